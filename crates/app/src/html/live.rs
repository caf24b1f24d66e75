pub const LIVE_TEMPLATE: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="UTF-8" />
  <meta name="viewport" content="width=device-width, initial-scale=1.0" />
  <title>Live Bus Tracking</title>
  {{LEAFLET}}
  {{STYLE}}
</head>
<body>
  <header>
    <h1>Live Bus Tracking</h1>
    <span id="summary">Connecting...</span>
    <a href="/driver">Driver login</a>
    <span id="connection"></span>
  </header>
  <div id="empty" class="empty" hidden>No active buses right now.</div>
  <div id="map"></div>
  {{RENDERER}}
  <script>
    const renderer = createMapRenderer('map');
    connectMapStream('/api/live/stream', renderer, {
      view(drivers) {
        const all = Object.values(drivers);
        const live = all.filter((driver) => driver.liveStatus === 'LIVE').length;
        document.getElementById('summary').textContent =
          `${all.length} active, ${live} live`;
        document.getElementById('empty').hidden = all.length > 0;
      }
    });
  </script>
</body>
</html>
"#;
