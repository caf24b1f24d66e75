pub const TRACK_TEMPLATE: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="UTF-8" />
  <meta name="viewport" content="width=device-width, initial-scale=1.0" />
  <title>Bus Tracker</title>
  {{LEAFLET}}
  {{STYLE}}
</head>
<body>
  <header>
    <h1 id="title">Tracking...</h1>
    <span id="details"></span>
    <a href="/">All buses</a>
    <span id="connection"></span>
  </header>
  <div id="empty" class="empty" hidden>Location not available</div>
  <div id="map"></div>
  {{RENDERER}}
  <script>
    const driverId = {{DRIVER_ID}};
    const renderer = createMapRenderer('map');
    connectMapStream(`/api/track/${encodeURIComponent(driverId)}/stream`, renderer, {
      driver(view) {
        document.getElementById('title').textContent = view.found
          ? `${view.name} (${view.driverId})`
          : `Driver ${view.driverId} not found`;
        const parts = [];
        if (view.busNumber) parts.push(`Bus ${view.busNumber}`);
        if (view.coordinates) {
          parts.push(`Lat: ${view.coordinates.latitude.toFixed(6)}, Lng: ${view.coordinates.longitude.toFixed(6)}`);
        }
        if (view.liveStatus) parts.push(view.liveStatus);
        document.getElementById('details').textContent = parts.join(' | ');
        document.getElementById('empty').hidden = view.coordinates != null;
      }
    });
  </script>
</body>
</html>
"#;
