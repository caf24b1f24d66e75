/// Driver login and GPS reporting page.
///
/// The browser only samples the device; the server owns the reporter, so
/// every fix and every classified sensor error is posted back as-is.
pub const DRIVER_HTML: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="UTF-8" />
  <meta name="viewport" content="width=device-width, initial-scale=1.0" />
  <title>Driver Portal</title>
  <style>
    body { margin: 0; font-family: system-ui, sans-serif; background: #0f172a; color: #e2e8f0; }
    main { max-width: 420px; margin: 0 auto; padding: 24px 16px; }
    h1 { font-size: 22px; }
    label { display: block; margin: 12px 0 4px; font-size: 14px; }
    input { width: 100%; padding: 10px; border-radius: 6px; border: 1px solid #334155; background: #111c33; color: inherit; box-sizing: border-box; }
    button { margin-top: 16px; width: 100%; padding: 12px; border: 0; border-radius: 6px; font-size: 16px; font-weight: 600; cursor: pointer; }
    .primary { background: #0ea5e9; color: #0f172a; }
    .danger { background: #f43f5e; color: #0f172a; }
    .card { background: #111c33; border-radius: 8px; padding: 16px; margin-top: 16px; }
    .card div { margin: 4px 0; font-size: 14px; }
    #message { margin-top: 12px; min-height: 1.2em; }
    .error { color: #fb7185; }
  </style>
</head>
<body>
  <main>
    <h1>Driver Portal</h1>

    <form id="login">
      <label for="username">Username</label>
      <input id="username" autocomplete="username" required />
      <label for="password">Password</label>
      <input id="password" type="password" autocomplete="current-password" required />
      <button class="primary" type="submit">Login</button>
    </form>

    <section id="session" hidden>
      <div class="card">
        <div><strong id="driver-name"></strong> (<span id="driver-id"></span>)</div>
        <div>Bus: <span id="bus-number">N/A</span></div>
      </div>
      <button id="toggle" class="primary" type="button">Start Tracking</button>
      <div class="card" id="status-card">
        <div>Status: <span id="status-message">GPS tracking stopped</span></div>
        <div>Total updates: <span id="total-updates">0</span></div>
        <div>Last update: <span id="last-update">N/A</span></div>
        <div>Accuracy: <span id="accuracy">N/A</span></div>
        <div>Latitude: <span id="latitude">N/A</span></div>
        <div>Longitude: <span id="longitude">N/A</span></div>
        <div>Speed: <span id="speed">0 km/h</span></div>
      </div>
      <button id="logout" class="danger" type="button">Logout</button>
    </section>

    <div id="message"></div>
  </main>

  <script>
    let driver = null;
    let watchId = null;

    const $ = (id) => document.getElementById(id);

    function showMessage(text, isError) {
      $('message').textContent = text;
      $('message').className = isError ? 'error' : '';
    }

    async function api(path, options) {
      const response = await fetch(path, {
        headers: { 'Content-Type': 'application/json' },
        ...options
      });
      const body = await response.json().catch(() => ({}));
      if (!response.ok) throw new Error(body.error || `HTTP ${response.status}`);
      return body;
    }

    function showStatus(status) {
      if (!status) return;
      $('status-message').textContent = status.message || '';
      $('total-updates').textContent = status.totalUpdates;
      $('last-update').textContent = status.lastUpdate
        ? new Date(status.lastUpdate).toLocaleTimeString() : 'N/A';
      $('accuracy').textContent = status.accuracy != null ? `${Math.round(status.accuracy)}m` : 'N/A';
      if (status.lastError) showMessage(status.lastError, true);
    }

    $('login').addEventListener('submit', async (event) => {
      event.preventDefault();
      try {
        driver = await api('/api/login', {
          method: 'POST',
          body: JSON.stringify({ username: $('username').value, password: $('password').value })
        });
        $('login').hidden = true;
        $('session').hidden = false;
        $('driver-name').textContent = driver.name;
        $('driver-id').textContent = driver.driverId;
        $('bus-number').textContent = driver.busNumber || 'N/A';
        showMessage('Login successful!', false);
      } catch (err) {
        showMessage(`Login failed: ${err.message}`, true);
      }
    });

    async function startTracking() {
      if (!navigator.geolocation) {
        showMessage('Geolocation is not supported by this browser.', true);
        return;
      }
      const started = await api(`/api/reporting/${encodeURIComponent(driver.driverId)}/start`, { method: 'POST' });
      showStatus(started.status);
      watchId = navigator.geolocation.watchPosition(async (position) => {
        const coords = position.coords;
        $('latitude').textContent = coords.latitude.toFixed(6);
        $('longitude').textContent = coords.longitude.toFixed(6);
        $('speed').textContent = `${Math.round((coords.speed || 0) * 3.6)} km/h`;
        try {
          const status = await api(`/api/reporting/${encodeURIComponent(driver.driverId)}/fix`, {
            method: 'POST',
            body: JSON.stringify({ fix: {
              latitude: coords.latitude,
              longitude: coords.longitude,
              accuracy: coords.accuracy,
              speed: coords.speed,
              heading: coords.heading
            } })
          });
          showStatus(status);
        } catch (err) {
          showMessage(`Failed to send location: ${err.message}`, true);
        }
      }, (error) => {
        api(`/api/reporting/${encodeURIComponent(driver.driverId)}/fix`, {
          method: 'POST',
          body: JSON.stringify({ error: error.code })
        }).then(showStatus).catch((err) => showMessage(err.message, true));
      }, started.positionOptions);
      $('toggle').textContent = 'Stop Tracking';
      $('toggle').className = 'danger';
    }

    async function stopTracking() {
      if (watchId !== null) {
        navigator.geolocation.clearWatch(watchId);
        watchId = null;
      }
      try {
        showStatus(await api(`/api/reporting/${encodeURIComponent(driver.driverId)}/stop`, { method: 'POST' }));
      } catch (err) {
        showMessage(err.message, true);
      }
      $('toggle').textContent = 'Start Tracking';
      $('toggle').className = 'primary';
    }

    $('toggle').addEventListener('click', async () => {
      try {
        if (watchId === null) await startTracking();
        else await stopTracking();
      } catch (err) {
        showMessage(err.message, true);
      }
    });

    $('logout').addEventListener('click', async () => {
      if (watchId !== null) await stopTracking();
      driver = null;
      $('session').hidden = true;
      $('login').hidden = false;
      showMessage('', false);
    });
  </script>
</body>
</html>
"#;
