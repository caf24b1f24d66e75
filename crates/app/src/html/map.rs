/// Leaflet includes shared by the map pages.
pub const LEAFLET_HEAD: &str = r#"
  <link rel="stylesheet" href="https://cdnjs.cloudflare.com/ajax/libs/leaflet/1.9.4/leaflet.css" crossorigin="anonymous"
    referrerpolicy="no-referrer" />
  <script src="https://cdnjs.cloudflare.com/ajax/libs/leaflet/1.9.4/leaflet.js" crossorigin="anonymous"
    referrerpolicy="no-referrer"></script>
"#;

/// Thin renderer for `render`/`setView` commands streamed by the server.
///
/// The first `render` creates the map at the given center and zoom; later
/// ones only replace markers so the viewport stays where the user left it.
pub const MAP_RENDERER: &str = r#"
  <script>
    function createMapRenderer(elementId) {
      let map = null;
      const layer = L.layerGroup();
      const openPopups = new Set();

      function popupHtml(popup) {
        const rows = [];
        if (popup.bus) rows.push(`<div><strong>Bus:</strong> ${escapeHtml(popup.bus)}</div>`);
        if (popup.route) rows.push(`<div><strong>Route:</strong> ${escapeHtml(popup.route)}</div>`);
        rows.push(`<div><strong>Location:</strong> ${popup.location}</div>`);
        rows.push(`<div><strong>Speed:</strong> ${popup.speed}</div>`);
        rows.push(`<div><strong>Last Update:</strong> ${popup.lastUpdate}</div>`);
        rows.push(`<div><strong>Accuracy:</strong> ${popup.accuracy}</div>`);
        if (popup.status) {
          const cls = popup.status === 'LIVE' ? 'status-live' : 'status-offline';
          rows.push(`<div class="${cls}">${popup.status}</div>`);
        }
        return `<div class="popup"><h3>${escapeHtml(popup.title)}</h3>${rows.join('')}</div>`;
      }

      function render(command) {
        if (!map) {
          map = L.map(elementId, { zoomControl: true }).setView(
            [command.center.latitude, command.center.longitude], command.zoom);
          L.tileLayer('https://{s}.tile.openstreetmap.org/{z}/{x}/{y}.png', {
            maxZoom: 19,
            attribution: '&copy; OpenStreetMap contributors'
          }).addTo(map);
          layer.addTo(map);
        }
        layer.clearLayers();
        for (const marker of command.markers) {
          const leafletMarker = L.marker([marker.position.latitude, marker.position.longitude])
            .bindPopup(popupHtml(marker.popup));
          leafletMarker.on('popupopen', () => openPopups.add(marker.id));
          leafletMarker.on('popupclose', () => openPopups.delete(marker.id));
          layer.addLayer(leafletMarker);
          if (openPopups.has(marker.id)) leafletMarker.openPopup();
        }
      }

      function setView(command) {
        if (!map) return;
        const zoom = command.zoom == null ? map.getZoom() : command.zoom;
        map.setView([command.position.latitude, command.position.longitude], zoom);
      }

      return {
        apply(command) {
          if (command.command === 'render') render(command);
          else if (command.command === 'setView') setView(command);
        }
      };
    }

    function escapeHtml(text) {
      return String(text).replace(/[&<>"']/g, (c) => ({
        '&': '&amp;', '<': '&lt;', '>': '&gt;', '"': '&quot;', "'": '&#39;'
      })[c]);
    }

    function connectMapStream(url, renderer, listeners) {
      const source = new EventSource(url);
      source.onmessage = (event) => renderer.apply(JSON.parse(event.data));
      for (const [name, handler] of Object.entries(listeners)) {
        source.addEventListener(name, (event) => handler(JSON.parse(event.data)));
      }
      source.onerror = () => {
        const banner = document.getElementById('connection');
        if (banner) banner.textContent = 'Reconnecting...';
      };
      source.onopen = () => {
        const banner = document.getElementById('connection');
        if (banner) banner.textContent = '';
      };
      return source;
    }
  </script>
"#;

pub const MAP_STYLE: &str = r#"
  <style>
    html, body { margin: 0; height: 100%; font-family: system-ui, sans-serif; background: #0f172a; color: #e2e8f0; }
    header { padding: 10px 16px; display: flex; gap: 16px; align-items: baseline; background: #111c33; }
    header h1 { font-size: 18px; margin: 0; }
    header a { color: #7dd3fc; }
    #connection { color: #facc15; margin-left: auto; }
    #map { position: absolute; top: 46px; bottom: 0; left: 0; right: 0; }
    .popup h3 { margin: 0 0 4px; font-size: 15px; }
    .popup div { font-size: 13px; color: #1e293b; }
    .status-live { color: #16a34a !important; font-weight: 700; }
    .status-offline { color: #dc2626 !important; font-weight: 700; }
    .empty { position: absolute; z-index: 500; top: 60px; left: 50%; transform: translateX(-50%);
      background: #111c33; padding: 8px 14px; border-radius: 6px; }
  </style>
"#;
