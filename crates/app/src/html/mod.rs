//! Embedded static HTML assets served by the tracking web UI.
//!
//! The assets are kept as `&'static str` so they can be bundled directly inside
//! the binary without filesystem lookups. Map pages only render the commands
//! streamed to them; every scene is computed server-side.

mod driver;
mod live;
mod map;
mod track;

pub use driver::DRIVER_HTML;

fn fill(template: &str) -> String {
    template
        .replace("{{LEAFLET}}", map::LEAFLET_HEAD)
        .replace("{{STYLE}}", map::MAP_STYLE)
        .replace("{{RENDERER}}", map::MAP_RENDERER)
}

/// Live map of every active driver.
pub fn live_page() -> String {
    fill(live::LIVE_TEMPLATE)
}

/// Map following `driver_id`.
pub fn track_page(driver_id: &str) -> String {
    fill(track::TRACK_TEMPLATE).replace("{{DRIVER_ID}}", &js_string(driver_id))
}

/// JSON-encode `text` as a JS string literal that is safe inside `<script>`.
fn js_string(text: &str) -> String {
    serde_json::to_string(text)
        .unwrap_or_else(|_| "\"\"".to_string())
        .replace('<', "\\u003c")
        .replace('>', "\\u003e")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_have_no_unfilled_placeholders() {
        assert!(!live_page().contains("{{"));
        assert!(!track_page("D1").contains("{{"));
        assert!(live_page().contains("/api/live/stream"));
    }

    #[test]
    fn driver_id_cannot_close_the_script() {
        let page = track_page("</script><script>alert(1)</script>");
        assert!(!page.contains("</script><script>alert(1)"));
        assert!(page.contains(r#"const driverId = "\u003c/script\u003e"#));
    }
}
