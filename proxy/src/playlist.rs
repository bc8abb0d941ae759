use crate::catalog::Catalog;
use http::HeaderMap;
use http::header::HOST;
use std::fmt::Write;

const FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Base URL for playlist entries: the configured one, else what the client
/// used to reach us.
pub fn base_url(catalog: &Catalog, headers: &HeaderMap) -> Option<String> {
    if let Some(url) = catalog.base_url() {
        return Some(url.as_str().trim_end_matches('/').to_string());
    }

    let host = headers.get(HOST)?.to_str().ok()?;
    let scheme = headers
        .get(FORWARDED_PROTO)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("http");

    Some(format!("{scheme}://{host}"))
}

/// Renders the M3U playlist of every channel for the holder of `token`.
pub fn render(catalog: &Catalog, base_url: &str, token: &str) -> String {
    let mut out = String::from("#EXTM3U\n");

    for channel in catalog.sorted_by_name() {
        let _ = write!(out, "#EXTINF:-1 tvg-id=\"{}\"", channel.id);
        if let Some(logo) = &channel.logo {
            let _ = write!(out, " tvg-logo=\"{logo}\"");
        }
        if let Some(group) = &channel.group {
            let _ = write!(out, " group-title=\"{group}\"");
        }
        let _ = writeln!(out, ",{}", channel.name);
        let _ = writeln!(out, "{base_url}/channel/{}/stream?t={token}", channel.id);
    }

    out
}
