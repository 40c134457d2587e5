//! URL helpers shared by the backends and the executor

/// Resolve an absolute URL from a base and a possibly-relative path.
///
/// Already-absolute URLs pass through; `//host/...` gets the base's scheme
/// defaulting to https. With an unusable base the relative URL is returned
/// unchanged rather than glued onto a non-URL.
pub fn resolve_absolute_url(base: &str, url: &str) -> String {
    let url = url.trim();
    let base = base.trim();

    if url.starts_with("http://") || url.starts_with("https://") {
        return url.to_string();
    }

    if url.starts_with("//") {
        let scheme = if base.starts_with("http://") {
            "http:"
        } else {
            "https:"
        };
        return format!("{scheme}{url}");
    }

    if !base.contains("://") {
        return url.to_string();
    }

    if let Some(stripped) = url.strip_prefix('/') {
        let origin = origin_of(base);
        return format!("{}/{}", origin.trim_end_matches('/'), stripped);
    }

    // path-relative: join onto the base's directory
    if base.ends_with('/') {
        return format!("{base}{url}");
    }
    if let Some(pos) = base.rfind('/') {
        if pos > base.find("://").unwrap_or(0) + 2 {
            return format!("{}/{}", &base[..pos], url);
        }
    }
    format!("{base}/{url}")
}

/// Scheme + authority of a URL, e.g. `https://example.com`
fn origin_of(url: &str) -> &str {
    let Some(scheme_end) = url.find("://") else {
        return url;
    };
    let after = &url[scheme_end + 3..];
    match after.find('/') {
        Some(path_pos) => &url[..scheme_end + 3 + path_pos],
        None => url,
    }
}

/// Hostname of a URL, used as the rate-limiter key. Falls back to the raw
/// string when the URL has no scheme.
pub fn host_of(url: &str) -> String {
    let after_scheme = url.split("://").nth(1).unwrap_or(url);
    let authority = after_scheme
        .split(['/', '?', '#'])
        .next()
        .unwrap_or(after_scheme);
    // strip userinfo and port
    let host = authority.rsplit('@').next().unwrap_or(authority);
    let host = host.split(':').next().unwrap_or(host);
    host.to_string()
}
