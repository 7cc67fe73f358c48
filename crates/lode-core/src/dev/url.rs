//! Request url classification and normalization.
//!
//! The cache key for a module is its *normalized* url: hash and
//! cache-busting query parameters (`?t=...`) are stripped, but the `import`
//! flag survives on non-JS urls because `/logo.png` and `/logo.png?import`
//! are served differently.

use std::path::Path;

/// Extensions served as JavaScript modules.
const JS_EXTENSIONS: &[&str] = &["js", "jsx", "ts", "tsx", "mjs"];

/// Style extensions wrapped into JS modules by the CSS plugin.
const CSS_EXTENSIONS: &[&str] = &["css"];

/// Framework single-file component extensions routed through the pipeline.
const FRAMEWORK_EXTENSIONS: &[&str] = &["vue", "svelte"];

/// Strip the hash and query from a url.
#[must_use]
pub fn clean_url(url: &str) -> &str {
    let end = url.find(['?', '#']).unwrap_or(url.len());
    &url[..end]
}

/// The query string of a url (without `?`, hash excluded).
#[must_use]
pub fn query_of(url: &str) -> Option<&str> {
    let without_hash = url.split('#').next().unwrap_or(url);
    without_hash.split_once('?').map(|(_, query)| query)
}

/// Lowercased extension of the url path, if any.
#[must_use]
pub fn extension_of(url: &str) -> Option<String> {
    let path = clean_url(url);
    let file_name = path.rsplit('/').next().unwrap_or(path);
    Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
}

/// Whether the url carries the `import` query flag.
#[must_use]
pub fn is_import_request(url: &str) -> bool {
    query_of(url).is_some_and(|query| {
        query
            .split('&')
            .any(|param| param.split('=').next() == Some("import"))
    })
}

/// JS-like request: a JS/TS extension, or no extension at all.
#[must_use]
pub fn is_js_request(url: &str) -> bool {
    let path = clean_url(url);
    match extension_of(path) {
        Some(ext) => JS_EXTENSIONS.contains(&ext.as_str()),
        None => !path.ends_with('/'),
    }
}

/// CSS-like request.
#[must_use]
pub fn is_css_request(url: &str) -> bool {
    extension_of(url).is_some_and(|ext| CSS_EXTENSIONS.contains(&ext.as_str()))
}

/// Framework component request (`.vue`, `.svelte`).
#[must_use]
pub fn is_framework_request(url: &str) -> bool {
    extension_of(url).is_some_and(|ext| FRAMEWORK_EXTENSIONS.contains(&ext.as_str()))
}

/// Whether a request should go through the transform pipeline.
#[must_use]
pub fn is_transform_request(url: &str) -> bool {
    is_js_request(url) || is_css_request(url) || is_import_request(url) || is_framework_request(url)
}

/// Normalize a request url into the module graph key.
///
/// Hash and query are dropped; the `import` flag is kept only where it
/// changes how the module is served (non-JS urls).
#[must_use]
pub fn normalize_url(url: &str) -> String {
    let path = clean_url(url);
    if is_import_request(url) && !is_js_request(path) {
        format!("{path}?import")
    } else {
        path.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_url() {
        assert_eq!(clean_url("/a.js?x=1#foo"), "/a.js");
        assert_eq!(clean_url("/a.js#foo?bar"), "/a.js");
        assert_eq!(clean_url("/a.js"), "/a.js");
    }

    #[test]
    fn test_normalize_drops_cache_busting_query() {
        assert_eq!(normalize_url("/a.js?x=1#foo"), "/a.js");
        assert_eq!(normalize_url("/a.js?t=123"), normalize_url("/a.js"));
        // ?import carries no meaning for JS
        assert_eq!(normalize_url("/a.js?import"), "/a.js");
    }

    #[test]
    fn test_normalize_keeps_import_flag_for_assets() {
        assert_eq!(normalize_url("/logo.png?import"), "/logo.png?import");
        assert_eq!(normalize_url("/logo.png?t=5&import"), "/logo.png?import");
        assert_eq!(normalize_url("/style.css?import#x"), "/style.css?import");
        assert_eq!(normalize_url("/style.css"), "/style.css");
    }

    #[test]
    fn test_is_import_request() {
        assert!(is_import_request("/logo.png?import"));
        assert!(is_import_request("/logo.png?t=1&import"));
        assert!(!is_import_request("/logo.png?important=1"));
        assert!(!is_import_request("/logo.png#import"));
    }

    #[test]
    fn test_request_classification() {
        assert!(is_js_request("/src/main.ts"));
        assert!(is_js_request("/src/App.tsx?t=1"));
        assert!(is_js_request("/@lode/client"));
        assert!(!is_js_request("/src/"));
        assert!(!is_js_request("/index.html"));
        assert!(is_css_request("/src/app.css?import"));
        assert!(is_framework_request("/src/App.vue"));
        assert!(is_transform_request("/logo.svg?import"));
        assert!(!is_transform_request("/logo.svg"));
    }
}
