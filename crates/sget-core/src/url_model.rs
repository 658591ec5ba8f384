//! Filename derivation from the download URL.

/// Default filename when the URL path yields nothing usable.
const DEFAULT_FILENAME: &str = "download.bin";

/// Derives a safe local filename from the last URL path segment, sanitized
/// for Linux filesystems. Falls back to `download.bin`.
pub fn derive_filename(url: &str) -> String {
    let candidate = url::Url::parse(url).ok().and_then(|u| {
        u.path_segments()
            .and_then(|segments| segments.filter(|s| !s.is_empty()).last().map(str::to_string))
    });
    let raw = match candidate {
        Some(c) => c,
        None => return DEFAULT_FILENAME.to_string(),
    };
    let sanitized = sanitize(&raw);
    if sanitized.is_empty() || sanitized == "." || sanitized == ".." {
        DEFAULT_FILENAME.to_string()
    } else {
        sanitized
    }
}

/// Strip path separators, NUL and control characters; trim leading/trailing
/// dots and spaces.
fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| *c != '/' && *c != '\\' && *c != '\0' && !c.is_control())
        .collect();
    cleaned.trim_matches(|c| c == '.' || c == ' ').to_string()
}
