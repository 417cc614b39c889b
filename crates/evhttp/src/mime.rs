//! File-extension to MIME type lookup.

/// Fallback for unknown or missing extensions.
pub const DEFAULT_TYPE: &str = "text/plain";

/// Resolve the content type from the extension after the last `.` of the
/// final path segment. Matching is ASCII case-insensitive.
pub fn content_type(path: &str) -> &'static str {
    let name = path.rsplit('/').next().unwrap_or(path);
    let Some((_, ext)) = name.rsplit_once('.') else {
        return DEFAULT_TYPE;
    };
    match ext.to_ascii_lowercase().as_str() {
        "html" | "htm" => "text/html",
        "xml" => "text/xml",
        "xhtml" => "application/xhtml+xml",
        "txt" => "text/plain",
        "rtf" => "application/rtf",
        "pdf" => "application/pdf",
        "word" | "doc" => "application/msword",
        "png" => "image/png",
        "gif" => "image/gif",
        "jpg" | "jpeg" => "image/jpeg",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "au" => "audio/basic",
        "mpeg" | "mpg" => "video/mpeg",
        "mp4" => "video/mp4",
        "avi" => "video/x-msvideo",
        "gz" => "application/x-gzip",
        "tar" => "application/x-tar",
        "css" => "text/css",
        "js" => "text/javascript",
        "json" => "application/json",
        _ => DEFAULT_TYPE,
    }
}
