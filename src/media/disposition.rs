use tone_bus::{OutputFormat, VideoId};

const MAX_FILENAME_LEN: usize = 100;

/// Reduce `raw` to `[A-Za-z0-9_.-]`, safe inside a quoted header parameter
/// on any client. Returns an empty string when nothing usable is left.
pub fn sanitize_filename(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len().min(MAX_FILENAME_LEN));
    for c in raw.chars() {
        let c = if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
            c
        } else {
            '_'
        };
        if c == '_' && out.ends_with('_') {
            continue;
        }
        out.push(c);
    }

    let trimmed = out.trim_matches(['.', '_']);
    let capped = &trimmed[..trimmed.len().min(MAX_FILENAME_LEN)];
    capped.trim_end_matches(['.', '_']).to_string()
}

/// `Content-Disposition` value for a download. The plain `filename` is the
/// sanitized title (or the video id); `filename*` keeps the full title for
/// clients that understand RFC 6266.
pub fn content_disposition(title: Option<&str>, id: &VideoId) -> String {
    let title = title.map(str::trim).filter(|t| !t.is_empty());
    let base = title
        .map(sanitize_filename)
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| id.as_str().to_string());

    let mut value = format!("attachment; filename=\"{}.{}\"", base, OutputFormat::EXTENSION);
    if let Some(title) = title {
        let full = format!("{}.{}", title, OutputFormat::EXTENSION);
        value.push_str("; filename*=UTF-8''");
        value.push_str(&urlencoding::encode(&full));
    }
    value
}
