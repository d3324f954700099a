use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use once_cell::sync::Lazy;

use crate::config::ServerConfig;

const DEFAULT_MIME_TYPE: &str = "text/plain";

const EXTENSIONS_MAP: &[&str] = &[
    "text/html               html htm",
    "text/css                css",
    "application/javascript  js",
    "image/png               png",
    "image/jpeg              jpg jpeg",
    "image/gif               gif",
];

static MIME_TYPES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    let mut map = HashMap::new();
    for line in EXTENSIONS_MAP {
        let mut fields = line.split_whitespace();
        let mimetype = fields.next().expect("empty extension map line");
        for extension in fields {
            map.insert(extension, mimetype);
        }
    }
    map
});

/// Content type for a filesystem path, inferred from its extension.
pub fn content_type_for(path: &str) -> &'static str {
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .and_then(|e| MIME_TYPES.get(e).copied())
        .unwrap_or(DEFAULT_MIME_TYPE)
}

/// Assemble a complete response: status line, `Content-Length`,
/// `Content-Type` and `Connection` headers, then the body. For HEAD the
/// body bytes are omitted but `Content-Length` still reflects them.
pub fn build_response(
    code: u16,
    reason: &str,
    body: &[u8],
    content_type: &str,
    keep_alive: bool,
    head_only: bool,
) -> Vec<u8> {
    let header = format!(
        "HTTP/1.1 {} {}\r\n\
        Content-Length: {}\r\n\
        Content-Type: {}\r\n\
        Connection: {}\r\n\
        \r\n",
        code,
        reason,
        body.len(),
        content_type,
        if keep_alive { "keep-alive" } else { "close" },
    );
    let mut response = header.into_bytes();
    if !head_only {
        response.extend_from_slice(body);
    }
    response
}

/// A redirect response with a `Location` header and a short HTML body.
pub fn build_redirect(code: u16, reason: &str, location: &str, keep_alive: bool) -> Vec<u8> {
    let body = format!(
        "<html><body><h1>{}</h1><a href=\"{}\">{}</a></body></html>",
        HtmlEscaped(reason),
        location,
        HtmlEscaped(location),
    );
    let header = format!(
        "HTTP/1.1 {} {}\r\n\
        Location: {}\r\n\
        Content-Length: {}\r\n\
        Content-Type: text/html\r\n\
        Connection: {}\r\n\
        \r\n",
        code,
        reason,
        location,
        body.len(),
        if keep_alive { "keep-alive" } else { "close" },
    );
    let mut response = header.into_bytes();
    response.extend_from_slice(body.as_bytes());
    response
}

/// CGI passthrough form: the child's headers are forwarded verbatim except
/// `Connection` (overridden) and `Content-Length` (inserted if the child
/// didn't supply one). `content_type` is the child's `Content-Type`, falling
/// back to `text/html` when it sent none.
pub fn build_cgi_passthrough(
    code: u16,
    reason: &str,
    pass_headers: &[(String, String)],
    content_type: &str,
    keep_alive: bool,
    body: &[u8],
) -> Vec<u8> {
    let mut header = format!("HTTP/1.1 {} {}\r\n", code, reason);
    let mut have_length = false;
    for (name, value) in pass_headers {
        if name.eq_ignore_ascii_case("content-length") {
            have_length = true;
        }
        header.push_str(name);
        header.push_str(": ");
        header.push_str(value);
        header.push_str("\r\n");
    }
    if !have_length {
        header.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    header.push_str(&format!("Content-Type: {}\r\n", content_type));
    header.push_str(if keep_alive {
        "Connection: keep-alive\r\n\r\n"
    } else {
        "Connection: close\r\n\r\n"
    });
    let mut response = header.into_bytes();
    response.extend_from_slice(body);
    response
}

/// Error response, preferring `<error_page_root>/<code>.html` over the
/// built-in plain-text body. Error responses always close the connection;
/// the caller is expected to have cleared keep-alive already.
pub fn build_error(
    sc: &ServerConfig,
    code: u16,
    reason: &str,
    fallback: &str,
    head_only: bool,
) -> Vec<u8> {
    match load_error_page(sc, code) {
        Some(page) => build_response(code, reason, &page, "text/html", false, head_only),
        None => build_response(code, reason, fallback.as_bytes(), "text/plain", false, head_only),
    }
}

fn load_error_page(sc: &ServerConfig, code: u16) -> Option<Vec<u8>> {
    let root = sc.error_page_root.as_ref()?;
    let path = Path::new(root).join(format!("{}.html", code));
    match std::fs::read(&path) {
        Ok(page) if !page.is_empty() => Some(page),
        _ => None,
    }
}

/// Escape < > & ' " into HTML entities.
pub struct HtmlEscaped<'a>(pub &'a str);

impl<'a> fmt::Display for HtmlEscaped<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in self.0.chars() {
            match c {
                '<' => write!(f, "&lt;")?,
                '>' => write!(f, "&gt;")?,
                '&' => write!(f, "&amp;")?,
                '\'' => write!(f, "&apos;")?,
                '"' => write!(f, "&quot;")?,
                c => write!(f, "{}", c)?,
            }
        }
        Ok(())
    }
}

/// Encode string to be an RFC3986-compliant URL part.
pub struct UrlEncoded<'a>(pub &'a str);

impl<'a> fmt::Display for UrlEncoded<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for c in self.0.chars() {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~') {
                write!(f, "{}", c)?;
            } else {
                let mut buf = [0; 4];
                c.encode_utf8(&mut buf);
                for byte in buf.iter().take(c.len_utf8()) {
                    write!(f, "%{:02X}", byte)?;
                }
            }
        }
        Ok(())
    }
}
