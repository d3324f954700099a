use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use crate::config::{Config, RouteConfig, ServerConfig};
use crate::http::Request;
use crate::multipart;
use crate::response::{self, HtmlEscaped, UrlEncoded};
use crate::routing;

/// What the event loop should do with a completed request.
#[derive(Debug)]
pub enum Outcome {
    /// Queue these bytes and flush.
    Respond { bytes: Vec<u8>, keep_alive: bool },
    /// Suspend the connection and hand off to the CGI controller.
    StartCgi {
        script: String,
        interpreter: Option<String>,
    },
}

impl Outcome {
    fn error(sc: &ServerConfig, code: u16, reason: &str, fallback: &str, head_only: bool) -> Self {
        Outcome::Respond {
            bytes: response::build_error(sc, code, reason, fallback, head_only),
            keep_alive: false,
        }
    }
}

/// Keep-alive policy: HTTP/1.1 defaults on, HTTP/1.0 defaults off, and an
/// explicit `Connection` header wins either way.
pub fn keep_alive_requested(req: &Request) -> bool {
    match req.header("connection") {
        Some(value) if value.eq_ignore_ascii_case("close") => false,
        Some(value) if value.eq_ignore_ascii_case("keep-alive") => true,
        _ => req.version.eq_ignore_ascii_case("HTTP/1.1"),
    }
}

/// Translate a completed request into a response policy for the selected
/// virtual host. Every error path produces a response with keep-alive off;
/// nothing here can fail outward.
pub fn handle_request(
    config: &Config,
    server_index: usize,
    req: &Request,
    upload_counter: &mut u64,
) -> Outcome {
    let sc = &config.servers[server_index];
    let head_only = req.method == "HEAD";
    let keep_alive = keep_alive_requested(req);

    // Route matching is against the path component only.
    let path = req.uri.split('?').next().unwrap_or("");

    let route = match routing::match_route(sc, path) {
        Some(route) => route,
        None => {
            eprintln!("[404] no route for uri={}", req.uri);
            return Outcome::error(sc, 404, "Not Found", "404 Not Found\n", head_only);
        }
    };

    if !route.allows_method(&req.method) {
        eprintln!("[405] method={} uri={}", req.method, req.uri);
        return Outcome::error(sc, 405, "Method Not Allowed", "405 Method Not Allowed\n", head_only);
    }

    if let Some(target) = &route.redirect {
        eprintln!("[302] uri={} -> {}", req.uri, target);
        return Outcome::Respond {
            bytes: response::build_redirect(302, "Found", target, false),
            keep_alive: false,
        };
    }

    let rel = routing::relative_uri(route, path);
    if rel.contains("..") {
        eprintln!("[403] traversal attempt uri={}", req.uri);
        return Outcome::error(sc, 403, "Forbidden", "403 Forbidden\n", head_only);
    }

    let file_path = format!("{}{}", route.root, rel);

    if let Some(extension) = &route.cgi_extension {
        if file_path.ends_with(extension.as_str()) {
            return Outcome::StartCgi {
                script: file_path,
                interpreter: route.cgi_interpreter.clone(),
            };
        }
    }

    if req.method == "POST" && route.uploads_enabled {
        return handle_upload(route, req, upload_counter, keep_alive);
    }

    if Path::new(&file_path).is_dir() {
        return handle_directory(sc, route, &file_path, path, keep_alive, head_only);
    }

    match req.method.as_str() {
        "DELETE" => handle_delete(sc, &file_path, keep_alive),
        "GET" | "HEAD" => handle_file(sc, &file_path, keep_alive, head_only),
        // POST on a non-upload route, or any other method.
        _ => {
            eprintln!("[405] method={} uri={}", req.method, req.uri);
            Outcome::error(sc, 405, "Method Not Allowed", "405 Method Not Allowed\n", head_only)
        }
    }
}

/// POST to an upload-enabled route: multipart bodies are split into saved
/// files, anything else is stored raw under a numbered filename. The reply
/// is a plain-text summary either way.
fn handle_upload(
    route: &RouteConfig,
    req: &Request,
    upload_counter: &mut u64,
    keep_alive: bool,
) -> Outcome {
    let dest = route.upload_path.as_ref().unwrap_or(&route.root);
    let dest = Path::new(dest);
    let mut summary = format!("Received POST ({} bytes)\n", req.body.len());

    let boundary = req
        .header("content-type")
        .filter(|ctype| ctype.contains("multipart/form-data"))
        .map(boundary_param);
    match boundary {
        Some(Some(boundary)) => match multipart::save_parts(&req.body, &boundary, dest) {
            Ok(saved) if saved.is_empty() => summary.push_str("No file parts saved\n"),
            Ok(saved) => {
                for file in &saved {
                    eprintln!("[upload] saved {} size={}", file.filename.display(), file.size);
                    summary.push_str(&format!(
                        "Saved field='{}' -> {} ({} bytes)\n",
                        file.field,
                        file.filename.display(),
                        file.size
                    ));
                }
            }
            Err(e) => {
                eprintln!("[upload] multipart save failed: {}", e);
                summary.push_str("Multipart parse error\n");
            }
        },
        Some(None) => summary.push_str("Missing boundary parameter\n"),
        None => {
            *upload_counter += 1;
            let filename = format!("upload_{}.bin", upload_counter);
            let full = dest.join(&filename);
            match multipart::ensure_dir(dest).and_then(|_| fs::write(&full, &req.body)) {
                Ok(()) => {
                    eprintln!("[upload] saved {} size={}", full.display(), req.body.len());
                    summary.push_str(&format!("Stored raw body as {}\n", full.display()));
                }
                Err(e) => {
                    eprintln!("[upload] save failed path={} error={}", full.display(), e);
                    summary.push_str("Upload save failed\n");
                }
            }
        }
    }

    Outcome::Respond {
        bytes: response::build_response(200, "OK", summary.as_bytes(), "text/plain", keep_alive, false),
        keep_alive,
    }
}

fn handle_directory(
    sc: &ServerConfig,
    route: &RouteConfig,
    file_path: &str,
    uri_path: &str,
    keep_alive: bool,
    head_only: bool,
) -> Outcome {
    if !route.autoindex {
        return Outcome::error(sc, 403, "Forbidden", "403 Forbidden\n", head_only);
    }
    match directory_listing(file_path, uri_path) {
        Ok(body) => Outcome::Respond {
            bytes: response::build_response(200, "OK", body.as_bytes(), "text/html", keep_alive, head_only),
            keep_alive,
        },
        Err(e) => {
            eprintln!("[500] listing failed path={} error={}", file_path, e);
            Outcome::error(sc, 500, "Internal Server Error", "500 Internal Server Error\n", head_only)
        }
    }
}

fn handle_delete(sc: &ServerConfig, file_path: &str, keep_alive: bool) -> Outcome {
    match fs::metadata(file_path) {
        Ok(metadata) if metadata.is_file() => match fs::remove_file(file_path) {
            Ok(()) => {
                eprintln!("[204] deleted {}", file_path);
                Outcome::Respond {
                    bytes: response::build_response(204, "No Content", b"", "text/plain", keep_alive, false),
                    keep_alive,
                }
            }
            Err(e) => {
                eprintln!("[500] delete failed path={} error={}", file_path, e);
                Outcome::error(sc, 500, "Internal Server Error", "500 Internal Server Error\n", false)
            }
        },
        Ok(metadata) if metadata.is_dir() => {
            Outcome::error(sc, 403, "Forbidden", "403 Forbidden\n", false)
        }
        Ok(_) => Outcome::error(sc, 403, "Forbidden", "403 Forbidden\n", false),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            Outcome::error(sc, 404, "Not Found", "404 Not Found\n", false)
        }
        Err(e) => {
            eprintln!("[500] stat failed path={} error={}", file_path, e);
            Outcome::error(sc, 500, "Internal Server Error", "500 Internal Server Error\n", false)
        }
    }
}

fn handle_file(sc: &ServerConfig, file_path: &str, keep_alive: bool, head_only: bool) -> Outcome {
    match fs::read(file_path) {
        Ok(content) => Outcome::Respond {
            bytes: response::build_response(
                200,
                "OK",
                &content,
                response::content_type_for(file_path),
                keep_alive,
                head_only,
            ),
            keep_alive,
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            eprintln!("[404] file={}", file_path);
            Outcome::error(sc, 404, "Not Found", "404 Not Found\n", head_only)
        }
        Err(e) => {
            eprintln!("[500] read failed path={} error={}", file_path, e);
            Outcome::error(sc, 500, "Internal Server Error", "500 Internal Server Error\n", head_only)
        }
    }
}

/// Extract the `boundary` parameter from a `multipart/form-data` content
/// type, stripping an optional quoted form.
fn boundary_param(ctype: &str) -> Option<String> {
    let start = ctype.find("boundary=")? + "boundary=".len();
    let value = &ctype[start..];
    let boundary = if let Some(quoted) = value.strip_prefix('"') {
        quoted.split('"').next()?
    } else {
        value.split(';').next()?.trim()
    };
    if boundary.is_empty() {
        None
    } else {
        Some(boundary.to_string())
    }
}

/// HTML directory index, dot entries omitted, names sorted.
struct Listing(Vec<fs::DirEntry>);

impl fmt::Display for Listing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.0 {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let is_dir = entry.metadata().map(|m| m.is_dir()).unwrap_or(false);
            write!(
                f,
                "<li><a href=\"{}{}\">{}{}</a></li>\n",
                UrlEncoded(&name),
                if is_dir { "/" } else { "" },
                HtmlEscaped(&name),
                if is_dir { "/" } else { "" },
            )?;
        }
        Ok(())
    }
}

fn directory_listing(fs_path: &str, uri_path: &str) -> io::Result<String> {
    let mut entries: Vec<_> = fs::read_dir(fs_path)?.filter_map(|entry| entry.ok()).collect();
    entries.sort_by_key(|entry| entry.file_name());
    Ok(format!(
        "<html>\n<head>\n<title>Index of {}</title>\n</head>\n\
        <body>\n<h1>Index of {}</h1>\n<ul>\n{}</ul>\n</body>\n</html>\n",
        HtmlEscaped(uri_path),
        HtmlEscaped(uri_path),
        Listing(entries),
    ))
}
