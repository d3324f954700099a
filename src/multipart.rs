use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// One file part persisted to disk.
#[derive(Debug)]
pub struct SavedFile {
    pub field: String,
    pub filename: PathBuf,
    pub size: usize,
}

/// Decode a `multipart/form-data` body and persist every file part into
/// `dest_dir` (created single-level if missing). Parts without a `filename`
/// parameter are form fields, not files, and are skipped.
// TODO: surface non-file form fields to the caller so the upload summary
// can mention them.
pub fn save_parts(body: &[u8], boundary: &str, dest_dir: &Path) -> io::Result<Vec<SavedFile>> {
    let marker = format!("--{}", boundary);
    let marker = marker.as_bytes();
    let mut saved = Vec::new();
    let mut cursor = 0;

    while let Some(pos) = find(marker, body, cursor) {
        let mut part_start = pos + marker.len();
        // `--` after the marker is the end-of-multipart delimiter.
        if body[part_start..].starts_with(b"--") {
            break;
        }
        if !body[part_start..].starts_with(b"\r\n") {
            cursor = part_start;
            continue;
        }
        part_start += 2;
        let header_end = match find(b"\r\n\r\n", body, part_start) {
            Some(end) => end,
            None => break,
        };
        let data_start = header_end + 4;
        let next_boundary = match find(marker, body, data_start) {
            Some(next) => next,
            None => break,
        };
        // The CRLF before the boundary belongs to the delimiter, not the data.
        let mut data_end = next_boundary;
        if data_end >= 2 && &body[data_end - 2..data_end] == b"\r\n" {
            data_end -= 2;
        }

        let (field, filename) = parse_part_headers(&body[part_start..header_end]);
        if let Some(filename) = filename {
            ensure_dir(dest_dir)?;
            let safe = sanitize_filename(&filename);
            let full = dest_dir.join(safe);
            fs::write(&full, &body[data_start..data_end])?;
            saved.push(SavedFile {
                field: field.unwrap_or_default(),
                filename: full,
                size: data_end - data_start,
            });
        }
        cursor = next_boundary;
    }
    Ok(saved)
}

/// Extract the `name` and `filename` parameters from a part's
/// `Content-Disposition` header, if present.
fn parse_part_headers(headers: &[u8]) -> (Option<String>, Option<String>) {
    let headers = String::from_utf8_lossy(headers);
    for line in headers.split("\r\n") {
        if !line
            .get(..20)
            .map_or(false, |p| p.eq_ignore_ascii_case("content-disposition:"))
        {
            continue;
        }
        let mut field = None;
        let mut filename = None;
        for token in line[20..].split(';') {
            let token = token.trim();
            let eq = match token.find('=') {
                Some(eq) => eq,
                None => continue,
            };
            let key = token[..eq].trim();
            let value = token[eq + 1..].trim().trim_matches('"').to_string();
            match key {
                "name" => field = Some(value),
                "filename" => filename = Some(value),
                _ => {}
            }
        }
        return (field, filename);
    }
    (None, None)
}

/// Strip directory components and dangerous bytes from a client-supplied
/// filename. An empty result becomes `upload.bin`.
pub fn sanitize_filename(name: &str) -> String {
    let basename = match name.rfind(|c| c == '/' || c == '\\') {
        Some(pos) => &name[pos + 1..],
        None => name,
    };
    let clean: String = basename
        .chars()
        .filter(|&c| c != '"' && !c.is_control())
        .collect();
    if clean.is_empty() {
        "upload.bin".to_string()
    } else {
        clean
    }
}

/// Create `path` if missing (single level only).
pub fn ensure_dir(path: &Path) -> io::Result<()> {
    match fs::create_dir(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e),
    }
}

fn find(needle: &[u8], haystack: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() || haystack.len() - from < needle.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|pos| pos + from)
}
