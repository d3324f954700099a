mod util;

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};

use util::{Response, Server};

macro_rules! map {
    ($($k:expr => $v:expr),* $(,)?) => {
        std::iter::Iterator::collect(std::array::IntoIter::new([$(($k, $v),)*]))
    };
}

const BASE_CONFIG: &str = "\
server 127.0.0.1 {port}
server_name localhost
route / {root} index=index.html
";

#[test]
fn static_get() {
    let server = Server::with_config(BASE_CONFIG);
    server.create_file("index.html", b"hi\n");
    let response = server.get("/index.html");
    assert_eq!(response.status(), 200);
    assert_eq!(response.header("Content-Length"), Some("3"));
    assert_eq!(response.header("Content-Type"), Some("text/html"));
    assert_eq!(response.body.as_deref(), Some(&b"hi\n"[..]));
}

#[test]
fn index_file_served_for_directory_uri() {
    let server = Server::with_config(BASE_CONFIG);
    server.create_file("index.html", b"front page");
    let response = server.get("/");
    assert_eq!(response.status(), 200);
    assert_eq!(response.body.as_deref(), Some(&b"front page"[..]));
}

#[test]
fn missing_file_is_404() {
    let server = Server::with_config(BASE_CONFIG);
    assert_eq!(server.get("/nothing-here.txt").status(), 404);
}

#[test]
fn mime_type_follows_extension() {
    let server = Server::with_config(BASE_CONFIG);
    server.create_file("style.css", b"body {}");
    server.create_file("notes.xyz", b"?");
    assert_eq!(server.get("/style.css").header("Content-Type"), Some("text/css"));
    assert_eq!(server.get("/notes.xyz").header("Content-Type"), Some("text/plain"));
}

#[test]
fn head_matches_get_without_body() {
    let server = Server::with_config(BASE_CONFIG);
    server.create_file("f.txt", b"12345");
    let get = server.get("/f.txt");
    let head_raw = server.send(
        b"HEAD /f.txt HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    );
    let head_text = String::from_utf8(head_raw).unwrap();
    assert!(head_text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(head_text.contains("Content-Length: 5\r\n"));
    assert_eq!(get.status(), 200);
    assert_eq!(get.header("Content-Length"), Some("5"));
    // Headers only; the body is omitted.
    assert!(head_text.ends_with("\r\n\r\n"));
}

#[test]
fn traversal_guard() {
    let config = "\
server 127.0.0.1 {port}
route /static {root}
";
    let server = Server::with_config(config);
    let response = server.get("/static/../etc/passwd");
    assert_eq!(response.status(), 403);
}

#[test]
fn bad_request_line_is_400() {
    let server = Server::with_config(BASE_CONFIG);
    let raw = server.send(b"NONSENSE\r\n\r\n");
    assert!(String::from_utf8_lossy(&raw).starts_with("HTTP/1.1 400 Bad Request\r\n"));
}

#[test]
fn method_filter_is_405() {
    let config = "\
server 127.0.0.1 {port}
route / {root} methods=GET,HEAD
";
    let server = Server::with_config(config);
    let response = server.request("POST", "/x", HashMap::new());
    assert_eq!(response.status(), 405);
}

#[test]
fn redirect_route() {
    let config = "\
server 127.0.0.1 {port}
route /old {root} redirect=http://example.com/new
route / {root}
";
    let server = Server::with_config(config);
    let response = server.get("/old/page");
    assert_eq!(response.status(), 302);
    assert_eq!(response.header("Location"), Some("http://example.com/new"));
    let body = String::from_utf8(response.body.unwrap()).unwrap();
    assert!(body.contains("http://example.com/new"));
}

#[test]
fn custom_error_page_is_used() {
    let config = "\
server 127.0.0.1 {port}
error_page_root {root}/errors
route / {root}
";
    let server = Server::with_config(config);
    server.create_dir("errors");
    server.create_file("errors/404.html", b"<h1>custom missing page</h1>");
    let response = server.get("/ghost");
    assert_eq!(response.status(), 404);
    assert_eq!(response.header("Content-Type"), Some("text/html"));
    let body = String::from_utf8(response.body.unwrap()).unwrap();
    assert!(body.contains("custom missing page"));
}

#[test]
fn autoindex_lists_directory() {
    let config = "\
server 127.0.0.1 {port}
route / {root} autoindex=on
";
    let server = Server::with_config(config);
    server.create_file("visible.txt", b"");
    server.create_dir("subdir");
    let response = server.get("/");
    assert_eq!(response.status(), 200);
    assert_eq!(response.header("Content-Type"), Some("text/html"));
    let body = String::from_utf8(response.body.unwrap()).unwrap();
    assert!(body.contains("visible.txt"));
    assert!(body.contains("subdir/"));
}

#[test]
fn directory_without_autoindex_is_403() {
    let config = "\
server 127.0.0.1 {port}
route / {root}
";
    let server = Server::with_config(config);
    assert_eq!(server.get("/").status(), 403);
}

#[test]
fn delete_file() {
    let server = Server::with_config(BASE_CONFIG);
    let victim = server.create_file("victim.txt", b"bye");
    let response = server.request("DELETE", "/victim.txt", HashMap::new());
    assert_eq!(response.status(), 204);
    assert_eq!(response.header("Content-Length"), Some("0"));
    assert!(!victim.exists());
    assert_eq!(server.request("DELETE", "/victim.txt", HashMap::new()).status(), 404);
}

#[test]
fn delete_directory_is_403() {
    let server = Server::with_config(BASE_CONFIG);
    server.create_dir("keep");
    assert_eq!(server.request("DELETE", "/keep", HashMap::new()).status(), 403);
}

#[test]
fn virtual_host_selection() {
    let config = "\
server 127.0.0.1 {port}
server_name a
route / {root}/a index=index.html

server 127.0.0.1 0
server_name b
route / {root}/b index=index.html
";
    let server = Server::with_config(config);
    server.create_dir("a");
    server.create_dir("b");
    server.create_file("a/index.html", b"host a");
    server.create_file("b/index.html", b"host b");

    // Both names resolve over the same listener; any port suffix on the
    // Host header is ignored.
    let response = server.request("GET", "/", map! { "Host" => "b:8080" });
    assert_eq!(response.body.as_deref(), Some(&b"host b"[..]));
    let response = server.request("GET", "/", map! { "Host" => "a" });
    assert_eq!(response.body.as_deref(), Some(&b"host a"[..]));
    // Unknown hosts fall back to the first server.
    let response = server.request("GET", "/", map! { "Host" => "unknown" });
    assert_eq!(response.body.as_deref(), Some(&b"host a"[..]));
}

const UPLOAD_CONFIG: &str = "\
server 127.0.0.1 {port}
route /u {root} upload=on upload_path={root}/up
route / {root}
";

#[test]
fn chunked_post_upload() {
    let server = Server::with_config(UPLOAD_CONFIG);
    let raw = server.send(
        b"POST /u HTTP/1.1\r\nHost: localhost\r\nTransfer-Encoding: chunked\r\n\
          Connection: close\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n",
    );
    let response = Response::from_reader(&mut raw.as_slice()).unwrap();
    assert_eq!(response.status(), 200);
    let saved = fs::read(server.root().join("up").join("upload_1.bin")).unwrap();
    assert_eq!(saved, b"Wikipedia");
}

#[test]
fn raw_post_upload() {
    let server = Server::with_config(UPLOAD_CONFIG);
    let raw = server.send(
        b"POST /u HTTP/1.1\r\nHost: localhost\r\nContent-Length: 9\r\n\
          Connection: close\r\n\r\nraw-bytes",
    );
    let response = Response::from_reader(&mut raw.as_slice()).unwrap();
    assert_eq!(response.status(), 200);
    let body = String::from_utf8(response.body.unwrap()).unwrap();
    assert!(body.contains("upload_1.bin"));
    let saved = fs::read(server.root().join("up").join("upload_1.bin")).unwrap();
    assert_eq!(saved, b"raw-bytes");
}

#[test]
fn multipart_post_upload() {
    let server = Server::with_config(UPLOAD_CONFIG);
    let body: &[u8] = b"--BOUND\r\n\
        Content-Disposition: form-data; name=\"doc\"; filename=\"data.txt\"\r\n\
        Content-Type: text/plain\r\n\r\n\
        file contents here\r\n\
        --BOUND--\r\n";
    let mut raw = format!(
        "POST /u HTTP/1.1\r\nHost: localhost\r\n\
         Content-Type: multipart/form-data; boundary=BOUND\r\n\
         Content-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    )
    .into_bytes();
    raw.extend_from_slice(body);
    let response = Response::from_reader(&mut server.send(&raw).as_slice()).unwrap();
    assert_eq!(response.status(), 200);
    let summary = String::from_utf8(response.body.unwrap()).unwrap();
    assert!(summary.contains("Saved field='doc'"));
    let saved = fs::read(server.root().join("up").join("data.txt")).unwrap();
    assert_eq!(saved, b"file contents here");
}

#[test]
fn oversized_body_is_413() {
    let config = "\
server 127.0.0.1 {port}
client_max_body_size 10
route / {root} upload=on
";
    let server = Server::with_config(config);
    let raw = server.send(
        b"POST / HTTP/1.1\r\nHost: localhost\r\nContent-Length: 20\r\n\r\n\
          01234567890123456789",
    );
    assert!(String::from_utf8_lossy(&raw).starts_with("HTTP/1.1 413 Payload Too Large\r\n"));
}

const CGI_CONFIG: &str = "\
server 127.0.0.1 {port}
server_name localhost
cgi_timeout 2000
route /cgi {root} cgi_ext=.sh cgi_bin=/bin/sh
route / {root}
";

#[test]
fn cgi_round_trip() {
    let server = Server::with_config(CGI_CONFIG);
    server.create_file("ok.sh", b"printf 'Content-Type: text/plain\\r\\n\\r\\nok'\n");
    let response = server.get("/cgi/ok.sh");
    assert_eq!(response.status(), 200);
    assert_eq!(response.header("Content-Type"), Some("text/plain"));
    assert_eq!(response.body.as_deref(), Some(&b"ok"[..]));
}

#[test]
fn cgi_status_header_sets_response_code() {
    let server = Server::with_config(CGI_CONFIG);
    server.create_file(
        "created.sh",
        b"printf 'Status: 201 Created\\r\\nContent-Type: text/plain\\r\\n\\r\\nmade'\n",
    );
    let response = server.get("/cgi/created.sh");
    assert_eq!(response.status(), 201);
    assert!(response.response_line.contains("Created"));
    assert_eq!(response.body.as_deref(), Some(&b"made"[..]));
}

#[test]
fn cgi_receives_query_string() {
    let server = Server::with_config(CGI_CONFIG);
    server.create_file(
        "env.sh",
        b"printf 'Content-Type: text/plain\\r\\n\\r\\n%s' \"$QUERY_STRING\"\n",
    );
    let response = server.get("/cgi/env.sh?x=1&y=2");
    assert_eq!(response.status(), 200);
    assert_eq!(response.body.as_deref(), Some(&b"x=1&y=2"[..]));
}

#[test]
fn cgi_receives_request_body_on_stdin() {
    let server = Server::with_config(CGI_CONFIG);
    server.create_file("echo.sh", b"printf 'Content-Type: text/plain\\r\\n\\r\\n'; cat\n");
    let raw = server.send(
        b"POST /cgi/echo.sh HTTP/1.1\r\nHost: localhost\r\nContent-Length: 4\r\n\
          Connection: close\r\n\r\nping",
    );
    let response = Response::from_reader(&mut raw.as_slice()).unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.body.as_deref(), Some(&b"ping"[..]));
}

#[test]
fn cgi_without_headers_is_500() {
    let server = Server::with_config(CGI_CONFIG);
    server.create_file("silent.sh", b"exit 0\n");
    assert_eq!(server.get("/cgi/silent.sh").status(), 500);
}

#[test]
fn cgi_timeout_is_504() {
    let config = "\
server 127.0.0.1 {port}
cgi_timeout 300
route /cgi {root} cgi_ext=.sh cgi_bin=/bin/sh
";
    let server = Server::with_config(config);
    server.create_file("hang.sh", b"sleep 5\n");
    let response = server.get("/cgi/hang.sh");
    assert_eq!(response.status(), 504);
}

#[test]
fn keep_alive_and_pipelining() {
    let server = Server::with_config(BASE_CONFIG);
    server.create_file("one.txt", b"1");
    server.create_file("two.txt", b"22");
    let mut stream = server.stream();
    stream
        .write_all(
            b"GET /one.txt HTTP/1.1\r\nHost: localhost\r\n\r\n\
              GET /two.txt HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        )
        .unwrap();
    let first = Response::from_reader(&mut stream).unwrap();
    assert_eq!(first.status(), 200);
    assert_eq!(first.header("Connection"), Some("keep-alive"));
    assert_eq!(first.body.as_deref(), Some(&b"1"[..]));
    let second = Response::from_reader(&mut stream).unwrap();
    assert_eq!(second.status(), 200);
    assert_eq!(second.header("Connection"), Some("close"));
    assert_eq!(second.body.as_deref(), Some(&b"22"[..]));
}

#[test]
fn header_timeout_sends_408() {
    let config = "\
server 127.0.0.1 {port}
header_timeout 300
route / {root}
";
    let server = Server::with_config(config);
    let mut stream = server.stream();
    // Request line only; the terminating CRLFCRLF never arrives.
    stream.write_all(b"GET / HTTP/1.1\r\n").unwrap();
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).expect("expected 408 then close");
    assert!(String::from_utf8_lossy(&buf).starts_with("HTTP/1.1 408 Request Timeout\r\n"));
}

#[test]
fn body_timeout_sends_408() {
    let config = "\
server 127.0.0.1 {port}
body_timeout 300
route / {root} upload=on
";
    let server = Server::with_config(config);
    let mut stream = server.stream();
    // Headers complete but only half the declared body is sent.
    stream
        .write_all(b"POST / HTTP/1.1\r\nHost: localhost\r\nContent-Length: 10\r\n\r\nhalf")
        .unwrap();
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).expect("expected 408 then close");
    assert!(String::from_utf8_lossy(&buf).starts_with("HTTP/1.1 408 Request Timeout\r\n"));
}

#[test]
fn idle_keep_alive_connection_is_closed() {
    let config = "\
server 127.0.0.1 {port}
idle_timeout 300
route / {root}
";
    let server = Server::with_config(config);
    server.create_file("f.txt", b"x");
    let mut stream = server.stream();
    stream
        .write_all(b"GET /f.txt HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    let response = Response::from_reader(&mut stream).unwrap();
    assert_eq!(response.header("Connection"), Some("keep-alive"));
    // No follow-up request: the idle sweep closes the connection.
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());
}
