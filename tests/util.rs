use std::collections::HashMap;
use std::fs::{create_dir, File};
use std::io;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::Duration;

use tempfile::{tempdir, TempDir};

fn get_unused_port() -> Option<u16> {
    TcpListener::bind(("localhost", 0))
        .ok()
        .map(|listener| listener.local_addr().unwrap().port())
}

fn wait_for_port(port: u16) -> bool {
    for _ in 0..1000 {
        if TcpStream::connect(("localhost", port)).is_ok() {
            return true;
        }
        sleep(Duration::from_millis(1));
    }
    false
}

struct ScopedChild(Child);

impl Drop for ScopedChild {
    fn drop(&mut self) {
        self.0.kill().ok();
    }
}

impl From<Child> for ScopedChild {
    fn from(child: Child) -> Self {
        ScopedChild(child)
    }
}

/// A selfserv instance running against a temporary document root. The
/// config text may refer to `{root}` and `{port}`, which are substituted
/// before the file is written.
pub struct Server {
    _child: ScopedChild,
    port: u16,
    root: TempDir,
}

impl Server {
    pub fn with_config(config_template: &str) -> Self {
        let root = tempdir().expect("failed to create tempdir");

        // Get an unused port. Assumes the port won't be reused before we
        // start the server.
        let port = get_unused_port().expect("failed to get unused port");

        let config_text = config_template
            .replace("{root}", root.path().to_str().expect("path is not valid UTF-8"))
            .replace("{port}", &port.to_string());
        let config_path = root.path().join("selfserv.conf");
        std::fs::write(&config_path, config_text).expect("failed to write config");

        let child = Command::new(env!("CARGO_BIN_EXE_selfserv"))
            .arg(&config_path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn selfserv")
            .into();

        // Wait until the socket is open.
        assert!(wait_for_port(port), "failed to connect to selfserv");

        Self {
            _child: child,
            port,
            root,
        }
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    pub fn create_dir(&self, name: &str) -> PathBuf {
        let path = self.root().join(name);
        create_dir(&path).expect("failed to create directory");
        path
    }

    pub fn create_file(&self, name: &str, contents: &[u8]) -> PathBuf {
        let path = self.root().join(name);
        let mut file = File::create(&path).expect("failed to create file");
        file.write_all(contents).expect("failed to write file");
        path
    }

    pub fn stream(&self) -> TcpStream {
        let stream =
            TcpStream::connect(("localhost", self.port)).expect("failed to connect to selfserv");
        // Set timeouts to prevent tests from hanging.
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
            .set_write_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    /// Send raw bytes and read until the server closes the connection.
    pub fn send(&self, raw: &[u8]) -> Vec<u8> {
        let mut stream = self.stream();
        stream.write_all(raw).expect("failed to write request");
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).expect("failed to read response");
        buf
    }

    /// One-shot request with `Connection: close`, parsed into a Response.
    pub fn request(&self, method: &str, path: &str, headers: HashMap<&str, &str>) -> Response {
        let mut raw = format!("{} {} HTTP/1.1\r\n", method, path);
        if !headers.contains_key("Host") {
            raw.push_str("Host: localhost\r\n");
        }
        for (name, value) in headers {
            raw.push_str(&format!("{}: {}\r\n", name, value));
        }
        raw.push_str("Connection: close\r\n\r\n");
        Response::from_reader(&mut self.send(raw.as_bytes()).as_slice())
            .expect("failed to read response")
    }

    pub fn get(&self, path: &str) -> Response {
        self.request("GET", path, HashMap::new())
    }
}

/// HTTP response from selfserv.
pub struct Response {
    pub response_line: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
}

impl Response {
    pub fn from_reader<R: Read>(reader: &mut R) -> io::Result<Self> {
        let response_line = Self::read_header(reader)?;
        let headers = Self::read_headers(reader)?;
        let body = headers
            .get("Content-Length")
            .map(|length| length.parse::<usize>().expect("invalid content length"))
            .map(|length| Self::read_body(reader, length))
            .transpose()?;
        Ok(Self {
            response_line,
            headers,
            body,
        })
    }

    fn read_headers<R: Read>(reader: &mut R) -> io::Result<HashMap<String, String>> {
        let mut headers = HashMap::new();
        loop {
            let header_line = Self::read_header(reader)?;
            if header_line.is_empty() {
                break;
            }
            let mut header = header_line.splitn(2, ": ");
            let key = header.next().expect("invalid header").to_string();
            let value = header.next().expect("invalid header").to_string();
            headers.insert(key, value);
        }
        Ok(headers)
    }

    fn read_header<R: Read>(reader: &mut R) -> io::Result<String> {
        read_until_slice(reader, b"\r\n")
            .map(|vec| String::from_utf8(vec).expect("response header is not valid UTF-8"))
    }

    fn read_body<R: Read>(reader: &mut R, content_length: usize) -> io::Result<Vec<u8>> {
        let mut body = vec![0; content_length];
        reader.read_exact(&mut body)?;
        Ok(body)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|value| value.as_str())
    }

    pub fn status(&self) -> u16 {
        self.response_line
            .split(' ')
            .nth(1)
            .and_then(|code| code.parse().ok())
            .expect("invalid status line")
    }
}

fn read_until_slice<R: Read>(reader: &mut R, separator: &[u8]) -> io::Result<Vec<u8>> {
    let mut byte = [0; 1];
    let mut buf = Vec::new();
    loop {
        reader.read_exact(&mut byte)?;
        buf.push(byte[0]);
        if buf.as_slice().ends_with(separator) {
            buf.truncate(buf.len() - separator.len());
            return Ok(buf);
        }
    }
}
