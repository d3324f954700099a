use std::ffi::{CStr, CString};
use std::os::unix::io::RawFd;
use std::path::Path;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{self, dup2, execvpe, fork, pipe, ForkResult, Pid};

use crate::config::ServerConfig;
use crate::fd::{set_nonblocking, Fd};
use crate::http::Request;

/// A running CGI child and the connection-side ends of its two pipes.
///
/// The pipes close with their `Fd` handles and the child is reaped exactly
/// once: cooperatively via `try_reap`, forcibly via `kill_and_reap`, or as
/// a last resort in `Drop` (which kills first if the child is still alive),
/// so no exit path can leak a descriptor or a zombie.
#[derive(Debug)]
pub struct CgiProcess {
    stdin: Fd,
    stdout: Fd,
    pid: Pid,
    reaped: bool,
    pub buffer: Vec<u8>,
    pub headers_done: bool,
    pub body_start: usize,
    pub write_offset: usize,
    pub started_at_ms: u64,
}

impl CgiProcess {
    /// Fork and exec `<interpreter> <script>` (or the script directly) with
    /// stdin/stdout wired through fresh pipes and the CGI/1.1 environment.
    /// The child chdirs into the script's directory so interpreted scripts
    /// can use relative includes.
    pub fn spawn(
        script: &str,
        interpreter: Option<&str>,
        req: &Request,
        sc: &ServerConfig,
        now_ms: u64,
    ) -> nix::Result<CgiProcess> {
        // Built before forking; only dup2/chdir/exec happen in the child.
        let env = cgi_env(script, req, sc);
        let mut argv = Vec::new();
        if let Some(interpreter) = interpreter {
            argv.push(cstring(interpreter));
        }
        argv.push(cstring(script));
        let exec_path = argv[0].clone();
        let script_dir = Path::new(script)
            .parent()
            .map(|dir| cstring(&dir.to_string_lossy()));

        let stdin_pipe = pipe()?;
        let (stdin_read, stdin_write) = (Fd::new(stdin_pipe.0), Fd::new(stdin_pipe.1));
        let stdout_pipe = pipe()?;
        let (stdout_read, stdout_write) = (Fd::new(stdout_pipe.0), Fd::new(stdout_pipe.1));

        match unsafe { fork() }? {
            ForkResult::Child => {
                dup2(stdin_read.get(), libc::STDIN_FILENO).ok();
                dup2(stdout_write.get(), libc::STDOUT_FILENO).ok();
                for fd in &[&stdin_read, &stdin_write, &stdout_read, &stdout_write] {
                    if fd.get() > libc::STDERR_FILENO {
                        unistd::close(fd.get()).ok();
                    }
                }
                if let Some(dir) = &script_dir {
                    if !dir.as_bytes().is_empty() {
                        unistd::chdir(dir.as_c_str()).ok();
                    }
                }
                let argv_ref: Vec<&CStr> = argv.iter().map(|a| a.as_c_str()).collect();
                let env_ref: Vec<&CStr> = env.iter().map(|e| e.as_c_str()).collect();
                execvpe(exec_path.as_c_str(), &argv_ref, &env_ref).ok();
                unsafe { libc::_exit(1) };
            }
            ForkResult::Parent { child } => {
                // Unused ends close when stdin_read/stdout_write drop here.
                set_nonblocking(stdin_write.get()).ok();
                set_nonblocking(stdout_read.get()).ok();
                Ok(CgiProcess {
                    stdin: stdin_write,
                    stdout: stdout_read,
                    pid: child,
                    reaped: false,
                    buffer: Vec::new(),
                    headers_done: false,
                    body_start: 0,
                    write_offset: 0,
                    started_at_ms: now_ms,
                })
            }
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn stdin_fd(&self) -> RawFd {
        self.stdin.get()
    }

    pub fn stdout_fd(&self) -> RawFd {
        self.stdout.get()
    }

    pub fn stdin_open(&self) -> bool {
        self.stdin.valid()
    }

    pub fn stdout_open(&self) -> bool {
        self.stdout.valid()
    }

    /// Best-effort write of the remaining request body into the child's
    /// stdin. Once everything is written (or the pipe fails) the fd is
    /// closed; the closed descriptor is returned so the caller can drop it
    /// from the pipe map.
    pub fn pump_stdin(&mut self, body: &[u8]) -> Option<RawFd> {
        if !self.stdin.valid() {
            return None;
        }
        if self.write_offset < body.len() {
            match unistd::write(self.stdin.get(), &body[self.write_offset..]) {
                Ok(n) => self.write_offset += n,
                Err(nix::Error::Sys(Errno::EAGAIN)) => return None,
                Err(_) => return self.close_stdin(),
            }
        }
        if self.write_offset >= body.len() {
            return self.close_stdin();
        }
        None
    }

    /// Best-effort drain of the child's stdout into the raw CGI buffer.
    /// Returns the closed descriptor on EOF or error.
    pub fn pump_stdout(&mut self) -> Option<RawFd> {
        if !self.stdout.valid() {
            return None;
        }
        let mut buf = [0u8; 4096];
        loop {
            match unistd::read(self.stdout.get(), &mut buf) {
                Ok(0) => return self.close_stdout(),
                Ok(n) => self.buffer.extend_from_slice(&buf[..n]),
                Err(nix::Error::Sys(Errno::EAGAIN)) => return None,
                Err(_) => return self.close_stdout(),
            }
        }
    }

    pub fn close_stdin(&mut self) -> Option<RawFd> {
        if !self.stdin.valid() {
            return None;
        }
        let raw = self.stdin.get();
        self.stdin.reset(-1);
        Some(raw)
    }

    pub fn close_stdout(&mut self) -> Option<RawFd> {
        if !self.stdout.valid() {
            return None;
        }
        let raw = self.stdout.get();
        self.stdout.reset(-1);
        Some(raw)
    }

    /// True once the child has been reaped.
    pub fn finished(&self) -> bool {
        self.reaped
    }

    /// Non-blocking check for child exit.
    pub fn try_reap(&mut self) -> bool {
        if self.reaped {
            return true;
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => false,
            // Any other status (or an ECHILD error) means the child is gone.
            _ => {
                self.reaped = true;
                true
            }
        }
    }

    /// SIGKILL the child and reap it; used on CGI timeout.
    pub fn kill_and_reap(&mut self) {
        if self.reaped {
            return;
        }
        kill(self.pid, Signal::SIGKILL).ok();
        waitpid(self.pid, None).ok();
        self.reaped = true;
    }
}

impl Drop for CgiProcess {
    fn drop(&mut self) {
        if !self.try_reap() {
            self.kill_and_reap();
        }
    }
}

/// The translated CGI header block: `Status` becomes the HTTP status line,
/// `Content-Type` and `Connection` are pulled out, everything else passes
/// through.
#[derive(Debug)]
pub struct CgiReply {
    pub code: u16,
    pub reason: String,
    pub content_type: String,
    pub connection: Option<String>,
    pub pass_headers: Vec<(String, String)>,
}

pub fn parse_reply(block: &[u8]) -> CgiReply {
    let mut reply = CgiReply {
        code: 200,
        reason: "OK".to_string(),
        content_type: "text/html".to_string(),
        connection: None,
        pass_headers: Vec::new(),
    };
    for line in String::from_utf8_lossy(block).split("\r\n") {
        let colon = match line.find(':') {
            Some(colon) => colon,
            None => continue,
        };
        let name = line[..colon].trim();
        let value = line[colon + 1..].trim();
        if name.eq_ignore_ascii_case("status") {
            let mut parts = value.splitn(2, ' ');
            if let Some(Ok(code)) = parts.next().map(str::parse) {
                if (100..=599).contains(&code) {
                    reply.code = code;
                }
            }
            if let Some(reason) = parts.next() {
                if !reason.trim().is_empty() {
                    reply.reason = reason.trim().to_string();
                }
            }
        } else if name.eq_ignore_ascii_case("content-type") {
            reply.content_type = value.to_string();
        } else if name.eq_ignore_ascii_case("connection") {
            reply.connection = Some(value.to_string());
        } else {
            reply.pass_headers.push((name.to_string(), value.to_string()));
        }
    }
    reply
}

/// CGI/1.1 environment for the child, every request header included as
/// `HTTP_<UPPER_UNDERSCORE_NAME>`.
fn cgi_env(script: &str, req: &Request, sc: &ServerConfig) -> Vec<CString> {
    let (path_info, query) = match req.uri.find('?') {
        Some(pos) => (&req.uri[..pos], &req.uri[pos + 1..]),
        None => (req.uri.as_str(), ""),
    };
    let server_name = sc
        .server_names
        .first()
        .map(|name| name.as_str())
        .unwrap_or(if sc.host.is_empty() { "localhost" } else { &sc.host });

    let mut env = vec![
        format!("REQUEST_METHOD={}", req.method),
        format!("SCRIPT_FILENAME={}", script),
        format!("SCRIPT_NAME={}", script),
        format!("PATH_INFO={}", path_info),
        format!("QUERY_STRING={}", query),
        format!("CONTENT_LENGTH={}", req.body.len()),
        "GATEWAY_INTERFACE=CGI/1.1".to_string(),
        "SERVER_PROTOCOL=HTTP/1.1".to_string(),
        "REDIRECT_STATUS=200".to_string(),
        format!("SERVER_NAME={}", server_name),
        format!("SERVER_PORT={}", sc.port),
    ];
    if let Some(content_type) = req.header("content-type") {
        env.push(format!("CONTENT_TYPE={}", content_type));
    }
    for (name, value) in &req.headers {
        let mangled: String = name
            .chars()
            .map(|c| if c == '-' { '_' } else { c.to_ascii_uppercase() })
            .collect();
        env.push(format!("HTTP_{}={}", mangled, value));
    }
    env.into_iter().filter_map(|var| CString::new(var).ok()).collect()
}

fn cstring(s: &str) -> CString {
    CString::new(s.as_bytes().to_vec()).unwrap_or_default()
}
