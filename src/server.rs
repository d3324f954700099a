use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::os::unix::io::RawFd;

use anyhow::{Context, Result};
use chrono::Utc;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::socket::{self, sockopt, AddressFamily, InetAddr, MsgFlags, SockAddr, SockFlag, SockProtocol, SockType};

use crate::cgi::{self, CgiProcess};
use crate::config::Config;
use crate::fd::{set_nonblocking, Fd};
use crate::handler::{self, Outcome};
use crate::http::{Progress, Request, RequestParser};
use crate::response;
use crate::routing;

const LISTEN_BACKLOG: usize = 128;

/// Coarse wall-clock milliseconds; the single clock source for deadlines
/// and the poll-timeout computation.
fn now_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    Accepted,
    Headers,
    Body,
    Handle,
    Respond,
    Idle,
    Closing,
}

/// Per-client connection state, owned by the loop and keyed by its fd.
struct Connection {
    fd: Fd,
    read_buf: Vec<u8>,
    write_buf: Vec<u8>,
    parser: RequestParser,
    request: Request,
    want_write: bool,
    keep_alive: bool,
    created_at_ms: u64,
    last_activity_ms: u64,
    headers_complete: bool,
    body_complete: bool,
    timed_out: bool,
    phase: Phase,
    server_index: Option<usize>,
    cgi: Option<CgiProcess>,
}

impl Connection {
    fn new(fd: Fd, now: u64) -> Self {
        Connection {
            fd,
            read_buf: Vec::new(),
            write_buf: Vec::new(),
            parser: RequestParser::new(),
            request: Request::new(),
            want_write: false,
            keep_alive: false,
            created_at_ms: now,
            last_activity_ms: now,
            headers_complete: false,
            body_complete: false,
            timed_out: false,
            phase: Phase::Accepted,
            server_index: None,
            cgi: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum TimeoutKind {
    Request,
    Idle,
    Cgi,
}

/// The event loop: owns the listening sockets, the connection table, and
/// the pipe-fd map for active CGI children. One `poll_once` +
/// `process_events` pair is one tick.
pub struct Server {
    config: Config,
    listeners: Vec<Fd>,
    clients: HashMap<RawFd, Connection>,
    cgi_fd_to_client: HashMap<RawFd, RawFd>,
    poll_fds: Vec<PollFd>,
    poll_raw: Vec<RawFd>,
    upload_counter: u64,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Server {
            config,
            listeners: Vec::new(),
            clients: HashMap::new(),
            cgi_fd_to_client: HashMap::new(),
            poll_fds: Vec::new(),
            poll_raw: Vec::new(),
            upload_counter: 0,
        }
    }

    /// Open one listening socket per configured server.
    pub fn init(&mut self) -> Result<()> {
        for sc in &self.config.servers {
            let fd = socket::socket(
                AddressFamily::Inet,
                SockType::Stream,
                SockFlag::empty(),
                SockProtocol::Tcp,
            )
            .context("failed to create listening socket")?;
            let fd = Fd::new(fd);
            socket::setsockopt(fd.get(), sockopt::ReuseAddr, &true)
                .context("failed to set SO_REUSEADDR")?;
            let ip: IpAddr = if sc.host.is_empty() {
                IpAddr::from([0, 0, 0, 0])
            } else {
                sc.host
                    .parse()
                    .with_context(|| format!("listen address {} is invalid", sc.host))?
            };
            let addr = SocketAddr::new(ip, sc.port);
            socket::bind(fd.get(), &SockAddr::Inet(InetAddr::from_std(&addr)))
                .with_context(|| format!("failed to bind {}", addr))?;
            socket::listen(fd.get(), LISTEN_BACKLOG)
                .with_context(|| format!("failed to listen on {}", addr))?;
            set_nonblocking(fd.get()).context("failed to set listening socket non-blocking")?;
            println!("listening on http://{}/", addr);
            self.listeners.push(fd);
        }
        Ok(())
    }

    /// Build the poll set and wait for readiness, clamping the supplied
    /// timeout to the earliest connection deadline so timeouts fire
    /// promptly. Interruption by a signal is not an error.
    pub fn poll_once(&mut self, timeout_ms: i32) -> Result<()> {
        self.build_poll_set();
        let now = now_ms();
        let mut timeout = timeout_ms;
        if let Some(deadline) = self.nearest_deadline() {
            let remain = deadline.saturating_sub(now).min(i32::max_value() as u64) as i32;
            if timeout < 0 || remain < timeout {
                timeout = remain;
            }
        }
        match poll(&mut self.poll_fds, timeout) {
            Ok(_) => Ok(()),
            Err(nix::Error::Sys(Errno::EINTR)) => {
                // Don't dispatch stale readiness after an interrupted poll.
                self.poll_fds.clear();
                self.poll_raw.clear();
                Ok(())
            }
            Err(e) => Err(e).context("poll failed"),
        }
    }

    /// Sweep deadlines, then dispatch every ready descriptor from the last
    /// poll: listeners accept, CGI pipes drive their child, client sockets
    /// read/write, and HUP/ERR forces closure.
    pub fn process_events(&mut self) {
        self.sweep_timeouts();
        let ready: Vec<(RawFd, PollFlags)> = self
            .poll_fds
            .iter()
            .zip(self.poll_raw.iter())
            .filter_map(|(pfd, &fd)| {
                pfd.revents().filter(|r| !r.is_empty()).map(|r| (fd, r))
            })
            .collect();
        for (fd, revents) in ready {
            if self.listeners.iter().any(|l| l.get() == fd) {
                if revents.intersects(PollFlags::POLLIN) {
                    self.accept_new(fd);
                }
            } else if self.cgi_fd_to_client.contains_key(&fd) {
                self.handle_cgi_event(fd);
            } else if self.clients.contains_key(&fd) {
                self.handle_client_event(fd, revents);
            }
        }
    }

    /// Drop every connection and listener; their handles close the fds and
    /// any CGI children are killed and reaped on the way out.
    pub fn shutdown(&mut self) {
        let fds: Vec<RawFd> = self.clients.keys().copied().collect();
        for fd in fds {
            if let Some(conn) = self.clients.remove(&fd) {
                self.destroy_connection(conn);
            }
        }
        self.listeners.clear();
    }

    fn build_poll_set(&mut self) {
        self.poll_fds.clear();
        self.poll_raw.clear();
        for listener in &self.listeners {
            self.poll_fds.push(PollFd::new(listener.get(), PollFlags::POLLIN));
            self.poll_raw.push(listener.get());
        }
        for (&fd, conn) in &self.clients {
            let mut events = PollFlags::POLLIN;
            if conn.want_write && !conn.write_buf.is_empty() {
                events.insert(PollFlags::POLLOUT);
            }
            self.poll_fds.push(PollFd::new(fd, events));
            self.poll_raw.push(fd);
            if let Some(cgi) = &conn.cgi {
                if cgi.stdin_open() {
                    self.poll_fds.push(PollFd::new(cgi.stdin_fd(), PollFlags::POLLOUT));
                    self.poll_raw.push(cgi.stdin_fd());
                }
                if cgi.stdout_open() {
                    self.poll_fds.push(PollFd::new(cgi.stdout_fd(), PollFlags::POLLIN));
                    self.poll_raw.push(cgi.stdout_fd());
                }
            }
        }
    }

    /// The connection's phase-appropriate deadline, if its budget is
    /// non-zero: header time runs from creation, body and idle time from
    /// the last activity, CGI time from the child's start.
    fn deadline_for(&self, conn: &Connection) -> Option<(u64, TimeoutKind)> {
        if conn.phase == Phase::Closing || conn.timed_out {
            return None;
        }
        if let Some(cgi) = &conn.cgi {
            let sc = &self.config.servers[conn.server_index.unwrap_or(0)];
            if sc.cgi_timeout_ms > 0 {
                return Some((cgi.started_at_ms + sc.cgi_timeout_ms, TimeoutKind::Cgi));
            }
            return None;
        }
        if conn.phase == Phase::Idle {
            let sc = &self.config.servers[conn.server_index.unwrap_or(0)];
            if sc.idle_timeout_ms > 0 {
                return Some((conn.last_activity_ms + sc.idle_timeout_ms, TimeoutKind::Idle));
            }
            return None;
        }
        if !conn.headers_complete {
            // No virtual host yet; the first server's budget applies.
            let sc = &self.config.servers[0];
            if sc.header_timeout_ms > 0 {
                return Some((conn.created_at_ms + sc.header_timeout_ms, TimeoutKind::Request));
            }
            return None;
        }
        if !conn.body_complete {
            let sc = &self.config.servers[conn.server_index.unwrap_or(0)];
            if sc.body_timeout_ms > 0 {
                return Some((conn.last_activity_ms + sc.body_timeout_ms, TimeoutKind::Request));
            }
        }
        None
    }

    fn nearest_deadline(&self) -> Option<u64> {
        self.clients
            .values()
            .filter_map(|conn| self.deadline_for(conn).map(|(deadline, _)| deadline))
            .min()
    }

    fn sweep_timeouts(&mut self) {
        let now = now_ms();
        let expired: Vec<(RawFd, TimeoutKind)> = self
            .clients
            .iter()
            .filter_map(|(&fd, conn)| match self.deadline_for(conn) {
                Some((deadline, kind)) if now >= deadline => Some((fd, kind)),
                _ => None,
            })
            .collect();
        for (fd, kind) in expired {
            let mut conn = match self.clients.remove(&fd) {
                Some(conn) => conn,
                None => continue,
            };
            match kind {
                TimeoutKind::Idle => {
                    eprintln!("[idle-timeout] fd={} closing keep-alive", fd);
                    self.destroy_connection(conn);
                    continue;
                }
                TimeoutKind::Request => {
                    eprintln!("[timeout] fd={} sending 408", fd);
                    conn.timed_out = true;
                    conn.keep_alive = false;
                    if conn.write_buf.is_empty() {
                        let sc = &self.config.servers[conn.server_index.unwrap_or(0)];
                        conn.write_buf = response::build_error(
                            sc,
                            408,
                            "Request Timeout",
                            "408 Request Timeout\n",
                            false,
                        );
                    }
                    conn.phase = Phase::Closing;
                    conn.want_write = true;
                }
                TimeoutKind::Cgi => {
                    if let Some(mut cgi) = conn.cgi.take() {
                        eprintln!("[cgi-timeout] pid={} fd={}", cgi.pid(), fd);
                        if let Some(raw) = cgi.close_stdin() {
                            self.cgi_fd_to_client.remove(&raw);
                        }
                        if let Some(raw) = cgi.close_stdout() {
                            self.cgi_fd_to_client.remove(&raw);
                        }
                        cgi.kill_and_reap();
                    }
                    conn.timed_out = true;
                    conn.keep_alive = false;
                    let sc = &self.config.servers[conn.server_index.unwrap_or(0)];
                    conn.write_buf = response::build_error(
                        sc,
                        504,
                        "Gateway Timeout",
                        "504 Gateway Timeout (CGI)\n",
                        false,
                    );
                    conn.phase = Phase::Closing;
                    conn.want_write = true;
                }
            }
            self.clients.insert(fd, conn);
        }
    }

    /// Drain the non-blocking accept queue.
    fn accept_new(&mut self, listen_fd: RawFd) {
        loop {
            match socket::accept(listen_fd) {
                Ok(client_fd) => {
                    if set_nonblocking(client_fd).is_err() {
                        nix::unistd::close(client_fd).ok();
                        continue;
                    }
                    let now = now_ms();
                    self.clients.insert(client_fd, Connection::new(Fd::new(client_fd), now));
                    eprintln!("[accept] fd={} total_clients={}", client_fd, self.clients.len());
                }
                Err(nix::Error::Sys(Errno::EAGAIN)) => break,
                Err(e) => {
                    eprintln!("warning: accept() failed: {}", e);
                    break;
                }
            }
        }
    }

    fn handle_client_event(&mut self, fd: RawFd, revents: PollFlags) {
        let mut conn = match self.clients.remove(&fd) {
            Some(conn) => conn,
            None => return,
        };
        let mut close = false;
        if revents.intersects(PollFlags::POLLIN) {
            close = self.conn_readable(&mut conn);
        }
        if !close && revents.intersects(PollFlags::POLLOUT) {
            close = self.conn_writable(&mut conn);
        }
        if revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR) {
            close = true;
        }
        if close {
            self.destroy_connection(conn);
        } else {
            self.clients.insert(fd, conn);
        }
    }

    /// Receive as much as the socket will give, then feed the parser.
    /// Returns true when the connection should be closed now.
    fn conn_readable(&mut self, conn: &mut Connection) -> bool {
        let mut peer_closed = false;
        let mut buf = [0u8; 4096];
        loop {
            match socket::recv(conn.fd.get(), &mut buf, MsgFlags::empty()) {
                Ok(0) => {
                    peer_closed = true;
                    break;
                }
                Ok(n) => {
                    conn.read_buf.extend_from_slice(&buf[..n]);
                    conn.last_activity_ms = now_ms();
                }
                Err(nix::Error::Sys(Errno::EAGAIN)) => break,
                Err(_) => return true,
            }
        }
        // A request already being answered leaves pipelined bytes waiting
        // in the buffer; nothing to parse until the response is out.
        if matches!(conn.phase, Phase::Accepted | Phase::Headers | Phase::Body | Phase::Idle) {
            if self.advance_connection(conn) {
                return true;
            }
        }
        peer_closed && conn.write_buf.is_empty() && conn.cgi.is_none()
    }

    /// Feed the inbound buffer to the parser and, on completion, run the
    /// handler to queue a response or start a CGI child.
    fn advance_connection(&mut self, conn: &mut Connection) -> bool {
        if conn.read_buf.is_empty() {
            return false;
        }
        if matches!(conn.phase, Phase::Accepted | Phase::Idle) {
            conn.phase = Phase::Headers;
        }
        let progress = match conn.parser.parse(&conn.read_buf, &mut conn.request) {
            Ok(progress) => progress,
            Err(e) => {
                eprintln!("[400] malformed request: {}", e);
                self.queue_error(conn, 400, "Bad Request", "400 Bad Request\n");
                return false;
            }
        };
        if conn.parser.headers_complete() && !conn.headers_complete {
            conn.headers_complete = true;
            conn.server_index = Some(routing::select_server(&self.config, &conn.request));
            conn.phase = Phase::Body;
            // Reject a declared oversize body before buffering it.
            let limit = self.config.servers[conn.server_index.unwrap_or(0)].client_max_body_size;
            if conn.parser.declared_content_length().map_or(false, |len| len > limit) {
                eprintln!("[413] declared body exceeds limit={}", limit);
                self.queue_error(conn, 413, "Payload Too Large", "413 Payload Too Large\n");
                return false;
            }
        }
        if progress != Progress::Complete {
            return false;
        }
        conn.body_complete = true;
        let server_index = conn.server_index.unwrap_or(0);
        let limit = self.config.servers[server_index].client_max_body_size;
        if conn.request.body.len() > limit {
            eprintln!("[413] body_size={} limit={}", conn.request.body.len(), limit);
            self.queue_error(conn, 413, "Payload Too Large", "413 Payload Too Large\n");
            return false;
        }
        conn.phase = Phase::Handle;
        match handler::handle_request(
            &self.config,
            server_index,
            &conn.request,
            &mut self.upload_counter,
        ) {
            Outcome::Respond { bytes, keep_alive } => {
                conn.keep_alive = keep_alive;
                conn.write_buf = bytes;
                conn.phase = Phase::Respond;
                conn.want_write = true;
            }
            Outcome::StartCgi { script, interpreter } => {
                let spawned = CgiProcess::spawn(
                    &script,
                    interpreter.as_deref(),
                    &conn.request,
                    &self.config.servers[server_index],
                    now_ms(),
                );
                match spawned {
                    Ok(cgi) => {
                        eprintln!("[cgi] started pid={} script={}", cgi.pid(), script);
                        self.cgi_fd_to_client.insert(cgi.stdin_fd(), conn.fd.get());
                        self.cgi_fd_to_client.insert(cgi.stdout_fd(), conn.fd.get());
                        conn.cgi = Some(cgi);
                        conn.want_write = false;
                    }
                    Err(e) => {
                        eprintln!("[500] cgi launch failed script={} error={}", script, e);
                        self.queue_error(
                            conn,
                            500,
                            "Internal Server Error",
                            "500 Internal Server Error\n",
                        );
                    }
                }
            }
        }
        false
    }

    /// Flush the outbound buffer. Once drained, either close or recycle
    /// the connection for keep-alive, preserving pipelined bytes.
    fn conn_writable(&mut self, conn: &mut Connection) -> bool {
        while !conn.write_buf.is_empty() {
            match socket::send(conn.fd.get(), &conn.write_buf, MsgFlags::empty()) {
                Ok(n) if n > 0 => {
                    conn.write_buf.drain(..n);
                }
                Ok(_) => break,
                Err(nix::Error::Sys(Errno::EAGAIN)) => return false,
                Err(_) => return true,
            }
        }
        if !conn.write_buf.is_empty() {
            return false;
        }
        if conn.cgi.is_some() {
            // The CGI child may still produce output for this response.
            return false;
        }
        if !conn.keep_alive || conn.phase == Phase::Closing {
            return true;
        }
        // Erase exactly the bytes of the answered request; anything left
        // over is the start of a pipelined follow-up.
        let consumed = conn.parser.consumed().min(conn.read_buf.len());
        conn.read_buf.drain(..consumed);
        conn.parser.reset();
        conn.request = Request::new();
        conn.want_write = false;
        conn.keep_alive = false;
        conn.headers_complete = false;
        conn.body_complete = false;
        conn.server_index = None;
        conn.phase = Phase::Idle;
        conn.last_activity_ms = now_ms();
        // Level-triggered polling won't wake for bytes already in our
        // buffer, so service any pipelined request straight away.
        self.advance_connection(conn)
    }

    fn handle_cgi_event(&mut self, pipe_fd: RawFd) {
        let client_fd = match self.cgi_fd_to_client.get(&pipe_fd) {
            Some(&client_fd) => client_fd,
            None => return,
        };
        let mut conn = match self.clients.remove(&client_fd) {
            Some(conn) => conn,
            None => {
                // Stale map entry; the connection is already gone.
                self.cgi_fd_to_client.remove(&pipe_fd);
                return;
            }
        };
        if self.drive_cgi(&mut conn) {
            self.destroy_connection(conn);
        } else {
            self.clients.insert(client_fd, conn);
        }
    }

    /// Pump both CGI pipes and reap the child if it exited. As soon as the
    /// header block appears the reply is translated and queued, enabling
    /// writability; stdout bytes arriving after that are forwarded to the
    /// outbound buffer as they drain. Returns true when the connection
    /// should be closed now.
    fn drive_cgi(&mut self, conn: &mut Connection) -> bool {
        let mut respond_500 = false;
        let mut done = false;
        match conn.cgi.as_mut() {
            Some(cgi) => {
                if let Some(raw) = cgi.pump_stdin(&conn.request.body) {
                    self.cgi_fd_to_client.remove(&raw);
                }
                if let Some(raw) = cgi.pump_stdout() {
                    self.cgi_fd_to_client.remove(&raw);
                }
                if cgi.try_reap() {
                    if let Some(raw) = cgi.close_stdout() {
                        self.cgi_fd_to_client.remove(&raw);
                    }
                    if let Some(raw) = cgi.close_stdin() {
                        self.cgi_fd_to_client.remove(&raw);
                    }
                }
                if !cgi.headers_done {
                    if let Some(pos) = find(b"\r\n\r\n", &cgi.buffer) {
                        cgi.headers_done = true;
                        cgi.body_start = pos + 4;
                        let reply = cgi::parse_reply(&cgi.buffer[..pos]);
                        let child_close = reply
                            .connection
                            .as_deref()
                            .map_or(false, |v| v.eq_ignore_ascii_case("close"));
                        let keep_alive =
                            handler::keep_alive_requested(&conn.request) && !child_close;
                        conn.keep_alive = keep_alive;
                        conn.write_buf = response::build_cgi_passthrough(
                            reply.code,
                            &reply.reason,
                            &reply.pass_headers,
                            &reply.content_type,
                            keep_alive,
                            &cgi.buffer[cgi.body_start..],
                        );
                        cgi.buffer.clear();
                        conn.phase = Phase::Respond;
                        conn.want_write = true;
                    } else if cgi.finished() && !cgi.stdout_open() {
                        eprintln!("[500] cgi pid={} produced no header block", cgi.pid());
                        respond_500 = true;
                    }
                } else if !cgi.buffer.is_empty() {
                    // Headers are already out; forward new output directly.
                    conn.write_buf.extend_from_slice(&cgi.buffer);
                    cgi.buffer.clear();
                    conn.want_write = true;
                }
                if cgi.headers_done && cgi.finished() && !cgi.stdout_open() {
                    done = true;
                }
            }
            None => return false,
        }
        if respond_500 {
            conn.cgi = None;
            self.queue_error(conn, 500, "Internal Server Error", "500 Internal Server Error\n");
            return false;
        }
        if done {
            conn.cgi = None;
            if conn.write_buf.is_empty() {
                // Everything was flushed already; finalize the exchange.
                return self.conn_writable(conn);
            }
        }
        false
    }

    /// Convert an error into a queued response; always closes after flush.
    fn queue_error(&self, conn: &mut Connection, code: u16, reason: &str, fallback: &str) {
        let sc = &self.config.servers[conn.server_index.unwrap_or(0)];
        let head_only = conn.request.method == "HEAD";
        conn.keep_alive = false;
        conn.write_buf = response::build_error(sc, code, reason, fallback, head_only);
        conn.phase = Phase::Respond;
        conn.want_write = true;
    }

    /// Tear down a connection: unregister any CGI pipe fds, then let the
    /// handles close the descriptors and reap the child.
    fn destroy_connection(&mut self, mut conn: Connection) {
        if let Some(mut cgi) = conn.cgi.take() {
            if let Some(raw) = cgi.close_stdin() {
                self.cgi_fd_to_client.remove(&raw);
            }
            if let Some(raw) = cgi.close_stdout() {
                self.cgi_fd_to_client.remove(&raw);
            }
        }
    }
}

/// Return index of first occurrence of `needle` in `haystack`.
fn find(needle: &[u8], haystack: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
