use std::fmt;

// Die once the header block exceeds this many bytes, so a malformed request
// can't eat up memory.
const MAX_HEADER_BLOCK: usize = 8192;

/// A parsed (possibly still incomplete) HTTP request.
///
/// Header order is preserved and names are stored verbatim; lookups are
/// case-insensitive.
#[derive(Debug, Default)]
pub struct Request {
    pub method: String,
    pub uri: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub complete: bool,
}

impl Request {
    pub fn new() -> Self {
        Request::default()
    }

    /// First header with the given name, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParseError {
    HeaderBlockTooLarge,
    BadRequestLine,
    BadContentLength,
    BadChunkSize,
    BadChunkFraming,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::HeaderBlockTooLarge => write!(f, "header block exceeds {} bytes", MAX_HEADER_BLOCK),
            ParseError::BadRequestLine => write!(f, "malformed request line"),
            ParseError::BadContentLength => write!(f, "invalid Content-Length"),
            ParseError::BadChunkSize => write!(f, "invalid chunk size"),
            ParseError::BadChunkFraming => write!(f, "invalid chunk framing"),
        }
    }
}

impl std::error::Error for ParseError {}

#[derive(Debug, PartialEq)]
pub enum Progress {
    NeedMore,
    Complete,
}

#[derive(Debug, PartialEq)]
enum State {
    RequestLine,
    Body,
    Done,
    Error(ParseError),
}

#[derive(Debug, PartialEq)]
enum ChunkState {
    Size,
    Data,
    Crlf,
    Trailer,
    Done,
}

/// Incremental request parser.
///
/// Each call re-reads the connection's inbound buffer from offset zero and
/// resumes from an internal cursor, so the same buffer can be fed any number
/// of times as it grows. `consumed()` is that cursor: it only ever advances
/// past fully-accepted framing units, and at `Complete` it equals the total
/// byte length of the request (which lets the caller erase exactly one
/// request from the buffer on keep-alive).
#[derive(Debug)]
pub struct RequestParser {
    state: State,
    consumed: usize,
    header_end: usize,
    content_length: Option<usize>,
    chunked: bool,
    chunk_state: ChunkState,
    chunk_size: usize,
    chunk_read: usize,
}

impl RequestParser {
    pub fn new() -> Self {
        RequestParser {
            state: State::RequestLine,
            consumed: 0,
            header_end: 0,
            content_length: None,
            chunked: false,
            chunk_state: ChunkState::Size,
            chunk_size: 0,
            chunk_read: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = RequestParser::new();
    }

    /// Total bytes irreversibly processed from the front of the buffer.
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    /// True once the header block has been fully parsed, even if the body
    /// is still arriving.
    pub fn headers_complete(&self) -> bool {
        matches!(self.state, State::Body | State::Done)
    }

    /// The `Content-Length` the request declared, if any.
    pub fn declared_content_length(&self) -> Option<usize> {
        self.content_length
    }

    /// Feed the inbound buffer. Returns `Complete` once the request is
    /// whole, `NeedMore` if more bytes are required, or the terminal parse
    /// error. The buffer must only ever grow between calls.
    pub fn parse(&mut self, data: &[u8], req: &mut Request) -> Result<Progress, ParseError> {
        if let State::Error(e) = self.state {
            return Err(e);
        }
        if self.state == State::RequestLine {
            let header_end = match find(b"\r\n\r\n", data) {
                Some(pos) => pos,
                None => {
                    if data.len() > MAX_HEADER_BLOCK {
                        return Err(self.fail(ParseError::HeaderBlockTooLarge));
                    }
                    return Ok(Progress::NeedMore);
                }
            };
            if header_end > MAX_HEADER_BLOCK {
                return Err(self.fail(ParseError::HeaderBlockTooLarge));
            }
            self.parse_header_block(&data[..header_end], req)?;
            self.header_end = header_end + 4;
            self.consumed = self.header_end;
            self.state = State::Body;
        }
        if self.state == State::Body {
            if self.chunked {
                self.parse_chunked(data, req)?;
            } else {
                let length = self.content_length.unwrap_or(0);
                if data.len() - self.header_end < length {
                    return Ok(Progress::NeedMore);
                }
                req.body = data[self.header_end..self.header_end + length].to_vec();
                self.consumed = self.header_end + length;
                self.state = State::Done;
                req.complete = true;
            }
        }
        match self.state {
            State::Done => Ok(Progress::Complete),
            _ => Ok(Progress::NeedMore),
        }
    }

    fn parse_header_block(&mut self, block: &[u8], req: &mut Request) -> Result<(), ParseError> {
        let mut lines = block.split_crlf();
        let request_line = match lines.next().map(std::str::from_utf8) {
            Some(Ok(line)) => line,
            _ => return Err(self.fail(ParseError::BadRequestLine)),
        };
        let mut parts = request_line.splitn(3, ' ');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(method), Some(uri), Some(version))
                if !method.is_empty() && !uri.is_empty() && !version.is_empty() =>
            {
                req.method = method.to_string();
                req.uri = uri.to_string();
                req.version = version.to_string();
            }
            _ => return Err(self.fail(ParseError::BadRequestLine)),
        }
        for line in lines {
            // Skip lines that aren't valid UTF-8 or have no colon (lenient).
            let line = match std::str::from_utf8(line) {
                Ok(line) => line,
                Err(_) => continue,
            };
            let colon = match line.find(':') {
                Some(colon) => colon,
                None => continue,
            };
            let name = line[..colon].trim();
            let value = line[colon + 1..].trim();
            if name.eq_ignore_ascii_case("content-length") {
                match value.parse() {
                    Ok(length) => self.content_length = Some(length),
                    Err(_) => return Err(self.fail(ParseError::BadContentLength)),
                }
            }
            if name.eq_ignore_ascii_case("transfer-encoding")
                && value.eq_ignore_ascii_case("chunked")
            {
                self.chunked = true;
            }
            req.headers.push((name.to_string(), value.to_string()));
        }
        Ok(())
    }

    fn parse_chunked(&mut self, data: &[u8], req: &mut Request) -> Result<(), ParseError> {
        loop {
            match self.chunk_state {
                ChunkState::Size => {
                    let line_end = match find(b"\r\n", &data[self.consumed..]) {
                        Some(pos) => self.consumed + pos,
                        None => return Ok(()), // need more
                    };
                    self.chunk_size = parse_chunk_size(&data[self.consumed..line_end])
                        .ok_or_else(|| self.fail(ParseError::BadChunkSize))?;
                    self.chunk_read = 0;
                    self.consumed = line_end + 2;
                    self.chunk_state = if self.chunk_size == 0 {
                        ChunkState::Trailer
                    } else {
                        ChunkState::Data
                    };
                }
                ChunkState::Data => {
                    let available = data.len() - self.consumed;
                    if available == 0 {
                        return Ok(());
                    }
                    let take = available.min(self.chunk_size - self.chunk_read);
                    req.body.extend_from_slice(&data[self.consumed..self.consumed + take]);
                    self.consumed += take;
                    self.chunk_read += take;
                    if self.chunk_read == self.chunk_size {
                        self.chunk_state = ChunkState::Crlf;
                    }
                }
                ChunkState::Crlf => {
                    if data.len() < self.consumed + 2 {
                        return Ok(());
                    }
                    if &data[self.consumed..self.consumed + 2] != b"\r\n" {
                        return Err(self.fail(ParseError::BadChunkFraming));
                    }
                    self.consumed += 2;
                    self.chunk_state = ChunkState::Size;
                }
                ChunkState::Trailer => {
                    // Terminating CRLF only; trailer headers are unsupported.
                    if data.len() < self.consumed + 2 {
                        return Ok(());
                    }
                    if &data[self.consumed..self.consumed + 2] != b"\r\n" {
                        return Err(self.fail(ParseError::BadChunkFraming));
                    }
                    self.consumed += 2;
                    self.chunk_state = ChunkState::Done;
                    self.state = State::Done;
                    req.complete = true;
                    return Ok(());
                }
                ChunkState::Done => return Ok(()),
            }
        }
    }

    fn fail(&mut self, e: ParseError) -> ParseError {
        self.state = State::Error(e);
        e
    }
}

fn parse_chunk_size(line: &[u8]) -> Option<usize> {
    if line.is_empty() {
        return None;
    }
    let mut value: usize = 0;
    for &byte in line {
        let digit = (byte as char).to_digit(16)? as usize;
        value = value.checked_mul(16)?.checked_add(digit)?;
    }
    Some(value)
}

/// Return index of first occurrence of `needle` in `haystack`.
fn find(needle: &[u8], haystack: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Split a byte slice on CRLF boundaries.
trait SplitCrlf {
    fn split_crlf(&self) -> CrlfLines<'_>;
}

impl SplitCrlf for [u8] {
    fn split_crlf(&self) -> CrlfLines<'_> {
        CrlfLines { rest: Some(self) }
    }
}

struct CrlfLines<'a> {
    rest: Option<&'a [u8]>,
}

impl<'a> Iterator for CrlfLines<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        let rest = self.rest?;
        match find(b"\r\n", rest) {
            Some(pos) => {
                self.rest = Some(&rest[pos + 2..]);
                Some(&rest[..pos])
            }
            None => {
                self.rest = None;
                Some(rest)
            }
        }
    }
}
