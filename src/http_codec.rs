//! Incremental HTTP/1.1 codec.
//!
//! [`MessageStream`] wraps a socket (or any async byte stream) and parses one
//! message at a time: it buffers bytes until a complete head is available,
//! then reads the body according to the framing headers. Chunked bodies are
//! decoded (trailers are appended to the headers), `Content-Length` bodies
//! are read exactly, and framing-less response bodies run until the peer
//! closes. The parser preserves header order and casing and accepts obsolete
//! line folding by collapsing the fold into a single space.
//!
//! Serialization is the inverse and never rewrites headers or bodies; callers
//! that mutate a message are responsible for keeping its framing headers
//! consistent.

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::HttpError;
use crate::http_message::{
    Headers, HttpRequest, HttpResponse, RequestTarget, Url, Version,
};

/// Default ceiling for message bodies: 64 MiB.
pub const DEFAULT_MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

/// Ceiling for the head (start line + headers) of a single message.
const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Ceiling for the number of header lines in one message.
const MAX_HEADER_COUNT: usize = 128;

/// Ceiling for a single chunk-size or trailer line.
const MAX_LINE_BYTES: usize = 8 * 1024;

/// A buffered HTTP/1.1 message stream over `S`.
pub struct MessageStream<S> {
    stream: S,
    buf: BytesMut,
    max_body_bytes: usize,
}

enum BodyMode {
    Request,
    Response,
    None,
}

impl<S> MessageStream<S> {
    pub fn new(stream: S, max_body_bytes: usize) -> Self {
        MessageStream {
            stream,
            buf: BytesMut::with_capacity(8 * 1024),
            max_body_bytes,
        }
    }

    /// Tear down the codec, returning the stream and any bytes that were
    /// read ahead but not consumed (needed when a tunnel takes over).
    pub fn into_parts(self) -> (S, BytesMut) {
        (self.stream, self.buf)
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }
}

impl<S: AsyncRead + Unpin> MessageStream<S> {
    /// Parse one request. Returns `Ok(None)` on a clean end-of-stream before
    /// any byte of a new message, the normal end of a kept-alive connection.
    pub async fn read_request(&mut self) -> Result<Option<HttpRequest>, HttpError> {
        let (start_line, mut headers) = match self.read_head(true).await? {
            Some(head) => head,
            None => return Ok(None),
        };
        let (method, target, version) = parse_request_line(&start_line)?;
        let body = self.read_body(&mut headers, BodyMode::Request).await?;
        Ok(Some(HttpRequest {
            method,
            target,
            version,
            headers,
            body,
        }))
    }

    /// Parse one response. `head_request` selects HEAD semantics: the
    /// response head may advertise a body that will not be sent.
    pub async fn read_response(&mut self, head_request: bool) -> Result<HttpResponse, HttpError> {
        let (start_line, mut headers) = self
            .read_head(false)
            .await?
            .ok_or(HttpError::UnexpectedEof)?;
        let (version, status, reason) = parse_status_line(&start_line)?;
        let mode = if head_request || status == 204 || status == 304 || (100..200).contains(&status)
        {
            BodyMode::None
        } else {
            BodyMode::Response
        };
        let body = self.read_body(&mut headers, mode).await?;
        Ok(HttpResponse {
            version,
            status,
            reason,
            headers,
            body,
        })
    }

    async fn fill(&mut self) -> Result<usize, HttpError> {
        Ok(self.stream.read_buf(&mut self.buf).await?)
    }

    async fn read_head(
        &mut self,
        eof_is_clean: bool,
    ) -> Result<Option<(String, Headers)>, HttpError> {
        loop {
            // Tolerate stray CRLFs between messages (RFC 7230 §3.5).
            while self.buf.starts_with(b"\r\n") {
                self.buf.advance(2);
            }
            if let Some(head_len) = find_head_end(&self.buf) {
                let head = self.buf.split_to(head_len + 4);
                return Ok(Some(parse_head(&head[..head_len])?));
            }
            if self.buf.len() > MAX_HEAD_BYTES {
                return Err(HttpError::BadHeader(format!(
                    "header section exceeds {MAX_HEAD_BYTES} bytes"
                )));
            }
            if self.fill().await? == 0 {
                if self.buf.is_empty() && eof_is_clean {
                    return Ok(None);
                }
                return Err(HttpError::UnexpectedEof);
            }
        }
    }

    async fn read_body(
        &mut self,
        headers: &mut Headers,
        mode: BodyMode,
    ) -> Result<Bytes, HttpError> {
        if matches!(mode, BodyMode::None) {
            return Ok(Bytes::new());
        }
        if headers.contains_token("Transfer-Encoding", "chunked") {
            return self.read_chunked(headers).await;
        }
        if let Some(raw) = headers.get("Content-Length") {
            let declared = content_length(headers, raw)?;
            if declared > self.max_body_bytes {
                return Err(HttpError::BodyTooLarge {
                    limit: self.max_body_bytes,
                });
            }
            return self.read_exact_body(declared).await;
        }
        match mode {
            BodyMode::Request => Ok(Bytes::new()),
            BodyMode::Response => self.read_until_close().await,
            BodyMode::None => unreachable!(),
        }
    }

    async fn read_exact_body(&mut self, len: usize) -> Result<Bytes, HttpError> {
        while self.buf.len() < len {
            if self.fill().await? == 0 {
                return Err(HttpError::UnexpectedEof);
            }
        }
        Ok(self.buf.split_to(len).freeze())
    }

    async fn read_until_close(&mut self) -> Result<Bytes, HttpError> {
        loop {
            if self.buf.len() > self.max_body_bytes {
                return Err(HttpError::BodyTooLarge {
                    limit: self.max_body_bytes,
                });
            }
            if self.fill().await? == 0 {
                return Ok(self.buf.split().freeze());
            }
        }
    }

    async fn read_chunked(&mut self, headers: &mut Headers) -> Result<Bytes, HttpError> {
        let mut body = BytesMut::new();
        loop {
            let line = self.read_line().await?;
            let line = std::str::from_utf8(&line)
                .map_err(|_| HttpError::InvalidChunk("non-UTF-8 chunk size line".to_string()))?;
            let size_field = line.split(';').next().unwrap_or("").trim();
            let size = usize::from_str_radix(size_field, 16).map_err(|_| {
                HttpError::InvalidChunk(format!("bad chunk size {size_field:?}"))
            })?;
            if size == 0 {
                self.read_trailers(headers).await?;
                return Ok(body.freeze());
            }
            if body.len() + size > self.max_body_bytes {
                return Err(HttpError::BodyTooLarge {
                    limit: self.max_body_bytes,
                });
            }
            while self.buf.len() < size + 2 {
                if self.fill().await? == 0 {
                    return Err(HttpError::UnexpectedEof);
                }
            }
            body.extend_from_slice(&self.buf[..size]);
            if &self.buf[size..size + 2] != b"\r\n" {
                return Err(HttpError::InvalidChunk(
                    "chunk data not terminated by CRLF".to_string(),
                ));
            }
            self.buf.advance(size + 2);
        }
    }

    async fn read_trailers(&mut self, headers: &mut Headers) -> Result<(), HttpError> {
        let mut count = 0;
        loop {
            let line = self.read_line().await?;
            if line.is_empty() {
                return Ok(());
            }
            count += 1;
            if count > MAX_HEADER_COUNT {
                return Err(HttpError::BadHeader("too many trailer lines".to_string()));
            }
            let line = std::str::from_utf8(&line)
                .map_err(|_| HttpError::BadHeader("non-UTF-8 trailer line".to_string()))?;
            let (name, value) = parse_header_line(line)?;
            headers.push(name, value);
        }
    }

    /// Read one CRLF-terminated line, excluding the terminator.
    async fn read_line(&mut self) -> Result<Bytes, HttpError> {
        loop {
            if let Some(pos) = self.buf.windows(2).position(|w| w == b"\r\n") {
                let line = self.buf.split_to(pos).freeze();
                self.buf.advance(2);
                return Ok(line);
            }
            if self.buf.len() > MAX_LINE_BYTES {
                return Err(HttpError::InvalidChunk("line exceeds limit".to_string()));
            }
            if self.fill().await? == 0 {
                return Err(HttpError::UnexpectedEof);
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> MessageStream<S> {
    pub async fn send_request(
        &mut self,
        request: &HttpRequest,
        origin_form: bool,
    ) -> std::io::Result<()> {
        self.write_raw(&encode_request(request, origin_form)).await
    }

    pub async fn send_response(&mut self, response: &HttpResponse) -> std::io::Result<()> {
        self.write_raw(&encode_response(response)).await
    }

    pub async fn write_raw(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await
    }
}

/// Serialize a request. With `origin_form` set, an absolute-form target is
/// rewritten to its path-and-query, the form an origin server expects.
pub fn encode_request(request: &HttpRequest, origin_form: bool) -> Bytes {
    let target = match (&request.target, origin_form) {
        (RequestTarget::Absolute(url), true) => url.path_and_query(),
        (target, _) => target.to_string(),
    };
    let mut out = BytesMut::with_capacity(256 + request.body.len());
    out.extend_from_slice(
        format!("{} {} {}\r\n", request.method, target, request.version).as_bytes(),
    );
    encode_tail(&mut out, &request.headers, &request.body);
    out.freeze()
}

/// Serialize a response.
pub fn encode_response(response: &HttpResponse) -> Bytes {
    let mut out = BytesMut::with_capacity(256 + response.body.len());
    out.extend_from_slice(
        format!(
            "{} {} {}\r\n",
            response.version, response.status, response.reason
        )
        .as_bytes(),
    );
    encode_tail(&mut out, &response.headers, &response.body);
    out.freeze()
}

fn encode_tail(out: &mut BytesMut, headers: &Headers, body: &Bytes) {
    for header in headers.iter() {
        out.extend_from_slice(header.name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(header.value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    if headers.contains_token("Transfer-Encoding", "chunked") {
        if !body.is_empty() {
            out.extend_from_slice(format!("{:x}\r\n", body.len()).as_bytes());
            out.extend_from_slice(body);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"0\r\n\r\n");
    } else {
        out.extend_from_slice(body);
    }
}

/// Position of the `\r\n\r\n` head terminator, if buffered.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_head(head: &[u8]) -> Result<(String, Headers), HttpError> {
    let head = std::str::from_utf8(head)
        .map_err(|_| HttpError::BadHeader("non-UTF-8 bytes in header section".to_string()))?;
    let mut lines = head.split("\r\n");
    let start_line = lines
        .next()
        .filter(|l| !l.is_empty())
        .ok_or_else(|| HttpError::BadRequestLine("empty start line".to_string()))?
        .to_string();

    let mut headers = Headers::new();
    let mut last_index: Option<usize> = None;
    for line in lines {
        if headers.len() > MAX_HEADER_COUNT {
            return Err(HttpError::BadHeader("too many header lines".to_string()));
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            // Obsolete line folding: collapse the fold into a single space.
            let index = last_index.ok_or_else(|| {
                HttpError::BadHeader("continuation line before any header".to_string())
            })?;
            let folded = line.trim_matches(|c: char| c == ' ' || c == '\t');
            if !folded.is_empty() {
                headers.fold_into(index, folded);
            }
            continue;
        }
        let (name, value) = parse_header_line(line)?;
        headers.push(name, value);
        last_index = Some(headers.len() - 1);
    }
    Ok((start_line, headers))
}

fn parse_header_line(line: &str) -> Result<(String, String), HttpError> {
    let (name, raw_value) = line
        .split_once(':')
        .ok_or_else(|| HttpError::BadHeader(format!("missing colon in {line:?}")))?;
    if name.is_empty() || !name.bytes().all(is_tchar) {
        return Err(HttpError::BadHeader(format!("invalid header name {name:?}")));
    }
    Ok((name.to_string(), trim_one_space(raw_value).to_string()))
}

/// Strip at most one leading and one trailing space around a header value.
fn trim_one_space(value: &str) -> &str {
    let value = value.strip_prefix(' ').unwrap_or(value);
    value.strip_suffix(' ').unwrap_or(value)
}

fn parse_request_line(line: &str) -> Result<(String, RequestTarget, Version), HttpError> {
    let mut parts = line.splitn(3, ' ');
    let method = parts
        .next()
        .filter(|m| !m.is_empty() && m.bytes().all(is_tchar))
        .ok_or_else(|| HttpError::BadRequestLine(format!("bad method in {line:?}")))?;
    let target = parts
        .next()
        .filter(|t| !t.is_empty())
        .ok_or_else(|| HttpError::BadRequestLine(format!("missing request target in {line:?}")))?;
    let version = parts
        .next()
        .and_then(Version::parse)
        .ok_or_else(|| HttpError::BadRequestLine(format!("bad HTTP version in {line:?}")))?;

    let target = if target == "*" {
        RequestTarget::Asterisk
    } else if target.starts_with('/') {
        RequestTarget::Origin {
            path_and_query: target.to_string(),
        }
    } else if target.contains("://") {
        let url = Url::parse(target)
            .ok_or_else(|| HttpError::BadRequestLine(format!("bad absolute URL {target:?}")))?;
        RequestTarget::Absolute(url)
    } else {
        RequestTarget::Authority(target.to_string())
    };

    Ok((method.to_string(), target, version))
}

fn parse_status_line(line: &str) -> Result<(Version, u16, String), HttpError> {
    let mut parts = line.splitn(3, ' ');
    let version = parts
        .next()
        .and_then(Version::parse)
        .ok_or_else(|| HttpError::BadRequestLine(format!("bad HTTP version in {line:?}")))?;
    let status: u16 = parts
        .next()
        .and_then(|c| c.parse().ok())
        .filter(|c| (100..=599).contains(c))
        .ok_or_else(|| HttpError::BadRequestLine(format!("bad status code in {line:?}")))?;
    let reason = parts.next().unwrap_or("").to_string();
    Ok((version, status, reason))
}

fn content_length(headers: &Headers, first: &str) -> Result<usize, HttpError> {
    let declared: usize = first
        .trim()
        .parse()
        .map_err(|_| HttpError::BadHeader(format!("bad Content-Length {first:?}")))?;
    // Duplicate Content-Length headers must agree.
    for other in headers.get_all("Content-Length") {
        if other.trim() != first.trim() {
            return Err(HttpError::BadHeader(
                "conflicting Content-Length headers".to_string(),
            ));
        }
    }
    Ok(declared)
}

fn is_tchar(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}
