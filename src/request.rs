//! HTTP request head parsing and request body reading.
//!
//! The body is exposed as plain `std::io::Read` over the wire bytes; content
//! encodings are never undone here. The ingest pipeline depends on seeing the
//! bytes exactly as they arrived so it can store them unaltered while hashing
//! the decoded content.

use crate::error::{RequestHeadParsingError, VermResult};
use std::fmt::{Display, Formatter};
use std::io;
use std::io::{BufRead, Error, ErrorKind, Read};

/// Maximum permitted length of the status line or any single header line,
/// including the CRLF trailer.
pub const MAX_HEAD_LINE_LENGTH: usize = 8192;

/// Represents an HTTP method.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HttpMethod {
  Get,
  Head,
  Post,
  Put,
  /// Anything else; verm responds 404 to these.
  Other(String),
}

impl HttpMethod {
  pub fn from_name(name: &str) -> Self {
    match name {
      "GET" => Self::Get,
      "HEAD" => Self::Head,
      "POST" => Self::Post,
      "PUT" => Self::Put,
      _ => Self::Other(name.to_string()),
    }
  }

  pub fn as_str(&self) -> &str {
    match self {
      HttpMethod::Get => "GET",
      HttpMethod::Head => "HEAD",
      HttpMethod::Post => "POST",
      HttpMethod::Put => "PUT",
      HttpMethod::Other(name) => name.as_str(),
    }
  }
}

impl Display for HttpMethod {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// HTTP versions verm speaks. 0.9 and 2+ are rejected during parsing.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HttpVersion {
  Http10,
  Http11,
}

impl HttpVersion {
  pub fn as_net_str(&self) -> &'static str {
    match self {
      HttpVersion::Http10 => "HTTP/1.0",
      HttpVersion::Http11 => "HTTP/1.1",
    }
  }

  pub fn try_from_net_str(value: &str) -> Result<Self, RequestHeadParsingError> {
    match value {
      "HTTP/1.0" => Ok(HttpVersion::Http10),
      "HTTP/1.1" => Ok(HttpVersion::Http11),
      other => Err(RequestHeadParsingError::HttpVersionNotSupported(other.to_string())),
    }
  }
}

impl Display for HttpVersion {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_net_str())
  }
}

/// An ordered list of headers with case-insensitive name lookup.
#[derive(Debug, Clone, Default)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
  pub fn new() -> Self {
    Headers(Vec::new())
  }

  pub fn add(&mut self, name: impl ToString, value: impl ToString) {
    self.0.push((name.to_string(), value.to_string()));
  }

  /// First value of the given header, if any.
  pub fn get(&self, name: impl AsRef<str>) -> Option<&str> {
    let name = name.as_ref();
    self.0.iter().find(|(n, _)| n.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str())
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
  }
}

/// The parsed request line and headers of one HTTP request.
#[derive(Debug)]
pub struct RequestHead {
  method: HttpMethod,
  path: String,
  version: HttpVersion,
  headers: Headers,
}

fn read_head_line<R: BufRead>(reader: &mut R, too_long: fn(usize) -> RequestHeadParsingError) -> VermResult<Option<String>> {
  let mut buffer = Vec::with_capacity(128);
  let count =
    reader.by_ref().take(MAX_HEAD_LINE_LENGTH as u64 + 1).read_until(b'\n', &mut buffer)?;
  if count == 0 {
    return Ok(None);
  }
  if buffer.len() > MAX_HEAD_LINE_LENGTH {
    return Err(too_long(buffer.len()).into());
  }
  if buffer.pop() != Some(b'\n') || buffer.pop() != Some(b'\r') {
    return Err(RequestHeadParsingError::StatusLineNoCRLF.into());
  }
  String::from_utf8(buffer).map(Some).map_err(|_| RequestHeadParsingError::LineIsNotUtf8.into())
}

impl RequestHead {
  /// Reads and parses one request head from the stream.
  /// Returns `Ok(None)` on a clean EOF before the first byte, which is how
  /// a keep-alive client signals it is done.
  pub fn read<R: BufRead>(reader: &mut R) -> VermResult<Option<RequestHead>> {
    let Some(status_line) = read_head_line(reader, RequestHeadParsingError::StatusLineTooLong)?
    else {
      return Ok(None);
    };

    let mut parts = status_line.split(' ');
    let method = parts.next().ok_or(RequestHeadParsingError::StatusLineNoWhitespace)?;
    let raw_path = parts.next().ok_or(RequestHeadParsingError::StatusLineNoWhitespace)?;
    let version = parts.next().ok_or(RequestHeadParsingError::StatusLineNoWhitespace)?;
    if parts.next().is_some() {
      return Err(RequestHeadParsingError::StatusLineTooManyWhitespaces.into());
    }

    let method = HttpMethod::from_name(method);
    let version = HttpVersion::try_from_net_str(version)?;

    // the path arrives percent-encoded and may carry a query string, which
    // verm has no use for
    let raw_path = raw_path.split_once('?').map(|(p, _)| p).unwrap_or(raw_path);
    let path = urlencoding::decode(raw_path)
      .map_err(|_| RequestHeadParsingError::InvalidPathUrlEncoding(raw_path.to_string()))?
      .into_owned();

    let mut headers = Headers::new();
    loop {
      let line = read_head_line(reader, RequestHeadParsingError::HeaderLineTooLong)?
        .ok_or(RequestHeadParsingError::HeaderLineNoCRLF)?;
      if line.is_empty() {
        break;
      }
      let (name, value) =
        line.split_once(':').ok_or(RequestHeadParsingError::HeaderValueMissing)?;
      headers.add(name.trim(), value.trim());
    }

    Ok(Some(RequestHead { method, path, version, headers }))
  }

  pub fn get_method(&self) -> &HttpMethod {
    &self.method
  }

  pub fn get_path(&self) -> &str {
    &self.path
  }

  pub fn get_version(&self) -> HttpVersion {
    self.version
  }

  pub fn get_header(&self, name: impl AsRef<str>) -> Option<&str> {
    self.headers.get(name)
  }

  /// The declared content type without any parameters, lowercased.
  pub fn content_type(&self) -> Option<String> {
    self
      .get_header("Content-Type")
      .map(|v| v.split(';').next().unwrap_or(v).trim().to_ascii_lowercase())
  }

  /// The boundary parameter of a multipart content type.
  pub fn multipart_boundary(&self) -> Option<String> {
    let value = self.get_header("Content-Type")?;
    for param in value.split(';').skip(1) {
      if let Some((name, boundary)) = param.split_once('=') {
        if name.trim().eq_ignore_ascii_case("boundary") {
          return Some(boundary.trim().trim_matches('"').to_string());
        }
      }
    }
    None
  }
}

/// The body of one request, yielding wire bytes.
///
/// Borrows the connection's reader; the server drains any unread remainder
/// before the response is written so keep-alive stays in sync.
pub struct RequestBody<'a> {
  inner: BodyKind<'a>,
}

enum BodyKind<'a> {
  Sized { reader: &'a mut dyn BufRead, remaining: u64 },
  Chunked { reader: &'a mut dyn BufRead, remaining_chunk: u64, eof: bool },
}

impl<'a> RequestBody<'a> {
  /// Decides how the body is framed from the request head.
  /// Returns `Ok(None)` when the request carries no body.
  pub fn from_head<R: BufRead>(
    head: &RequestHead,
    reader: &'a mut R,
  ) -> VermResult<Option<RequestBody<'a>>> {
    if head.get_version() == HttpVersion::Http11 {
      match head.get_header("Transfer-Encoding") {
        Some("chunked") => {
          return Ok(Some(RequestBody {
            inner: BodyKind::Chunked { reader, remaining_chunk: 0, eof: false },
          }));
        }
        Some(other) => {
          return Err(
            RequestHeadParsingError::TransferEncodingNotSupported(other.to_string()).into(),
          );
        }
        None => {}
      }
    }

    if let Some(content_length) = head.get_header("Content-Length") {
      let content_length: u64 = content_length.parse().map_err(|_| {
        RequestHeadParsingError::InvalidContentLength(content_length.to_string())
      })?;
      if content_length == 0 {
        return Ok(None);
      }
      return Ok(Some(RequestBody { inner: BodyKind::Sized { reader, remaining: content_length } }));
    }

    Ok(None)
  }

  /// Reads and discards everything left in the body.
  pub fn drain(&mut self) -> io::Result<()> {
    let mut discard = [0u8; 0x4000];
    loop {
      if self.read(&mut discard)? == 0 {
        return Ok(());
      }
    }
  }
}

fn read_retry(reader: &mut dyn BufRead, buf: &mut [u8]) -> io::Result<usize> {
  loop {
    match reader.read(buf) {
      Err(e) if e.kind() == ErrorKind::Interrupted => continue,
      other => return other,
    }
  }
}

#[expect(clippy::indexing_slicing, reason = "filled never exceeds buf.len()")]
fn read_exact_retry(reader: &mut dyn BufRead, buf: &mut [u8]) -> io::Result<()> {
  let mut filled = 0;
  while filled < buf.len() {
    let n = read_retry(reader, &mut buf[filled..])?;
    if n == 0 {
      return Err(Error::new(ErrorKind::UnexpectedEof, "connection closed mid body"));
    }
    filled += n;
  }
  Ok(())
}

impl Read for RequestBody<'_> {
  #[expect(clippy::indexing_slicing, reason = "limit is clamped to buf.len()")]
  fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    if buf.is_empty() {
      return Ok(0);
    }

    match &mut self.inner {
      BodyKind::Sized { reader, remaining } => {
        if *remaining == 0 {
          return Ok(0);
        }
        let limit = u64::min(buf.len() as u64, *remaining) as usize;
        let count = read_retry(*reader, &mut buf[..limit])?;
        if count == 0 {
          return Err(Error::new(ErrorKind::UnexpectedEof, "content-length suggests more data"));
        }
        *remaining -= count as u64;
        Ok(count)
      }
      BodyKind::Chunked { reader, remaining_chunk, eof } => {
        if *eof {
          return Ok(0);
        }

        if *remaining_chunk == 0 {
          let mut size_line = Vec::with_capacity(16);
          reader.by_ref().take(32).read_until(b'\n', &mut size_line)?;
          if size_line.pop() != Some(b'\n') || size_line.pop() != Some(b'\r') {
            return Err(Error::new(ErrorKind::InvalidData, "chunk size is malformed"));
          }
          let size_str = std::str::from_utf8(&size_line)
            .map_err(|_| Error::new(ErrorKind::InvalidData, "chunk size is malformed"))?;
          let chunk_len = u64::from_str_radix(size_str, 16)
            .map_err(|_| Error::new(ErrorKind::InvalidData, "chunk size is malformed"))?;

          if chunk_len == 0 {
            let mut trailer = [0u8; 2];
            read_exact_retry(*reader, &mut trailer)?;
            if trailer != *b"\r\n" {
              return Err(Error::new(ErrorKind::InvalidData, "chunk trailer is malformed"));
            }
            *eof = true;
            return Ok(0);
          }
          *remaining_chunk = chunk_len;
        }

        let limit = u64::min(buf.len() as u64, *remaining_chunk) as usize;
        let count = read_retry(*reader, &mut buf[..limit])?;
        if count == 0 {
          return Err(Error::new(ErrorKind::UnexpectedEof, "chunked encoding suggests more data"));
        }
        *remaining_chunk -= count as u64;
        if *remaining_chunk == 0 {
          let mut trailer = [0u8; 2];
          read_exact_retry(*reader, &mut trailer)?;
          if trailer != *b"\r\n" {
            return Err(Error::new(ErrorKind::InvalidData, "chunk trailer is malformed"));
          }
        }
        Ok(count)
      }
    }
  }
}
