//! HTTP response model, verm's fixed pages, and cache/content headers.

use crate::decompression::{FileDecompressor, DECOMPRESSION_CHUNK_SIZE};
use crate::mime_types::MimeTypes;
use crate::request::{Headers, HttpVersion};
use chrono::{DateTime, Utc};
use std::fmt::Write as _;
use std::fs::File;
use std::io;
use std::io::{Error, ErrorKind, Read, Seek, SeekFrom, Write};
use std::time::SystemTime;

pub const UPLOAD_PAGE: &str = concat!(
  "<!DOCTYPE html><html><head><title>Verm - Upload</title></head><body>",
  "<form method='post' enctype='multipart/form-data'>",
  // redirect instead of returning 201 (as APIs want)
  "<input type='hidden' name='redirect' value='1'/>",
  "<input type='file' name='uploaded_file'/>",
  "<input type='submit' value='Upload'/>",
  "</form>",
  "</body></html>\n"
);

pub const HTTP_404_PAGE: &str =
  "<!DOCTYPE html><html><head><title>Verm - File not found</title></head><body>File not found</body></html>";

pub const WRONG_PATH_PAGE: &str =
  "<!DOCTYPE html><html><head><title>Verm - Wrong path</title></head><body>The path requested doesn't match the content uploaded</body></html>";

pub const CREATED_PAGE: &str = "Resource created\n";
pub const REDIRECT_PAGE: &str = "You are being redirected\n";

/// essentially never expires
pub const EXPIRES_NEVER: &str = "Tue, 19 Jan 2038 00:00:00";

/// The status codes verm actually sends.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StatusCode {
  OK,
  Created,
  SeeOther,
  NotModified,
  Forbidden,
  NotFound,
}

impl StatusCode {
  pub fn code(&self) -> u16 {
    match self {
      StatusCode::OK => 200,
      StatusCode::Created => 201,
      StatusCode::SeeOther => 303,
      StatusCode::NotModified => 304,
      StatusCode::Forbidden => 403,
      StatusCode::NotFound => 404,
    }
  }

  pub fn status_line(&self) -> &'static str {
    match self {
      StatusCode::OK => "OK",
      StatusCode::Created => "Created",
      StatusCode::SeeOther => "See Other",
      StatusCode::NotModified => "Not Modified",
      StatusCode::Forbidden => "Forbidden",
      StatusCode::NotFound => "Not Found",
    }
  }
}

/// The body of a response.
pub enum ResponseBody {
  Empty,
  Static(&'static str),
  Data(Vec<u8>),
  /// Streams the file from offset 0; `Content-Length` is the file size.
  File(File, u64),
  /// Streams gzip-decoded bytes; `Content-Length` is the advertised
  /// decompressed size from the gzip trailer.
  Decompressed(FileDecompressor, u64),
  /// No bytes on the wire but a real `Content-Length`, for HEAD.
  HeadOnly(u64),
}

impl ResponseBody {
  pub fn content_length(&self) -> u64 {
    match self {
      ResponseBody::Empty => 0,
      ResponseBody::Static(data) => data.len() as u64,
      ResponseBody::Data(data) => data.len() as u64,
      ResponseBody::File(_, size) => *size,
      ResponseBody::Decompressed(_, size) => *size,
      ResponseBody::HeadOnly(size) => *size,
    }
  }
}

/// Represents a response from the server.
pub struct Response {
  pub status_code: StatusCode,
  pub headers: Headers,
  pub body: ResponseBody,
}

impl Response {
  pub fn new(status_code: StatusCode) -> Response {
    Response { status_code, headers: Headers::new(), body: ResponseBody::Empty }
  }

  pub fn with_body(mut self, body: ResponseBody) -> Response {
    self.body = body;
    self
  }

  pub fn with_header(mut self, name: impl ToString, value: impl ToString) -> Response {
    self.headers.add(name, value);
    self
  }

  fn static_page(status_code: StatusCode, page: &'static str) -> Response {
    Response::new(status_code)
      .with_body(ResponseBody::Static(page))
      .with_header("Content-Type", "text/html")
  }

  /// The HTML upload form, served for `/` and for directories.
  pub fn upload_page() -> Response {
    Response::static_page(StatusCode::OK, UPLOAD_PAGE)
  }

  pub fn file_not_found() -> Response {
    Response::static_page(StatusCode::NotFound, HTTP_404_PAGE)
  }

  /// 403 for a PUT whose path doesn't match the canonical form of its bytes.
  pub fn wrong_path() -> Response {
    Response::static_page(StatusCode::Forbidden, WRONG_PATH_PAGE)
  }

  pub fn not_modified(etag: &str) -> Response {
    Response::new(StatusCode::NotModified).with_header("ETag", etag)
  }

  pub fn created(location: &str) -> Response {
    Response::new(StatusCode::Created)
      .with_body(ResponseBody::Static(CREATED_PAGE))
      .with_header("Location", location)
  }

  pub fn redirected(location: &str) -> Response {
    Response::new(StatusCode::SeeOther)
      .with_body(ResponseBody::Static(REDIRECT_PAGE))
      .with_header("Location", location)
  }

  /// `Last-Modified` from a file timestamp, RFC 1123 format in GMT.
  pub fn with_last_modified(self, modified: SystemTime) -> Response {
    let when: DateTime<Utc> = modified.into();
    self.with_header("Last-Modified", when.format("%a, %d %b %Y %H:%M:%S GMT"))
  }

  /// `Content-Type` looked up from the filename's extension. No extension or
  /// no table entry means no header, which is fine.
  pub fn with_content_type_for(self, path: &str, mime_types: &MimeTypes) -> Response {
    let filename = path.rsplit('/').next().unwrap_or(path);
    if let Some((_, extension)) = filename.split_once('.') {
      if let Some(mime_type) = mime_types.mime_type_for_extension(extension) {
        return self.with_header("Content-Type", mime_type);
      }
    }
    self
  }

  /// The hashed URL path (without its leading slash) is a perfect ETag.
  pub fn with_etag(self, etag: &str) -> Response {
    self.with_header("ETag", etag)
  }

  pub fn with_expires_never(self) -> Response {
    self.with_header("Expires", EXPIRES_NEVER)
  }

  /// Writes the whole response. Returns the number of body bytes sent, for
  /// the access log. A decode failure while streaming a compressed twin
  /// surfaces as an error, which tears the connection down mid-body.
  pub fn write_to(
    self,
    version: HttpVersion,
    keep_alive: bool,
    destination: &mut dyn Write,
  ) -> io::Result<u64> {
    let mut head = String::with_capacity(256);
    let _ = write!(
      head,
      "{} {} {}\r\n",
      version.as_net_str(),
      self.status_code.code(),
      self.status_code.status_line()
    );
    for (name, value) in self.headers.iter() {
      let _ = write!(head, "{}: {}\r\n", name, value);
    }
    let _ = write!(head, "Connection: {}\r\n", if keep_alive { "Keep-Alive" } else { "Close" });
    let _ = write!(head, "Content-Length: {}\r\n\r\n", self.body.content_length());
    destination.write_all(head.as_bytes())?;

    let sent = match self.body {
      ResponseBody::Empty | ResponseBody::HeadOnly(_) => 0,
      ResponseBody::Static(data) => {
        destination.write_all(data.as_bytes())?;
        data.len() as u64
      }
      ResponseBody::Data(data) => {
        destination.write_all(&data)?;
        data.len() as u64
      }
      ResponseBody::File(mut file, size) => {
        file.seek(SeekFrom::Start(0))?;
        copy_exactly(&mut file, destination, size)?
      }
      ResponseBody::Decompressed(mut decompressor, size) => {
        copy_exactly(&mut decompressor, destination, size)?
      }
    };

    destination.flush()?;
    Ok(sent)
  }
}

/// Streams exactly `size` bytes, erroring if the source yields more or less.
#[expect(clippy::indexing_slicing, reason = "count comes from read on the same buffer")]
fn copy_exactly(source: &mut dyn Read, destination: &mut dyn Write, size: u64) -> io::Result<u64> {
  let mut buffer = [0u8; DECOMPRESSION_CHUNK_SIZE];
  let mut written = 0u64;
  loop {
    let count = match source.read(&mut buffer) {
      Err(e) if e.kind() == ErrorKind::Interrupted => continue,
      other => other?,
    };
    if count == 0 {
      if written != size {
        return Err(Error::new(ErrorKind::InvalidData, "file shorter than advertised"));
      }
      return Ok(written);
    }
    if written + count as u64 > size {
      return Err(Error::new(ErrorKind::InvalidData, "file longer than advertised"));
    }
    destination.write_all(&buffer[..count])?;
    written += count as u64;
  }
}

/// Decides whether the client accepts a gzip response.
///
/// A missing header means yes, per the specification's advice to assume the
/// common encodings are understood. `*`, `gzip` and `x-gzip` match; a token
/// with no parameters is acceptable; a `q` value makes it acceptable iff it
/// parses to something non-zero. Malformed parameters disqualify only their
/// own token.
pub fn accept_gzip_encoding(header: Option<&str>) -> bool {
  let Some(value) = header else { return true };

  for token in value.split(',') {
    let token = token.trim();
    let (name, params) = match token.split_once(';') {
      Some((name, params)) => (name.trim(), Some(params)),
      None => (token, None),
    };

    if name != "*" && name != "gzip" && name != "x-gzip" {
      continue;
    }

    let Some(params) = params else { return true };
    let Some((key, qvalue)) = params.split_once('=') else { continue };
    if key.trim() != "q" {
      continue;
    }
    match qvalue.trim().parse::<f64>() {
      Ok(q) if q != 0.0 => return true,
      _ => continue,
    }
  }

  false
}
