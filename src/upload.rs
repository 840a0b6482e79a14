//! The upload ingest pipeline.
//!
//! An upload streams through an incremental SHA-256 hasher into a tempfile
//! created next to its final destination, then gets hard-linked into its
//! content-addressed name. The stored bytes are always the wire bytes; when
//! the upload is gzip-encoded a streaming decoder sits between the wire and
//! the hasher so the name is derived from the content, not the compression.

use crate::decompression::TeeReader;
use crate::error::{VermError, VermResult};
use crate::mime_types::MimeTypes;
use crate::request::{HttpMethod, RequestHead};
use crate::response::Response;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use libflate::gzip;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::fs;
use std::fs::File;
use std::io;
use std::io::{ErrorKind, Read};
use std::os::unix::fs::{DirBuilderExt, FileExt};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Longest permitted client-supplied directory prefix.
pub const MAX_DIRECTORY_LENGTH: usize = 256;

/// Rather than letting people upload directly into the root directory,
/// which in practice is a PITA to administer.
pub const DEFAULT_DIRECTORY: &str = "/default";

const DIRECTORY_MODE: u32 = 0o777;
const UPLOAD_BUFFER_SIZE: usize = 65536;
const COMPARE_BUFFER_SIZE: usize = 16384;

/// Shape of a canonical PUT path: directory, two-character hash prefix, and
/// a filename with at most one dot.
pub fn put_path_pattern() -> Result<Regex, regex::Error> {
  Regex::new(r"^((?:/[^/]+)+)/([0-9A-Za-z_-]{2})/([0-9A-Za-z_-]+)(\.[0-9A-Za-z]+)?$")
}

/// A file that finished the link loop and should be replicated.
#[derive(Debug, Clone)]
pub struct StoredFile {
  /// Canonical URL path, without any encoding suffix.
  pub location: String,
  /// Where the bytes ended up on disk.
  pub path: PathBuf,
  /// `Some("gzip")` when the stored bytes are the compressed rendition.
  pub encoding: Option<&'static str>,
}

/// What came out of one POST or PUT.
pub struct UploadOutcome {
  pub response: Response,
  pub new_file_stored: bool,
  /// Present only when a new file was stored, for the replication queues.
  pub stored: Option<StoredFile>,
}

impl UploadOutcome {
  fn rejected(response: Response) -> UploadOutcome {
    UploadOutcome { response, new_file_stored: false, stored: None }
  }
}

/// Maps a URL path (leading slash included) under the data root.
pub fn fs_path(root: &Path, relative: &str) -> PathBuf {
  let mut path = root.as_os_str().to_os_string();
  path.push(relative);
  PathBuf::from(path)
}

/// The truthiness rule for form fields: `"0"`, `"f"` and `"false"` (letters
/// case-insensitive) are false, everything else is true.
pub fn boolean(data: &[u8]) -> bool {
  !(data == b"0" || data.eq_ignore_ascii_case(b"f") || data.eq_ignore_ascii_case(b"false"))
}

/// Checks and normalises the destination directory of a POST.
/// `//` collapses to `/`, a trailing slash is dropped, and the bare root
/// maps to the default directory.
pub fn validate_post_directory(path: &str) -> Option<String> {
  if !path.starts_with('/') || path.contains("/..") || path.len() >= MAX_DIRECTORY_LENGTH {
    return None;
  }

  let mut directory = path.to_string();
  while let Some(position) = directory.find("//") {
    directory.remove(position);
  }
  if directory.len() > 1 && directory.ends_with('/') {
    directory.pop();
  }
  if directory == "/" {
    directory = DEFAULT_DIRECTORY.to_string();
  }
  Some(directory)
}

/// The decomposed target of a PUT request.
#[derive(Debug)]
pub struct PutTarget {
  pub directory: String,
  hash_prefix: String,
  rest: String,
  extension: Option<String>,
}

/// Checks the shape of a PUT path before any bytes are read. The content
/// check against the actual hash happens at completion.
pub fn validate_put_path(path: &str, pattern: &Regex) -> Option<PutTarget> {
  if path.contains("/..") {
    return None;
  }
  let captures = pattern.captures(path)?;
  let directory = captures.get(1)?.as_str();
  if directory.len() >= MAX_DIRECTORY_LENGTH {
    return None;
  }
  Some(PutTarget {
    directory: directory.to_string(),
    hash_prefix: captures.get(2)?.as_str().to_string(),
    rest: captures.get(3)?.as_str().to_string(),
    extension: captures.get(4).map(|m| m.as_str().trim_start_matches('.').to_string()),
  })
}

impl PutTarget {
  /// True if this path is the canonical name for the hash and extension we
  /// computed from the body. A `_N` collision suffix from the sending side
  /// is tolerated; the local link loop re-derives the stored name.
  fn matches(&self, encoded_hash: &str, extension: &str) -> bool {
    let (prefix, remainder) = (encoded_hash.get(..2), encoded_hash.get(2..));
    if Some(self.hash_prefix.as_str()) != prefix {
      return false;
    }

    let mut hash_matches = Some(self.rest.as_str()) == remainder;
    if !hash_matches {
      if let Some((base, suffix)) = self.rest.rsplit_once('_') {
        hash_matches = !suffix.is_empty()
          && suffix.bytes().all(|b| b.is_ascii_digit())
          && Some(base) == remainder;
      }
    }
    if !hash_matches {
      return false;
    }

    match &self.extension {
      Some(given) => extension.is_empty() || given == extension,
      None => extension.is_empty(),
    }
  }
}

/// Ingest state for one POST or PUT request.
///
/// The tempfile lives in the same directory tree as the final destination so
/// the final placement is a crash-safe atomic hard link; it is unlinked on
/// drop whichever way the request ends.
pub struct Upload<'a> {
  root: &'a Path,
  mime_types: &'a MimeTypes,
  directory: String,
  tempfile: NamedTempFile,
  hasher: Sha256,
  size: u64,
  extension: String,
  encoding: Option<&'static str>,
  pub redirect_afterwards: bool,
}

impl<'a> Upload<'a> {
  /// Creates the tempfile in the destination directory, making missing
  /// parents (permissions 0777, races tolerated) and retrying once.
  pub fn create(root: &'a Path, mime_types: &'a MimeTypes, directory: String) -> VermResult<Upload<'a>> {
    let upload_directory = fs_path(root, &directory);
    let tempfile = match tempfile::Builder::new().prefix("upload.").tempfile_in(&upload_directory)
    {
      Ok(tempfile) => tempfile,
      Err(err) if err.kind() == ErrorKind::NotFound => {
        create_directories(&upload_directory)?;
        tempfile::Builder::new().prefix("upload.").tempfile_in(&upload_directory)?
      }
      Err(err) => return Err(err.into()),
    };

    Ok(Upload {
      root,
      mime_types,
      directory,
      tempfile,
      hasher: Sha256::new(),
      size: 0,
      extension: String::new(),
      encoding: None,
      redirect_afterwards: false,
    })
  }

  /// Streams one uploaded field into the tempfile and the hasher.
  ///
  /// The wire bytes go to disk unaltered; when the upload declares gzip
  /// encoding a streaming decoder feeds the hasher instead, so identical
  /// content converges on one name however it was compressed in transit.
  pub fn ingest_file(
    &mut self,
    source: &mut dyn Read,
    content_type: Option<&str>,
    gzip_encoded: bool,
  ) -> VermResult<()> {
    if let Some(content_type) = content_type {
      if let Some(extension) = self.mime_types.extension_for_mime_type(content_type) {
        self.extension = extension.to_string();
      }
    }

    let mut buffer = vec![0u8; UPLOAD_BUFFER_SIZE];
    if gzip_encoded {
      self.encoding = Some("gzip");

      let tempfile = self.tempfile.as_file_mut();
      let mut decoder =
        gzip::Decoder::new(TeeReader::new(&mut *source, tempfile, &mut self.size))?;
      loop {
        let count = read_chunk(&mut decoder, &mut buffer)?;
        if count == 0 {
          break;
        }
        self.hasher.update(buffer.get(..count).unwrap_or(&buffer));
      }
      drop(decoder);

      // anything past the end of the gzip stream still belongs on disk:
      // the stored bytes must be exactly the wire bytes
      let mut trailing = TeeReader::new(source, self.tempfile.as_file_mut(), &mut self.size);
      while read_chunk(&mut trailing, &mut buffer)? > 0 {}
    } else {
      let mut tee = TeeReader::new(source, self.tempfile.as_file_mut(), &mut self.size);
      loop {
        let count = read_chunk(&mut tee, &mut buffer)?;
        if count == 0 {
          break;
        }
        self.hasher.update(buffer.get(..count).unwrap_or(&buffer));
      }
    }
    Ok(())
  }

  /// Finalises the hash and links the tempfile into its content-addressed
  /// name, deduplicating against byte-identical existing files.
  pub fn complete(self, put_target: Option<&PutTarget>) -> VermResult<UploadOutcome> {
    let digest = self.hasher.finalize();
    let encoded = URL_SAFE_NO_PAD.encode(digest);

    if let Some(target) = put_target {
      if !target.matches(&encoded, &self.extension) {
        log::info!(
          "Refusing PUT to {}/{}/{}: not the canonical path for these contents",
          target.directory,
          target.hash_prefix,
          target.rest
        );
        return Ok(UploadOutcome::rejected(Response::wrong_path()));
      }
    }

    // replication senders don't declare a content type, so the path is the
    // only source for the extension of a pushed file
    let extension = if self.extension.is_empty() {
      put_target.and_then(|t| t.extension.clone()).unwrap_or_default()
    } else {
      self.extension.clone()
    };

    let encoding_suffix = if self.encoding.is_some() { ".gz" } else { "" };
    let hash_prefix = encoded.get(..2).unwrap_or_default();
    let remainder = encoded.get(2..).unwrap_or_default();

    // we put each file in a subdirectory off the main root, whose name is
    // the first two characters of the hash, and don't repeat those
    // characters in the filename
    let mut attempt: u32 = 1;
    let mut created_directory = false;
    loop {
      let mut location = format!("{}/{}/{}", self.directory, hash_prefix, remainder);
      if attempt > 1 {
        location.push('_');
        location.push_str(&attempt.to_string());
      }
      if !extension.is_empty() {
        location.push('.');
        location.push_str(&extension);
      }

      let final_path = fs_path(self.root, &format!("{}{}", location, encoding_suffix));
      log::debug!("trying to link as {}", final_path.display());

      match fs::hard_link(self.tempfile.path(), &final_path) {
        Ok(()) => {
          let stored = StoredFile { location: location.clone(), path: final_path, encoding: self.encoding };
          let response = if self.redirect_afterwards {
            Response::redirected(&location)
          } else {
            Response::created(&location)
          };
          return Ok(UploadOutcome { response, new_file_stored: true, stored: Some(stored) });
        }
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
          let existing = File::open(&final_path)?;
          if existing.metadata()?.len() == self.size
            && same_file_contents(self.tempfile.as_file(), &existing, self.size)?
          {
            // same file size and contents: a dedup hit, nothing to store
            let response = if self.redirect_afterwards {
              Response::redirected(&location)
            } else {
              Response::created(&location)
            };
            return Ok(UploadOutcome { response, new_file_stored: false, stored: None });
          }

          // different contents behind the same name; try again with an
          // attempt number appended
          attempt += 1;
        }
        Err(err) if err.kind() == ErrorKind::NotFound && !created_directory => {
          let parent = fs_path(self.root, &format!("{}/{}", self.directory, hash_prefix));
          create_directories(&parent)?;
          created_directory = true;
        }
        Err(err) => return Err(err.into()),
      }
    }
  }
}

fn read_chunk(source: &mut dyn Read, buffer: &mut [u8]) -> io::Result<usize> {
  loop {
    match source.read(buffer) {
      Err(e) if e.kind() == ErrorKind::Interrupted => continue,
      other => return other,
    }
  }
}

fn create_directories(directory: &Path) -> io::Result<()> {
  fs::DirBuilder::new().recursive(true).mode(DIRECTORY_MODE).create(directory)
}

/// Paired 16 KiB positional reads over both files.
fn same_file_contents(ours: &File, theirs: &File, size: u64) -> io::Result<bool> {
  let mut our_buffer = [0u8; COMPARE_BUFFER_SIZE];
  let mut their_buffer = [0u8; COMPARE_BUFFER_SIZE];

  let mut offset = 0u64;
  while offset < size {
    let chunk = u64::min(size - offset, COMPARE_BUFFER_SIZE as u64) as usize;
    let ours_chunk = our_buffer.get_mut(..chunk).unwrap_or(&mut []);
    ours.read_exact_at(ours_chunk, offset)?;
    let theirs_chunk = their_buffer.get_mut(..chunk).unwrap_or(&mut []);
    match theirs.read_exact_at(theirs_chunk, offset) {
      Ok(()) => {}
      Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(false),
      Err(err) => return Err(err),
    }
    if ours_chunk != theirs_chunk {
      return Ok(false);
    }
    offset += chunk as u64;
  }

  Ok(true)
}

/// Runs the whole ingest state machine for one POST or PUT.
pub fn handle_upload(
  root: &Path,
  mime_types: &MimeTypes,
  put_pattern: &Regex,
  head: &RequestHead,
  body: Option<&mut dyn Read>,
) -> VermResult<UploadOutcome> {
  let is_put = head.get_method() == &HttpMethod::Put;

  let (directory, put_target) = if is_put {
    match validate_put_path(head.get_path(), put_pattern) {
      Some(target) => (target.directory.clone(), Some(target)),
      None => {
        log::info!("Refusing put to a suspicious path: '{}'", head.get_path());
        return Ok(UploadOutcome::rejected(Response::wrong_path()));
      }
    }
  } else {
    match validate_post_directory(head.get_path()) {
      Some(directory) => (directory, None),
      None => {
        log::info!("Refusing post to a suspicious path: '{}'", head.get_path());
        return Ok(UploadOutcome::rejected(Response::wrong_path()));
      }
    }
  };

  let mut upload = Upload::create(root, mime_types, directory)?;

  let gzip_encoded = head
    .get_header("Content-Encoding")
    .map(|encoding| encoding.eq_ignore_ascii_case("gzip"))
    .unwrap_or(false);

  let mut empty = io::empty();
  let body: &mut dyn Read = match body {
    Some(body) => body,
    None => &mut empty,
  };

  match head.content_type().as_deref() {
    Some("multipart/form-data") => {
      let boundary = head.multipart_boundary().ok_or_else(|| {
        VermError::new_io(ErrorKind::InvalidData, "multipart form without a boundary")
      })?;
      ingest_multipart(&mut upload, body, &boundary, gzip_encoded)?;
    }
    Some("application/x-www-form-urlencoded") => {
      ingest_form_urlencoded(&mut upload, body, gzip_encoded)?;
    }
    // no post processor; the body is the single field `uploaded_file`
    content_type => {
      upload.ingest_file(body, content_type, gzip_encoded)?;
    }
  }

  upload.complete(put_target.as_ref())
}

/// Streams multipart/form-data fields through the upload.
///
/// Only two fields are recognised: `uploaded_file` carries the content and
/// `redirect` switches the response to a 303. The multipart parser doesn't
/// surface per-part encodings, so the request-level header governs.
fn ingest_multipart(
  upload: &mut Upload<'_>,
  body: &mut dyn Read,
  boundary: &str,
  gzip_encoded: bool,
) -> VermResult<()> {
  let mut form = multipart::server::Multipart::with_body(body, boundary);
  while let Some(mut field) = form.read_entry()? {
    match &*field.headers.name {
      "uploaded_file" => {
        let content_type = field.headers.content_type.as_ref().map(|m| m.essence_str().to_string());
        upload.ingest_file(&mut field.data, content_type.as_deref(), gzip_encoded)?;
      }
      "redirect" => {
        let mut value = Vec::new();
        field.data.read_to_end(&mut value)?;
        upload.redirect_afterwards = boolean(&value);
      }
      other => {
        log::debug!("ignoring unrecognised form field {}", other);
      }
    }
  }
  Ok(())
}

/// Decodes an application/x-www-form-urlencoded body and dispatches its
/// fields the same way as multipart parts. Decoding stays at the byte level
/// since the uploaded content need not be text.
fn ingest_form_urlencoded(
  upload: &mut Upload<'_>,
  body: &mut dyn Read,
  gzip_encoded: bool,
) -> VermResult<()> {
  let mut data = Vec::new();
  body.read_to_end(&mut data)?;

  for pair in data.split(|b| *b == b'&') {
    let mut halves = pair.splitn(2, |b| *b == b'=');
    let name = halves.next().unwrap_or_default();
    let value: Vec<u8> =
      halves.next().unwrap_or_default().iter().map(|b| if *b == b'+' { b' ' } else { *b }).collect();
    let value = urlencoding::decode_binary(&value).into_owned();
    match name {
      b"uploaded_file" => {
        upload.ingest_file(&mut value.as_slice(), None, gzip_encoded)?;
      }
      b"redirect" => {
        upload.redirect_afterwards = boolean(&value);
      }
      _ => {}
    }
  }
  Ok(())
}
