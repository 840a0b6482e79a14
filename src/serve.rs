//! Resolving GET and HEAD requests against the data tree.

use crate::decompression::{decompressed_file_size, FileDecompressor};
use crate::error::VermResult;
use crate::mime_types::MimeTypes;
use crate::request::{HttpMethod, RequestHead};
use crate::response::{accept_gzip_encoding, Response, ResponseBody, StatusCode};
use crate::upload::fs_path;
use std::fs::File;
use std::io::ErrorKind;
use std::path::Path;

/// Handles one GET or HEAD request.
///
/// `/` and directories serve the upload form. A path that doesn't resolve
/// falls back to its gzip-compressed twin, which is streamed as-is to
/// clients accepting gzip and decoded on the fly otherwise.
pub fn handle_get_or_head(
  root: &Path,
  mime_types: &MimeTypes,
  head: &RequestHead,
) -> VermResult<Response> {
  let path = head.get_path();
  let send_data = head.get_method() != &HttpMethod::Head;

  if path == "/" {
    return Ok(Response::upload_page());
  }

  if !path.starts_with('/') || path.contains("/..") {
    return Ok(Response::file_not_found());
  }

  let mut compressed_twin = false;
  let file_path = fs_path(root, path);
  log::debug!("opening {}", file_path.display());
  let mut file = match File::open(&file_path) {
    Ok(file) => file,
    Err(err) if matches!(err.kind(), ErrorKind::NotFound | ErrorKind::PermissionDenied) => {
      // fall back to the compressed twin, unless they asked for one already
      if path.ends_with(".gz") {
        return Ok(Response::file_not_found());
      }
      let twin_path = fs_path(root, &format!("{}.gz", path));
      match File::open(&twin_path) {
        Ok(file) => {
          compressed_twin = true;
          file
        }
        Err(err) if matches!(err.kind(), ErrorKind::NotFound | ErrorKind::PermissionDenied) => {
          return Ok(Response::file_not_found());
        }
        Err(err) => return Err(err.into()),
      }
    }
    Err(err) => return Err(err.into()),
  };

  let metadata = file.metadata()?;
  if metadata.is_dir() {
    return Ok(Response::upload_page());
  }

  // since the path includes the hash, it's a perfect ETag
  let etag = path.trim_start_matches('/').to_string();
  if head.get_header("If-None-Match") == Some(etag.as_str()) {
    log::debug!("{} not modified", path);
    return Ok(Response::not_modified(&etag));
  }

  let modified = metadata.modified()?;
  let mut response = Response::new(StatusCode::OK);

  if compressed_twin {
    if accept_gzip_encoding(head.get_header("Accept-Encoding")) {
      response = response.with_header("Content-Encoding", "gzip");
      response.body = if send_data {
        ResponseBody::File(file, metadata.len())
      } else {
        ResponseBody::HeadOnly(metadata.len())
      };
    } else {
      let size = decompressed_file_size(&mut file)?;
      response.body = if send_data {
        ResponseBody::Decompressed(FileDecompressor::new(file)?, size)
      } else {
        ResponseBody::HeadOnly(size)
      };
    }
  } else {
    response.body = if send_data {
      ResponseBody::File(file, metadata.len())
    } else {
      ResponseBody::HeadOnly(metadata.len())
    };
  }

  Ok(
    response
      .with_last_modified(modified)
      .with_content_type_for(path, mime_types)
      .with_etag(&etag)
      .with_expires_never(),
  )
}
