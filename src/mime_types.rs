//! Bidirectional mapping between content types and file extensions.
//!
//! Loaded once at startup from a builtin table plus, optionally, a file in
//! the classic `/etc/mime.types` format. Read-only thereafter.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// A somewhat-arbitrary selection of the most important standard mime types
/// for use with net apps. Excludes all non-standard or vendor-specific types
/// and most non-document types. Should generally be supplemented by your
/// /etc/mime.types file, especially if you plan to store audio, video, or
/// animation files or source documents from word processors & spreadsheets.
///
/// Later entries overwrite earlier entries for the same extension or type.
const BUILTIN_MIME_TYPES: &[(&str, &str)] = &[
  ("text/plain", "txt"),
  ("text/html", "htm"),
  ("text/html", "html"),
  ("text/xml", "xsl"),
  ("text/xml", "xsd"),
  ("text/xml", "xml"),
  ("text/css", "css"),
  ("text/comma-separated-values", "csv"),
  ("text/csv", "csv"),
  ("text/tab-separated-values", "tsv"),
  ("image/jpeg", "jpeg"),
  ("image/jpeg", "jpg"),
  ("image/gif", "gif"),
  ("image/png", "png"),
  ("image/svg+xml", "svg"),
  ("application/pdf", "pdf"),
  ("application/javascript", "js"),
  ("application/json", "json"),
  ("application/tar", "tar"),
  ("application/xhtml+xml", "xhtml"),
  ("application/zip", "zip"),
  ("message/rfc822", "eml"),
];

/// The default place to find the system mime types table.
pub const DEFAULT_MIME_TYPES_FILE: &str = "/etc/mime.types";

/// The loaded table. Both directions use exact string keys.
#[derive(Debug, Default)]
pub struct MimeTypes {
  by_mime_type: HashMap<String, String>,
  by_extension: HashMap<String, String>,
}

impl MimeTypes {
  /// Builds the table from the builtin entries only.
  pub fn builtin() -> MimeTypes {
    let mut types = MimeTypes::default();
    for (mime_type, extension) in BUILTIN_MIME_TYPES {
      types.by_mime_type.insert((*mime_type).to_string(), (*extension).to_string());
      types.by_extension.insert((*extension).to_string(), (*mime_type).to_string());
    }
    types
  }

  /// Builds the table from the builtin entries plus the given file.
  /// A missing or unreadable file leaves just the builtin entries in place.
  pub fn load(filename: &Path) -> MimeTypes {
    let mut types = MimeTypes::builtin();
    match File::open(filename) {
      Ok(file) => {
        if let Err(err) = types.add_from_file(file) {
          log::warn!("Error reading mime types from {}: {}", filename.display(), err);
        }
      }
      Err(err) => {
        log::warn!("Couldn't open mime types file {}: {}", filename.display(), err);
      }
    }
    types
  }

  fn add_from_file(&mut self, file: File) -> io::Result<()> {
    for line in BufReader::new(file).lines() {
      let line = line?;
      let mut tokens = line.split_ascii_whitespace();
      let Some(mime_type) = tokens.next() else { continue };
      if mime_type.starts_with('#') {
        continue;
      }

      let mut first = true;
      for extension in tokens {
        // the first extension on the line becomes the default for the type,
        // except for the generic application/octet-stream entries
        if first && mime_type != "application/octet-stream" {
          self.by_mime_type.insert(mime_type.to_string(), extension.to_string());
        }
        first = false;
        self.by_extension.insert(extension.to_string(), mime_type.to_string());
      }
    }
    Ok(())
  }

  /// The extension files of this type are stored with.
  pub fn extension_for_mime_type(&self, mime_type: &str) -> Option<&str> {
    self.by_mime_type.get(mime_type).map(|s| s.as_str())
  }

  /// The content type files with this extension are served with.
  pub fn mime_type_for_extension(&self, extension: &str) -> Option<&str> {
    self.by_extension.get(extension).map(|s| s.as_str())
  }
}
