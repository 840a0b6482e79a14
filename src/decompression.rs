//! Streaming gzip decoding for stored files and uploaded bodies.

use libflate::gzip;
use std::fs::File;
use std::io;
use std::io::{Read, Seek, SeekFrom, Write};

/// Chunk size used when streaming decoded bytes out of a stored `.gz` file.
pub const DECOMPRESSION_CHUNK_SIZE: usize = 16384;

/// Lazily decompresses a stored `.gz` file for clients that don't accept
/// gzip. The file handle is adopted; dropping the reader closes it.
pub struct FileDecompressor {
  decoder: gzip::Decoder<File>,
}

impl FileDecompressor {
  /// Positions the file at the start and reads the gzip header.
  /// Fails if the file is not in gzip format.
  pub fn new(mut file: File) -> io::Result<FileDecompressor> {
    file.seek(SeekFrom::Start(0))?;
    Ok(FileDecompressor { decoder: gzip::Decoder::new(file)? })
  }
}

impl Read for FileDecompressor {
  fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    self.decoder.read(buf)
  }
}

/// Reads the ISIZE field from the standard gzip trailer: the length of the
/// decompressed data as a little-endian u32, ie. modulo 2^32. Wrong for
/// files whose original content was 4GB or more, an acknowledged limitation.
pub fn decompressed_file_size(file: &mut File) -> io::Result<u64> {
  file.seek(SeekFrom::End(-4))?;
  let mut trailer = [0u8; 4];
  file.read_exact(&mut trailer)?;
  Ok(u64::from(u32::from_le_bytes(trailer)))
}

/// Copies everything read through it into a writer, counting the bytes.
///
/// The ingest pipeline reads an upload through one of these so the wire
/// bytes land in the tempfile whether or not a gzip decoder sits on top
/// feeding the content hasher.
pub struct TeeReader<'a, R: Read, W: Write> {
  inner: R,
  copy: &'a mut W,
  written: &'a mut u64,
}

impl<'a, R: Read, W: Write> TeeReader<'a, R, W> {
  pub fn new(inner: R, copy: &'a mut W, written: &'a mut u64) -> TeeReader<'a, R, W> {
    TeeReader { inner, copy, written }
  }
}

impl<R: Read, W: Write> Read for TeeReader<'_, R, W> {
  #[expect(clippy::indexing_slicing, reason = "count comes from read on the same buffer")]
  fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    let count = loop {
      match self.inner.read(buf) {
        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
        other => break other?,
      }
    };
    if count > 0 {
      // write_all retries interrupted and short writes for us
      self.copy.write_all(&buf[..count])?;
      *self.written += count as u64;
    }
    Ok(count)
  }
}
