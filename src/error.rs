//! Crate-wide error type.

use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use std::io;
use std::io::ErrorKind;

pub type VermResult<T> = Result<T, VermError>;

/// Errors produced while parsing the head of an incoming HTTP request.
#[derive(Debug, Ord, PartialOrd, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum RequestHeadParsingError {
  StatusLineNoCRLF,
  StatusLineNoWhitespace,
  StatusLineTooManyWhitespaces,
  StatusLineTooLong(usize),
  LineIsNotUtf8,
  InvalidPath(String),
  InvalidPathUrlEncoding(String),
  HeaderLineNoCRLF,
  HeaderValueMissing,
  HeaderLineTooLong(usize),
  HttpVersionNotSupported(String),
  TransferEncodingNotSupported(String),
  InvalidContentLength(String),
}

impl Display for RequestHeadParsingError {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    Debug::fmt(self, f)
  }
}
impl Error for RequestHeadParsingError {}

#[derive(Debug)]
#[non_exhaustive]
pub enum VermError {
  RequestHeadParsing(RequestHeadParsingError),
  IO(io::Error),
  Other(Box<dyn Error + Send + Sync>),
}

impl VermError {
  pub fn new_io<E: Into<Box<dyn Error + Send + Sync>>>(kind: ErrorKind, message: E) -> VermError {
    io::Error::new(kind, message).into()
  }

  pub fn kind(&self) -> ErrorKind {
    match self {
      VermError::IO(io) => io.kind(),
      VermError::RequestHeadParsing(_) => ErrorKind::InvalidData,
      VermError::Other(_) => ErrorKind::Other,
    }
  }
}

impl Display for VermError {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    match self {
      VermError::IO(err) => Display::fmt(err, f),
      VermError::RequestHeadParsing(err) => Display::fmt(err, f),
      VermError::Other(err) => Display::fmt(err, f),
    }
  }
}

impl Error for VermError {}

impl From<io::Error> for VermError {
  fn from(value: io::Error) -> Self {
    VermError::IO(value)
  }
}

impl From<RequestHeadParsingError> for VermError {
  fn from(value: RequestHeadParsingError) -> Self {
    VermError::RequestHeadParsing(value)
  }
}

impl From<regex::Error> for VermError {
  fn from(value: regex::Error) -> Self {
    VermError::Other(Box::new(value))
  }
}

impl From<VermError> for io::Error {
  fn from(value: VermError) -> Self {
    match value {
      VermError::IO(io) => io,
      err => io::Error::new(err.kind(), err.to_string()),
    }
  }
}
