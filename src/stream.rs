//! Connection stream abstraction.
//!
//! The server core only requires a bidirectional byte stream; this trait lets
//! integration tests drive a full connection through an in-memory mock while
//! production connections come from `TcpStream`.

use std::io;
use std::io::{Read, Write};
use std::net::TcpStream;

/// A bidirectional stream carrying one client connection.
pub trait ConnectionStream: Read + Write + Send {
  /// Address of the peer we are talking to, entirely socket dependant.
  fn peer_addr(&self) -> io::Result<String>;
}

impl ConnectionStream for TcpStream {
  fn peer_addr(&self) -> io::Result<String> {
    Ok(TcpStream::peer_addr(self)?.to_string())
  }
}

/// Converts an owned stream into a boxed `ConnectionStream`.
pub trait IntoConnectionStream {
  fn into_connection_stream(self) -> Box<dyn ConnectionStream>;
}

impl IntoConnectionStream for TcpStream {
  fn into_connection_stream(self) -> Box<dyn ConnectionStream> {
    Box::new(self)
  }
}

impl IntoConnectionStream for Box<dyn ConnectionStream> {
  fn into_connection_stream(self) -> Box<dyn ConnectionStream> {
    self
  }
}
