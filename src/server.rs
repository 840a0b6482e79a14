//! The connection loop and request dispatch.
//!
//! One thread per connection; requests on a connection are processed in
//! sequence with standard keep-alive semantics. Handler errors drop the
//! connection without a response.

use crate::error::VermResult;
use crate::mime_types::MimeTypes;
use crate::replication::ReplicationSet;
use crate::request::{HttpMethod, HttpVersion, RequestBody, RequestHead};
use crate::response::{Response, ResponseBody, StatusCode};
use crate::serve;
use crate::statistics::Statistics;
use crate::stream::IntoConnectionStream;
use crate::upload;
use regex::Regex;
use std::io::{BufReader, ErrorKind, Read};
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub const DEFAULT_HTTP_PORT: u16 = 1138;

/// Idle connections are dropped after this long.
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Everything a request needs: the data root, the mime tables, the
/// statistics block and the replication queues. Assembled once at startup
/// and shared read-only between connection threads.
pub struct VermServer {
  root: PathBuf,
  mime_types: MimeTypes,
  statistics: Arc<Statistics>,
  replication: ReplicationSet,
  put_path_pattern: Regex,
  connections_current: AtomicUsize,
  shutdown: AtomicBool,
}

impl VermServer {
  pub fn new(
    root: PathBuf,
    mime_types: MimeTypes,
    replication: ReplicationSet,
  ) -> VermResult<VermServer> {
    Ok(VermServer {
      root,
      mime_types,
      statistics: Arc::new(Statistics::new()),
      replication,
      put_path_pattern: upload::put_path_pattern()?,
      connections_current: AtomicUsize::new(0),
      shutdown: AtomicBool::new(false),
    })
  }

  pub fn statistics(&self) -> &Arc<Statistics> {
    &self.statistics
  }

  pub fn root(&self) -> &PathBuf {
    &self.root
  }

  pub fn current_connections(&self) -> usize {
    self.connections_current.load(Ordering::SeqCst)
  }

  /// Spawns the replication workers. Call once, after construction.
  pub fn start_replication(&self) {
    self.replication.start(Arc::clone(&self.statistics), self.root.clone())
  }

  pub fn is_shutdown(&self) -> bool {
    self.shutdown.load(Ordering::SeqCst)
  }

  /// Flags the server down: the acceptor stops taking connections and
  /// keep-alive stops being offered. In-flight requests complete on their
  /// own threads.
  pub fn initiate_shutdown(&self) {
    self.shutdown.store(true, Ordering::SeqCst);
  }

  /// Winds the replication workers down and joins them. Call after the
  /// listener has stopped producing new uploads.
  pub fn shutdown_replication(&self) {
    self.replication.shutdown();
  }

  /// Serves every request arriving on one connection.
  pub fn handle_connection<S: IntoConnectionStream>(&self, stream: S) -> VermResult<()> {
    let stream = stream.into_connection_stream();
    let peer = stream.peer_addr().unwrap_or_else(|_| "-".to_string());
    let mut reader = BufReader::new(stream);

    loop {
      let Some(head) = RequestHead::read(&mut reader)? else {
        // clean EOF between requests
        return Ok(());
      };
      let version = head.get_version();
      let keep_alive = match head.get_header("Connection") {
        Some(value) if value.eq_ignore_ascii_case("close") => false,
        Some(value) if value.eq_ignore_ascii_case("keep-alive") => true,
        _ => version == HttpVersion::Http11,
      } && !self.is_shutdown();

      let mut body = RequestBody::from_head(&head, &mut reader)?;
      let outcome = self.dispatch(&head, body.as_mut());

      // whatever the handler left unread has to go before the response, or
      // the next request on this connection would parse garbage
      let drained = match (&outcome, body.as_mut()) {
        (Ok(_), Some(body)) => body.drain(),
        _ => Ok(()),
      };
      drop(body);

      let (response, new_file_stored) = match outcome {
        Ok(handled) => handled,
        Err(err) => {
          self.statistics.log_response(
            &peer,
            head.get_method(),
            head.get_path(),
            version,
            500,
            0,
            false,
          );
          return Err(err);
        }
      };
      drained?;

      let status = response.status_code.code();
      let response_bytes = response.write_to(version, keep_alive, reader.get_mut())?;
      self.statistics.log_response(
        &peer,
        head.get_method(),
        head.get_path(),
        version,
        status,
        response_bytes,
        new_file_stored,
      );

      if !keep_alive {
        return Ok(());
      }
    }
  }

  fn dispatch(
    &self,
    head: &RequestHead,
    body: Option<&mut RequestBody<'_>>,
  ) -> VermResult<(Response, bool)> {
    match head.get_method() {
      HttpMethod::Get | HttpMethod::Head => {
        if head.get_path() == "/_statistics" {
          return Ok((self.statistics_response(head), false));
        }
        let mut response = serve::handle_get_or_head(&self.root, &self.mime_types, head)?;
        if head.get_method() == &HttpMethod::Head {
          // HEAD keeps the headers, including the length the body would
          // have had, and sends nothing
          response.body = ResponseBody::HeadOnly(response.body.content_length());
        }
        Ok((response, false))
      }
      HttpMethod::Post | HttpMethod::Put => {
        let outcome = upload::handle_upload(
          &self.root,
          &self.mime_types,
          &self.put_path_pattern,
          head,
          body.map(|body| body as &mut dyn Read),
        )?;
        if let Some(stored) = &outcome.stored {
          self.replication.enqueue(stored);
        }
        Ok((outcome.response, outcome.new_file_stored))
      }
      HttpMethod::Other(method) => {
        log::debug!("unsupported method {}", method);
        Ok((Response::file_not_found(), false))
      }
    }
  }

  fn statistics_response(&self, head: &RequestHead) -> Response {
    let report = self.statistics.report(self.current_connections());
    let body = if head.get_method() == &HttpMethod::Head {
      ResponseBody::HeadOnly(report.len() as u64)
    } else {
      ResponseBody::Data(report.into_bytes())
    };
    Response::new(StatusCode::OK).with_header("Content-Type", "text/plain").with_body(body)
  }
}

/// Accepts connections until shutdown, one handler thread per connection.
/// The caller owns the listener; poking a connection at it after flagging
/// shutdown gets `accept` to return.
pub fn run_acceptor(server: Arc<VermServer>, listener: TcpListener) {
  for stream in listener.incoming() {
    if server.is_shutdown() {
      break;
    }

    let stream = match stream {
      Ok(stream) => stream,
      Err(err) => {
        log::error!("Couldn't accept connection: {}", err);
        continue;
      }
    };
    let _ = stream.set_read_timeout(Some(HTTP_TIMEOUT));
    let _ = stream.set_write_timeout(Some(HTTP_TIMEOUT));

    server.connections_current.fetch_add(1, Ordering::SeqCst);
    let connection_server = Arc::clone(&server);
    let spawned = thread::Builder::new().spawn(move || {
      if let Err(err) = connection_server.handle_connection(stream) {
        match err.kind() {
          ErrorKind::TimedOut
          | ErrorKind::WouldBlock
          | ErrorKind::UnexpectedEof
          | ErrorKind::ConnectionReset
          | ErrorKind::BrokenPipe => {
            log::debug!("connection closed: {}", err);
          }
          _ => log::error!("error handling connection: {}", err),
        }
      }
      connection_server.connections_current.fetch_sub(1, Ordering::SeqCst);
    });
    if let Err(err) = spawned {
      server.connections_current.fetch_sub(1, Ordering::SeqCst);
      log::error!("Couldn't spawn a connection thread: {}", err);
    }
  }
}
