//! Pushing stored files to peer verm instances.
//!
//! One worker thread per peer drains a FIFO queue of newly stored files,
//! PUTting each over a persistent HTTP/1.0 connection. Failures close the
//! connection and back off exponentially; a vanished file triggers a full
//! resync, which rescans the data tree and pushes everything.
//!
//! Each peer owns its queue, mutex and condvar; the only cross-peer state
//! is the shutdown flag, checked on every wakeup and between send buffers.

use crate::server::DEFAULT_HTTP_PORT;
use crate::statistics::Statistics;
use crate::upload::StoredFile;
use std::collections::VecDeque;
use std::fs::File;
use std::io;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

// we use binary exponential backoff times, but after 1 failed push attempt
// we want to retry immediately, and only after 2 failed push attempts wait
// the base backoff time, doubling after each failure from there
const BACKOFF_BASE_TIME: Duration = Duration::from_secs(1);
const BACKOFF_MAX_TIME: Duration = Duration::from_secs(60);

const SEND_BUFFER_SIZE: usize = 8192;
const HTTP_CREATED_STATUS: u16 = 201;

/// One queued push.
#[derive(Debug, Clone)]
pub struct ReplicationFile {
  pub location: String,
  pub path: PathBuf,
  pub encoding: Option<&'static str>,
  pub queued_at: SystemTime,
}

#[derive(Debug, Default)]
struct PeerQueue {
  files: VecDeque<ReplicationFile>,
  need_resync: bool,
}

/// One peer and the state shared between its worker and the ingest threads.
#[derive(Debug)]
pub struct Replicator {
  hostname: String,
  port: u16,
  queue: Mutex<PeerQueue>,
  wakeup: Condvar,
  shutdown: AtomicBool,
}

impl Replicator {
  fn lock_queue(&self) -> MutexGuard<'_, PeerQueue> {
    self.queue.lock().unwrap_or_else(|poison| poison.into_inner())
  }

  fn is_shutdown(&self) -> bool {
    self.shutdown.load(Ordering::SeqCst)
  }
}

/// All configured peers plus their worker threads.
#[derive(Debug, Default)]
pub struct ReplicationSet {
  replicators: Vec<Arc<Replicator>>,
  workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ReplicationSet {
  pub fn new() -> ReplicationSet {
    ReplicationSet::default()
  }

  /// Parses a `host[:port]` replication target and adds it to the set.
  pub fn add_target(&mut self, target: &str) -> Result<(), String> {
    let (hostname, port) = match target.rsplit_once(':') {
      Some((hostname, port)) => {
        let port =
          port.parse::<u16>().map_err(|_| format!("invalid replication port in '{}'", target))?;
        (hostname, port)
      }
      None => (target, DEFAULT_HTTP_PORT),
    };
    if hostname.is_empty() {
      return Err(format!("invalid replication target '{}'", target));
    }

    self.replicators.push(Arc::new(Replicator {
      hostname: hostname.to_string(),
      port,
      queue: Mutex::new(PeerQueue::default()),
      wakeup: Condvar::new(),
      shutdown: AtomicBool::new(false),
    }));
    Ok(())
  }

  pub fn is_empty(&self) -> bool {
    self.replicators.is_empty()
  }

  /// Total files currently queued across all peers.
  pub fn queued_files(&self) -> usize {
    self.replicators.iter().map(|replicator| replicator.lock_queue().files.len()).sum()
  }

  /// Starts one worker thread per peer.
  pub fn start(&self, statistics: Arc<Statistics>, root: PathBuf) {
    let mut workers = self.workers.lock().unwrap_or_else(|poison| poison.into_inner());
    for replicator in &self.replicators {
      let replicator = Arc::clone(replicator);
      let statistics = Arc::clone(&statistics);
      let root = root.clone();
      workers.push(thread::spawn(move || replication_worker(replicator, statistics, root)));
    }
  }

  /// Queues a freshly stored file for every peer. Called by the ingest
  /// pipeline once the hard link has landed.
  pub fn enqueue(&self, stored: &StoredFile) {
    for replicator in &self.replicators {
      let mut queue = replicator.lock_queue();
      // a pending resync will pick the file up anyway
      if queue.need_resync {
        continue;
      }
      queue.files.push_back(ReplicationFile {
        location: stored.location.clone(),
        path: stored.path.clone(),
        encoding: stored.encoding,
        queued_at: SystemTime::now(),
      });
      replicator.wakeup.notify_all();
    }
  }

  /// Flags every worker down, wakes them, and joins them. Workers close
  /// their sockets and drop their queues on the way out.
  pub fn shutdown(&self) {
    for replicator in &self.replicators {
      replicator.shutdown.store(true, Ordering::SeqCst);
      let _queue = replicator.lock_queue();
      replicator.wakeup.notify_all();
    }

    let mut workers = self.workers.lock().unwrap_or_else(|poison| poison.into_inner());
    for worker in workers.drain(..) {
      let _ = worker.join();
    }
  }
}

enum PushResult {
  Success,
  Failure,
  /// The file has gone missing locally; the queue is stale.
  MissingFile,
}

/// The persistent client connection to one peer.
struct PeerConnection {
  stream: Option<BufReader<TcpStream>>,
}

impl PeerConnection {
  fn new() -> PeerConnection {
    PeerConnection { stream: None }
  }

  fn close(&mut self) {
    self.stream = None;
  }

  /// Resolves the peer and tries each address until one connects.
  fn ensure_open(&mut self, hostname: &str, port: u16) -> bool {
    if self.stream.is_some() {
      return true;
    }

    let addresses = match (hostname, port).to_socket_addrs() {
      Ok(addresses) => addresses,
      Err(err) => {
        log::error!("Couldn't resolve {}:{}: {}", hostname, port, err);
        return false;
      }
    };

    for address in addresses {
      match TcpStream::connect(address) {
        Ok(stream) => {
          log::debug!("connected to {}:{}", hostname, port);
          self.stream = Some(BufReader::new(stream));
          return true;
        }
        Err(err) => {
          log::error!("Couldn't connect to {}:{}: {}", hostname, port, err);
          // loop around and retry the next address
        }
      }
    }

    false
  }
}

fn replication_worker(replicator: Arc<Replicator>, statistics: Arc<Statistics>, root: PathBuf) {
  log::debug!("replicating to {}:{}", replicator.hostname, replicator.port);

  let mut connection = PeerConnection::new();
  let mut failed_push_attempts: u32 = 0;
  let mut queue = replicator.lock_queue();

  while !replicator.is_shutdown() {
    if queue.need_resync {
      queue.files.clear();
      queue.need_resync = false;

      drop(queue);
      let successful =
        resync(&replicator, &mut connection, &statistics, &root, &mut failed_push_attempts);
      queue = replicator.lock_queue();

      if !successful {
        queue.need_resync = true;
        connection.close();
        queue = backoff(&replicator, queue, failed_push_attempts);
      }
    } else if let Some(file) = queue.files.front().cloned() {
      drop(queue);
      let result = push_file(&replicator, &mut connection, &statistics, &file);
      queue = replicator.lock_queue();

      match result {
        PushResult::Success => {
          failed_push_attempts = 0;
          queue.files.pop_front();
        }
        PushResult::MissingFile => {
          // flush the queue and scan for files, so we don't get stuck on a
          // disappeared file
          queue.need_resync = true;
          connection.close();
        }
        PushResult::Failure => {
          failed_push_attempts += 1;
          connection.close();
          queue = backoff(&replicator, queue, failed_push_attempts);
        }
      }
    } else {
      connection.close();
      queue = match replicator.wakeup.wait(queue) {
        Ok(queue) => queue,
        Err(poison) => poison.into_inner(),
      };
    }
  }

  connection.close();
  queue.files.clear();
}

/// Sleeps out the backoff on the peer's condvar so shutdown interrupts it.
fn backoff<'a>(
  replicator: &'a Replicator,
  mut queue: MutexGuard<'a, PeerQueue>,
  failed_push_attempts: u32,
) -> MutexGuard<'a, PeerQueue> {
  if failed_push_attempts <= 1 {
    return queue;
  }

  let exponent = (failed_push_attempts - 2).min(6);
  let backoff_time = Duration::min(BACKOFF_BASE_TIME * 2u32.pow(exponent), BACKOFF_MAX_TIME);
  let deadline = Instant::now() + backoff_time;

  while !replicator.is_shutdown() {
    let now = Instant::now();
    if now >= deadline {
      break;
    }
    let (returned, timeout) = match replicator.wakeup.wait_timeout(queue, deadline - now) {
      Ok(result) => result,
      Err(poison) => {
        queue = poison.into_inner().0;
        continue;
      }
    };
    queue = returned;
    if timeout.timed_out() {
      break;
    }
  }

  queue
}

/// PUTs one file to the peer. Counts the attempt whatever happens.
fn push_file(
  replicator: &Replicator,
  connection: &mut PeerConnection,
  statistics: &Statistics,
  file: &ReplicationFile,
) -> PushResult {
  log::debug!(
    "replicating {} to {}:{}",
    file.location,
    replicator.hostname,
    replicator.port
  );

  let stored = match File::open(&file.path) {
    Ok(stored) => stored,
    Err(err) => {
      log::error!("Couldn't open {}: {}", file.path.display(), err);
      statistics.log_replication_attempt(false);
      return if matches!(err.kind(), io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied) {
        PushResult::MissingFile
      } else {
        PushResult::Failure
      };
    }
  };

  let size = match stored.metadata() {
    Ok(metadata) => metadata.len(),
    Err(err) => {
      log::error!("Couldn't stat {}: {}", file.path.display(), err);
      statistics.log_replication_attempt(false);
      return PushResult::Failure;
    }
  };

  let successful = connection.ensure_open(&replicator.hostname, replicator.port)
    && send_put_request(replicator, connection, file, stored, size)
    && check_put_response(replicator, connection, &file.location);

  if !successful {
    connection.close();
  }
  statistics.log_replication_attempt(successful);

  if successful {
    PushResult::Success
  } else {
    PushResult::Failure
  }
}

fn send_put_request(
  replicator: &Replicator,
  connection: &mut PeerConnection,
  file: &ReplicationFile,
  mut stored: File,
  size: u64,
) -> bool {
  let Some(reader) = connection.stream.as_mut() else { return false };
  let stream = reader.get_mut();

  let mut header = format!("PUT {} HTTP/1.0\r\nHost: {}\r\n", file.location, replicator.hostname);
  if let Some(encoding) = file.encoding {
    header.push_str("Content-Encoding: ");
    header.push_str(encoding);
    header.push_str("\r\n");
  }
  header.push_str(&format!("Content-Length: {}\r\n\r\n", size));

  if let Err(err) = stream.write_all(header.as_bytes()) {
    log::error!("Couldn't write to {}:{}: {}", replicator.hostname, replicator.port, err);
    return false;
  }

  let mut buffer = [0u8; SEND_BUFFER_SIZE];
  let mut sent = 0u64;
  while sent < size {
    if replicator.is_shutdown() {
      return false;
    }
    let count = match stored.read(&mut buffer) {
      Ok(0) => {
        // the file must have been truncated under us; our counter no longer
        // matches the size we advertised
        log::error!("Error reading from {}: file truncated?", file.path.display());
        return false;
      }
      Ok(count) => count,
      Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
      Err(err) => {
        log::error!("Error reading from {}: {}", file.path.display(), err);
        return false;
      }
    };
    if let Err(err) = stream.write_all(buffer.get(..count).unwrap_or(&buffer)) {
      log::error!("Error writing to {}:{}: {}", replicator.hostname, replicator.port, err);
      return false;
    }
    sent += count as u64;
  }

  stream.flush().is_ok()
}

/// Reads the peer's response, expecting 201. The body is drained by its
/// `Content-Length` so the connection can be reused; a response without one
/// forces a close.
fn check_put_response(
  replicator: &Replicator,
  connection: &mut PeerConnection,
  location: &str,
) -> bool {
  let Some(reader) = connection.stream.as_mut() else { return false };

  let mut status_line = String::new();
  if let Err(err) = reader.read_line(&mut status_line) {
    log::error!(
      "Replication HTTP request to {}:{} for {} failed: {}",
      replicator.hostname,
      replicator.port,
      location,
      err
    );
    return false;
  }

  let response_code = status_line
    .strip_prefix("HTTP/")
    .and_then(|rest| rest.split_whitespace().nth(1))
    .and_then(|code| code.parse::<u16>().ok());
  if response_code != Some(HTTP_CREATED_STATUS) {
    log::error!(
      "Replication HTTP request to {}:{} for {} failed: {}",
      replicator.hostname,
      replicator.port,
      location,
      status_line.trim_end()
    );
    return false;
  }

  // read header lines until the blank line that separates them from the
  // response body (if any)
  let mut content_length: Option<u64> = None;
  loop {
    let mut line = String::new();
    match reader.read_line(&mut line) {
      Ok(0) => {
        log::error!(
          "Replication HTTP request to {}:{} for {} failed while reading response header",
          replicator.hostname,
          replicator.port,
          location
        );
        return false;
      }
      Ok(_) => {}
      Err(err) => {
        log::error!(
          "Replication HTTP request to {}:{} for {} failed while reading response header: {}",
          replicator.hostname,
          replicator.port,
          location,
          err
        );
        return false;
      }
    }
    let line = line.trim_end();
    if line.is_empty() {
      break;
    }
    if let Some((name, value)) = line.split_once(':') {
      if name.trim().eq_ignore_ascii_case("Content-Length") {
        content_length = match value.trim().parse::<u64>() {
          Ok(length) => Some(length),
          Err(_) => {
            log::error!(
              "Replication HTTP request to {}:{} for {} returned an invalid content-length header: {}",
              replicator.hostname,
              replicator.port,
              location,
              line
            );
            return false;
          }
        };
      }
    }
  }

  match content_length {
    Some(length) => {
      if let Err(err) = io::copy(&mut reader.take(length), &mut io::sink()) {
        log::error!(
          "Replication HTTP request to {}:{} for {} failed while reading response body: {}",
          replicator.hostname,
          replicator.port,
          location,
          err
        );
        return false;
      }
      true
    }
    None => {
      // successful, but without a content-length we can't find the end of
      // the body, so the connection can't be reused
      connection.close();
      true
    }
  }
}

/// Rebuilds the peer's dataset by walking the data tree and pushing every
/// stored file, oldest directories first in whatever order the filesystem
/// yields. Tempfiles still being written are skipped.
fn resync(
  replicator: &Replicator,
  connection: &mut PeerConnection,
  statistics: &Statistics,
  root: &Path,
  failed_push_attempts: &mut u32,
) -> bool {
  log::debug!("resyncing to {}:{}", replicator.hostname, replicator.port);
  resync_directory(replicator, connection, statistics, root, root, failed_push_attempts)
}

fn resync_directory(
  replicator: &Replicator,
  connection: &mut PeerConnection,
  statistics: &Statistics,
  root: &Path,
  directory: &Path,
  failed_push_attempts: &mut u32,
) -> bool {
  let entries = match std::fs::read_dir(directory) {
    Ok(entries) => entries,
    Err(err) => {
      log::error!("Couldn't scan {}: {}", directory.display(), err);
      return false;
    }
  };

  for entry in entries {
    if replicator.is_shutdown() {
      return false;
    }
    let Ok(entry) = entry else { return false };
    let path = entry.path();
    let file_type = match entry.file_type() {
      Ok(file_type) => file_type,
      Err(_) => return false,
    };

    if file_type.is_dir() {
      if !resync_directory(replicator, connection, statistics, root, &path, failed_push_attempts) {
        return false;
      }
      continue;
    }
    if !file_type.is_file() {
      continue;
    }
    if entry.file_name().to_string_lossy().starts_with("upload.") {
      continue;
    }

    let Some(file) = replication_file_for(root, &path) else { continue };
    match push_file(replicator, connection, statistics, &file) {
      PushResult::Success => {
        *failed_push_attempts = 0;
      }
      PushResult::Failure | PushResult::MissingFile => {
        *failed_push_attempts += 1;
        return false;
      }
    }
  }

  true
}

/// Derives the queue record for a file found on disk: the location is the
/// path below the root, and a `.gz` suffix marks the stored bytes as the
/// compressed rendition of the named location.
fn replication_file_for(root: &Path, path: &Path) -> Option<ReplicationFile> {
  let relative = path.strip_prefix(root).ok()?;
  let mut location = format!("/{}", relative.to_string_lossy());
  let mut encoding = None;
  if let Some(stripped) = location.strip_suffix(".gz") {
    location = stripped.to_string();
    encoding = Some("gzip");
  }
  Some(ReplicationFile { location, path: path.to_path_buf(), encoding, queued_at: SystemTime::now() })
}
