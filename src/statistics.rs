//! Request counters and the access log.
//!
//! Every counter update happens under the same mutex as the access log line
//! for the request that caused it, so the log and the `/_statistics` report
//! can't disagree about ordering.

use crate::request::{HttpMethod, HttpVersion};
use std::fmt::Write as _;
use std::sync::Mutex;

/// Monotonically non-decreasing counters, copied out whole under the lock.
#[derive(Debug, Default, Clone)]
pub struct LogStatistics {
  pub get_requests: u64,
  pub get_requests_not_found: u64,
  pub post_requests: u64,
  pub post_requests_new_file_stored: u64,
  pub post_requests_failed: u64,
  pub put_requests: u64,
  pub put_requests_new_file_stored: u64,
  pub put_requests_failed: u64,
  pub replication_push_attempts: u64,
  pub replication_push_attempts_failed: u64,
}

#[derive(Debug, Default)]
pub struct Statistics {
  log: Mutex<LogStatistics>,
}

impl Statistics {
  pub fn new() -> Statistics {
    Statistics::default()
  }

  pub fn copy_log_statistics(&self) -> LogStatistics {
    self.log.lock().unwrap_or_else(|poison| poison.into_inner()).clone()
  }

  /// Counts one finished request and emits its access log line.
  ///
  /// GET and HEAD requests share the serve path and the `get_requests`
  /// counters, except that the statistics endpoint doesn't count itself.
  /// POST and PUT always count; stores that created a new filesystem object
  /// bump the new-file counter and anything outside [200,400) is a failure.
  pub fn log_response(
    &self,
    peer: &str,
    method: &HttpMethod,
    path: &str,
    version: HttpVersion,
    status: u16,
    response_bytes: u64,
    new_file_stored: bool,
  ) {
    let mut log = self.log.lock().unwrap_or_else(|poison| poison.into_inner());

    match method {
      HttpMethod::Get | HttpMethod::Head => {
        if path != "/_statistics" {
          log.get_requests += 1;
          if status == 404 {
            log.get_requests_not_found += 1;
          }
        }
      }
      HttpMethod::Post => {
        log.post_requests += 1;
        if new_file_stored {
          log.post_requests_new_file_stored += 1;
        }
        if !(200..400).contains(&status) {
          log.post_requests_failed += 1;
        }
      }
      HttpMethod::Put => {
        log.put_requests += 1;
        if new_file_stored {
          log.put_requests_new_file_stored += 1;
        }
        if !(200..400).contains(&status) {
          log.put_requests_failed += 1;
        }
      }
      HttpMethod::Other(_) => {}
    }

    // standard CLF time format
    let timestamp = chrono::Local::now().format("%d/%b/%Y:%H:%M:%S %z");
    log::info!(
      "{} - - [{}] \"{} {} {}\" {} {}",
      peer,
      timestamp,
      method,
      path,
      version,
      status,
      response_bytes
    );
  }

  /// Counts one replication push attempt.
  pub fn log_replication_attempt(&self, successful: bool) {
    let mut log = self.log.lock().unwrap_or_else(|poison| poison.into_inner());
    log.replication_push_attempts += 1;
    if !successful {
      log.replication_push_attempts_failed += 1;
    }
  }

  /// The plaintext report served on `/_statistics`, one `name value` line
  /// per counter plus the current connection gauge.
  pub fn report(&self, connections_current: usize) -> String {
    let statistics = self.copy_log_statistics();
    let mut out = String::with_capacity(512);
    let _ = writeln!(out, "get_requests {}", statistics.get_requests);
    let _ = writeln!(out, "get_requests_not_found {}", statistics.get_requests_not_found);
    let _ = writeln!(out, "post_requests {}", statistics.post_requests);
    let _ =
      writeln!(out, "post_requests_new_file_stored {}", statistics.post_requests_new_file_stored);
    let _ = writeln!(out, "post_requests_failed {}", statistics.post_requests_failed);
    let _ = writeln!(out, "put_requests {}", statistics.put_requests);
    let _ =
      writeln!(out, "put_requests_new_file_stored {}", statistics.put_requests_new_file_stored);
    let _ = writeln!(out, "put_requests_failed {}", statistics.put_requests_failed);
    let _ = writeln!(out, "replication_push_attempts {}", statistics.replication_push_attempts);
    let _ = writeln!(
      out,
      "replication_push_attempts_failed {}",
      statistics.replication_push_attempts_failed
    );
    let _ = writeln!(out, "connections_current {}", connections_current);
    out
  }
}
