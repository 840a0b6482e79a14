//! The verm daemon: flag parsing, startup, and orderly shutdown.

use clap::error::ErrorKind as ClapErrorKind;
use clap::Parser;
use signal_hook::consts::{SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use verm::mime_types::{MimeTypes, DEFAULT_MIME_TYPES_FILE};
use verm::replication::ReplicationSet;
use verm::server::{run_acceptor, VermServer, DEFAULT_HTTP_PORT};

const EXIT_DAEMON_FAILED: i32 = 1;
const EXIT_SIGNALS_FAILED: i32 = 6;
const EXIT_USAGE: i32 = 100;

/// How long shutdown waits for in-flight requests before giving up on them.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "verm", version, about = "A content-addressed, replicating HTTP file store.")]
struct Arguments {
  /// Data directory; must be an absolute path
  #[arg(short = 'd', value_name = "DIRECTORY", default_value = "/var/lib/verm")]
  data_directory: String,

  /// Port to listen on
  #[arg(short = 'l', value_name = "PORT", default_value_t = DEFAULT_HTTP_PORT)]
  listen_port: u16,

  /// Mime types file to supplement the builtin table
  #[arg(short = 'm', value_name = "FILE", default_value = DEFAULT_MIME_TYPES_FILE)]
  mime_types_file: PathBuf,

  /// Push stored files to this peer as well; repeatable
  #[arg(short = 'r', value_name = "HOST[:PORT]")]
  replicate_to: Vec<String>,

  /// Quiet: suppress the access log
  #[arg(short = 'q')]
  quiet: bool,
}

fn main() {
  process::exit(run());
}

fn run() -> i32 {
  let arguments = match Arguments::try_parse() {
    Ok(arguments) => arguments,
    Err(err) => {
      let _ = err.print();
      return match err.kind() {
        ClapErrorKind::DisplayHelp | ClapErrorKind::DisplayVersion => 0,
        _ => EXIT_USAGE,
      };
    }
  };

  env_logger::Builder::from_env(
    env_logger::Env::default().default_filter_or(if arguments.quiet { "warn" } else { "info" }),
  )
  .init();

  if !arguments.data_directory.starts_with('/') {
    eprintln!("The data directory must be given as an absolute path");
    return EXIT_USAGE;
  }

  let mut replication = ReplicationSet::new();
  for target in &arguments.replicate_to {
    if let Err(err) = replication.add_target(target) {
      eprintln!("{}", err);
      return EXIT_USAGE;
    }
  }

  let mime_types = MimeTypes::load(&arguments.mime_types_file);

  let server =
    match VermServer::new(PathBuf::from(&arguments.data_directory), mime_types, replication) {
      Ok(server) => Arc::new(server),
      Err(err) => {
        log::error!("couldn't start daemon: {}", err);
        return EXIT_DAEMON_FAILED;
      }
    };

  let mut signals = match Signals::new([SIGINT, SIGTERM, SIGQUIT]) {
    Ok(signals) => signals,
    Err(err) => {
      log::error!("couldn't set up signal handling: {}", err);
      return EXIT_SIGNALS_FAILED;
    }
  };

  let listener = match TcpListener::bind(("0.0.0.0", arguments.listen_port)) {
    Ok(listener) => listener,
    Err(err) => {
      log::error!("couldn't start daemon: {}", err);
      return EXIT_DAEMON_FAILED;
    }
  };

  server.start_replication();

  let acceptor = {
    let server = Arc::clone(&server);
    thread::spawn(move || run_acceptor(server, listener))
  };

  println!("Verm listening on http://localhost:{}/", arguments.listen_port);
  let _ = signals.forever().next();
  log::info!("shutting down");

  // the listener stops accepting, in-flight requests get a grace period,
  // then the replication workers flush out
  server.initiate_shutdown();
  let _ = TcpStream::connect(("127.0.0.1", arguments.listen_port));
  let _ = acceptor.join();

  let deadline = Instant::now() + SHUTDOWN_DRAIN_TIMEOUT;
  while server.current_connections() > 0 && Instant::now() < deadline {
    thread::sleep(Duration::from_millis(50));
  }

  server.shutdown_replication();
  0
}
