use libflate::gzip;
use std::io::Write;
use std::path::Path;
use verm::{MimeTypes, ReplicationSet, VermServer};

use mock_stream::MockStream;

// base64url(sha256("hello")), 43 characters with the padding dropped
const HELLO_HASH: &str = "LPJNul-wow4m6DsqxbninhsWHlwfp0JecwQzYpOLmCQ";
const HELLO_LOCATION: &str = "/default/LP/JNul-wow4m6DsqxbninhsWHlwfp0JecwQzYpOLmCQ.txt";

fn test_server(root: &Path) -> VermServer {
  VermServer::new(root.to_path_buf(), MimeTypes::builtin(), ReplicationSet::new())
    .expect("building the server")
}

fn drive(server: &VermServer, request: &[u8]) -> String {
  let stream = MockStream::with_slice(request);
  server.handle_connection(stream.clone()).expect("handling the connection");
  stream.copy_written_data_to_string()
}

fn header<'a>(response: &'a str, name: &str) -> Option<&'a str> {
  let (head, _body) = response.split_once("\r\n\r\n").expect("malformed response");
  head.lines().find_map(|line| {
    let (header_name, value) = line.split_once(':')?;
    header_name.eq_ignore_ascii_case(name).then(|| value.trim())
  })
}

fn files_under(directory: &Path) -> Vec<String> {
  let mut found = Vec::new();
  for entry in std::fs::read_dir(directory).expect("reading the directory") {
    let entry = entry.expect("reading the directory");
    if entry.file_type().expect("file type").is_dir() {
      found.extend(files_under(&entry.path()));
    } else {
      found.push(entry.file_name().to_string_lossy().to_string());
    }
  }
  found.sort();
  found
}

fn gzip_compress(data: &[u8]) -> Vec<u8> {
  let mut encoder = gzip::Encoder::new(Vec::new()).expect("building the encoder");
  encoder.write_all(data).expect("compressing");
  encoder.finish().into_result().expect("compressing")
}

#[test]
fn stores_a_raw_post_under_its_content_hash() {
  let root = tempfile::tempdir().expect("tempdir");
  let server = test_server(root.path());

  let response = drive(
    &server,
    b"POST /default HTTP/1.1\r\nContent-Type: text/plain\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello",
  );

  assert!(response.starts_with("HTTP/1.1 201 Created\r\n"), "got: {}", response);
  assert_eq!(header(&response, "Location"), Some(HELLO_LOCATION));
  assert!(response.ends_with("Resource created\n"));

  let stored = root.path().join(format!("default/LP/{}.txt", &HELLO_HASH[2..]));
  assert_eq!(std::fs::read(stored).expect("reading the stored file"), b"hello");

  // the tempfile is gone again
  assert_eq!(files_under(root.path()), vec![format!("{}.txt", &HELLO_HASH[2..])]);

  let statistics = server.statistics().copy_log_statistics();
  assert_eq!(statistics.post_requests, 1);
  assert_eq!(statistics.post_requests_new_file_stored, 1);
  assert_eq!(statistics.post_requests_failed, 0);
}

#[test]
fn identical_uploads_converge_on_one_file() {
  let root = tempfile::tempdir().expect("tempdir");
  let server = test_server(root.path());
  let request =
    b"POST /default HTTP/1.1\r\nContent-Type: text/plain\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello";

  let first = drive(&server, request);
  let second = drive(&server, request);

  assert_eq!(header(&first, "Location"), Some(HELLO_LOCATION));
  assert_eq!(header(&second, "Location"), Some(HELLO_LOCATION));
  assert_eq!(files_under(root.path()).len(), 1);

  let statistics = server.statistics().copy_log_statistics();
  assert_eq!(statistics.post_requests, 2);
  assert_eq!(statistics.post_requests_new_file_stored, 1);
}

#[test]
fn colliding_filenames_with_different_contents_get_numbered() {
  let root = tempfile::tempdir().expect("tempdir");
  let server = test_server(root.path());

  // plant different bytes of the same length behind the canonical name
  let fan_directory = root.path().join("default/LP");
  std::fs::create_dir_all(&fan_directory).expect("creating directories");
  std::fs::write(fan_directory.join(format!("{}.txt", &HELLO_HASH[2..])), b"HELLO")
    .expect("planting the colliding file");

  let response = drive(
    &server,
    b"POST /default HTTP/1.1\r\nContent-Type: text/plain\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello",
  );

  assert!(response.starts_with("HTTP/1.1 201 Created\r\n"), "got: {}", response);
  let expected = format!("/default/LP/{}_2.txt", &HELLO_HASH[2..]);
  assert_eq!(header(&response, "Location"), Some(expected.as_str()));
  assert_eq!(files_under(root.path()).len(), 2);
}

#[test]
fn multipart_upload_with_redirect_gets_a_303() {
  let root = tempfile::tempdir().expect("tempdir");
  let server = test_server(root.path());

  let body = concat!(
    "--boundary99\r\n",
    "Content-Disposition: form-data; name=\"redirect\"\r\n",
    "\r\n",
    "1\r\n",
    "--boundary99\r\n",
    "Content-Disposition: form-data; name=\"uploaded_file\"; filename=\"hello.txt\"\r\n",
    "Content-Type: text/plain\r\n",
    "\r\n",
    "hello\r\n",
    "--boundary99--\r\n",
  );
  let request = format!(
    "POST / HTTP/1.1\r\nContent-Type: multipart/form-data; boundary=boundary99\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
    body.len(),
    body
  );

  let response = drive(&server, request.as_bytes());

  assert!(response.starts_with("HTTP/1.1 303 See Other\r\n"), "got: {}", response);
  assert_eq!(header(&response, "Location"), Some(HELLO_LOCATION));
  assert!(response.ends_with("You are being redirected\n"));
}

#[test]
fn multipart_upload_without_redirect_gets_a_201() {
  let root = tempfile::tempdir().expect("tempdir");
  let server = test_server(root.path());

  let body = concat!(
    "--b\r\n",
    "Content-Disposition: form-data; name=\"redirect\"\r\n",
    "\r\n",
    "false\r\n",
    "--b\r\n",
    "Content-Disposition: form-data; name=\"uploaded_file\"; filename=\"hello.txt\"\r\n",
    "Content-Type: text/plain\r\n",
    "\r\n",
    "hello\r\n",
    "--b--\r\n",
  );
  let request = format!(
    "POST /default HTTP/1.1\r\nContent-Type: multipart/form-data; boundary=b\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
    body.len(),
    body
  );

  let response = drive(&server, request.as_bytes());
  assert!(response.starts_with("HTTP/1.1 201 Created\r\n"), "got: {}", response);
  assert_eq!(header(&response, "Location"), Some(HELLO_LOCATION));
}

#[test]
fn gzip_encoded_uploads_store_wire_bytes_under_the_content_hash() {
  let root = tempfile::tempdir().expect("tempdir");
  let server = test_server(root.path());

  let compressed = gzip_compress(b"hello");
  let mut request = format!(
    "POST /default HTTP/1.1\r\nContent-Type: text/plain\r\nContent-Encoding: gzip\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
    compressed.len()
  )
  .into_bytes();
  request.extend_from_slice(&compressed);

  let response = drive(&server, &request);

  // named after the decompressed content, stored as the compressed bytes
  assert!(response.starts_with("HTTP/1.1 201 Created\r\n"), "got: {}", response);
  assert_eq!(header(&response, "Location"), Some(HELLO_LOCATION));

  let stored = root.path().join(format!("default/LP/{}.txt.gz", &HELLO_HASH[2..]));
  assert_eq!(std::fs::read(stored).expect("reading the stored file"), compressed);
}

#[test]
fn put_to_the_canonical_path_succeeds() {
  let root = tempfile::tempdir().expect("tempdir");
  let server = test_server(root.path());

  let request = format!(
    "PUT {} HTTP/1.1\r\nContent-Type: text/plain\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello",
    HELLO_LOCATION
  );
  let response = drive(&server, request.as_bytes());

  assert!(response.starts_with("HTTP/1.1 201 Created\r\n"), "got: {}", response);
  assert_eq!(header(&response, "Location"), Some(HELLO_LOCATION));

  let statistics = server.statistics().copy_log_statistics();
  assert_eq!(statistics.put_requests, 1);
  assert_eq!(statistics.put_requests_new_file_stored, 1);
}

#[test]
fn put_without_a_content_type_takes_the_extension_from_the_path() {
  // replication pushes don't declare a content type
  let root = tempfile::tempdir().expect("tempdir");
  let server = test_server(root.path());

  let request = format!(
    "PUT {} HTTP/1.0\r\nHost: elsewhere\r\nContent-Length: 5\r\n\r\nhello",
    HELLO_LOCATION
  );
  let response = drive(&server, request.as_bytes());

  assert!(response.starts_with("HTTP/1.0 201 Created\r\n"), "got: {}", response);
  let stored = root.path().join(format!("default/LP/{}.txt", &HELLO_HASH[2..]));
  assert!(stored.exists());
}

#[test]
fn put_to_a_non_canonical_path_is_refused_and_stores_nothing() {
  let root = tempfile::tempdir().expect("tempdir");
  let server = test_server(root.path());

  let response = drive(
    &server,
    b"PUT /default/AA/garbage HTTP/1.1\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello",
  );

  assert!(response.starts_with("HTTP/1.1 403 Forbidden\r\n"), "got: {}", response);
  assert_eq!(files_under(root.path()), Vec::<String>::new());

  let statistics = server.statistics().copy_log_statistics();
  assert_eq!(statistics.put_requests, 1);
  assert_eq!(statistics.put_requests_failed, 1);
  assert_eq!(statistics.put_requests_new_file_stored, 0);
}

#[test]
fn suspicious_post_paths_are_refused() {
  let root = tempfile::tempdir().expect("tempdir");
  let server = test_server(root.path());

  for path in ["/somewhere/../else", "relative"] {
    let request = format!(
      "POST {} HTTP/1.1\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello",
      path
    );
    let response = drive(&server, request.as_bytes());
    assert!(response.starts_with("HTTP/1.1 403 Forbidden\r\n"), "got: {}", response);
  }
}

#[test]
fn posts_to_subdirectories_normalise_the_path() {
  let root = tempfile::tempdir().expect("tempdir");
  let server = test_server(root.path());

  let response = drive(
    &server,
    b"POST //photos//thumbs/ HTTP/1.1\r\nContent-Type: text/plain\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello",
  );

  assert!(response.starts_with("HTTP/1.1 201 Created\r\n"), "got: {}", response);
  let expected = format!("/photos/thumbs/LP/{}.txt", &HELLO_HASH[2..]);
  assert_eq!(header(&response, "Location"), Some(expected.as_str()));
}

#[test]
fn uploads_without_a_known_content_type_get_no_extension() {
  let root = tempfile::tempdir().expect("tempdir");
  let server = test_server(root.path());

  let response = drive(
    &server,
    b"POST /default HTTP/1.1\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello",
  );

  assert!(response.starts_with("HTTP/1.1 201 Created\r\n"), "got: {}", response);
  let expected = format!("/default/LP/{}", &HELLO_HASH[2..]);
  assert_eq!(header(&response, "Location"), Some(expected.as_str()));
}
