use libflate::gzip;
use std::io::Write;
use std::path::Path;
use verm::{MimeTypes, ReplicationSet, VermServer};

use mock_stream::MockStream;

const HELLO_HASH: &str = "LPJNul-wow4m6DsqxbninhsWHlwfp0JecwQzYpOLmCQ";

fn test_server(root: &Path) -> VermServer {
  VermServer::new(root.to_path_buf(), MimeTypes::builtin(), ReplicationSet::new())
    .expect("building the server")
}

fn drive(server: &VermServer, request: &[u8]) -> Vec<u8> {
  let stream = MockStream::with_slice(request);
  server.handle_connection(stream.clone()).expect("handling the connection");
  stream.copy_written_data()
}

fn drive_to_string(server: &VermServer, request: &[u8]) -> String {
  String::from_utf8_lossy(&drive(server, request)).to_string()
}

fn header<'a>(response: &'a str, name: &str) -> Option<&'a str> {
  let (head, _body) = response.split_once("\r\n\r\n").expect("malformed response");
  head.lines().find_map(|line| {
    let (header_name, value) = line.split_once(':')?;
    header_name.eq_ignore_ascii_case(name).then(|| value.trim())
  })
}

fn body(response: &[u8]) -> &[u8] {
  let separator = response.windows(4).position(|w| w == b"\r\n\r\n").expect("malformed response");
  &response[separator + 4..]
}

fn store_hello(server: &VermServer) -> String {
  let response = drive_to_string(
    server,
    b"POST /default HTTP/1.1\r\nContent-Type: text/plain\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello",
  );
  assert!(response.starts_with("HTTP/1.1 201 Created\r\n"), "got: {}", response);
  header(&response, "Location").expect("no location header").to_string()
}

fn gzip_compress(data: &[u8]) -> Vec<u8> {
  let mut encoder = gzip::Encoder::new(Vec::new()).expect("building the encoder");
  encoder.write_all(data).expect("compressing");
  encoder.finish().into_result().expect("compressing")
}

#[test]
fn the_root_serves_the_upload_form() {
  let root = tempfile::tempdir().expect("tempdir");
  let server = test_server(root.path());

  let response = drive_to_string(&server, b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n");

  assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "got: {}", response);
  assert_eq!(header(&response, "Content-Type"), Some("text/html"));
  assert!(response.contains("<form method='post' enctype='multipart/form-data'>"));
}

#[test]
fn directories_serve_the_upload_form() {
  let root = tempfile::tempdir().expect("tempdir");
  let server = test_server(root.path());
  store_hello(&server);

  let response = drive_to_string(&server, b"GET /default HTTP/1.1\r\nConnection: close\r\n\r\n");
  assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "got: {}", response);
  assert!(response.contains("<form"));
}

#[test]
fn missing_files_get_the_404_page() {
  let root = tempfile::tempdir().expect("tempdir");
  let server = test_server(root.path());

  let response =
    drive_to_string(&server, b"GET /default/no/such-file HTTP/1.1\r\nConnection: close\r\n\r\n");

  assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"), "got: {}", response);
  assert!(response.contains("File not found"));

  let statistics = server.statistics().copy_log_statistics();
  assert_eq!(statistics.get_requests, 1);
  assert_eq!(statistics.get_requests_not_found, 1);
}

#[test]
fn dotdot_paths_are_not_resolved() {
  let root = tempfile::tempdir().expect("tempdir");
  let server = test_server(root.path());

  let response =
    drive_to_string(&server, b"GET /../etc/passwd HTTP/1.1\r\nConnection: close\r\n\r\n");
  assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"), "got: {}", response);
}

#[test]
fn stored_files_come_back_with_cache_headers() {
  let root = tempfile::tempdir().expect("tempdir");
  let server = test_server(root.path());
  let location = store_hello(&server);

  let request = format!("GET {} HTTP/1.1\r\nConnection: close\r\n\r\n", location);
  let response = drive_to_string(&server, request.as_bytes());

  assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "got: {}", response);
  assert_eq!(header(&response, "Content-Length"), Some("5"));
  assert_eq!(header(&response, "Content-Type"), Some("text/plain"));
  assert_eq!(header(&response, "ETag"), Some(location.trim_start_matches('/')));
  assert_eq!(header(&response, "Expires"), Some("Tue, 19 Jan 2038 00:00:00"));
  let last_modified = header(&response, "Last-Modified").expect("no last-modified header");
  assert!(last_modified.ends_with(" GMT"), "got: {}", last_modified);
  assert!(response.ends_with("hello"));
}

#[test]
fn if_none_match_on_the_etag_returns_304() {
  let root = tempfile::tempdir().expect("tempdir");
  let server = test_server(root.path());
  let location = store_hello(&server);
  let etag = location.trim_start_matches('/').to_string();

  let request = format!(
    "GET {} HTTP/1.1\r\nIf-None-Match: {}\r\nConnection: close\r\n\r\n",
    location, etag
  );
  let response = drive_to_string(&server, request.as_bytes());

  assert!(response.starts_with("HTTP/1.1 304 Not Modified\r\n"), "got: {}", response);
  assert_eq!(header(&response, "ETag"), Some(etag.as_str()));
  assert_eq!(header(&response, "Content-Length"), Some("0"));
  assert!(response.ends_with("\r\n\r\n"));
}

#[test]
fn head_gets_the_same_headers_and_no_body() {
  let root = tempfile::tempdir().expect("tempdir");
  let server = test_server(root.path());
  let location = store_hello(&server);

  let request = format!("HEAD {} HTTP/1.1\r\nConnection: close\r\n\r\n", location);
  let response = drive_to_string(&server, request.as_bytes());

  assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "got: {}", response);
  assert_eq!(header(&response, "Content-Length"), Some("5"));
  assert_eq!(header(&response, "Content-Type"), Some("text/plain"));
  assert!(response.ends_with("\r\n\r\n"), "expected an empty body, got: {}", response);
}

#[test]
fn compressed_twins_are_served_as_gzip_to_accepting_clients() {
  let root = tempfile::tempdir().expect("tempdir");
  let server = test_server(root.path());

  let compressed = gzip_compress(b"hello");
  let mut request = format!(
    "POST /default HTTP/1.1\r\nContent-Type: text/plain\r\nContent-Encoding: gzip\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
    compressed.len()
  )
  .into_bytes();
  request.extend_from_slice(&compressed);
  let upload_response = drive_to_string(&server, &request);
  let location = header(&upload_response, "Location").expect("no location header").to_string();

  // no Accept-Encoding header means gzip is acceptable
  let request = format!("GET {} HTTP/1.1\r\nConnection: close\r\n\r\n", location);
  let response = drive(&server, request.as_bytes());
  let text = String::from_utf8_lossy(&response).to_string();

  assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "got: {}", text);
  assert_eq!(header(&text, "Content-Encoding"), Some("gzip"));
  assert_eq!(header(&text, "Content-Length"), Some(&*compressed.len().to_string()));
  assert_eq!(body(&response), compressed.as_slice());
}

#[test]
fn compressed_twins_are_decoded_for_clients_that_refuse_gzip() {
  let root = tempfile::tempdir().expect("tempdir");
  let server = test_server(root.path());

  let compressed = gzip_compress(b"hello");
  let mut request = format!(
    "POST /default HTTP/1.1\r\nContent-Type: text/plain\r\nContent-Encoding: gzip\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
    compressed.len()
  )
  .into_bytes();
  request.extend_from_slice(&compressed);
  let upload_response = drive_to_string(&server, &request);
  let location = header(&upload_response, "Location").expect("no location header").to_string();

  let request = format!(
    "GET {} HTTP/1.1\r\nAccept-Encoding: identity\r\nConnection: close\r\n\r\n",
    location
  );
  let response = drive_to_string(&server, request.as_bytes());

  assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "got: {}", response);
  assert_eq!(header(&response, "Content-Encoding"), None);
  // the gzip trailer's ISIZE field drives the content length
  assert_eq!(header(&response, "Content-Length"), Some("5"));
  assert_eq!(header(&response, "Content-Type"), Some("text/plain"));
  assert!(response.ends_with("hello"));
}

#[test]
fn asking_for_the_gz_twin_directly_serves_it_plain() {
  let root = tempfile::tempdir().expect("tempdir");
  let server = test_server(root.path());

  let compressed = gzip_compress(b"hello");
  let mut request = format!(
    "POST /default HTTP/1.1\r\nContent-Type: text/plain\r\nContent-Encoding: gzip\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
    compressed.len()
  )
  .into_bytes();
  request.extend_from_slice(&compressed);
  let upload_response = drive_to_string(&server, &request);
  let location = header(&upload_response, "Location").expect("no location header").to_string();

  let request = format!("GET {}.gz HTTP/1.1\r\nConnection: close\r\n\r\n", location);
  let response = drive(&server, request.as_bytes());
  let text = String::from_utf8_lossy(&response).to_string();

  assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "got: {}", text);
  // the client asked for the .gz itself, so it's just a file
  assert_eq!(header(&text, "Content-Encoding"), None);
  assert_eq!(body(&response), compressed.as_slice());
}

#[test]
fn statistics_report_lists_every_counter() {
  let root = tempfile::tempdir().expect("tempdir");
  let server = test_server(root.path());
  let location = store_hello(&server);

  let request = format!("GET {} HTTP/1.1\r\nConnection: close\r\n\r\n", location);
  drive(&server, request.as_bytes());

  let response =
    drive_to_string(&server, b"GET /_statistics HTTP/1.1\r\nConnection: close\r\n\r\n");

  assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "got: {}", response);
  assert_eq!(header(&response, "Content-Type"), Some("text/plain"));
  let report = response.split_once("\r\n\r\n").expect("malformed response").1;
  assert!(report.contains("get_requests 1\n"), "got: {}", report);
  assert!(report.contains("post_requests 1\n"), "got: {}", report);
  assert!(report.contains("post_requests_new_file_stored 1\n"), "got: {}", report);
  assert!(report.contains("replication_push_attempts 0\n"), "got: {}", report);
  assert!(report.contains("connections_current 0\n"), "got: {}", report);
}

#[test]
fn unknown_methods_get_a_404() {
  let root = tempfile::tempdir().expect("tempdir");
  let server = test_server(root.path());

  let response = drive_to_string(&server, b"DELETE /default HTTP/1.1\r\nConnection: close\r\n\r\n");
  assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"), "got: {}", response);
}

#[test]
fn keep_alive_serves_sequential_requests() {
  let root = tempfile::tempdir().expect("tempdir");
  let server = test_server(root.path());
  let location = store_hello(&server);

  let request = format!(
    "GET {} HTTP/1.1\r\n\r\nGET {} HTTP/1.1\r\nConnection: close\r\n\r\n",
    location, location
  );
  let response = drive_to_string(&server, request.as_bytes());

  assert_eq!(response.matches("HTTP/1.1 200 OK\r\n").count(), 2, "got: {}", response);
  assert!(response.contains("Connection: Keep-Alive"));
  assert!(response.contains("Connection: Close"));
}
