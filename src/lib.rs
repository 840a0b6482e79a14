//! Verm is a content-addressed HTTP file store. Files POSTed or PUT to it
//! are hashed, stored once under a URL derived from the hash, served back
//! with strong cache headers, and pushed asynchronously to any number of
//! peer verm instances.

pub mod decompression;
pub mod error;
pub mod mime_types;
pub mod replication;
pub mod request;
pub mod response;
pub mod serve;
pub mod server;
pub mod statistics;
pub mod stream;
pub mod upload;

pub use error::{RequestHeadParsingError, VermError, VermResult};
pub use mime_types::MimeTypes;
pub use replication::ReplicationSet;
pub use request::{HttpMethod, HttpVersion, RequestHead};
pub use response::{Response, ResponseBody, StatusCode};
pub use server::{run_acceptor, VermServer, DEFAULT_HTTP_PORT, HTTP_TIMEOUT};
pub use statistics::{LogStatistics, Statistics};
pub use stream::{ConnectionStream, IntoConnectionStream};
