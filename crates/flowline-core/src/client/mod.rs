//! Backend API client: the seam between the executor and the network.

pub mod backend;
pub mod config;
pub mod http;

pub use backend::{ByteStream, WorkflowBackend};
pub use config::ClientConfig;
pub use http::HttpBackend;
