pub mod broadcast;
pub mod config;
pub mod error;
pub mod framing;
pub mod history;
pub mod http;
pub mod ingest;
pub mod metric;
pub mod pipeline;
pub mod source;
pub mod store;
