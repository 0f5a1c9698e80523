//! Library crate for iptv-scan-rs: range expansion, stream probing and the
//! threaded scan pipeline behind the CLI and the HTTP API.
pub mod addrlist;
pub mod config;
pub mod controller;
pub mod errors;
pub mod inspector;
pub mod pool;
pub mod probe;
pub mod server;
pub mod sink;
pub mod stats;
pub mod template;
pub mod types;
