//! CLI library: the HTTP client used by the `sitekb` binary.

pub mod api_client;
