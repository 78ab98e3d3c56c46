// fb-core: the pure parts of the gateway.
//
// Subject matching, frame validation, rate limiting, token verification and
// configuration loading.  Nothing in this crate does I/O except the config
// loader reading its TOML file.

pub mod auth;
pub mod config;
pub mod limiter;
pub mod subject;
pub mod validate;
