//! conn-dispatch: a line-echo TCP server with pluggable dispatch
//!
//! Each connection sends one line and receives it back with a timestamp.
//! How connections reach the handler is selected at startup:
//! - `sequential`: handled inline on the accepting thread
//! - `thread-per-task`: one new thread per connection
//! - `pooled`: a fixed worker pool fed from a queue
//!
//! Configuration via CLI arguments or TOML file.

pub mod config;
pub mod connection;
pub mod dispatch;
pub mod handler;
pub mod server;
