//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod error;
mod location;
mod safetcp;
mod timer;

pub use error::MetaError;
pub use location::ServerLocation;
pub use timer::Timer;

pub(crate) use safetcp::{
    safe_tcp_read, safe_tcp_write, tcp_bind_with_retry, tcp_connect_with_retry,
};
