//! Customized unified error type.

use std::fmt;
use std::io;
use std::net;
use std::num;
use std::string;

/// Customized error type for the metadata replication library.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct MetaError(pub String);

impl MetaError {
    /// Creates an error out of anything printable.
    pub fn msg(m: impl ToString) -> Self {
        MetaError(m.to_string())
    }
}

impl fmt::Display for MetaError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

impl std::error::Error for MetaError {}

// Helper macro for saving boiler-plate `impl From<T>`s for transparent
// conversion from various common error types to `MetaError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for MetaError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                MetaError(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(net::AddrParseError);
impl_from_error!(num::ParseIntError);
impl_from_error!(num::ParseFloatError);
impl_from_error!(string::FromUtf8Error);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(tokio::sync::mpsc::error::TryRecvError);
impl_from_error!(
    tokio::sync::watch::error::SendError<Option<tokio::time::Instant>>
);

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = MetaError("what the heck?".into());
        assert_eq!(format!("{}", e), String::from("what the heck?"));
    }

    #[test]
    fn from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "oh no!");
        let e = MetaError::from(io_error);
        assert!(e.0.contains("oh no!"));
    }
}
