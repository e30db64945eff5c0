//! PV layer error types.

use thiserror::Error;

/// Errors raised while decoding or routing channel writes.
#[derive(Debug, Error, PartialEq)]
pub enum PvError {
    #[error("unknown channel: {channel}")]
    UnknownChannel { channel: String },

    #[error("channel is read-only: {channel}")]
    ReadOnly { channel: String },

    #[error("bad value for {channel}: expected {expected}")]
    BadValue {
        channel: String,
        expected: &'static str,
    },
}
