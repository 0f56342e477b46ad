//! Data structures and converter functions for dealing with AMQP 0-9-1 frames.
//!
//! All the data types are in the `frame` module, the `codec` implements
//! the encoding and the decoding.
pub mod codec;
pub mod frame;


#[macro_use]
extern crate bitflags;

use std::fmt;

/// Reply code for malformed frames (bad header, size or end marker).
pub const FRAME_ERROR: u16 = 501;
/// Reply code for frames containing illegal field values.
pub const SYNTAX_ERROR: u16 = 502;
/// Reply code for unknown class or method ids.
pub const COMMAND_INVALID: u16 = 503;
/// Errors of the underlying transport don't have an AMQP reply code.
pub const TRANSPORT_ERROR: u16 = 0;

/// Type alias for a simplified Result with `FrameError`.
pub type Result<T> = std::result::Result<T, FrameError>;

/// Error struct used by the crate.
#[derive(Debug)]
pub struct FrameError {
    pub code: u16,
    pub message: String,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for FrameError {}

impl From<std::io::Error> for FrameError {
    fn from(err: std::io::Error) -> Self {
        FrameError {
            code: TRANSPORT_ERROR,
            message: err.to_string(),
        }
    }
}

/// Shorthand for making errors with error code and error message.
///
/// ```no_run
/// use amqpstorm_codec::{frame_error, FrameError, SYNTAX_ERROR};
/// use amqpstorm_codec::frame::AMQPFieldValue;
///
/// fn as_string(val: AMQPFieldValue) -> Result<String, FrameError> {
///     if let AMQPFieldValue::LongString(s) = val {
///         return Ok(s)
///     }
///
///     frame_error!(SYNTAX_ERROR, "Value cannot be converted to string")
/// }
/// ```
#[macro_export]
macro_rules! frame_error {
    ($code:expr, $message:expr) => {
        ::std::result::Result::Err($crate::FrameError {
            code: $code,
            message: ::std::string::String::from($message),
        })
    };
}
