use crate::model;
use amqpstorm_codec::{FrameError, TRANSPORT_ERROR};
use std::fmt;

/// Category of a client error, callers can branch on it after downcasting the `anyhow::Error`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed frame received or a frame which cannot be encoded.
    Framing,
    /// The peer sent something which doesn't fit the protocol state.
    ProtocolViolation,
    /// The channel was closed, the reply code and text are the peer's ones if it closed it.
    ChannelClosed,
    /// The peer was silent longer than twice the heartbeat interval.
    HeartbeatTimeout,
    /// The broker closed the connection.
    ConnectionForced,
    /// A synchronous call didn't get its response in time.
    Timeout,
    /// The connection is already torn down.
    ConnectionClosed,
    /// Invalid connection parameters.
    Configuration,
    /// Transport error.
    Io,
}

/// Represents a connection or channel error. If `channel` is `None` it is a
/// connection error.
#[derive(Clone, Debug)]
pub struct ClientError {
    pub kind: ErrorKind,
    pub channel: Option<model::ChannelNumber>,
    pub code: u16,
    pub message: String,
    pub class_method: model::ClassMethod,
}

impl ClientError {
    pub fn new(kind: ErrorKind, code: u16, message: &str) -> Self {
        ClientError {
            kind,
            channel: None,
            code,
            message: message.to_string(),
            class_method: 0,
        }
    }

    /// The same error reported on a specific channel.
    pub fn on_channel(mut self, channel: model::ChannelNumber) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Error kind of an `anyhow::Error` if it was made by this crate.
    pub fn kind_of(err: &anyhow::Error) -> Option<ErrorKind> {
        err.downcast_ref::<ClientError>().map(|e| e.kind)
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientError")
            .field("kind", &self.kind)
            .field("channel", &self.channel)
            .field("code", &self.code)
            .field("message", &self.message)
            .field("class_method", &format!("{:08X}", &self.class_method))
            .finish()
    }
}

impl std::error::Error for ClientError {}

impl From<FrameError> for ClientError {
    fn from(err: FrameError) -> Self {
        let kind = if err.code == TRANSPORT_ERROR {
            ErrorKind::Io
        } else {
            ErrorKind::Framing
        };

        ClientError::new(kind, err.code, &err.message)
    }
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        ClientError::new(ErrorKind::Io, TRANSPORT_ERROR, &err.to_string())
    }
}

/// Shorthand for creating errors in async functions.
#[macro_export]
macro_rules! client_error {
    ($kind:expr, $channel:expr, $code:expr, $message:expr, $cm:expr) => {
        ::std::result::Result::Err(anyhow::Error::new($crate::ClientError {
            kind: $kind,
            channel: $channel,
            code: $code,
            message: ::std::string::String::from($message),
            class_method: $cm,
        }))
    };
}
