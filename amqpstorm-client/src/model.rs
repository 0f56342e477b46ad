use amqpstorm_codec::frame;

/// AMQP channel number
pub type ChannelNumber = frame::Channel;
/// AMQP class id method id number
pub type ClassMethod = frame::ClassMethod;

/// Error codes in connection scope the client closes the connection with.
#[derive(Clone, Copy, Debug)]
pub enum ConnectionError {
    /// The server sent a frame which didn't fit in the normal order.
    CommandInvalid = 503,
    /// The server sent an unexpected method, content header or body frame.
    UnexpectedFrame = 505,
    /// The limits of the connection agreed during connection tune are exceeded.
    ResourceError = 506,
    /// The server asked for a not implemented funcionality.
    NotImplemented = 540,
}

impl From<ConnectionError> for u16 {
    fn from(code: ConnectionError) -> u16 {
        code as u16
    }
}

/// Reply code of a normal channel or connection close.
pub const REPLY_SUCCESS: u16 = 200;
