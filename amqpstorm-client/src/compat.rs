//! Normalization of byte strings coming from the wire or from the caller.

/// Result of [`try_utf8_decode`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Utf8Decoded {
    Text(String),
    /// The bytes were not valid UTF-8, they are returned unchanged.
    Bytes(Vec<u8>),
}

impl Utf8Decoded {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Utf8Decoded::Text(s) => Some(s),
            Utf8Decoded::Bytes(_) => None,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Utf8Decoded::Text(s) => s.into_bytes(),
            Utf8Decoded::Bytes(b) => b,
        }
    }
}

/// Decode the value as UTF-8 text if it is valid UTF-8, otherwise give back the original bytes.
///
/// It never fails.
///
/// ```
/// use amqpstorm_client::{try_utf8_decode, Utf8Decoded};
///
/// assert_eq!(try_utf8_decode("héllo"), Utf8Decoded::Text("héllo".to_string()));
/// assert_eq!(try_utf8_decode(vec![0xC3, 0x28]), Utf8Decoded::Bytes(vec![0xC3, 0x28]));
/// ```
pub fn try_utf8_decode<T: Into<Vec<u8>>>(value: T) -> Utf8Decoded {
    match String::from_utf8(value.into()) {
        Ok(s) => Utf8Decoded::Text(s),
        Err(e) => Utf8Decoded::Bytes(e.into_bytes()),
    }
}
