// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use bytes::Bytes;

/// The serialize/parse contract between the engine and typed request/response bodies.
///
/// The engine itself only moves opaque bytes; schema-specific encodings implement this trait.
pub trait Message: Sized + Send + 'static {
    /// Serializes the message.
    fn encode(&self) -> Bytes;

    /// Parses a message. Fails if `buf` does not hold a valid encoding.
    fn decode(buf: &[u8]) -> Result<Self, DecodeError>;
}

/// A payload could not be parsed into the expected message type.
#[derive(Debug, thiserror::Error)]
#[error("failed to decode {type_name}: {reason}")]
pub struct DecodeError {
    type_name: &'static str,
    reason: String,
}

impl DecodeError {
    /// Creates an error for a payload that could not be parsed as `T`.
    pub fn new<T>(reason: impl ToString) -> Self {
        Self {
            type_name: std::any::type_name::<T>(),
            reason: reason.to_string(),
        }
    }
}

impl Message for Bytes {
    fn encode(&self) -> Bytes {
        self.clone()
    }

    fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        Ok(Bytes::copy_from_slice(buf))
    }
}

impl Message for Vec<u8> {
    fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(self)
    }

    fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        Ok(buf.to_vec())
    }
}

/// UTF-8 text. Payloads that are not valid UTF-8 fail to decode.
impl Message for String {
    fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }

    fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        std::str::from_utf8(buf)
            .map(str::to_owned)
            .map_err(|e| DecodeError::new::<String>(e))
    }
}

#[test]
fn invalid_utf8_is_rejected() {
    assert_eq!(String::decode(b"hello").unwrap(), "hello");
    let err = String::decode(&[0xff, 0xfe]).unwrap_err();
    assert!(err.to_string().contains("String"), "{err}");
}
