// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Call outcomes: canonical status codes, metadata, and the terminal [`CallResult`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// The canonical RPC status codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum Code {
    /// Not an error; returned on success.
    Ok = 0,
    /// The operation was cancelled, typically by the caller.
    Cancelled = 1,
    /// Unknown error.
    Unknown = 2,
    /// The client specified an invalid argument.
    InvalidArgument = 3,
    /// The deadline expired before the operation could complete.
    DeadlineExceeded = 4,
    /// Some requested entity was not found.
    NotFound = 5,
    /// The entity that a client attempted to create already exists.
    AlreadyExists = 6,
    /// The caller does not have permission to execute the operation.
    PermissionDenied = 7,
    /// Some resource has been exhausted.
    ResourceExhausted = 8,
    /// The system is not in a state required for the operation's execution.
    FailedPrecondition = 9,
    /// The operation was aborted.
    Aborted = 10,
    /// The operation was attempted past the valid range.
    OutOfRange = 11,
    /// The operation is not implemented or not supported.
    Unimplemented = 12,
    /// Internal error.
    Internal = 13,
    /// The service is currently unavailable.
    Unavailable = 14,
    /// Unrecoverable data loss or corruption.
    DataLoss = 15,
    /// The request does not have valid authentication credentials.
    Unauthenticated = 16,
}

impl Code {
    /// Every code, in numeric order.
    pub const ALL: [Code; 17] = [
        Code::Ok,
        Code::Cancelled,
        Code::Unknown,
        Code::InvalidArgument,
        Code::DeadlineExceeded,
        Code::NotFound,
        Code::AlreadyExists,
        Code::PermissionDenied,
        Code::ResourceExhausted,
        Code::FailedPrecondition,
        Code::Aborted,
        Code::OutOfRange,
        Code::Unimplemented,
        Code::Internal,
        Code::Unavailable,
        Code::DataLoss,
        Code::Unauthenticated,
    ];

    /// Maps a numeric code to a [`Code`]. Values outside the canonical range map to
    /// [`Code::Unknown`].
    pub fn from_i32(value: i32) -> Code {
        usize::try_from(value)
            .ok()
            .and_then(|i| Code::ALL.get(i).copied())
            .unwrap_or(Code::Unknown)
    }

    /// The upper snake case name of the code, e.g. `DEADLINE_EXCEEDED`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Code::Ok => "OK",
            Code::Cancelled => "CANCELLED",
            Code::Unknown => "UNKNOWN",
            Code::InvalidArgument => "INVALID_ARGUMENT",
            Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Code::NotFound => "NOT_FOUND",
            Code::AlreadyExists => "ALREADY_EXISTS",
            Code::PermissionDenied => "PERMISSION_DENIED",
            Code::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Code::FailedPrecondition => "FAILED_PRECONDITION",
            Code::Aborted => "ABORTED",
            Code::OutOfRange => "OUT_OF_RANGE",
            Code::Unimplemented => "UNIMPLEMENTED",
            Code::Internal => "INTERNAL",
            Code::Unavailable => "UNAVAILABLE",
            Code::DataLoss => "DATA_LOSS",
            Code::Unauthenticated => "UNAUTHENTICATED",
        }
    }
}

impl From<Code> for i32 {
    fn from(code: Code) -> i32 {
        code as i32
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A status code paired with a human-readable message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    /// The status code.
    pub code: Code,
    /// Describes the status; empty for most successful calls.
    pub message: String,
}

impl Status {
    /// Constructs a new status.
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// A successful status with an empty message.
    pub fn ok() -> Self {
        Self::new(Code::Ok, "")
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

/// String-keyed call metadata. Keys may repeat; entries keep the order they were added in.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata(Vec<(String, String)>);

impl Metadata {
    /// An empty metadata list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.push((key.into(), value.into()));
    }

    /// Returns the first value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Iterates entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// The number of entries, counting repeated keys.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for Metadata
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// The terminal outcome of a call, created once and handed to the application.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallResult {
    /// The final status code.
    pub status_code: Code,
    /// The final status message.
    pub status_message: String,
    /// True iff `status_code` is [`Code::Ok`].
    pub succeeded: bool,
    /// Trailers sent by the server along with the final status.
    pub trailing_metadata: Metadata,
}

impl CallResult {
    /// Builds a result from a final status and its trailers.
    pub fn new(status: Status, trailing_metadata: Metadata) -> Self {
        Self {
            succeeded: status.code == Code::Ok,
            status_code: status.code,
            status_message: status.message,
            trailing_metadata,
        }
    }

    /// A result with the given code and message and no trailers.
    pub fn from_code(code: Code, message: impl Into<String>) -> Self {
        Self::new(Status::new(code, message), Metadata::default())
    }

    /// The final status as a [`Status`].
    pub fn status(&self) -> Status {
        Status::new(self.status_code, self.status_message.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip_through_i32() {
        for code in Code::ALL {
            assert_eq!(Code::from_i32(i32::from(code)), code);
        }
        assert_eq!(Code::from_i32(17), Code::Unknown);
        assert_eq!(Code::from_i32(-1), Code::Unknown);
    }

    #[test]
    fn only_ok_succeeds() {
        for code in Code::ALL {
            let result = CallResult::from_code(code, "");
            assert_eq!(result.succeeded, code == Code::Ok, "{code}");
        }
    }

    #[test]
    fn metadata_keeps_duplicates_in_order() {
        let mut md = Metadata::new();
        md.insert("k", "1");
        md.insert("other", "x");
        md.insert("k", "2");
        assert_eq!(md.get("k"), Some("1"));
        assert_eq!(
            md.iter().filter(|(k, _)| *k == "k").map(|(_, v)| v).collect::<Vec<_>>(),
            vec!["1", "2"]
        );
        assert_eq!(md.len(), 3);
    }

    #[test]
    fn status_display() {
        assert_eq!(Status::ok().to_string(), "OK");
        assert_eq!(
            Status::new(Code::Aborted, "X").to_string(),
            "ABORTED: X"
        );
    }
}
