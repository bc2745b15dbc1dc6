// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use std::io;

/// Setup failures, reported synchronously when building a channel or binding a server.
///
/// Failures of individual calls are never reported through this type; they arrive as a
/// [`CallResult`](crate::CallResult) through the result dispatcher.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The address is not of the form `host:port`.
    #[error("invalid address {0:?}: expected host:port")]
    InvalidAddress(String),
    /// Certificate or key material could not be used.
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),
    /// The listening endpoint could not be bound.
    #[error("could not bind {address}")]
    Bind {
        /// The address that was requested.
        address: String,
        /// The underlying failure.
        #[source]
        source: io::Error,
    },
    /// The I/O runtime or the polling thread could not be started.
    #[error("could not start engine threads")]
    Spawn(#[source] io::Error),
}
