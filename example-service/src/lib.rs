// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use tagrpc::{bytes::Bytes, server::ServiceError};
use tracing_subscriber::{fmt::format::FmtSpan, prelude::*};

/// The service the greeter is registered under.
pub const SERVICE: &str = "hello.World";

/// Returns a greeting for the name in the request.
pub const HELLO: &str = "/hello.World/Hello";

/// Serves [`HELLO`]. Requests and responses are UTF-8 strings.
pub fn hello(method: &str, request: Bytes) -> Result<Bytes, ServiceError> {
    if method != HELLO {
        return Err(ServiceError::new(format!("{method} is not a greeting")));
    }
    let name = std::str::from_utf8(&request)
        .map_err(|_| ServiceError::new("name is not UTF-8"))?;
    if name.is_empty() {
        return Err(ServiceError::new("name is empty"));
    }
    Ok(Bytes::from(format!("Hello, {name}!")))
}

/// Initializes a tracing subscriber that logs span entry and exit, filtered by `RUST_LOG`.
pub fn init_tracing() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_span_events(FmtSpan::NEW | FmtSpan::CLOSE))
        .try_init()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greets_by_name() {
        assert_eq!(hello(HELLO, Bytes::from("Ada")), Ok(Bytes::from("Hello, Ada!")));
    }

    #[test]
    fn refuses_empty_names_and_other_methods() {
        assert_eq!(
            hello(HELLO, Bytes::new()),
            Err(ServiceError::new("name is empty"))
        );
        assert!(hello("/hello.World/Goodbye", Bytes::from("Ada")).is_err());
    }
}
