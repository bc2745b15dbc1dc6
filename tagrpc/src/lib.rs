// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! tagrpc is an RPC engine built around completion queues.
//!
//! Every call in flight is an [`Operation`](completion::Operation) owned by a
//! [`CompletionQueue`](completion::CompletionQueue). When a step of the call finishes, its
//! completion is posted to the queue under the operation's [`Tag`](completion::Tag), and a single
//! polling thread per channel or server hands the event back to the operation, which advances its
//! state machine and, if it has more to do, registers itself again. Connection I/O happens on a
//! small tokio runtime owned by the same channel or server, so application threads never block.
//!
//! On top of this the crate provides:
//! - A schema-agnostic server, [`ServerEngine`], that routes inbound calls to
//!   [handlers](server::Handler) by method name and always keeps an accept outstanding.
//! - [Unary calls](ClientChannel::unary): one request, one response.
//! - [Duplex calls](ClientChannel::duplex): independent read and write loops, fed by a
//!   [`StreamContext`](client::StreamContext) the application writes to from any thread.
//!
//! Results are never returned to the caller directly. Each call delivers exactly one
//! [`CallResult`] through the channel's [`ResultDispatcher`](dispatch::ResultDispatcher), which
//! decides what thread the application's callbacks run on.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::{mpsc, Arc};
//! use tagrpc::{
//!     bytes::Bytes,
//!     client::{self, ClientChannel},
//!     server::{self, ServerEngine, ServiceError, ServiceRegistry},
//!     ClientCredentials, Context, ServerCredentials,
//! };
//!
//! fn main() -> Result<(), tagrpc::Error> {
//!     let registry = Arc::new(ServiceRegistry::new());
//!     registry.register("hello.World", |_: &str, name: Bytes| -> Result<Bytes, ServiceError> {
//!         let name = String::from_utf8_lossy(&name);
//!         Ok(Bytes::from(format!("Hello, {name}!")))
//!     });
//!     let server = ServerEngine::bind(
//!         "127.0.0.1:0",
//!         ServerCredentials::Insecure,
//!         server::Config::default(),
//!     )?;
//!     server.start_dispatch_loop(registry);
//!
//!     let channel = ClientChannel::connect(
//!         server.local_addr().to_string(),
//!         ClientCredentials::Insecure,
//!         client::Config::default(),
//!     )?;
//!     let (tx, rx) = mpsc::channel();
//!     let request = "world".to_string();
//!     channel.unary(
//!         "/hello.World/Hello",
//!         Context::default(),
//!         &request,
//!         move |result, reply: Option<String>| {
//!             let _ = tx.send((result, reply));
//!         },
//!     );
//!     let (result, reply) = rx.recv().expect("the result is always delivered");
//!     assert!(result.succeeded);
//!     assert_eq!(reply.as_deref(), Some("Hello, world!"));
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![allow(clippy::type_complexity)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod client;
pub mod completion;
pub mod context;
pub mod dispatch;
mod error;
pub mod hub;
pub mod interceptor;
pub mod message;
pub mod server;
pub mod status;
pub mod tls;
pub mod trace;
mod util;
pub mod wire;
pub mod worker;

pub use bytes;

pub use crate::{
    client::ClientChannel,
    context::Context,
    error::Error,
    hub::Hub,
    message::Message,
    server::ServerEngine,
    status::{CallResult, Code, Metadata, Status},
    tls::{ClientCredentials, ServerCredentials},
    util::TimeUntil,
};
