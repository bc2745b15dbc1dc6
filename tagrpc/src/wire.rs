// Copyright 2019 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! The frames exchanged between client and server, and a length-delimited bincode
//! [`Transport`] that carries them over any `AsyncRead + AsyncWrite` stream.
//!
//! Many calls are multiplexed over one connection; every call frame names its `call_id`. A
//! unary call is `Start`, `Message`, `HalfClose` answered by `Message`, `Status`. A duplex call
//! interleaves `Message` frames in both directions until the server sends `Status`.

use crate::{completion::Completer, status::Code, status::Metadata, trace};
use bytes::Bytes;
use futures::{prelude::*, task::*};
use pin_project::pin_project;
use serde::{Deserialize, Serialize};
use std::{error::Error, io, pin::Pin, time::SystemTime};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
};
use tokio_serde::{formats::Bincode, Framed as SerdeFramed, *};
use tokio_util::{
    codec::{length_delimited::LengthDelimitedCodec, Framed},
    sync::CancellationToken,
};
use tracing::{trace, warn};

/// Frames sent from client to server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ClientFrame {
    /// Opens a call.
    Start {
        /// Identifies the call on this connection.
        call_id: u64,
        /// The full method path, e.g. `/package.Service/Method`.
        method: String,
        /// Request headers.
        metadata: Metadata,
        /// When the client gives up on the call.
        deadline: Option<SystemTime>,
        /// The client's trace context for the call.
        trace_context: trace::Context,
    },
    /// One request message.
    Message {
        /// The call the message belongs to.
        call_id: u64,
        /// The encoded message.
        payload: Bytes,
    },
    /// The client will send no more messages on the call.
    HalfClose {
        /// The call being half-closed.
        call_id: u64,
    },
    /// The client abandoned the call.
    Cancel {
        /// The call being cancelled.
        call_id: u64,
    },
    /// Keepalive probe, answered with [`ServerFrame::Pong`].
    Ping {
        /// Echoed back by the server.
        nonce: u64,
    },
}

/// Frames sent from server to client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ServerFrame {
    /// One response message.
    Message {
        /// The call the message belongs to.
        call_id: u64,
        /// The encoded message.
        payload: Bytes,
    },
    /// The final status of a call. No frames for the call follow it.
    Status {
        /// The call being finished.
        call_id: u64,
        /// The final status code.
        code: Code,
        /// The final status message.
        message: String,
        /// Trailing metadata.
        trailers: Metadata,
    },
    /// Answer to [`ClientFrame::Ping`].
    Pong {
        /// The nonce of the ping being answered.
        nonce: u64,
    },
}

/// A byte stream a [`Transport`] can run over: plain TCP or TLS.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// A boxed [`Io`].
pub type BoxIo = Box<dyn Io>;

/// The client end of a connection.
pub type ClientTransport<S = BoxIo> =
    Transport<S, ServerFrame, ClientFrame, Bincode<ServerFrame, ClientFrame>>;

/// The server end of a connection.
pub type ServerTransport<S = BoxIo> =
    Transport<S, ClientFrame, ServerFrame, Bincode<ClientFrame, ServerFrame>>;

/// A transport that serializes to, and deserializes from, a byte stream.
#[pin_project]
pub struct Transport<S, Item, SinkItem, Codec> {
    #[pin]
    inner: SerdeFramed<Framed<S, LengthDelimitedCodec>, Item, SinkItem, Codec>,
}

impl<S, Item, SinkItem, Codec> Transport<S, Item, SinkItem, Codec> {
    /// Returns the inner transport over which messages are sent and received.
    pub fn get_ref(&self) -> &S {
        self.inner.get_ref().get_ref()
    }
}

impl<S, Item, SinkItem, Codec, CodecError> Stream for Transport<S, Item, SinkItem, Codec>
where
    S: AsyncWrite + AsyncRead,
    Item: for<'a> Deserialize<'a>,
    Codec: Deserializer<Item>,
    CodecError: Into<Box<dyn std::error::Error + Send + Sync>>,
    SerdeFramed<Framed<S, LengthDelimitedCodec>, Item, SinkItem, Codec>:
        Stream<Item = Result<Item, CodecError>>,
{
    type Item = io::Result<Item>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<io::Result<Item>>> {
        self.project()
            .inner
            .poll_next(cx)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }
}

impl<S, Item, SinkItem, Codec, CodecError> Sink<SinkItem> for Transport<S, Item, SinkItem, Codec>
where
    S: AsyncWrite,
    SinkItem: Serialize,
    Codec: Serializer<SinkItem>,
    CodecError: Into<Box<dyn Error + Send + Sync>>,
    SerdeFramed<Framed<S, LengthDelimitedCodec>, Item, SinkItem, Codec>:
        Sink<SinkItem, Error = CodecError>,
{
    type Error = io::Error;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project()
            .inner
            .poll_ready(cx)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    fn start_send(self: Pin<&mut Self>, item: SinkItem) -> io::Result<()> {
        self.project()
            .inner
            .start_send(item)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project()
            .inner
            .poll_flush(cx)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project()
            .inner
            .poll_close(cx)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }
}

/// Constructs a new transport from a framed transport and a serialization codec.
pub fn new<S, Item, SinkItem, Codec>(
    framed_io: Framed<S, LengthDelimitedCodec>,
    codec: Codec,
) -> Transport<S, Item, SinkItem, Codec>
where
    S: AsyncWrite + AsyncRead,
    Item: for<'de> Deserialize<'de>,
    SinkItem: Serialize,
    Codec: Serializer<SinkItem> + Deserializer<Item>,
{
    Transport {
        inner: SerdeFramed::new(framed_io, codec),
    }
}

/// Wraps `io` in a bincode transport whose frames may be up to `max_frame_length` bytes.
pub fn bincode<S, Item, SinkItem>(
    io: S,
    max_frame_length: usize,
) -> Transport<S, Item, SinkItem, Bincode<Item, SinkItem>>
where
    S: AsyncWrite + AsyncRead,
    Item: for<'de> Deserialize<'de>,
    SinkItem: Serialize,
{
    let framed = LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_length)
        .new_framed(io);
    new(framed, Bincode::default())
}

impl<S, Item, SinkItem, Codec> From<(S, Codec)> for Transport<S, Item, SinkItem, Codec>
where
    S: AsyncWrite + AsyncRead,
    Item: for<'de> Deserialize<'de>,
    SinkItem: Serialize,
    Codec: Serializer<SinkItem> + Deserializer<Item>,
{
    fn from((io, codec): (S, Codec)) -> Self {
        new(Framed::new(io, LengthDelimitedCodec::new()), codec)
    }
}

/// A frame queued for the connection's writer, with the completion to post once it is written.
pub(crate) struct Outbound<F> {
    pub(crate) frame: F,
    pub(crate) ack: Option<Completer>,
}

impl<F> Outbound<F> {
    pub(crate) fn frame(frame: F) -> Self {
        Self { frame, ack: None }
    }

    pub(crate) fn acked(frame: F, ack: Completer) -> Self {
        Self {
            frame,
            ack: Some(ack),
        }
    }
}

/// Writes queued frames in order until the queue closes, a write fails, or `shutdown` fires.
/// Acks of frames that were never written are dropped, which fails their operations.
pub(crate) async fn write_loop<W, F>(
    mut sink: W,
    mut outbound: mpsc::UnboundedReceiver<Outbound<F>>,
    shutdown: CancellationToken,
) where
    W: Sink<F, Error = io::Error> + Unpin,
{
    loop {
        let Outbound { frame, ack } = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = outbound.recv() => match next {
                Some(outbound) => outbound,
                None => break,
            },
        };
        match sink.send(frame).await {
            Ok(()) => {
                if let Some(ack) = ack {
                    ack.complete(true);
                }
            }
            Err(e) => {
                warn!("Connection write failed: {}", e);
                break;
            }
        }
    }
    trace!("WriterClosed");
    shutdown.cancel();
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Cursor;
    use tokio::io::ReadBuf;

    fn ctx() -> Context<'static> {
        Context::from_waker(noop_waker_ref())
    }

    struct TestIo(Cursor<Vec<u8>>);

    impl AsyncRead for TestIo {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            AsyncRead::poll_read(Pin::new(&mut self.0), cx, buf)
        }
    }

    impl AsyncWrite for TestIo {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            AsyncWrite::poll_write(Pin::new(&mut self.0), cx, buf)
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            AsyncWrite::poll_flush(Pin::new(&mut self.0), cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            AsyncWrite::poll_shutdown(Pin::new(&mut self.0), cx)
        }
    }

    #[test]
    fn frames_written_by_one_side_are_read_by_the_other() {
        let frame = ClientFrame::Message {
            call_id: 7,
            payload: Bytes::from_static(b"payload"),
        };
        let mut client = Box::pin(bincode::<_, ServerFrame, ClientFrame>(
            TestIo(Cursor::new(vec![])),
            usize::MAX,
        ));
        assert_matches!(client.as_mut().poll_ready(&mut ctx()), Poll::Ready(Ok(())));
        assert_matches!(client.as_mut().start_send(frame.clone()), Ok(()));
        assert_matches!(client.as_mut().poll_flush(&mut ctx()), Poll::Ready(Ok(())));
        let written = client.get_ref().0.get_ref().clone();

        let mut server = Box::pin(bincode::<_, ClientFrame, ServerFrame>(
            TestIo(Cursor::new(written)),
            usize::MAX,
        ));
        assert_matches!(
            server.as_mut().poll_next(&mut ctx()),
            Poll::Ready(Some(Ok(ref f))) if *f == frame
        );
        assert_matches!(server.as_mut().poll_next(&mut ctx()), Poll::Ready(None));
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let status = ServerFrame::Status {
            call_id: 1,
            code: Code::Ok,
            message: "x".repeat(64),
            trailers: Metadata::default(),
        };
        let mut writer = Box::pin(bincode::<_, ClientFrame, ServerFrame>(
            TestIo(Cursor::new(vec![])),
            usize::MAX,
        ));
        assert_matches!(writer.as_mut().start_send(status), Ok(()));
        assert_matches!(writer.as_mut().poll_flush(&mut ctx()), Poll::Ready(Ok(())));
        let written = writer.get_ref().0.get_ref().clone();

        let mut reader = Box::pin(bincode::<_, ServerFrame, ClientFrame>(
            TestIo(Cursor::new(written)),
            16,
        ));
        assert_matches!(reader.as_mut().poll_next(&mut ctx()), Poll::Ready(Some(Err(_))));
    }
}
