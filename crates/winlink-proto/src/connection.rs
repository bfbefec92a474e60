//! Length-prefixed, authenticated message connections.
//!
//! Frames are a 4-byte big-endian length followed by a JSON [`Envelope`].
//! Outbound envelopes get a per-connection sequence number starting at 1.
//! Inbound envelopes are verified before decoding; frames that fail
//! verification are dropped, and a run of consecutive failures closes the
//! connection. Envelopes whose sequence number is not greater than the last
//! accepted one are dropped as replays.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::stream::{self, SplitSink, SplitStream};
use futures_util::{SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, warn};

use crate::auth::MessageAuthenticator;
use crate::envelope::Envelope;
use crate::error::TransportError;
use crate::message::Message;

/// Largest accepted frame.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Consecutive authentication failures tolerated before closing.
pub const DEFAULT_MAX_AUTH_FAILURES: u32 = 5;

type FramedStream<S> = Framed<S, LengthDelimitedCodec>;

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

/// A bidirectional message connection over any byte stream.
pub struct Connection<S> {
    writer: ConnectionWriter<S>,
    reader: ConnectionReader<S>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an established (typically TLS) stream.
    pub fn new(stream: S, auth: Arc<MessageAuthenticator>, peer: impl Into<String>) -> Self {
        let peer: Arc<str> = Arc::from(peer.into());
        let (sink, stream) = Framed::new(stream, codec()).split();
        Self {
            writer: ConnectionWriter {
                sink,
                auth: auth.clone(),
                next_seq: 1,
                peer: peer.clone(),
            },
            reader: ConnectionReader {
                stream,
                auth,
                last_seq: 0,
                violations: 0,
                max_auth_failures: DEFAULT_MAX_AUTH_FAILURES,
                peer,
            },
        }
    }

    /// Builder method to set the authentication-failure threshold.
    pub fn with_max_auth_failures(mut self, max: u32) -> Self {
        self.reader.max_auth_failures = max.max(1);
        self
    }

    pub fn peer(&self) -> &str {
        &self.writer.peer
    }

    pub async fn send(&mut self, message: &Message) -> Result<(), TransportError> {
        self.writer.send(message).await
    }

    pub async fn receive(&mut self) -> Result<Option<Message>, TransportError> {
        self.reader.receive().await
    }

    /// Split into independently owned halves.
    pub fn into_split(self) -> (ConnectionWriter<S>, ConnectionReader<S>) {
        (self.writer, self.reader)
    }
}

/// Sending half of a [`Connection`].
pub struct ConnectionWriter<S> {
    sink: SplitSink<FramedStream<S>, Bytes>,
    auth: Arc<MessageAuthenticator>,
    next_seq: u64,
    peer: Arc<str>,
}

impl<S> ConnectionWriter<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Sign, length-prefix and transmit a message.
    ///
    /// Fails with `Disconnected` if the peer has gone away.
    pub async fn send(&mut self, message: &Message) -> Result<(), TransportError> {
        let envelope = Envelope::seal(self.next_seq, message, &self.auth)?;
        let frame = Bytes::from(envelope.to_bytes()?);

        self.sink
            .send(frame)
            .await
            .map_err(|e| TransportError::Disconnected(format!("{}: {}", self.peer, e)))?;

        self.next_seq += 1;
        Ok(())
    }

    /// Flush and shut down the write side.
    pub async fn close(&mut self) -> Result<(), TransportError> {
        self.sink
            .close()
            .await
            .map_err(|e| TransportError::Disconnected(format!("{}: {}", self.peer, e)))
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }
}

/// Receiving half of a [`Connection`].
pub struct ConnectionReader<S> {
    stream: SplitStream<FramedStream<S>>,
    auth: Arc<MessageAuthenticator>,
    last_seq: u64,
    violations: u32,
    max_auth_failures: u32,
    peer: Arc<str>,
}

impl<S> ConnectionReader<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Next verified message in arrival order.
    ///
    /// Returns `Ok(None)` once the peer has closed the connection.
    pub async fn receive(&mut self) -> Result<Option<Message>, TransportError> {
        loop {
            let frame = match self.stream.next().await {
                None => return Ok(None),
                Some(Ok(frame)) => frame,
                Some(Err(e)) if is_disconnect(&e) => {
                    debug!(peer = %self.peer, error = %e, "Connection dropped");
                    return Ok(None);
                }
                Some(Err(e)) => return Err(TransportError::Io(e)),
            };

            let opened = Envelope::from_bytes(&frame)
                .and_then(|envelope| envelope.open(&self.auth).map(|msg| (envelope.seq, msg)));

            match opened {
                Ok((seq, message)) => {
                    self.violations = 0;
                    if seq <= self.last_seq {
                        warn!(
                            peer = %self.peer,
                            seq,
                            last_seq = self.last_seq,
                            "Dropping replayed or out-of-order envelope"
                        );
                        continue;
                    }
                    self.last_seq = seq;
                    return Ok(Some(message));
                }
                Err(rejection) => {
                    self.violations += 1;
                    warn!(
                        peer = %self.peer,
                        violations = self.violations,
                        reason = %rejection,
                        "Dropping unauthenticated frame"
                    );
                    if self.violations >= self.max_auth_failures {
                        return Err(TransportError::AuthViolations(self.violations));
                    }
                }
            }
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Lazy stream of inbound messages; ends when the connection drops or
    /// after the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<Message, TransportError>>
    where
        S: 'static,
    {
        stream::unfold(Some(self), |state| async move {
            let mut reader = state?;
            match reader.receive().await {
                Ok(Some(message)) => Some((Ok(message), Some(reader))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}

fn is_disconnect(e: &std::io::Error) -> bool {
    use std::io::ErrorKind::*;
    matches!(
        e.kind(),
        UnexpectedEof | ConnectionReset | ConnectionAborted | BrokenPipe
    )
}
