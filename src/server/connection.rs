//! Per-connection task: handshake, read loop and write loop
//!
//! Each accepted socket gets:
//!
//! 1. The opening handshake and a `connection` welcome envelope
//! 2. A write loop draining the connection's outbox (and control frames)
//! 3. A read loop decoding frames and handing text payloads to the router
//! 4. Cleanup: the connection leaves every registry view in one step
//!
//! Both loops run inside the connection's own task. Gateway shutdown is
//! cooperative through a `CancellationToken`.
//!
//! Transport errors end the connection silently. Protocol errors end it with
//! a close frame carrying the matching status code.

use super::registry::{ConnectionId, SessionRegistry};
use super::router::MessageRouter;
use crate::config::GatewayConfig;
use crate::core::error::{FrameError, GatewayError};
use crate::protocol::envelope::ServerMessage;
use crate::protocol::frame::{Frame, FrameCodec, Opcode, close_code};
use crate::protocol::handshake;
use futures::SinkExt;
use futures::stream::{SplitSink, SplitStream, StreamExt};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, FramedParts};
use tokio_util::sync::CancellationToken;

/// How long the write side may keep flushing after the read side ended
const WRITE_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// What the read loop decided after one frame
enum FrameOutcome {
    Continue,
    Close,
}

/// Serves one client connection from handshake to cleanup
#[derive(Clone)]
pub struct ConnectionHandler {
    registry: Arc<SessionRegistry>,
    router: MessageRouter,
    max_frame_size: usize,
    max_handshake_bytes: usize,
    handshake_timeout: Duration,
}

impl ConnectionHandler {
    pub fn new(registry: Arc<SessionRegistry>, config: &GatewayConfig) -> Self {
        Self {
            router: MessageRouter::new(registry.clone()),
            registry,
            max_frame_size: config.max_frame_size,
            max_handshake_bytes: config.max_handshake_bytes,
            handshake_timeout: config.handshake_timeout(),
        }
    }

    /// Run the connection to completion
    ///
    /// Never returns an error: every failure is logged and ends only this
    /// connection. Cancelling `shutdown` sends a 1001 close frame, removes the
    /// connection from the registry and drops the socket.
    pub async fn run<S, P>(self, mut stream: S, peer: P, shutdown: CancellationToken)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        P: fmt::Display,
    {
        let negotiated = tokio::select! {
            _ = shutdown.cancelled() => return,
            result = handshake::negotiate(
                &mut stream,
                self.max_handshake_bytes,
                self.handshake_timeout,
            ) => result,
        };
        let leftover = match negotiated {
            Ok((request, leftover)) => {
                tracing::debug!(peer = %peer, path = %request.path, "Handshake completed");
                leftover
            }
            Err(e) => {
                log_failure(&peer, None, &e);
                return;
            }
        };

        let (connection_id, outbox) = self.registry.register().await;

        let mut parts = FramedParts::new::<Frame>(stream, FrameCodec::new(self.max_frame_size));
        parts.read_buf = leftover;
        let (mut sink, mut frames) = Framed::from_parts(parts).split();

        // Send welcome message
        let welcome = ServerMessage::welcome(connection_id.as_str());
        if let Err(e) = send_message(&mut sink, &welcome).await {
            log_failure(&peer, Some(&connection_id), &e.into());
            self.registry.unregister(&connection_id).await;
            return;
        }

        tracing::info!(connection_id = %connection_id, peer = %peer, "Client connected");

        // Both halves run inside this task, so dropping it closes the socket
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let writer = write_loop(connection_id.clone(), sink, outbox, control_rx);
        tokio::pin!(writer);

        let writer_finished = tokio::select! {
            _ = self.read_loop(&connection_id, &mut frames, &control_tx, &shutdown, &peer) => false,
            _ = &mut writer => true,
        };

        // Cleanup: leave every view first so nothing new is queued
        if let Some(removed) = self.registry.unregister(&connection_id).await {
            tracing::info!(
                connection_id = %connection_id,
                user_id = ?removed.user_id,
                projects = removed.projects.len(),
                "Client disconnected"
            );
        }
        drop(control_tx);

        if !writer_finished
            && tokio::time::timeout(WRITE_DRAIN_TIMEOUT, &mut writer)
                .await
                .is_err()
        {
            tracing::debug!(connection_id = %connection_id, "Write loop did not drain, dropping");
        }
    }

    /// Read frames until the peer leaves, a protocol error occurs or the
    /// gateway shuts down
    async fn read_loop<S, P>(
        &self,
        connection_id: &ConnectionId,
        frames: &mut FrameStream<S>,
        control_tx: &mpsc::UnboundedSender<Frame>,
        shutdown: &CancellationToken,
        peer: &P,
    ) where
        S: AsyncRead + AsyncWrite + Unpin,
        P: fmt::Display,
    {
        loop {
            let result = tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = control_tx.send(Frame::close_with_code(close_code::GOING_AWAY));
                    tracing::debug!(connection_id = %connection_id, "Gateway shutting down, closing");
                    return;
                }
                next = frames.next() => match next {
                    Some(result) => result,
                    None => return,
                },
            };

            let outcome = match result {
                Ok(frame) => self.on_frame(connection_id, frame, control_tx).await,
                Err(e) => {
                    if let Some(code) = close_code_for(&e) {
                        let _ = control_tx.send(Frame::close_with_code(code));
                    }
                    log_failure(peer, Some(connection_id), &e.into());
                    FrameOutcome::Close
                }
            };

            if let FrameOutcome::Close = outcome {
                return;
            }
        }
    }

    async fn on_frame(
        &self,
        connection_id: &ConnectionId,
        frame: Frame,
        control_tx: &mpsc::UnboundedSender<Frame>,
    ) -> FrameOutcome {
        if !frame.fin || frame.opcode == Opcode::Continuation {
            let _ = control_tx.send(Frame::close_with_code(close_code::PROTOCOL_ERROR));
            tracing::warn!(
                connection_id = %connection_id,
                error_code = FrameError::Fragmented.error_code(),
                "Fragmented message, closing"
            );
            return FrameOutcome::Close;
        }

        match frame.opcode {
            Opcode::Text => match frame.into_text() {
                Ok(text) if text.is_empty() => FrameOutcome::Continue,
                Ok(text) => {
                    self.router.handle(connection_id, &text).await;
                    FrameOutcome::Continue
                }
                Err(e) => {
                    let _ = control_tx.send(Frame::close_with_code(close_code::INVALID_PAYLOAD));
                    tracing::warn!(
                        connection_id = %connection_id,
                        error_code = e.error_code(),
                        "Invalid text frame, closing"
                    );
                    FrameOutcome::Close
                }
            },
            Opcode::Ping => {
                let _ = control_tx.send(Frame::pong(frame.payload));
                FrameOutcome::Continue
            }
            Opcode::Close => {
                tracing::debug!(
                    connection_id = %connection_id,
                    code = ?frame.close_code(),
                    "Client sent close frame"
                );
                let reply = match frame.close_code() {
                    Some(code) => Frame::close_with_code(code),
                    None => Frame::close(Vec::new()),
                };
                let _ = control_tx.send(reply);
                FrameOutcome::Close
            }
            Opcode::Pong => FrameOutcome::Continue,
            Opcode::Binary => {
                tracing::debug!(connection_id = %connection_id, "Ignoring binary frame");
                FrameOutcome::Continue
            }
            Opcode::Continuation => FrameOutcome::Close,
        }
    }
}

type FrameSink<S> = SplitSink<Framed<S, FrameCodec>, Frame>;
type FrameStream<S> = SplitStream<Framed<S, FrameCodec>>;

async fn send_message<S>(sink: &mut FrameSink<S>, message: &ServerMessage) -> Result<(), FrameError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match serde_json::to_string(message) {
        Ok(json) => sink.send(Frame::text(json)).await,
        Err(e) => {
            tracing::error!(error = %e, kind = message.kind(), "Failed to serialize ServerMessage");
            Ok(())
        }
    }
}

/// Forward queued envelopes and control frames to the socket
///
/// Control frames take priority. Ends after sending a close frame, when the
/// outbox is closed by `unregister`, or on the first write failure.
async fn write_loop<S>(
    connection_id: ConnectionId,
    mut sink: FrameSink<S>,
    mut outbox: mpsc::UnboundedReceiver<ServerMessage>,
    mut control: mpsc::UnboundedReceiver<Frame>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let result = tokio::select! {
            biased;
            Some(frame) = control.recv() => {
                let closing = frame.opcode == Opcode::Close;
                let result = sink.send(frame).await;
                if closing {
                    let _ = sink.close().await;
                    break;
                }
                result
            }
            message = outbox.recv() => match message {
                Some(message) => send_message(&mut sink, &message).await,
                None => break,
            },
        };

        if let Err(e) = result {
            tracing::debug!(
                connection_id = %connection_id,
                error = %e,
                "WebSocket write failed, closing"
            );
            break;
        }
    }
}

fn close_code_for(error: &FrameError) -> Option<u16> {
    match error {
        FrameError::Io(_) => None,
        FrameError::PayloadTooLarge { .. } => Some(close_code::MESSAGE_TOO_BIG),
        FrameError::InvalidUtf8 => Some(close_code::INVALID_PAYLOAD),
        _ => Some(close_code::PROTOCOL_ERROR),
    }
}

fn log_failure(peer: &dyn fmt::Display, connection_id: Option<&ConnectionId>, error: &GatewayError) {
    let connection_id = connection_id.map(ConnectionId::as_str).unwrap_or("-");
    if error.is_protocol_error() {
        tracing::warn!(
            peer = %peer,
            connection_id = %connection_id,
            error_code = error.error_code(),
            error = %error,
            "Protocol error, closing connection"
        );
    } else {
        tracing::debug!(
            peer = %peer,
            connection_id = %connection_id,
            error = %error,
            "Connection closed"
        );
    }
}
