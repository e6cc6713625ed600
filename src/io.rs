//! Async drivers binding a [`Connection`] to a live transport.
//!
//! Each driver is the connection's I/O task: the only code that touches the
//! socket. It flushes what the handler wrote, reports completed sends back as
//! [`ConnEvent::Sent`], and turns poll requests into [`ConnEvent::Poll`].
//! Dropping a driver mid-transfer drops the connection, which delivers
//! [`ConnEvent::Close`] to the handler.

use std::convert::Infallible;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use bytes::{Bytes, BytesMut};
use futures::{SinkExt, Stream, StreamExt};
use tokio::sync::watch;

use crate::connection::{ConnEvent, Connection};

/// HTTP response body fed by `conn`'s handler.
///
/// A chunk counts as sent once the body consumer asks for the next one. The
/// stream ends when the handler finishes and its last chunk is out.
pub fn body_stream(conn: Connection) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    futures::stream::unfold((conn, 0usize), |(mut conn, in_flight)| async move {
        if in_flight > 0 {
            conn.dispatch(ConnEvent::Sent(in_flight));
        }
        loop {
            if let Some(chunk) = conn.take_outbound() {
                let n = chunk.data.len();
                return Some((Ok(chunk.data), (conn, n)));
            }
            if !conn.has_handler() {
                tracing::trace!(conn = %conn.id(), "response body complete");
                return None;
            }
            let poll = conn.poll_handle();
            poll.polled().await;
            conn.dispatch(ConnEvent::Poll);
        }
    })
}

/// Run the WebSocket I/O loop for `conn` until either side closes or the
/// server shuts down.
///
/// Chunks are reassembled into one text message per payload. Non-final
/// chunks are acknowledged once buffered, the final chunk once the message
/// has been handed to the socket.
pub async fn run_websocket(socket: WebSocket, mut conn: Connection, mut shutdown: watch::Receiver<bool>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let poll = conn.poll_handle();
    let mut message = BytesMut::new();

    'outer: loop {
        while let Some(chunk) = conn.take_outbound() {
            let n = chunk.data.len();
            message.extend_from_slice(&chunk.data);
            if chunk.fin {
                let payload = message.split().freeze();
                let msg = match String::from_utf8(payload.to_vec()) {
                    Ok(text) => Message::Text(text.into()),
                    Err(_) => Message::Binary(payload),
                };
                if ws_tx.send(msg).await.is_err() {
                    tracing::debug!(conn = %conn.id(), "websocket send failed");
                    break 'outer;
                }
            }
            conn.dispatch(ConnEvent::Sent(n));
        }
        if !conn.has_handler() {
            tracing::debug!(conn = %conn.id(), "websocket handler finished, closing");
            let _ = ws_tx.send(close_frame("client released")).await;
            let _ = ws_tx.flush().await;
            break;
        }

        tokio::select! {
            _ = poll.polled() => {
                conn.dispatch(ConnEvent::Poll);
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        conn.dispatch(ConnEvent::Recv(Bytes::copy_from_slice(text.as_bytes())));
                    }
                    Some(Ok(Message::Binary(data))) => {
                        conn.dispatch(ConnEvent::Recv(data));
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue, // Ping/Pong handled automatically
                    Some(Err(e)) => {
                        tracing::debug!(conn = %conn.id(), error = %e, "websocket receive failed");
                        break;
                    }
                }
            }

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    tracing::debug!(conn = %conn.id(), "WebSocket received shutdown signal, closing");
                    let _ = ws_tx.send(close_frame("server shutting down")).await;
                    let _ = ws_tx.flush().await;
                    break;
                }
            }
        }
    }

    conn.close();
    tracing::debug!(conn = %conn.id(), "websocket closed");
}

fn close_frame(reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code: close_code::NORMAL,
        reason: reason.into(),
    }))
}
