/*
 * Copyright (C) 2026 Mark Wells Dev
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Framed message channel over a process's stdio streams.
//!
//! A dedicated reader task accumulates partial reads and hands each decoded
//! message to the owner through a bounded queue. Writes are serialized behind
//! a mutex so concurrent senders never interleave bytes on the wire. A write
//! failure surfaces to that sender only; it does not bring down the reader.

use bytes::BytesMut;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::protocol::{self, Message};
use crate::error::{Error, Result};

/// What the reader task reports to the channel owner.
#[derive(Debug)]
pub enum ChannelEvent {
    /// One decoded message.
    Message(Message),
    /// The stream ended. `error` is `None` on clean EOF, `Some` when framing
    /// broke and the channel had to be abandoned.
    Closed {
        /// The framing failure that terminated the channel, if any.
        error: Option<Error>,
    },
}

/// Channel over a spawned server's stdio.
pub type StdioChannel = FramedChannel<tokio::process::ChildStdin>;

/// Bidirectional framed channel: one reader task, serialized writes.
#[derive(Debug)]
pub struct FramedChannel<W> {
    writer: Arc<Mutex<W>>,
    closed: Arc<AtomicBool>,
    reader_handle: JoinHandle<()>,
}

impl<W: AsyncWrite + Unpin + Send + 'static> FramedChannel<W> {
    /// Attach to a process's streams and start the reader task.
    ///
    /// Decoded messages and the eventual close notice arrive on `events`.
    pub fn attach<R>(writer: W, reader: R, events: mpsc::Sender<ChannelEvent>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let closed = Arc::new(AtomicBool::new(false));
        let reader_handle = tokio::spawn(read_loop(reader, events, Arc::clone(&closed)));
        Self {
            writer: Arc::new(Mutex::new(writer)),
            closed,
            reader_handle,
        }
    }

    /// Write one already-encoded frame.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Communication`] when the channel is closed or the
    /// write fails. The reader keeps running either way.
    pub async fn send(&self, frame: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Communication("channel is closed".to_string()));
        }

        let mut writer = self.writer.lock().await;
        writer
            .write_all(frame)
            .await
            .map_err(|e| Error::Communication(format!("write failed: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| Error::Communication(format!("flush failed: {e}")))?;
        Ok(())
    }

    /// Whether the channel has stopped carrying messages.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Tear the channel down: no further reads or writes.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.reader_handle.abort();
    }
}

impl<W> Drop for FramedChannel<W> {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        self.reader_handle.abort();
    }
}

/// Reader task: accumulate bytes, peel off complete frames, decode, forward.
async fn read_loop<R>(mut reader: R, events: mpsc::Sender<ChannelEvent>, closed: Arc<AtomicBool>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut buffer = BytesMut::with_capacity(8192);
    let mut temp = [0u8; 4096];

    let close_error = 'outer: loop {
        match reader.read(&mut temp).await {
            Ok(0) => {
                debug!("server stdout closed");
                break None;
            }
            Ok(n) => buffer.extend_from_slice(&temp[..n]),
            Err(e) => {
                break Some(Error::Communication(format!("read failed: {e}")));
            }
        }

        loop {
            match protocol::try_parse_frame(&mut buffer) {
                Ok(Some(body)) => {
                    trace!("received frame: {body}");
                    match protocol::decode(&body) {
                        Ok(message) => {
                            if events.send(ChannelEvent::Message(message)).await.is_err() {
                                // Owner went away; nothing left to deliver to.
                                break 'outer None;
                            }
                        }
                        Err(e) => {
                            // Framing is intact, one body is garbage. Skip it.
                            warn!("dropping undecodable frame: {e}");
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    // Malformed header: the byte stream can no longer be
                    // trusted, so the channel terminates.
                    break 'outer Some(e);
                }
            }
        }
    };

    closed.store(true, Ordering::SeqCst);
    let _ = events
        .send(ChannelEvent::Closed { error: close_error })
        .await;
}
