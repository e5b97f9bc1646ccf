//! Flow control as consumed by the framer.
//!
//! [`FlowController`] is the interface the framer and scheduler rely on;
//! [`WindowFlowController`] is a straightforward in-memory implementation
//! with per-stream and connection-level windows.

use std::collections::HashMap;

use mpquic_core::{ByteCount, StreamId};
use parking_lot::Mutex;
use tracing::trace;

use crate::error::Error;
use crate::frame::WindowUpdateFrame;

/// Default receive and send window for a stream.
pub const DEFAULT_STREAM_WINDOW: ByteCount = 32 * 1024;

/// Default receive and send window for the connection.
pub const DEFAULT_CONNECTION_WINDOW: ByteCount = 48 * 1024;

/// Flow control state of one connection.
pub trait FlowController: Send + Sync {
    /// Start tracking a stream. Streams that do not contribute to the
    /// connection window are only limited by their own window.
    fn new_stream(&self, stream: StreamId, contributes_to_connection: bool);

    /// Forget a stream.
    fn remove_stream(&self, stream: StreamId);

    /// Bytes `stream` may still send, bounded by the connection window when
    /// the stream contributes to it.
    fn send_window_size(&self, stream: StreamId) -> Result<ByteCount, Error>;

    /// Bytes the connection may still send.
    fn remaining_connection_window_size(&self) -> ByteCount;

    /// Account freshly sent bytes.
    fn add_bytes_sent(&self, stream: StreamId, n: ByteCount) -> Result<(), Error>;

    /// Account retransmitted bytes. They do not consume window again.
    fn add_bytes_retrans(&self, stream: StreamId, n: ByteCount) -> Result<(), Error>;

    /// Highest offset the peer may send on `stream`.
    fn receive_window(&self, stream: StreamId) -> Result<ByteCount, Error>;

    /// WINDOW_UPDATE frames that should go out now. With `force`, every
    /// window that moved at all is announced.
    fn window_updates(&self, force: bool) -> Vec<WindowUpdateFrame>;
}

#[derive(Debug, Clone)]
struct SendWindow {
    limit: ByteCount,
    sent: ByteCount,
    retransmitted: ByteCount,
}

impl SendWindow {
    fn new(limit: ByteCount) -> Self {
        Self {
            limit,
            sent: 0,
            retransmitted: 0,
        }
    }

    fn remaining(&self) -> ByteCount {
        self.limit.saturating_sub(self.sent)
    }
}

#[derive(Debug, Clone)]
struct ReceiveWindow {
    increment: ByteCount,
    limit: ByteCount,
    read: ByteCount,
    announced: ByteCount,
}

impl ReceiveWindow {
    fn new(increment: ByteCount) -> Self {
        Self {
            increment,
            limit: increment,
            read: 0,
            announced: increment,
        }
    }

    // Slides the window once half of it has been consumed.
    fn maybe_update(&mut self, force: bool) -> Option<ByteCount> {
        let remaining = self.limit.saturating_sub(self.read);
        if remaining <= self.increment / 2 || (force && self.read > 0) {
            self.limit = self.read + self.increment;
        }
        if self.limit > self.announced {
            self.announced = self.limit;
            return Some(self.limit);
        }
        None
    }
}

#[derive(Debug)]
struct StreamWindows {
    send: SendWindow,
    receive: ReceiveWindow,
    contributes: bool,
}

#[derive(Debug)]
struct Windows {
    stream_window: ByteCount,
    connection_send: SendWindow,
    connection_receive: ReceiveWindow,
    streams: HashMap<StreamId, StreamWindows>,
}

/// In-memory flow controller.
#[derive(Debug)]
pub struct WindowFlowController {
    inner: Mutex<Windows>,
}

impl Default for WindowFlowController {
    fn default() -> Self {
        Self::new(DEFAULT_STREAM_WINDOW, DEFAULT_CONNECTION_WINDOW)
    }
}

impl WindowFlowController {
    pub fn new(stream_window: ByteCount, connection_window: ByteCount) -> Self {
        Self {
            inner: Mutex::new(Windows {
                stream_window,
                connection_send: SendWindow::new(connection_window),
                connection_receive: ReceiveWindow::new(connection_window),
                streams: HashMap::new(),
            }),
        }
    }

    /// Apply a WINDOW_UPDATE from the peer. Stream 0 is the connection.
    /// Limits never move backwards.
    pub fn update_send_window(&self, stream: StreamId, offset: ByteCount) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        let window = if stream == 0 {
            &mut inner.connection_send
        } else {
            &mut inner
                .streams
                .get_mut(&stream)
                .ok_or(Error::UnknownStream(stream))?
                .send
        };
        if offset > window.limit {
            trace!(stream_id = stream, offset, "send window raised");
            window.limit = offset;
        }
        Ok(())
    }

    /// The application consumed `n` received bytes of `stream`.
    pub fn add_bytes_read(&self, stream: StreamId, n: ByteCount) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        let windows = inner
            .streams
            .get_mut(&stream)
            .ok_or(Error::UnknownStream(stream))?;
        windows.receive.read += n;
        if windows.contributes {
            inner.connection_receive.read += n;
        }
        Ok(())
    }

    /// Bytes sent on `stream` for the first time.
    pub fn bytes_sent(&self, stream: StreamId) -> Option<ByteCount> {
        self.inner.lock().streams.get(&stream).map(|w| w.send.sent)
    }

    /// Bytes retransmitted on `stream`.
    pub fn bytes_retransmitted(&self, stream: StreamId) -> Option<ByteCount> {
        self.inner
            .lock()
            .streams
            .get(&stream)
            .map(|w| w.send.retransmitted)
    }
}

impl FlowController for WindowFlowController {
    fn new_stream(&self, stream: StreamId, contributes_to_connection: bool) {
        let mut inner = self.inner.lock();
        let window = inner.stream_window;
        inner.streams.entry(stream).or_insert_with(|| StreamWindows {
            send: SendWindow::new(window),
            receive: ReceiveWindow::new(window),
            contributes: contributes_to_connection,
        });
    }

    fn remove_stream(&self, stream: StreamId) {
        self.inner.lock().streams.remove(&stream);
    }

    fn send_window_size(&self, stream: StreamId) -> Result<ByteCount, Error> {
        let inner = self.inner.lock();
        let windows = inner
            .streams
            .get(&stream)
            .ok_or(Error::UnknownStream(stream))?;
        let own = windows.send.remaining();
        if windows.contributes {
            Ok(own.min(inner.connection_send.remaining()))
        } else {
            Ok(own)
        }
    }

    fn remaining_connection_window_size(&self) -> ByteCount {
        self.inner.lock().connection_send.remaining()
    }

    fn add_bytes_sent(&self, stream: StreamId, n: ByteCount) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        let windows = inner
            .streams
            .get_mut(&stream)
            .ok_or(Error::UnknownStream(stream))?;
        if n > windows.send.remaining() {
            return Err(Error::FlowControl(format!(
                "stream {stream} sent {n} bytes beyond its window"
            )));
        }
        windows.send.sent += n;
        if windows.contributes {
            inner.connection_send.sent += n;
        }
        Ok(())
    }

    fn add_bytes_retrans(&self, stream: StreamId, n: ByteCount) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        let windows = inner
            .streams
            .get_mut(&stream)
            .ok_or(Error::UnknownStream(stream))?;
        windows.send.retransmitted += n;
        Ok(())
    }

    fn receive_window(&self, stream: StreamId) -> Result<ByteCount, Error> {
        let inner = self.inner.lock();
        if stream == 0 {
            return Ok(inner.connection_receive.limit);
        }
        inner
            .streams
            .get(&stream)
            .map(|w| w.receive.limit)
            .ok_or(Error::UnknownStream(stream))
    }

    fn window_updates(&self, force: bool) -> Vec<WindowUpdateFrame> {
        let mut inner = self.inner.lock();
        let mut updates: Vec<WindowUpdateFrame> = inner
            .streams
            .iter_mut()
            .filter_map(|(&id, w)| {
                w.receive
                    .maybe_update(force)
                    .map(|byte_offset| WindowUpdateFrame {
                        stream_id: id,
                        byte_offset,
                    })
            })
            .collect();
        updates.sort_by_key(|u| u.stream_id);
        if let Some(byte_offset) = inner.connection_receive.maybe_update(force) {
            updates.push(WindowUpdateFrame {
                stream_id: 0,
                byte_offset,
            });
        }
        updates
    }
}
