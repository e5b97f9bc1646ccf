//! Send side of a stream as seen by the scheduler.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use mpquic_core::{ByteCount, PathId, Priority, StreamId};
use parking_lot::Mutex;

use crate::error::Error;

/// A stream's send buffer together with its scheduling state.
///
/// The application appends with [`Stream::write`] and the framer drains with
/// [`Stream::get_data_for_writing`]. All state sits behind one mutex so both
/// sides may run on different tasks.
#[derive(Debug)]
pub struct Stream {
    id: StreamId,
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State {
    priority: Priority,
    write_offset: ByteCount,
    data_for_writing: BytesMut,
    finished_writing: bool,
    fin_sent: bool,
    cancel_err: Option<Error>,
    // Set once the total size has been read off the send buffer.
    checksize: bool,
    size: ByteCount,
    path_volume: HashMap<PathId, f64>,
    request_path: String,
}

impl Stream {
    pub fn new(id: StreamId, priority: Priority) -> Self {
        Self {
            id,
            state: Mutex::new(State {
                priority,
                ..State::default()
            }),
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn priority(&self) -> Priority {
        self.state.lock().priority
    }

    pub fn weight(&self) -> u8 {
        self.state.lock().priority.weight
    }

    pub fn set_priority(&self, priority: Priority) {
        self.state.lock().priority = priority;
    }

    /// Queue bytes for sending.
    pub fn write(&self, data: &[u8]) -> Result<usize, Error> {
        let mut state = self.state.lock();
        if let Some(err) = &state.cancel_err {
            return Err(err.clone());
        }
        if state.finished_writing {
            return Err(Error::StreamClosed(self.id));
        }
        state.data_for_writing.extend_from_slice(data);
        Ok(data.len())
    }

    /// No more data will be written; a FIN goes out after the buffer drains.
    pub fn close(&self) {
        self.state.lock().finished_writing = true;
    }

    pub fn len_of_data_for_writing(&self) -> ByteCount {
        let state = self.state.lock();
        if state.cancel_err.is_some() {
            return 0;
        }
        state.data_for_writing.len() as ByteCount
    }

    /// Take up to `max` bytes off the front of the send buffer.
    pub fn get_data_for_writing(&self, max: ByteCount) -> Option<Bytes> {
        let mut state = self.state.lock();
        if state.cancel_err.is_some() || state.data_for_writing.is_empty() || max == 0 {
            return None;
        }
        let n = (max as usize).min(state.data_for_writing.len());
        let data = state.data_for_writing.split_to(n).freeze();
        state.write_offset += n as ByteCount;
        Some(data)
    }

    pub fn write_offset(&self) -> ByteCount {
        self.state.lock().write_offset
    }

    pub fn should_send_fin(&self) -> bool {
        let state = self.state.lock();
        state.cancel_err.is_none()
            && state.finished_writing
            && !state.fin_sent
            && state.data_for_writing.is_empty()
    }

    pub fn sent_fin(&self) {
        self.state.lock().fin_sent = true;
    }

    pub fn finished_write_and_sent_fin(&self) -> bool {
        let state = self.state.lock();
        state.finished_writing && state.fin_sent
    }

    /// Abort the stream; buffered data is dropped.
    pub fn cancel(&self, err: Error) {
        let mut state = self.state.lock();
        state.data_for_writing.clear();
        state.cancel_err = Some(err);
    }

    pub fn cancel_error(&self) -> Option<Error> {
        self.state.lock().cancel_err.clone()
    }

    /// Total size of the stream, read off the send buffer the first time any
    /// data is queued. Returns `None` while nothing has been written yet.
    pub fn detect_size(&self) -> Option<ByteCount> {
        let mut state = self.state.lock();
        if state.checksize {
            return Some(state.size);
        }
        let len = state.data_for_writing.len() as ByteCount;
        if len == 0 {
            return None;
        }
        state.checksize = true;
        state.size = len;
        Some(len)
    }

    pub fn checksize(&self) -> bool {
        self.state.lock().checksize
    }

    pub fn size(&self) -> ByteCount {
        self.state.lock().size
    }

    /// Bytes still budgeted for this stream on `path`.
    pub fn path_volume(&self, path: PathId) -> f64 {
        self.state.lock().path_volume.get(&path).copied().unwrap_or(0.0)
    }

    pub fn set_path_volume(&self, path: PathId, volume: f64) {
        self.state.lock().path_volume.insert(path, volume);
    }

    pub(crate) fn consume_path_volume(&self, path: PathId, bytes: ByteCount) {
        let mut state = self.state.lock();
        *state.path_volume.entry(path).or_insert(0.0) -= bytes as f64;
    }

    pub fn request_path(&self) -> String {
        self.state.lock().request_path.clone()
    }

    /// Resource the stream is fetching, forwarded to the path advisor.
    pub fn set_request_path(&self, path: impl Into<String>) {
        self.state.lock().request_path = path.into();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_in_order_and_advances_offset() {
        let s = Stream::new(5, Priority::default());
        s.write(b"hello world").unwrap();
        assert_eq!(s.len_of_data_for_writing(), 11);
        assert_eq!(s.get_data_for_writing(5).unwrap().as_ref(), b"hello");
        assert_eq!(s.write_offset(), 5);
        assert_eq!(s.get_data_for_writing(100).unwrap().as_ref(), b" world");
        assert_eq!(s.write_offset(), 11);
        assert!(s.get_data_for_writing(100).is_none());
    }

    #[test]
    fn fin_after_buffer_drains() {
        let s = Stream::new(5, Priority::default());
        s.write(b"abc").unwrap();
        s.close();
        assert!(!s.should_send_fin());
        s.get_data_for_writing(3);
        assert!(s.should_send_fin());
        assert!(!s.finished_write_and_sent_fin());
        s.sent_fin();
        assert!(!s.should_send_fin());
        assert!(s.finished_write_and_sent_fin());
        assert!(matches!(s.write(b"more"), Err(Error::StreamClosed(5))));
        assert!(s.cancel_error().is_none());
    }

    #[test]
    fn size_detected_once() {
        let s = Stream::new(7, Priority::default());
        assert_eq!(s.detect_size(), None);
        assert!(!s.checksize());
        s.write(&[0u8; 300]).unwrap();
        assert_eq!(s.detect_size(), Some(300));
        s.get_data_for_writing(100);
        assert_eq!(s.detect_size(), Some(300));
        assert_eq!(s.size(), 300);
    }

    #[test]
    fn cancel_drops_data() {
        let s = Stream::new(9, Priority::default());
        s.write(b"abc").unwrap();
        s.cancel(Error::ConnectionClosed {
            reason: "gone".into(),
        });
        assert_eq!(s.len_of_data_for_writing(), 0);
        assert!(s.get_data_for_writing(10).is_none());
        assert!(s.write(b"x").is_err());
        assert!(s.cancel_error().is_some());
    }

    #[test]
    fn path_volume_accounting() {
        let s = Stream::new(9, Priority::default());
        assert_eq!(s.path_volume(1), 0.0);
        s.set_path_volume(1, 1000.0);
        s.consume_path_volume(1, 400);
        assert_eq!(s.path_volume(1), 600.0);
    }
}
