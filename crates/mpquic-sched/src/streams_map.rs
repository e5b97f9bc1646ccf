//! Stream table of one connection.
//!
//! [`StreamsMap`] owns every open stream, hands out stream ids, enforces
//! the stream limits and offers the iteration orders used by the framer and
//! the path scheduler. Opening and accepting streams can wait for capacity
//! or for the peer; closing the map with an error wakes every waiter.

use std::collections::HashMap;
use std::sync::Arc;

use mpquic_core::{
    is_control_stream, PathId, Perspective, Priority, StreamId, CRYPTO_STREAM_ID,
    HEADER_STREAM_ID, MAX_NEW_STREAM_ID_DELTA,
};
use parking_lot::Mutex;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::config::Config;
use crate::error::Error;
use crate::priority_tree::{NodeState, PriorityTree};
use crate::stream::Stream;

/// Builds the stream object for a freshly opened id.
pub type NewStreamFn = Box<dyn Fn(StreamId, Priority) -> Arc<Stream> + Send + Sync>;

pub struct StreamsMap {
    perspective: Perspective,
    inner: Mutex<Inner>,
    new_stream: NewStreamFn,
    // Signalled when the peer opened a stream or the map was closed.
    next_stream_or_err: Notify,
    // Signalled when a stream was removed or the map was closed.
    open_stream_or_err: Notify,
}

struct Inner {
    streams: HashMap<StreamId, Arc<Stream>>,
    open_streams: Vec<StreamId>,
    round_robin_index: usize,
    path_round_robin_index: HashMap<PathId, usize>,
    priority_order: Vec<StreamId>,
    tree: PriorityTree,

    next_stream: StreamId,
    highest_stream_opened_by_peer: StreamId,
    next_stream_to_accept: StreamId,
    num_outgoing_streams: u32,
    num_incoming_streams: u32,
    max_outgoing_streams: u32,
    max_incoming_streams: u32,

    close_err: Option<Error>,
    rng: StdRng,
}

impl std::fmt::Debug for StreamsMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("StreamsMap")
            .field("perspective", &self.perspective)
            .field("open_streams", &inner.open_streams)
            .field("closed", &inner.close_err.is_some())
            .finish_non_exhaustive()
    }
}

impl StreamsMap {
    pub fn new(perspective: Perspective, config: &Config, new_stream: NewStreamFn) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            perspective,
            inner: Mutex::new(Inner {
                streams: HashMap::new(),
                open_streams: Vec::new(),
                round_robin_index: 0,
                path_round_robin_index: HashMap::new(),
                priority_order: Vec::new(),
                tree: PriorityTree::new(),
                next_stream: perspective.first_local_stream(),
                highest_stream_opened_by_peer: 0,
                next_stream_to_accept: perspective.first_remote_stream(),
                num_outgoing_streams: 0,
                num_incoming_streams: 0,
                max_outgoing_streams: config.max_outgoing_streams,
                max_incoming_streams: config.max_incoming_streams,
                close_err: None,
                rng,
            }),
            new_stream,
            next_stream_or_err: Notify::new(),
            open_stream_or_err: Notify::new(),
        }
    }

    pub fn perspective(&self) -> Perspective {
        self.perspective
    }

    /// Return the stream with `id`, opening it (and every lower peer id not
    /// seen yet) if the peer uses it for the first time.
    ///
    /// `Ok(None)` means the stream existed and is gone already.
    pub fn get_or_open(&self, id: StreamId) -> Result<Option<Arc<Stream>>, Error> {
        let mut inner = self.inner.lock();
        if let Some(stream) = inner.streams.get(&id).cloned() {
            // The peer sending on a placeholder stream makes it active.
            if inner.tree.state(id) == Some(NodeState::Idle) {
                inner.tree.set_active(id)?;
            }
            return Ok(Some(stream));
        }

        if self.perspective.is_local_stream(id) {
            if id < inner.next_stream {
                return Ok(None);
            }
            return Err(Error::InvalidStreamId(id));
        }
        let highest = inner.highest_stream_opened_by_peer;
        if id <= highest {
            if highest - id > MAX_NEW_STREAM_ID_DELTA {
                return Err(Error::StreamIdRegression { id, highest });
            }
            return Ok(None);
        }

        let mut sid = if highest == 0 {
            self.perspective.first_remote_stream()
        } else {
            highest + 2
        };
        while sid <= id {
            // Streams skipped by the peer wait idle until their first frame.
            let state = if sid == id || is_control_stream(sid) {
                NodeState::Active
            } else {
                NodeState::Idle
            };
            self.open_remote_stream(&mut inner, sid, state)?;
            sid += 2;
        }
        self.next_stream_or_err.notify_waiters();
        Ok(inner.streams.get(&id).cloned())
    }

    fn open_remote_stream(
        &self,
        inner: &mut Inner,
        id: StreamId,
        state: NodeState,
    ) -> Result<(), Error> {
        if inner.num_incoming_streams >= inner.max_incoming_streams {
            return Err(Error::TooManyOpenStreams);
        }
        inner.num_incoming_streams += 1;
        if id > inner.highest_stream_opened_by_peer {
            inner.highest_stream_opened_by_peer = id;
        }
        let stream = (self.new_stream)(id, Priority::remote());
        let weight = stream.weight();
        Self::put_stream(inner, stream, state)?;
        inner.tree.set_weight(id, weight)?;
        trace!(stream_id = id, perspective = %self.perspective, "peer opened stream");
        Ok(())
    }

    /// Open the next local stream without waiting.
    pub fn open_stream(&self, priority: Priority) -> Result<Arc<Stream>, Error> {
        let mut inner = self.inner.lock();
        if let Some(err) = &inner.close_err {
            return Err(err.clone());
        }
        self.open_stream_impl(&mut inner, priority)
    }

    /// Open the next local stream, waiting while the stream limit is reached.
    pub async fn open_stream_sync(&self, priority: Priority) -> Result<Arc<Stream>, Error> {
        loop {
            let notified = {
                let mut inner = self.inner.lock();
                if let Some(err) = &inner.close_err {
                    return Err(err.clone());
                }
                match self.open_stream_impl(&mut inner, priority) {
                    Err(Error::TooManyOpenStreams) => {}
                    other => return other,
                }
                self.open_stream_or_err.notified()
            };
            notified.await;
        }
    }

    fn open_stream_impl(&self, inner: &mut Inner, priority: Priority) -> Result<Arc<Stream>, Error> {
        let id = inner.next_stream;
        if inner.num_outgoing_streams >= inner.max_outgoing_streams {
            return Err(Error::TooManyOpenStreams);
        }
        let reparent = !is_control_stream(id) && (priority.dependency != 0 || priority.exclusive);
        if reparent {
            if is_control_stream(priority.dependency) {
                return Err(Error::InvalidParent {
                    child: id,
                    parent: priority.dependency,
                });
            }
            if !inner.tree.contains(priority.dependency) {
                return Err(Error::UnknownStream(priority.dependency));
            }
        }

        inner.num_outgoing_streams += 1;
        inner.next_stream += 2;
        let stream = (self.new_stream)(id, priority);
        Self::put_stream(inner, Arc::clone(&stream), NodeState::Active)?;
        inner.tree.set_weight(id, priority.weight)?;
        if reparent {
            inner
                .tree
                .set_parent(id, priority.dependency, priority.exclusive)?;
        }
        debug!(
            stream_id = id,
            weight = priority.weight,
            dependency = priority.dependency,
            perspective = %self.perspective,
            "opened stream"
        );
        Ok(stream)
    }

    fn put_stream(inner: &mut Inner, stream: Arc<Stream>, state: NodeState) -> Result<(), Error> {
        let id = stream.id();
        match state {
            NodeState::Idle => inner.tree.add_idle_node(Arc::clone(&stream))?,
            _ => inner.tree.add_node(Arc::clone(&stream))?,
        }
        inner.streams.insert(id, stream);
        inner.open_streams.push(id);
        Ok(())
    }

    /// Wait for the next stream opened by the peer.
    pub async fn accept_stream(&self) -> Result<Arc<Stream>, Error> {
        loop {
            let notified = {
                let mut inner = self.inner.lock();
                if let Some(err) = &inner.close_err {
                    return Err(err.clone());
                }
                loop {
                    let id = inner.next_stream_to_accept;
                    if let Some(stream) = inner.streams.get(&id).cloned() {
                        inner.next_stream_to_accept += 2;
                        return Ok(stream);
                    }
                    // Opened and removed before anyone accepted it.
                    if id <= inner.highest_stream_opened_by_peer {
                        inner.next_stream_to_accept += 2;
                        continue;
                    }
                    break;
                }
                self.next_stream_or_err.notified()
            };
            notified.await;
        }
    }

    pub fn get(&self, id: StreamId) -> Option<Arc<Stream>> {
        self.inner.lock().streams.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of open streams in the order they were opened.
    pub fn open_stream_ids(&self) -> Vec<StreamId> {
        self.inner.lock().open_streams.clone()
    }

    /// Drop a stream from the connection.
    pub fn remove(&self, id: StreamId) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        if inner.streams.remove(&id).is_none() {
            return Err(Error::UnknownStream(id));
        }
        if self.perspective.is_local_stream(id) {
            inner.num_outgoing_streams = inner.num_outgoing_streams.saturating_sub(1);
        } else {
            inner.num_incoming_streams = inner.num_incoming_streams.saturating_sub(1);
        }
        // The round-robin cursor indexes the non-control streams.
        let pos = inner
            .open_streams
            .iter()
            .filter(|s| !is_control_stream(**s))
            .position(|&s| s == id);
        if let Some(pos) = pos {
            if pos < inner.round_robin_index {
                inner.round_robin_index -= 1;
            }
        }
        inner.open_streams.retain(|&s| s != id);
        inner.priority_order.retain(|&s| s != id);
        if let Err(err) = inner.tree.close(id) {
            debug!(stream_id = id, %err, "stream had no priority node");
        }
        debug!(stream_id = id, "removed stream");
        drop(inner);
        self.open_stream_or_err.notify_waiters();
        Ok(())
    }

    /// Close the connection: cancel every stream and release all waiters.
    pub fn close_with_error(&self, err: Error) {
        let mut inner = self.inner.lock();
        for id in &inner.open_streams {
            if let Some(stream) = inner.streams.get(id) {
                stream.cancel(err.clone());
            }
        }
        debug!(%err, "closing streams map");
        inner.close_err = Some(err);
        drop(inner);
        self.next_stream_or_err.notify_waiters();
        self.open_stream_or_err.notify_waiters();
    }

    pub fn close_error(&self) -> Option<Error> {
        self.inner.lock().close_err.clone()
    }

    /// Visit the crypto and header streams, then every other stream starting
    /// at a cursor that moves by one per call, until `f` returns false.
    pub fn round_robin_iterate<F>(&self, mut f: F) -> Result<(), Error>
    where
        F: FnMut(&Arc<Stream>) -> Result<bool, Error>,
    {
        let mut inner = self.inner.lock();
        for id in [CRYPTO_STREAM_ID, HEADER_STREAM_ID] {
            if let Some(stream) = inner.streams.get(&id) {
                if !f(stream)? {
                    return Ok(());
                }
            }
        }

        let data: Vec<StreamId> = inner
            .open_streams
            .iter()
            .copied()
            .filter(|id| !is_control_stream(*id))
            .collect();
        let n = data.len();
        if n == 0 {
            return Ok(());
        }
        let start = inner.round_robin_index % n;
        inner.round_robin_index = (start + 1) % n;
        for i in 0..n {
            let Some(stream) = inner.streams.get(&data[(start + i) % n]) else {
                continue;
            };
            if !f(stream)? {
                break;
            }
        }
        Ok(())
    }

    /// Visit streams in the order computed by
    /// [`StreamsMap::sort_by_priority`].
    pub fn priority_order_iterate<F>(&self, mut f: F) -> Result<(), Error>
    where
        F: FnMut(&Arc<Stream>) -> Result<bool, Error>,
    {
        let inner = self.inner.lock();
        for id in &inner.priority_order {
            if let Some(stream) = inner.streams.get(id) {
                if !f(stream)? {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Keep the cursor of `path` on the same next stream after the stream at
    /// `pos` left the path.
    pub fn stream_left_path(&self, path: PathId, pos: usize) {
        let mut inner = self.inner.lock();
        if let Some(cursor) = inner.path_round_robin_index.get_mut(&path) {
            if pos < *cursor {
                *cursor -= 1;
            }
        }
    }

    pub fn forget_path(&self, path: PathId) {
        self.inner.lock().path_round_robin_index.remove(&path);
    }

    /// Round-robin over the streams assigned to one path. The header stream
    /// goes first; the crypto stream is left to the packer.
    pub fn per_path_round_robin<F>(
        &self,
        path: PathId,
        stream_ids: &[StreamId],
        mut f: F,
    ) -> Result<(), Error>
    where
        F: FnMut(&Arc<Stream>) -> Result<bool, Error>,
    {
        let mut inner = self.inner.lock();
        if stream_ids.contains(&HEADER_STREAM_ID) {
            if let Some(stream) = inner.streams.get(&HEADER_STREAM_ID) {
                if !f(stream)? {
                    return Ok(());
                }
            }
        }
        let n = stream_ids.len();
        if n == 0 {
            return Ok(());
        }
        let cursor = inner.path_round_robin_index.entry(path).or_insert(0);
        let start = *cursor % n;
        *cursor = (start + 1) % n;
        for i in 0..n {
            let id = stream_ids[(start + i) % n];
            if is_control_stream(id) {
                continue;
            }
            let Some(stream) = inner.streams.get(&id) else {
                continue;
            };
            if !f(stream)? {
                break;
            }
        }
        Ok(())
    }

    /// Give one stream of a path the chance to send, picked at random with
    /// probability proportional to its weight among the path's streams that
    /// have something to send. The header stream always goes first.
    pub fn per_path_proportional<F>(&self, stream_ids: &[StreamId], mut f: F) -> Result<(), Error>
    where
        F: FnMut(&Arc<Stream>) -> Result<bool, Error>,
    {
        let mut inner = self.inner.lock();
        if stream_ids.contains(&HEADER_STREAM_ID) {
            if let Some(stream) = inner.streams.get(&HEADER_STREAM_ID) {
                if !f(stream)? {
                    return Ok(());
                }
            }
        }

        let candidates: Vec<Arc<Stream>> = stream_ids
            .iter()
            .filter(|id| !is_control_stream(**id))
            .filter_map(|id| inner.streams.get(id))
            .filter(|s| s.len_of_data_for_writing() > 0 || s.should_send_fin())
            .cloned()
            .collect();
        if candidates.is_empty() {
            return Ok(());
        }
        let weights = candidates.iter().map(|s| u32::from(s.weight()));
        let pick = match WeightedIndex::new(weights) {
            Ok(dist) => dist.sample(&mut inner.rng),
            // All weights are zero: fall back to a uniform pick.
            Err(_) => inner.rng.gen_range(0..candidates.len()),
        };
        drop(inner);
        f(&candidates[pick])?;
        Ok(())
    }

    /// Refresh the priority order from the tree: streams ready for
    /// assignment, heaviest first, ties in tree order. Returns false (and
    /// keeps the previous order) when the tree has nothing new.
    pub fn sort_by_priority(&self) -> bool {
        let mut inner = self.inner.lock();
        let mut ready = inner.tree.schedule();
        if ready.is_empty() {
            return false;
        }
        ready.sort_by(|a, b| b.weight().cmp(&a.weight()));
        inner.priority_order = ready.iter().map(|s| s.id()).collect();
        trace!(order = ?inner.priority_order, "sorted streams by priority");
        true
    }

    pub fn priority_order(&self) -> Vec<StreamId> {
        self.inner.lock().priority_order.clone()
    }

    /// Re-prioritize an open stream.
    pub fn set_priority(&self, id: StreamId, priority: Priority) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        let stream = inner
            .streams
            .get(&id)
            .cloned()
            .ok_or(Error::UnknownStream(id))?;
        inner.tree.set_weight(id, priority.weight)?;
        if !is_control_stream(id) {
            let parent = priority.dependency;
            let same_parent = inner.tree.parent(id) == Some(parent);
            if priority.exclusive || !same_parent {
                inner.tree.set_parent(id, parent, priority.exclusive)?;
            }
        }
        stream.set_priority(priority);
        Ok(())
    }

    /// Every live stream of the tree, level by level.
    pub fn schedule_all(&self) -> Vec<Arc<Stream>> {
        self.inner.lock().tree.schedule_all()
    }

    /// Run `f` against the priority tree.
    pub fn with_tree<R>(&self, f: impl FnOnce(&mut PriorityTree) -> R) -> R {
        f(&mut self.inner.lock().tree)
    }
}
