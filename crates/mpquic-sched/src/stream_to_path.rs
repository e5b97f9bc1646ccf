//! Which paths each stream has been placed on.

use std::collections::HashMap;

use mpquic_core::{PathId, StreamId};

use crate::error::Error;

/// Stream to path assignments. A stream may be spread over several paths;
/// each pair is recorded at most once.
#[derive(Debug, Default, Clone)]
pub struct StreamToPath {
    entries: HashMap<StreamId, Vec<PathId>>,
}

impl StreamToPath {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `stream` is sent on `path`. Adding a known pair is a no-op.
    pub fn add(&mut self, stream: StreamId, path: PathId) {
        let paths = self.entries.entry(stream).or_default();
        if !paths.contains(&path) {
            paths.push(path);
        }
    }

    pub fn find(&self, stream: StreamId, path: PathId) -> bool {
        self.entries
            .get(&stream)
            .is_some_and(|paths| paths.contains(&path))
    }

    pub fn contains(&self, stream: StreamId) -> bool {
        self.entries.contains_key(&stream)
    }

    /// Paths of `stream`, in the order they were assigned.
    pub fn get(&self, stream: StreamId) -> Result<&[PathId], Error> {
        match self.entries.get(&stream) {
            Some(paths) if !paths.is_empty() => Ok(paths),
            _ => Err(Error::NotFound(stream)),
        }
    }

    /// Remove a single pair. The stream's key disappears with its last path.
    pub fn delete_one(&mut self, stream: StreamId, path: PathId) -> Result<(), Error> {
        let nothing = Error::NothingToDelete { stream, path };
        let paths = self.entries.get_mut(&stream).ok_or(nothing)?;
        let Some(pos) = paths.iter().position(|&p| p == path) else {
            return Err(Error::NothingToDelete { stream, path });
        };
        paths.remove(pos);
        if paths.is_empty() {
            self.entries.remove(&stream);
        }
        Ok(())
    }

    /// Remove every path of `stream`.
    pub fn delete(&mut self, stream: StreamId) -> Result<Vec<PathId>, Error> {
        self.entries.remove(&stream).ok_or(Error::NotFound(stream))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
