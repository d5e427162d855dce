//! Named consumer registry shared between callers and the copy loop

use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::{Mutex, PoisonError, RwLock};

/// A destination that receives a copy of every forwarded chunk.
///
/// Sinks are written from the copy loop while the registry is held in shared
/// mode, so writes go through `&self`.
pub trait Sink: Send + Sync {
    fn write_chunk(&self, chunk: &[u8]) -> io::Result<()>;
}

impl<W: Write + Send> Sink for Mutex<W> {
    fn write_chunk(&self, chunk: &[u8]) -> io::Result<()> {
        let mut writer = self.lock().unwrap_or_else(PoisonError::into_inner);
        writer.write_all(chunk)?;
        writer.flush()
    }
}

/// Consumer id → sink, behind a reader/writer lock
#[derive(Default)]
pub struct Registry {
    consumers: RwLock<HashMap<String, Box<dyn Sink>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the sink for `id`. Returns true if one was replaced.
    pub fn insert(&self, id: impl Into<String>, sink: Box<dyn Sink>) -> bool {
        let mut consumers = self.consumers.write().unwrap_or_else(PoisonError::into_inner);
        consumers.insert(id.into(), sink).is_some()
    }

    /// Remove `id` if present. Returns true if something was removed.
    pub fn remove(&self, id: &str) -> bool {
        let mut consumers = self.consumers.write().unwrap_or_else(PoisonError::into_inner);
        consumers.remove(id).is_some()
    }

    pub fn clear(&self) {
        let mut consumers = self.consumers.write().unwrap_or_else(PoisonError::into_inner);
        consumers.clear();
    }

    pub fn len(&self) -> usize {
        self.consumers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered ids, sorted
    pub fn ids(&self) -> Vec<String> {
        let consumers = self.consumers.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<String> = consumers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Write `chunk` to every consumer under the shared lock.
    ///
    /// `on_error` is called for each failing consumer; failures never stop
    /// the broadcast. Returns the number of failed consumers.
    pub fn broadcast<F>(&self, chunk: &[u8], mut on_error: F) -> usize
    where
        F: FnMut(&str, &io::Error),
    {
        let consumers = self.consumers.read().unwrap_or_else(PoisonError::into_inner);
        let mut failures = 0;
        for (id, sink) in consumers.iter() {
            if let Err(e) = sink.write_chunk(chunk) {
                failures += 1;
                on_error(id, &e);
            }
        }
        failures
    }
}
