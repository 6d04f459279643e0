// Strict-priority request queues with an index of coalescable reads
use std::collections::{HashMap, VecDeque};

use super::types::{CoalesceKey, Completion, QueuedRequest};

/// One FIFO per priority level; higher levels drain first
#[derive(Debug)]
pub(crate) struct RequestQueue {
    levels: Vec<VecDeque<QueuedRequest>>,
    /// Queued (not in-flight) reads by coalescing key
    coalescable: HashMap<CoalesceKey, (usize, String)>,
}

impl RequestQueue {
    pub(crate) fn new(levels: usize) -> Self {
        Self {
            levels: (0..levels.max(1)).map(|_| VecDeque::new()).collect(),
            coalescable: HashMap::new(),
        }
    }

    /// Out-of-range priorities are clamped to the highest level
    pub(crate) fn clamp(&self, priority: usize) -> usize {
        priority.min(self.levels.len() - 1)
    }

    pub(crate) fn default_priority(&self) -> usize {
        self.levels.len() / 2
    }

    pub(crate) fn len(&self) -> usize {
        self.levels.iter().map(VecDeque::len).sum()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.levels.iter().all(VecDeque::is_empty)
    }

    /// Depth per priority level, index = priority
    pub(crate) fn depths(&self) -> Vec<usize> {
        self.levels.iter().map(VecDeque::len).collect()
    }

    pub(crate) fn push(&mut self, request: QueuedRequest) {
        let level = self.clamp(request.priority);
        if let Some(key) = &request.coalesce_key {
            self.coalescable.entry(key.clone()).or_insert((level, request.id.clone()));
        }
        self.levels[level].push_back(request);
    }

    /// Attach `waiter` to a queued request with the same key
    ///
    /// Returns the request id and its waiter count, or hands the waiter back
    /// when nothing matches.
    pub(crate) fn coalesce(
        &mut self,
        key: &CoalesceKey,
        waiter: Completion,
    ) -> Result<(String, usize), Completion> {
        let Some((level, id)) = self.coalescable.get(key) else {
            return Err(waiter);
        };
        match self.levels[*level].iter_mut().find(|r| &r.id == id) {
            Some(request) => {
                request.waiters.push(waiter);
                Ok((request.id.clone(), request.waiters.len()))
            }
            None => Err(waiter),
        }
    }

    /// Take up to `max` requests, highest priority first, FIFO within a level
    pub(crate) fn take_batch(&mut self, max: usize) -> Vec<QueuedRequest> {
        let mut batch = Vec::with_capacity(max.min(self.len()));
        for level in self.levels.iter_mut().rev() {
            while batch.len() < max {
                match level.pop_front() {
                    Some(request) => batch.push(request),
                    None => break,
                }
            }
        }

        for request in &batch {
            if let Some(key) = &request.coalesce_key {
                if self.coalescable.get(key).is_some_and(|(_, id)| id == &request.id) {
                    self.coalescable.remove(key);
                }
            }
        }
        batch
    }

    /// Put requests back at the head of their levels, keeping their order
    pub(crate) fn requeue_front(&mut self, requests: Vec<QueuedRequest>) {
        for request in requests.into_iter().rev() {
            let level = self.clamp(request.priority);
            if let Some(key) = &request.coalesce_key {
                self.coalescable.entry(key.clone()).or_insert((level, request.id.clone()));
            }
            self.levels[level].push_front(request);
        }
    }

    /// Remove everything, e.g. to fail it on shutdown
    pub(crate) fn drain(&mut self) -> Vec<QueuedRequest> {
        self.coalescable.clear();
        self.levels.iter_mut().flat_map(|level| level.drain(..)).collect()
    }
}
