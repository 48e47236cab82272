use std::collections::BTreeMap;

/// Index-keyed reorder buffer
///
/// Results may be inserted in any order; [`pop_ready`](Self::pop_ready)
/// only ever releases the next expected index.
#[derive(Debug)]
pub struct ReorderBuffer<T> {
    next: usize,
    pending: BTreeMap<usize, T>,
}

impl<T> Default for ReorderBuffer<T> {
    fn default() -> Self {
        ReorderBuffer::new()
    }
}

impl<T> ReorderBuffer<T> {
    pub fn new() -> ReorderBuffer<T> {
        ReorderBuffer {
            next: 0,
            pending: BTreeMap::new(),
        }
    }

    /// Index that must arrive before anything else is released
    #[inline]
    pub fn next_expected(&self) -> usize {
        self.next
    }

    /// Store the result for `index`. Returns `false` for an index already
    /// released or already pending.
    pub fn insert(&mut self, index: usize, item: T) -> bool {
        if index < self.next || self.pending.contains_key(&index) {
            return false;
        }
        self.pending.insert(index, item);
        true
    }

    pub fn pop_ready(&mut self) -> Option<(usize, T)> {
        let item = self.pending.remove(&self.next)?;
        let index = self.next;
        self.next += 1;
        Some((index, item))
    }

    /// Number of results waiting on an earlier index
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
