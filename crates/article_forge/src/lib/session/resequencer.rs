use std::collections::BTreeMap;

/// Releases items strictly in sequence order, holding back anything that
/// arrives ahead of a gap until the gap is filled.
#[derive(Debug)]
pub(super) struct Resequencer<T> {
    pending: BTreeMap<u64, T>,
    next: u64,
}

impl<T> Resequencer<T> {
    pub fn new() -> Self {
        Self {
            pending: BTreeMap::new(),
            next: 0,
        }
    }

    pub fn insert(&mut self, sequence: u64, item: T) {
        if sequence < self.next {
            tracing::warn!(sequence, next = self.next, "Ignoring already released sequence");
            return;
        }
        self.pending.insert(sequence, item);
    }

    /// The next item in order, if it has arrived.
    pub fn pop_ready(&mut self) -> Option<T> {
        let item = self.pending.remove(&self.next)?;
        self.next += 1;
        Some(item)
    }

    pub fn held_back(&self) -> usize {
        self.pending.len()
    }
}
