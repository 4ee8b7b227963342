use std::mem::{swap, take};

/// Append-only queue drained by buffer swap so flush never gives up capacity.
pub(crate) struct DrainQueue<T> {
    items: Vec<T>,
    spare: Vec<T>,
}

impl<T> Default for DrainQueue<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            spare: Vec::new(),
        }
    }
}

impl<T> DrainQueue<T> {
    pub fn push(&mut self, item: T) {
        self.items.push(item);
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Take the queued batch, leaving the queue ready for re-entrant pushes.
    pub fn take(&mut self) -> Vec<T> {
        let mut buf = take(&mut self.spare);
        swap(&mut buf, &mut self.items);
        buf
    }

    /// Return a drained batch so its capacity is reused by the next flush.
    pub fn restore(&mut self, mut buf: Vec<T>) {
        buf.clear();
        if self.spare.capacity() < buf.capacity() {
            self.spare = buf;
        }
    }
}
