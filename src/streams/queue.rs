use super::error::StreamError;
use std::collections::VecDeque;

/// FIFO of `(value, size)` pairs with a running total of the sizes.
///
/// Owned by a single stream task; the total is maintained incrementally and
/// only recomputed (reset to zero) by [`QueueWithSizes::clear`].
#[derive(Debug)]
pub struct QueueWithSizes<T> {
    entries: VecDeque<(T, f64)>,
    total_size: f64,
}

impl<T> Default for QueueWithSizes<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> QueueWithSizes<T> {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            total_size: 0.0,
        }
    }

    /// Append `value` with the given size.
    ///
    /// A NaN, negative or infinite size is rejected and the value is handed
    /// back together with the error so the caller can error its stream.
    pub fn enqueue(&mut self, value: T, size: f64) -> Result<(), (StreamError, T)> {
        if !is_valid_size(size) {
            return Err((StreamError::InvalidSize(size), value));
        }
        self.entries.push_back((value, size));
        self.total_size += size;
        Ok(())
    }

    pub fn dequeue(&mut self) -> Option<T> {
        let (value, size) = self.entries.pop_front()?;
        self.total_size -= size;
        // Rounding can leave a tiny negative remainder.
        if self.total_size < 0.0 {
            self.total_size = 0.0;
        }
        Some(value)
    }

    pub fn peek(&self) -> Option<&T> {
        self.entries.front().map(|(value, _)| value)
    }

    pub fn peek_mut(&mut self) -> Option<&mut T> {
        self.entries.front_mut().map(|(value, _)| value)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.total_size = 0.0;
    }

    /// Remove every entry in delivery order, resetting the total.
    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.total_size = 0.0;
        self.entries.drain(..).map(|(value, _)| value)
    }

    pub fn total_size(&self) -> f64 {
        self.total_size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub(crate) fn is_valid_size(size: f64) -> bool {
    size.is_finite() && size >= 0.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_total_size_across_enqueue_and_dequeue() {
        let mut queue = QueueWithSizes::new();
        queue.enqueue("a", 1.5).unwrap();
        queue.enqueue("b", 2.0).unwrap();
        queue.enqueue("c", 0.5).unwrap();
        assert_eq!(queue.total_size(), 4.0);

        assert_eq!(queue.dequeue(), Some("a"));
        assert_eq!(queue.total_size(), 2.5);
        assert_eq!(queue.dequeue(), Some("b"));
        assert_eq!(queue.total_size(), 0.5);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn delivers_values_in_insertion_order() {
        let mut queue = QueueWithSizes::new();
        for i in 0..10 {
            queue.enqueue(i, 1.0).unwrap();
        }
        let drained: Vec<_> = std::iter::from_fn(|| queue.dequeue()).collect();
        assert_eq!(drained, (0..10).collect::<Vec<_>>());
        assert!(queue.is_empty());
        assert_eq!(queue.total_size(), 0.0);
    }

    #[test]
    fn rejects_invalid_sizes_and_returns_value() {
        let mut queue = QueueWithSizes::new();
        for bad in [f64::NAN, -1.0, f64::INFINITY, f64::NEG_INFINITY] {
            let (err, value) = queue.enqueue("chunk", bad).unwrap_err();
            assert!(matches!(err, StreamError::InvalidSize(_)));
            assert_eq!(value, "chunk");
        }
        assert!(queue.is_empty());
        assert_eq!(queue.total_size(), 0.0);
    }

    #[test]
    fn accepts_zero_sized_entries() {
        let mut queue = QueueWithSizes::new();
        queue.enqueue("sentinel", 0.0).unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.total_size(), 0.0);
    }

    #[test]
    fn peek_leaves_entry_queued() {
        let mut queue = QueueWithSizes::new();
        queue.enqueue(String::from("head"), 3.0).unwrap();
        queue.enqueue(String::from("tail"), 1.0).unwrap();

        assert_eq!(queue.peek().map(String::as_str), Some("head"));
        if let Some(head) = queue.peek_mut() {
            head.push('!');
        }
        assert_eq!(queue.total_size(), 4.0);
        assert_eq!(queue.dequeue().as_deref(), Some("head!"));
    }

    #[test]
    fn clear_and_drain_reset_total() {
        let mut queue = QueueWithSizes::new();
        queue.enqueue(1, 1.0).unwrap();
        queue.enqueue(2, 2.0).unwrap();
        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.total_size(), 0.0);

        queue.enqueue(3, 1.0).unwrap();
        queue.enqueue(4, 1.0).unwrap();
        let drained: Vec<_> = queue.drain().collect();
        assert_eq!(drained, vec![3, 4]);
        assert_eq!(queue.total_size(), 0.0);
    }
}
