//! Fence-keyed retirement of destroyed resources
//!
//! Submissions complete in order on the single queue, so an object retired
//! under fence `n` can be freed once any fence `>= n` has signaled.

use std::collections::VecDeque;

#[derive(Debug)]
pub(super) struct DeferredQueue<T> {
    entries: VecDeque<(u64, T)>,
}

impl<T> DeferredQueue<T> {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    /// Hold `item` until fence `fence` signals. Fences never decrease.
    pub fn push(&mut self, fence: u64, item: T) {
        self.entries.push_back((fence, item));
    }

    /// Remove everything retired under a fence at or below `completed`
    pub fn drain_completed(&mut self, completed: u64) -> Vec<T> {
        let mut ready = Vec::new();
        while let Some((fence, _)) = self.entries.front() {
            if *fence > completed {
                break;
            }
            if let Some((_, item)) = self.entries.pop_front() {
                ready.push(item);
            }
        }
        ready
    }

    pub fn drain_all(&mut self) -> Vec<T> {
        self.entries.drain(..).map(|(_, item)| item).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn items_wait_for_their_fence() {
        let mut queue = DeferredQueue::new();
        queue.push(1, "a");
        queue.push(2, "b");
        queue.push(2, "c");
        queue.push(4, "d");

        assert!(queue.drain_completed(0).is_empty());
        assert_eq!(queue.drain_completed(2), vec!["a", "b", "c"]);
        assert_eq!(queue.len(), 1);
        assert!(queue.drain_completed(3).is_empty());
        assert_eq!(queue.drain_all(), vec!["d"]);
        assert_eq!(queue.len(), 0);
    }
}
