use std::{cmp::Reverse, collections::BinaryHeap};

use hashbrown::HashMap;
use tokio::time::Instant;

use crate::tcp_wire::BlockInfo;

/// The blocks requested by one connection and their deadlines.
///
/// Deadlines live in a min-heap, removed requests are only dropped from the
/// index and their heap entries are skipped when they surface.
#[derive(Debug, Default)]
pub(crate) struct RequestManager {
    timeouts: BinaryHeap<(Reverse<Instant>, BlockInfo)>,
    // `BlockInfo → deadline`
    index: HashMap<BlockInfo, Instant>,
}

impl RequestManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn add_request(&mut self, block: BlockInfo, deadline: Instant) {
        self.index.insert(block.clone(), deadline);
        self.timeouts.push((Reverse(deadline), block));
    }

    /// Return true if the request exists, and false otherwise.
    pub fn remove_request(&mut self, block: &BlockInfo) -> bool {
        let removed = self.index.remove(block).is_some();
        if self.index.is_empty() {
            self.timeouts.clear();
        }
        removed
    }

    /// Remove and return the requests with a deadline before `now`.
    pub fn take_timed_out(&mut self, now: Instant) -> Vec<BlockInfo> {
        let mut timed_out = Vec::new();

        while let Some((Reverse(deadline), _)) = self.timeouts.peek() {
            if *deadline > now {
                break;
            }
            let Some((Reverse(deadline), block)) = self.timeouts.pop() else {
                break;
            };
            // only if this entry is still the live one for the block
            if self.index.get(&block) == Some(&deadline) {
                self.index.remove(&block);
                timed_out.push(block);
            }
        }

        timed_out
    }

    /// Remove every request.
    pub fn drain(&mut self) -> Vec<BlockInfo> {
        self.timeouts.clear();
        self.index.drain().map(|(block, _)| block).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn add_and_remove() {
        let mut r = RequestManager::new();
        let now = Instant::now();
        let a = BlockInfo::new(0, 0, 10);
        let b = BlockInfo::new(0, 10, 10);

        r.add_request(a.clone(), now);
        r.add_request(b.clone(), now);
        assert_eq!(r.len(), 2);

        assert!(r.remove_request(&a));
        assert!(!r.remove_request(&a));
        assert_eq!(r.len(), 1);

        assert_eq!(r.drain(), vec![b]);
        assert!(r.is_empty());
    }

    #[test]
    fn timed_out_in_deadline_order() {
        let mut r = RequestManager::new();
        let now = Instant::now();
        let s = Duration::from_secs(1);

        let a = BlockInfo::new(0, 0, 1);
        let b = BlockInfo::new(1, 0, 1);
        let c = BlockInfo::new(2, 0, 1);

        r.add_request(c.clone(), now + s * 3);
        r.add_request(a.clone(), now + s);
        r.add_request(b.clone(), now + s * 2);

        assert!(r.take_timed_out(now).is_empty());
        assert_eq!(r.take_timed_out(now + s * 2), vec![a, b]);
        assert_eq!(r.len(), 1);
        assert_eq!(r.take_timed_out(now + s * 10), vec![c]);
        assert!(r.is_empty());
    }

    #[test]
    fn removed_requests_do_not_time_out() {
        let mut r = RequestManager::new();
        let now = Instant::now();
        let a = BlockInfo::new(0, 0, 1);
        let b = BlockInfo::new(1, 0, 1);

        r.add_request(a.clone(), now);
        r.add_request(b.clone(), now);
        r.remove_request(&a);

        assert_eq!(r.take_timed_out(now), vec![b]);
    }

    #[test]
    fn re_added_request_uses_new_deadline() {
        let mut r = RequestManager::new();
        let now = Instant::now();
        let later = now + Duration::from_secs(5);
        let a = BlockInfo::new(0, 0, 1);

        r.add_request(a.clone(), now);
        r.remove_request(&a);
        r.add_request(a.clone(), later);

        assert!(r.take_timed_out(now).is_empty());
        assert_eq!(r.take_timed_out(later), vec![a]);
    }
}
