//! Bounded pool of peer connections.
//!
//! Addresses returned by the tracker are queued once, no matter how many
//! times they are announced. Connections are spawned from the queue while
//! fewer than `max_peers` are running.
use std::{
    collections::VecDeque, future::Future, net::SocketAddr, time::Duration,
};

use hashbrown::HashSet;
use tokio::{task::JoinSet, time::timeout};
use tracing::{debug, warn};

use crate::error::Error;

pub type PeerOutcome = (SocketAddr, Result<(), Error>);

#[derive(Debug)]
pub struct PeerPool {
    /// Addresses waiting for a free slot.
    queue: VecDeque<SocketAddr>,
    /// Every address ever queued.
    seen: HashSet<SocketAddr>,
    running: JoinSet<PeerOutcome>,
    max_peers: usize,
}

impl PeerPool {
    pub fn new(max_peers: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            seen: HashSet::new(),
            running: JoinSet::new(),
            max_peers: max_peers.max(1),
        }
    }

    /// Queue the addresses that were never seen before, returns how many
    /// were queued.
    pub fn extend(
        &mut self,
        peers: impl IntoIterator<Item = SocketAddr>,
    ) -> usize {
        let mut added = 0;
        for addr in peers {
            if self.seen.insert(addr) {
                self.queue.push_back(addr);
                added += 1;
            }
        }
        added
    }

    /// Spawn connections while there are free slots and queued addresses.
    /// Returns how many were spawned.
    pub fn fill<F, Fut>(&mut self, mut connect: F) -> usize
    where
        F: FnMut(SocketAddr) -> Fut,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        let mut spawned = 0;

        while self.running.len() < self.max_peers {
            let Some(addr) = self.queue.pop_front() else { break };
            let fut = connect(addr);
            self.running.spawn(async move { (addr, fut.await) });
            spawned += 1;
        }

        if spawned > 0 {
            debug!(
                "spawned {spawned} connections, {} running, {} queued",
                self.running.len(),
                self.queue.len()
            );
        }

        spawned
    }

    /// Wait for the next connection to end. Returns `None` when nothing is
    /// running.
    pub async fn join_next(&mut self) -> Option<PeerOutcome> {
        loop {
            match self.running.join_next().await? {
                Ok(outcome) => return Some(outcome),
                Err(e) if e.is_cancelled() => {}
                Err(e) => warn!("peer task panicked: {e}"),
            }
        }
    }

    pub fn running(&self) -> usize {
        self.running.len()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn seen(&self) -> usize {
        self.seen.len()
    }

    /// No connection is running and none is waiting.
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.running.is_empty()
    }

    /// Drop the queue and give the running connections `grace` to end,
    /// then abort the rest.
    pub async fn shutdown(&mut self, grace: Duration) {
        self.queue.clear();

        let drained =
            timeout(grace, async { while self.join_next().await.is_some() {} })
                .await;

        if drained.is_err() {
            warn!("aborting {} connections", self.running.len());
            self.running.abort_all();
            while self.running.join_next().await.is_some() {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn extend_deduplicates() {
        let mut pool = PeerPool::new(2);
        assert_eq!(pool.extend([addr(1), addr(2), addr(1)]), 2);
        assert_eq!(pool.extend([addr(2), addr(3)]), 1);
        assert_eq!(pool.queued(), 3);
        assert_eq!(pool.seen(), 3);
    }

    #[tokio::test]
    async fn bounded_by_max_peers() {
        let mut pool = PeerPool::new(2);
        pool.extend((1..=5).map(addr));

        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let connect = |_addr: SocketAddr| {
            let running = running.clone();
            let peak = peak.clone();
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        };

        assert_eq!(pool.fill(connect), 2);
        assert_eq!(pool.queued(), 3);

        let mut done = Vec::new();
        while let Some((addr, r)) = pool.join_next().await {
            assert!(r.is_ok());
            done.push(addr);
            pool.fill(connect);
        }

        assert_eq!(done.len(), 5);
        assert!(pool.is_idle());
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn reports_errors_with_the_address() {
        let mut pool = PeerPool::new(4);
        pool.extend([addr(7)]);
        pool.fill(|_| async { Err(Error::ConnectTimeout) });

        let (a, r) = pool.join_next().await.unwrap();
        assert_eq!(a, addr(7));
        assert!(matches!(r, Err(Error::ConnectTimeout)));
        assert!(pool.join_next().await.is_none());
    }

    #[tokio::test]
    async fn shutdown_aborts_stragglers() {
        let mut pool = PeerPool::new(4);
        pool.extend([addr(1), addr(2)]);
        pool.fill(|a| async move {
            if a.port() == 1 {
                std::future::pending::<()>().await;
            }
            Ok(())
        });

        pool.shutdown(Duration::from_millis(20)).await;
        assert_eq!(pool.running(), 0);
        assert!(pool.is_idle());
    }
}
