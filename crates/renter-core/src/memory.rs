//! Bounded memory admission
//!
//! Every download, upload and repair asks a [`MemoryManager`] for the bytes
//! it is about to hold before it starts. Blocked requesters are served in
//! arrival order, priority requesters ahead of normal ones. A request
//! larger than the whole budget is admitted once nothing else is
//! outstanding and then holds the manager until it is returned, so later
//! small requests cannot starve it.
//!
//! Returning memory that was never granted panics. Callers must not ask
//! for more memory while holding an earlier grant for the same operation;
//! two such callers can deadlock and the manager does not detect it.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::trace;

use crate::types::Priority;

struct Waiter {
    amount: u64,
    granted: oneshot::Sender<()>,
}

struct State {
    available: u64,
    /// Bytes granted beyond the budget to an oversized request
    overdraft: u64,
    outstanding: u64,
    priority: VecDeque<Waiter>,
    normal: VecDeque<Waiter>,
}

impl State {
    fn can_grant(&self, amount: u64, budget: u64) -> bool {
        if self.overdraft > 0 {
            return false;
        }
        amount <= self.available || (amount > budget && self.available == budget)
    }

    fn grant(&mut self, amount: u64, budget: u64) {
        if amount > self.available {
            self.overdraft = amount - budget;
            self.available = 0;
        } else {
            self.available -= amount;
        }
        self.outstanding += amount;
    }

    fn ungrant(&mut self, amount: u64) {
        self.outstanding -= amount;
        let paid = amount.min(self.overdraft);
        self.overdraft -= paid;
        self.available += amount - paid;
    }

    /// Grant queued waiters in order until the first that does not fit
    fn wake(&mut self, budget: u64) {
        for priority in [true, false] {
            loop {
                let queue = if priority { &self.priority } else { &self.normal };
                let Some(front) = queue.front() else { break };
                if front.granted.is_closed() {
                    self.queue_mut(priority).pop_front();
                    continue;
                }
                let amount = front.amount;
                if !self.can_grant(amount, budget) {
                    return;
                }
                let Some(waiter) = self.queue_mut(priority).pop_front() else {
                    break;
                };
                self.grant(amount, budget);
                if waiter.granted.send(()).is_err() {
                    self.ungrant(amount);
                }
            }
        }
    }

    fn queue_mut(&mut self, priority: bool) -> &mut VecDeque<Waiter> {
        if priority {
            &mut self.priority
        } else {
            &mut self.normal
        }
    }

    fn has_waiters_ahead(&self, priority: bool) -> bool {
        if priority {
            !self.priority.is_empty()
        } else {
            !self.priority.is_empty() || !self.normal.is_empty()
        }
    }
}

struct Inner {
    name: &'static str,
    budget: u64,
    state: Mutex<State>,
}

/// Counting semaphore over a byte budget
#[derive(Clone)]
pub struct MemoryManager {
    inner: Arc<Inner>,
}

impl MemoryManager {
    /// Create a manager; `name` labels its trace events
    pub fn new(name: &'static str, budget: u64) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                budget,
                state: Mutex::new(State {
                    available: budget,
                    overdraft: 0,
                    outstanding: 0,
                    priority: VecDeque::new(),
                    normal: VecDeque::new(),
                }),
            }),
        }
    }

    pub fn budget(&self) -> u64 {
        self.inner.budget
    }

    pub fn available(&self) -> u64 {
        self.inner.state.lock().available
    }

    /// Bytes granted and not yet returned
    pub fn outstanding(&self) -> u64 {
        self.inner.state.lock().outstanding
    }

    /// Requesters currently blocked
    pub fn waiters(&self) -> usize {
        let state = self.inner.state.lock();
        state
            .priority
            .iter()
            .chain(state.normal.iter())
            .filter(|w| !w.granted.is_closed())
            .count()
    }

    /// Grant `amount` now if it fits and nobody is queued ahead
    pub fn try_request(&self, amount: u64) -> bool {
        let mut state = self.inner.state.lock();
        if state.has_waiters_ahead(false) || !state.can_grant(amount, self.inner.budget) {
            return false;
        }
        state.grant(amount, self.inner.budget);
        true
    }

    /// Wait until `amount` bytes are granted
    ///
    /// Dropping the future gives up the place in the queue; memory that was
    /// granted in the meantime is returned.
    pub async fn request(&self, amount: u64, priority: Priority) {
        let is_priority = priority.is_memory_priority();
        let rx = {
            let mut state = self.inner.state.lock();
            if !state.has_waiters_ahead(is_priority)
                && state.can_grant(amount, self.inner.budget)
            {
                state.grant(amount, self.inner.budget);
                return;
            }
            let (tx, rx) = oneshot::channel();
            state.queue_mut(is_priority).push_back(Waiter {
                amount,
                granted: tx,
            });
            rx
        };

        trace!(manager = self.inner.name, amount, "Memory request blocked");
        let mut pending = PendingGrant {
            manager: self,
            amount,
            rx,
            granted: false,
        };
        if (&mut pending.rx).await.is_err() {
            panic!("memory manager {} dropped a waiter", self.inner.name);
        }
        pending.granted = true;
    }

    /// Like [`request`](Self::request), returning a guard that gives the
    /// memory back on drop
    pub async fn request_guard(&self, amount: u64, priority: Priority) -> MemoryGuard {
        self.request(amount, priority).await;
        MemoryGuard {
            manager: self.clone(),
            remaining: amount,
        }
    }

    /// Guard-returning form of [`try_request`](Self::try_request)
    pub fn try_request_guard(&self, amount: u64) -> Option<MemoryGuard> {
        self.try_request(amount).then(|| MemoryGuard {
            manager: self.clone(),
            remaining: amount,
        })
    }

    /// Give back `amount` bytes and admit as many waiters as now fit
    ///
    /// # Panics
    ///
    /// If `amount` exceeds what is currently granted.
    pub fn return_memory(&self, amount: u64) {
        if amount == 0 {
            return;
        }
        let mut state = self.inner.state.lock();
        assert!(
            amount <= state.outstanding,
            "memory manager {}: returned {} bytes but only {} are granted",
            self.inner.name,
            amount,
            state.outstanding
        );
        state.ungrant(amount);
        assert!(
            state.available <= self.inner.budget,
            "memory manager {}: available {} exceeds budget {}",
            self.inner.name,
            state.available,
            self.inner.budget
        );
        state.wake(self.inner.budget);
    }

    fn abandon(&self) {
        let mut state = self.inner.state.lock();
        state.wake(self.inner.budget);
    }
}

impl std::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("MemoryManager")
            .field("name", &self.inner.name)
            .field("budget", &self.inner.budget)
            .field("available", &state.available)
            .field("outstanding", &state.outstanding)
            .finish()
    }
}

struct PendingGrant<'a> {
    manager: &'a MemoryManager,
    amount: u64,
    rx: oneshot::Receiver<()>,
    granted: bool,
}

impl Drop for PendingGrant<'_> {
    fn drop(&mut self) {
        if self.granted {
            return;
        }
        self.rx.close();
        if self.rx.try_recv().is_ok() {
            self.manager.return_memory(self.amount);
        } else {
            // a closed waiter at the head may be hiding grantable ones
            self.manager.abandon();
        }
    }
}

/// Granted memory that returns itself on drop
#[derive(Debug)]
pub struct MemoryGuard {
    manager: MemoryManager,
    remaining: u64,
}

impl MemoryGuard {
    /// Bytes still held
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Return up to `amount` bytes early; returns what was released
    pub fn release(&mut self, amount: u64) -> u64 {
        let amount = amount.min(self.remaining);
        self.remaining -= amount;
        self.manager.return_memory(amount);
        amount
    }

    /// Release everything above `keep`
    pub fn shrink_to(&mut self, keep: u64) -> u64 {
        self.release(self.remaining.saturating_sub(keep))
    }
}

impl Drop for MemoryGuard {
    fn drop(&mut self) {
        self.manager.return_memory(self.remaining);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn blocked<F: std::future::Future>(fut: F) -> bool {
        timeout(Duration::from_millis(50), fut).await.is_err()
    }

    #[tokio::test]
    async fn test_request_and_return() {
        let mm = MemoryManager::new("test", 100);
        mm.request(40, Priority::Normal).await;
        assert_eq!(mm.available(), 60);
        assert_eq!(mm.outstanding(), 40);
        mm.return_memory(40);
        assert_eq!(mm.available(), 100);
    }

    #[tokio::test]
    async fn test_fifo_fairness_scenario() {
        let mm = MemoryManager::new("test", 100);
        mm.request(100, Priority::Normal).await;

        let first = tokio::spawn({
            let mm = mm.clone();
            async move { mm.request(60, Priority::Normal).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = tokio::spawn({
            let mm = mm.clone();
            async move { mm.request(50, Priority::Normal).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(mm.waiters(), 2);

        mm.return_memory(100);
        first.await.unwrap();
        assert_eq!(mm.available(), 40);
        assert!(!second.is_finished());

        mm.return_memory(10);
        timeout(Duration::from_secs(1), second)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(mm.available(), 0);
        assert_eq!(mm.outstanding(), 100);
    }

    #[tokio::test]
    async fn test_small_request_waits_behind_queue() {
        let mm = MemoryManager::new("test", 100);
        mm.request(80, Priority::Normal).await;
        let big = tokio::spawn({
            let mm = mm.clone();
            async move { mm.request(50, Priority::Normal).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        // 20 bytes are free but a request is already queued
        assert!(!mm.try_request(10));
        assert!(blocked(mm.request(10, Priority::Normal)).await);

        mm.return_memory(80);
        big.await.unwrap();
        assert_eq!(mm.available(), 50);
    }

    #[tokio::test]
    async fn test_oversized_request_monopolizes() {
        let mm = MemoryManager::new("test", 100);
        mm.request(30, Priority::Normal).await;

        let large = tokio::spawn({
            let mm = mm.clone();
            async move { mm.request(150, Priority::Normal).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let small = tokio::spawn({
            let mm = mm.clone();
            async move { mm.request(10, Priority::Normal).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!large.is_finished());

        mm.return_memory(30);
        large.await.unwrap();
        assert_eq!(mm.available(), 0);
        assert!(!small.is_finished());

        // paying down the overdraft alone frees nothing
        mm.return_memory(40);
        assert_eq!(mm.available(), 0);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!small.is_finished());

        mm.return_memory(110);
        small.await.unwrap();
        assert_eq!(mm.available(), 90);
    }

    #[tokio::test]
    async fn test_priority_waiters_first() {
        let mm = MemoryManager::new("test", 10);
        mm.request(10, Priority::Normal).await;

        let order = Arc::new(Mutex::new(Vec::new()));
        let normal = tokio::spawn({
            let (mm, order) = (mm.clone(), order.clone());
            async move {
                mm.request(10, Priority::Normal).await;
                order.lock().push("normal");
                mm.return_memory(10);
            }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let high = tokio::spawn({
            let (mm, order) = (mm.clone(), order.clone());
            async move {
                mm.request(10, Priority::High).await;
                order.lock().push("high");
                mm.return_memory(10);
            }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        mm.return_memory(10);
        high.await.unwrap();
        normal.await.unwrap();
        assert_eq!(*order.lock(), vec!["high", "normal"]);
        assert_eq!(mm.available(), 10);
    }

    #[tokio::test]
    async fn test_dropped_waiter_is_skipped() {
        let mm = MemoryManager::new("test", 100);
        mm.request(100, Priority::Normal).await;

        assert!(blocked(mm.request(90, Priority::Normal)).await);
        let next = tokio::spawn({
            let mm = mm.clone();
            async move { mm.request(30, Priority::Normal).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(mm.waiters(), 1);

        mm.return_memory(50);
        next.await.unwrap();
        assert_eq!(mm.available(), 20);
        assert_eq!(mm.outstanding(), 80);
    }

    #[tokio::test]
    async fn test_guard_returns_on_drop() {
        let mm = MemoryManager::new("test", 100);
        {
            let mut guard = mm.request_guard(70, Priority::Normal).await;
            assert_eq!(guard.release(20), 20);
            assert_eq!(mm.available(), 50);
            assert_eq!(guard.shrink_to(10), 40);
            assert_eq!(guard.remaining(), 10);
            assert_eq!(guard.release(1_000), 10);
        }
        assert_eq!(mm.available(), 100);

        let guard = mm.try_request_guard(100).unwrap();
        assert!(mm.try_request_guard(1).is_none());
        drop(guard);
        assert_eq!(mm.outstanding(), 0);
    }

    #[test]
    #[should_panic(expected = "only 0 are granted")]
    fn test_return_without_grant_panics() {
        MemoryManager::new("test", 100).return_memory(1);
    }

    proptest! {
        #[test]
        fn prop_counters_stay_in_bounds(
            budget in 1u64..1_000,
            ops in proptest::collection::vec((any::<bool>(), 0u64..1_500), 1..64),
        ) {
            let mm = MemoryManager::new("prop", budget);
            let mut held: Vec<u64> = Vec::new();
            for (acquire, amount) in ops {
                if acquire {
                    if mm.try_request(amount) {
                        held.push(amount);
                    }
                } else if let Some(amount) = held.pop() {
                    mm.return_memory(amount);
                }
                let available = mm.available();
                prop_assert!(available <= budget);
                prop_assert_eq!(mm.outstanding(), held.iter().sum::<u64>());
            }
            for amount in held.drain(..) {
                mm.return_memory(amount);
            }
            prop_assert_eq!(mm.available(), budget);
        }
    }
}
