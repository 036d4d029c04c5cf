use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use enrolld_transport::ClientHandoff;

/// Bounded FIFO handing [`ClientHandoff`]s from the acceptor to the
/// dispatcher pool (spec.md §4.4/§5). `try_push` never blocks the
/// acceptor: a full queue means the connection is dropped and logged.
/// `pop_timed` is how dispatcher workers observe shutdown without a
/// dedicated cancellation channel.
pub struct ClientQueue {
    capacity: usize,
    state: Mutex<VecDeque<ClientHandoff>>,
    not_empty: Condvar,
}

impl ClientQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(VecDeque::with_capacity(capacity)),
            not_empty: Condvar::new(),
        }
    }

    /// Returns `Err(handoff)` (the caller should drop the socket) if the
    /// queue is at capacity.
    pub fn try_push(&self, handoff: ClientHandoff) -> Result<(), ClientHandoff> {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if guard.len() >= self.capacity {
            return Err(handoff);
        }
        guard.push_back(handoff);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Waits up to `timeout` for an item. Returns `None` on timeout so
    /// dispatcher workers re-check `running` at a bounded interval
    /// (spec.md §4.5: "1-second timeout so shutdown is observed").
    pub fn pop_timed(&self, timeout: Duration) -> Option<ClientHandoff> {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(item) = guard.pop_front() {
                return Some(item);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (next_guard, timeout_result) = self
                .not_empty
                .wait_timeout(guard, remaining)
                .unwrap_or_else(|e| e.into_inner());
            guard = next_guard;
            if timeout_result.timed_out() && guard.is_empty() {
                return None;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};

    fn fake_handoff() -> ClientHandoff {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, peer) = listener.accept().unwrap();
        drop(client);
        ClientHandoff::new(server, peer)
    }

    #[test]
    fn push_then_pop_round_trips() {
        let queue = ClientQueue::new(2);
        queue.try_push(fake_handoff()).unwrap();
        let popped = queue.pop_timed(Duration::from_millis(100));
        assert!(popped.is_some());
    }

    #[test]
    fn try_push_rejects_when_full() {
        let queue = ClientQueue::new(1);
        queue.try_push(fake_handoff()).unwrap();
        let result = queue.try_push(fake_handoff());
        assert!(result.is_err());
    }

    #[test]
    fn pop_timed_returns_none_on_empty_queue() {
        let queue = ClientQueue::new(1);
        let result = queue.pop_timed(Duration::from_millis(50));
        assert!(result.is_none());
    }
}
