// Trap vectors, the pending-interrupt order and the shared interrupt queue.
// Devices post from their own threads; the CPU drains between instructions.

use std::collections::BinaryHeap;
use std::cmp::Ordering;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use thiserror::Error;

pub const INT_BUS: u16 = 0o004;
pub const INT_INVAL: u16 = 0o010;
pub const INT_BPT: u16 = 0o014;
pub const INT_IOT: u16 = 0o020;
pub const INT_EMT: u16 = 0o030;
pub const INT_TRAP: u16 = 0o034;
pub const INT_TTYIN: u16 = 0o060;
pub const INT_TTYOUT: u16 = 0o064;
pub const INT_CLOCK: u16 = 0o100;
pub const INT_RK: u16 = 0o220;
pub const INT_FAULT: u16 = 0o250;

/// A synchronous, vectored exception. Instructions abort with one of these
/// and the step loop re-enters through the vector table.
#[derive(Debug, Clone, Error)]
#[error("trap {vec:03o}: {msg}")]
pub struct Trap {
    pub vec: u16,
    pub msg: String,
}

impl Trap {
    pub fn new(vec: u16, msg: impl Into<String>) -> Trap {
        Trap { vec, msg: msg.into() }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PendingInterrupt {
    pub vec: u16,
    pub pri: u8,
}

// Higher priority first, ties broken by the lower vector.
impl Ord for PendingInterrupt {
    fn cmp(&self, other: &Self) -> Ordering {
        self.pri.cmp(&other.pri).then(other.vec.cmp(&self.vec))
    }
}

impl PartialOrd for PendingInterrupt {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Multi-producer, single-consumer: device threads post, the CPU takes.
/// Posting wakes a CPU parked in WAIT.
#[derive(Clone)]
pub struct InterruptQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    heap: Mutex<BinaryHeap<PendingInterrupt>>,
    wake: Condvar,
}

impl InterruptQueue {
    pub fn new() -> InterruptQueue {
        InterruptQueue {
            inner: Arc::new(QueueInner { heap: Mutex::new(BinaryHeap::new()), wake: Condvar::new() }),
        }
    }

    pub fn post(&self, vec: u16, pri: u8) {
        if vec & 1 != 0 {
            panic!("posting interrupt with odd vector {:03o}", vec);
        }
        let mut heap = self.inner.heap.lock().unwrap();
        heap.push(PendingInterrupt { vec, pri });
        self.inner.wake.notify_all();
    }

    pub fn peek(&self) -> Option<PendingInterrupt> {
        self.inner.heap.lock().unwrap().peek().copied()
    }

    pub fn take(&self) -> Option<PendingInterrupt> {
        self.inner.heap.lock().unwrap().pop()
    }

    /// Take the head only if its priority beats the CPU's current one.
    pub fn take_ready(&self, cpu_pri: u8) -> Option<PendingInterrupt> {
        let mut heap = self.inner.heap.lock().unwrap();
        match heap.peek() {
            Some(p) if p.pri > cpu_pri => heap.pop(),
            _ => None,
        }
    }

    /// Park until something is pending (or the timeout lapses). Used by WAIT.
    pub fn wait_pending(&self, timeout: Duration) {
        let heap = self.inner.heap.lock().unwrap();
        if heap.is_empty() {
            let _ = self.inner.wake.wait_timeout(heap, timeout).unwrap();
        }
    }

    pub fn clear(&self) {
        self.inner.heap.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_order_is_priority_desc_vector_asc() {
        let q = InterruptQueue::new();
        q.post(INT_RK, 5);
        q.post(INT_CLOCK, 6);
        q.post(INT_TTYOUT, 4);
        q.post(INT_TTYIN, 4);
        assert_eq!(q.peek(), Some(PendingInterrupt { vec: INT_CLOCK, pri: 6 }));
        assert_eq!(q.take(), Some(PendingInterrupt { vec: INT_CLOCK, pri: 6 }));
        assert_eq!(q.take(), Some(PendingInterrupt { vec: INT_RK, pri: 5 }));
        assert_eq!(q.take(), Some(PendingInterrupt { vec: INT_TTYIN, pri: 4 }));
        assert_eq!(q.take(), Some(PendingInterrupt { vec: INT_TTYOUT, pri: 4 }));
        assert_eq!(q.take(), None);
    }

    #[test]
    fn take_ready_respects_cpu_priority() {
        let q = InterruptQueue::new();
        q.post(INT_TTYIN, 4);
        assert_eq!(q.take_ready(4), None);
        assert_eq!(q.take_ready(7), None);
        let p = q.take_ready(3).unwrap();
        assert_eq!(p.vec, INT_TTYIN);
    }

    #[test]
    #[should_panic]
    fn odd_vector_is_a_programmer_error() {
        let q = InterruptQueue::new();
        q.post(0o61, 4);
    }
}
