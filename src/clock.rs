// KW11 line clock: a 20 ms repeating schedule that sets LKS bit 7 and,
// when bit 6 is enabled, posts the clock interrupt at priority 6.

use crate::interrupts::{InterruptQueue, INT_CLOCK};
use chrono::Duration;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

pub const TICK_MS: u64 = 20;

/// One tick of the line clock. The repeating schedule fires this every
/// 20 ms; headless drivers may call it themselves.
pub fn tick(lks: &AtomicU16, intq: &InterruptQueue) {
    let prev = lks.fetch_or(1 << 7, Ordering::SeqCst);
    if prev & (1 << 6) != 0 {
        intq.post(INT_CLOCK, 6);
    }
}

/// Dropping the guard cancels the schedule; the timer's scheduler thread
/// dies with the clock.
pub struct LineClock {
    _timer: timer::Timer,
    guard: Option<timer::Guard>,
}

impl LineClock {
    pub fn start(lks: Arc<AtomicU16>, intq: InterruptQueue) -> LineClock {
        let timer = timer::Timer::new();
        let guard =
            timer.schedule_repeating(Duration::milliseconds(TICK_MS as i64), move || {
                tick(&lks, &intq);
            });
        LineClock { _timer: timer, guard: Some(guard) }
    }

    pub fn stop(&mut self) {
        self.guard.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_sets_status_and_interrupts_when_enabled() {
        let lks = AtomicU16::new(0);
        let q = InterruptQueue::new();
        tick(&lks, &q);
        assert_eq!(lks.load(Ordering::SeqCst), 1 << 7);
        assert!(q.take().is_none());

        lks.store(1 << 6, Ordering::SeqCst);
        tick(&lks, &q);
        let p = q.take().unwrap();
        assert_eq!((p.vec, p.pri), (INT_CLOCK, 6));
    }

    #[test]
    fn schedule_fires_until_stopped() {
        let lks = Arc::new(AtomicU16::new(0));
        let q = InterruptQueue::new();
        let mut clock = LineClock::start(Arc::clone(&lks), q.clone());
        std::thread::sleep(std::time::Duration::from_millis(100));
        assert_ne!(lks.load(Ordering::SeqCst) & (1 << 7), 0);

        clock.stop();
        // let any tick already in flight land before listening for silence
        std::thread::sleep(std::time::Duration::from_millis(50));
        lks.store(0, Ordering::SeqCst);
        std::thread::sleep(std::time::Duration::from_millis(100));
        assert_eq!(lks.load(Ordering::SeqCst), 0);
    }
}
