use core::{
    future::{poll_fn, Future},
    task::Poll,
};

use atomic_waker::AtomicWaker;
use portable_atomic::{AtomicU8, AtomicUsize, Ordering};

/// A primitive for signaling completion of a single in-flight operation.
///
/// One of these exists per command slot and per one-shot firmware
/// notification the driver waits for. It is armed with [Self::reset] before
/// the operation is started, so a completion can never be consumed twice.
pub struct EventSignal {
    state: AtomicU8,
    waker: AtomicWaker,
}
impl EventSignal {
    const PENDING: u8 = 0;
    const COMPLETE: u8 = 1;
    /// Create a new event signal.
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(Self::PENDING),
            waker: AtomicWaker::new(),
        }
    }
    /// Re-arm the signal.
    pub fn reset(&self) {
        self.state.store(Self::PENDING, Ordering::Relaxed);
    }
    /// Mark the operation as complete and wake the waiter.
    pub fn signal(&self) {
        self.state.store(Self::COMPLETE, Ordering::Release);
        self.waker.wake();
    }
    /// Wait for the operation to complete.
    pub fn wait(&self) -> impl Future<Output = ()> + use<'_> {
        poll_fn(|cx| {
            if self.state.load(Ordering::Acquire) == Self::COMPLETE {
                self.reset();
                Poll::Ready(())
            } else {
                self.waker.register(cx.waker());
                Poll::Pending
            }
        })
    }
}

/// A synchronization primitive, which allows queueing a number signals, to be awaited.
pub struct SignalQueue {
    waker: AtomicWaker,
    queued_signals: AtomicUsize,
}
impl SignalQueue {
    pub const fn new() -> Self {
        Self {
            waker: AtomicWaker::new(),
            queued_signals: AtomicUsize::new(0),
        }
    }
    /// Increments the queue signals by one.
    pub fn put(&self) {
        self.queued_signals.fetch_add(1, Ordering::Relaxed);
        self.waker.wake();
    }
    /// Reset the amount of signals in the queue back to zero.
    pub fn reset(&self) {
        self.queued_signals.store(0, Ordering::Relaxed);
    }
    /// Asynchronously wait for the next signal.
    pub async fn next(&self) {
        poll_fn(|cx| {
            let queued_signals = self.queued_signals.load(Ordering::Relaxed);
            if queued_signals == 0 {
                self.waker.register(cx.waker());
                Poll::Pending
            } else {
                self.queued_signals
                    .store(queued_signals - 1, Ordering::Relaxed);
                Poll::Ready(())
            }
        })
        .await
    }
}

/// A drop guard, which executes the provided closure on drop.
pub struct DropGuard<F: FnMut()> {
    drop_closure: F,
}
impl<F: FnMut()> DropGuard<F> {
    #[inline]
    /// Create a new drop guard.
    pub const fn new(drop_closure: F) -> Self {
        Self { drop_closure }
    }
    #[inline]
    /// Defuse the drop guard.
    ///
    /// This will prevent the drop closure from being run.
    pub const fn defuse(self) {
        core::mem::forget(self);
    }
}
impl<F: FnMut()> Drop for DropGuard<F> {
    fn drop(&mut self) {
        (self.drop_closure)();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_futures::{block_on, join::join, yield_now};

    #[test]
    fn event_signal_wakes_waiter() {
        let signal = EventSignal::new();
        block_on(join(signal.wait(), async {
            yield_now().await;
            signal.signal();
        }));
        // Consumed on wake; must be pending again.
        assert_eq!(signal.state.load(Ordering::Relaxed), EventSignal::PENDING);
    }

    #[test]
    fn signal_queue_counts_pending_events() {
        let queue = SignalQueue::new();
        queue.put();
        queue.put();
        block_on(async {
            queue.next().await;
            queue.next().await;
        });
        assert_eq!(queue.queued_signals.load(Ordering::Relaxed), 0);
    }
}
