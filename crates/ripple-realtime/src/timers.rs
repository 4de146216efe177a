//! One-shot timers that report back into the engine inbox.
//!
//! Every timer carries a generation. Cancelling aborts the sleeping task, but
//! a task that already posted its firing cannot be recalled; the owner checks
//! the generation with [`TimerSlot::claim`] and ignores stale firings.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::engine::Input;
use crate::transport::TransportId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TimerOwner {
    /// Bounds the connecting and closing states.
    Transition,
    /// Moves a long-disconnected connection to suspended.
    Suspend,
    /// Reconnect from disconnected or suspended.
    Retry,
    /// No inbound activity on a transport.
    Idle(TransportId),
    Ping(String),
    ChannelState(String),
    ChannelRetry(String),
}

#[derive(Debug)]
pub(crate) struct TimerFired {
    pub owner: TimerOwner,
    pub generation: u64,
}

/// Handle to the engine inbox for timers and background work.
#[derive(Clone)]
pub(crate) struct Scheduler {
    inbox: mpsc::UnboundedSender<Input>,
    generation: Arc<AtomicU64>,
}

impl Scheduler {
    pub fn new(inbox: mpsc::UnboundedSender<Input>) -> Self {
        Self {
            inbox,
            generation: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn start(&self, owner: TimerOwner, after: Duration) -> Timer {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let inbox = self.inbox.clone();
        let deadline = tokio::time::Instant::now() + after;
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let _ = inbox.send(Input::Timer(TimerFired { owner, generation }));
        });
        Timer { generation, handle }
    }

    /// Run `work` in the background and post its result as an input.
    pub fn spawn<F>(&self, work: F)
    where
        F: std::future::Future<Output = Input> + Send + 'static,
    {
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            let input = work.await;
            let _ = inbox.send(input);
        });
    }

    pub fn inbox(&self) -> &mpsc::UnboundedSender<Input> {
        &self.inbox
    }
}

pub(crate) struct Timer {
    generation: u64,
    handle: JoinHandle<()>,
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// At most one running timer.
#[derive(Default)]
pub(crate) struct TimerSlot(Option<Timer>);

impl TimerSlot {
    /// Start a timer, replacing any running one.
    pub fn start(&mut self, scheduler: &Scheduler, owner: TimerOwner, after: Duration) {
        self.0 = Some(scheduler.start(owner, after));
    }

    pub fn start_if_idle(&mut self, scheduler: &Scheduler, owner: TimerOwner, after: Duration) {
        if self.0.is_none() {
            self.start(scheduler, owner, after);
        }
    }

    pub fn cancel(&mut self) -> bool {
        self.0.take().is_some()
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        self.0.is_some()
    }

    /// True if `generation` is the running timer; the slot is then empty.
    pub fn claim(&mut self, generation: u64) -> bool {
        match &self.0 {
            Some(timer) if timer.generation == generation => {
                self.0 = None;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fires_after_delay_with_generation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scheduler = Scheduler::new(tx);
        let mut slot = TimerSlot::default();
        slot.start(&scheduler, TimerOwner::Retry, Duration::from_secs(5));

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(2)).await;
        match rx.try_recv() {
            Ok(Input::Timer(fired)) => {
                assert_eq!(fired.owner, TimerOwner::Retry);
                assert!(slot.claim(fired.generation));
                assert!(!slot.is_running());
            }
            _ => panic!("expected timer firing"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scheduler = Scheduler::new(tx);
        let mut slot = TimerSlot::default();
        slot.start(&scheduler, TimerOwner::Suspend, Duration::from_secs(1));
        assert!(slot.cancel());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn replaced_timer_is_stale() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let scheduler = Scheduler::new(tx);
        let mut slot = TimerSlot::default();
        slot.start(&scheduler, TimerOwner::Transition, Duration::from_secs(1));
        let stale = scheduler.start(TimerOwner::Transition, Duration::from_secs(1)).generation;
        slot.start(&scheduler, TimerOwner::Transition, Duration::from_secs(3));

        assert!(!slot.claim(stale));
        tokio::time::sleep(Duration::from_secs(4)).await;
        let mut claimed = 0;
        while let Ok(Input::Timer(fired)) = rx.try_recv() {
            if slot.claim(fired.generation) {
                claimed += 1;
            }
        }
        assert_eq!(claimed, 1);
    }
}
