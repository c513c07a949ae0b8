//! One-shot timers keyed by purpose
//!
//! At most one timer per purpose exists. Scheduling a purpose again aborts
//! the previous timer, and every timer carries a token so a fire that was
//! already queued when its timer got replaced can be recognised and dropped
//! with [`Scheduler::claim`].

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Delivered on the scheduler's channel when a timer elapses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerFired<P> {
    pub purpose: P,
    pub token: u64,
}

struct Armed {
    token: u64,
    task: JoinHandle<()>,
}

pub struct Scheduler<P> {
    tx: mpsc::UnboundedSender<TimerFired<P>>,
    timers: HashMap<P, Armed>,
    next_token: u64,
}

impl<P> Scheduler<P>
where
    P: Clone + Eq + Hash + Send + 'static,
{
    /// Create a scheduler and the receiver its fires arrive on.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TimerFired<P>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                timers: HashMap::new(),
                next_token: 0,
            },
            rx,
        )
    }

    /// Arm `purpose` to fire once after `delay`, replacing any timer already
    /// armed for it.
    pub fn schedule_once(&mut self, purpose: P, delay: Duration) {
        self.cancel(&purpose);

        self.next_token += 1;
        let token = self.next_token;
        let tx = self.tx.clone();
        let fired = TimerFired {
            purpose: purpose.clone(),
            token,
        };
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(fired);
        });
        self.timers.insert(purpose, Armed { token, task });
    }

    /// Disarm `purpose`. Returns whether a timer was armed.
    pub fn cancel(&mut self, purpose: &P) -> bool {
        match self.timers.remove(purpose) {
            Some(armed) => {
                armed.task.abort();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, armed) in self.timers.drain() {
            armed.task.abort();
        }
    }

    /// Disarm every purpose matching `pred`.
    pub fn cancel_where<F>(&mut self, mut pred: F)
    where
        F: FnMut(&P) -> bool,
    {
        let doomed: Vec<P> = self.timers.keys().filter(|p| pred(p)).cloned().collect();
        for purpose in doomed {
            self.cancel(&purpose);
        }
    }

    pub fn is_armed(&self, purpose: &P) -> bool {
        self.timers.contains_key(purpose)
    }

    pub fn armed_count(&self) -> usize {
        self.timers.len()
    }

    /// Accept a fire if it belongs to the currently armed timer for its
    /// purpose, disarming it. Stale fires return `false`.
    pub fn claim(&mut self, fired: &TimerFired<P>) -> bool {
        match self.timers.get(&fired.purpose) {
            Some(armed) if armed.token == fired.token => {
                self.timers.remove(&fired.purpose);
                true
            }
            _ => false,
        }
    }
}

impl<P> Drop for Scheduler<P> {
    fn drop(&mut self) {
        for (_, armed) in self.timers.drain() {
            armed.task.abort();
        }
    }
}
