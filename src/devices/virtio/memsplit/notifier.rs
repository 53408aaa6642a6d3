//! Deferred guest notifications.
//!
//! Timers are plain data polled by whoever owns the device: [`Notifier::expire`]
//! hands back the targets that are due and forgets them. Nothing here holds a
//! reference to a request or to the device, so dropping the notifier (or
//! calling [`Notifier::shutdown`]) is all teardown needs.

use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::devices::virtio::InterruptKind;

/// What a timer signals when it fires.
pub type NotifyTarget = InterruptKind;

/// Handle to a scheduled notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

#[derive(Debug)]
struct PendingNotification {
    id: TimerId,
    deadline: Instant,
    target: NotifyTarget,
}

#[derive(Debug, Default)]
pub struct Notifier {
    /// Sorted by deadline, then by scheduling order.
    pending: Vec<PendingNotification>,
    heartbeat: Option<TimerId>,
    next_id: u64,
    shut_down: bool,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `target` to fire `delay` after `now`.
    ///
    /// Returns `None` once the notifier has been shut down.
    pub fn schedule(&mut self, now: Instant, delay: Duration, target: NotifyTarget) -> Option<TimerId> {
        if self.shut_down {
            debug!("notifier: refusing {:?} after shutdown", target);
            return None;
        }

        let id = TimerId(self.next_id);
        self.next_id += 1;
        let deadline = now + delay;

        let pos = self.pending.partition_point(|p| p.deadline <= deadline);
        self.pending.insert(
            pos,
            PendingNotification {
                id,
                deadline,
                target,
            },
        );
        trace!("notifier: {:?} scheduled as {:?} in {:?}", target, id, delay);
        Some(id)
    }

    /// Cancel a pending notification. Returns whether it was still pending.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        if self.heartbeat == Some(id) {
            self.heartbeat = None;
        }
        match self.pending.iter().position(|p| p.id == id) {
            Some(pos) => {
                self.pending.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Arm the configuration-change heartbeat, replacing any armed one.
    pub fn arm_heartbeat(&mut self, now: Instant, period: Duration) -> Option<TimerId> {
        if let Some(old) = self.heartbeat.take() {
            self.cancel(old);
        }
        self.heartbeat = self.schedule(now, period, InterruptKind::ConfigChange);
        self.heartbeat
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.first().map(|p| p.deadline)
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Remove and return every target due at `now`, earliest first.
    pub fn expire(&mut self, now: Instant) -> Vec<NotifyTarget> {
        let due = self.pending.partition_point(|p| p.deadline <= now);
        self.pending
            .drain(..due)
            .map(|p| {
                if self.heartbeat == Some(p.id) {
                    self.heartbeat = None;
                }
                p.target
            })
            .collect()
    }

    /// Drop pending queue notifications, keeping the heartbeat.
    pub fn cancel_queue_notifications(&mut self) -> usize {
        let before = self.pending.len();
        self.pending
            .retain(|p| !matches!(p.target, InterruptKind::Queue(_)));
        before - self.pending.len()
    }

    /// Cancel everything and refuse later schedules.
    pub fn shutdown(&mut self) {
        if !self.pending.is_empty() {
            debug!("notifier: dropping {} pending timers", self.pending.len());
        }
        self.pending.clear();
        self.heartbeat = None;
        self.shut_down = true;
    }
}
