// src/timeout.rs
//
// Handshake timeout slot.
//
// A single slot holding at most one timer, owned by the state machine. The
// timer fires exactly one TIMEOUT event into the control queue. A fired or
// cancelled slot can be re-armed; a live slot is modified, never duplicated.

use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

use crate::events::Event;

pub struct TimeoutSlot {
    tx: UnboundedSender<Event>,
    handle: Option<JoinHandle<()>>,
}

impl TimeoutSlot {
    pub fn new(tx: UnboundedSender<Event>) -> Self {
        Self { tx, handle: None }
    }

    /// Arm the slot. No-op if a timer is already outstanding; remove it
    /// first or use `modify`.
    pub fn create(&mut self, seconds: u64) {
        if self.is_armed() {
            return;
        }
        self.spawn(seconds);
    }

    /// Re-arm the slot, replacing any outstanding timer.
    pub fn modify(&mut self, seconds: u64) {
        self.cancel_task();
        self.spawn(seconds);
    }

    /// Cancel the outstanding timer, if any.
    pub fn remove(&mut self) {
        self.cancel_task();
    }

    /// Whether a timer is outstanding (armed and not yet fired).
    pub fn is_armed(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }

    fn spawn(&mut self, seconds: u64) {
        let tx = self.tx.clone();
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(seconds)).await;
            let _ = tx.send(Event::Timeout);
        }));
    }

    fn cancel_task(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for TimeoutSlot {
    fn drop(&mut self) {
        self.cancel_task();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test(start_paused = true)]
    async fn test_fires_single_timeout_event() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut slot = TimeoutSlot::new(tx);

        slot.create(5);
        assert!(slot.is_armed());

        assert_eq!(rx.recv().await, Some(Event::Timeout));
        assert!(!slot.is_armed());

        // Exactly one event
        let extra = tokio::time::timeout(Duration::from_secs(30), rx.recv()).await;
        assert!(extra.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_is_noop_while_armed() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut slot = TimeoutSlot::new(tx);

        slot.create(60);
        // A second create must not shorten the outstanding timer
        slot.create(1);

        let early = tokio::time::timeout(Duration::from_secs(30), rx.recv()).await;
        assert!(early.is_err());
        assert_eq!(rx.recv().await, Some(Event::Timeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_modify_rearms() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut slot = TimeoutSlot::new(tx);

        slot.create(60);
        slot.modify(5);

        // Fires at the modified deadline, once
        assert_eq!(rx.recv().await, Some(Event::Timeout));
        let extra = tokio::time::timeout(Duration::from_secs(120), rx.recv()).await;
        assert!(extra.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_cancels() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut slot = TimeoutSlot::new(tx);

        slot.create(5);
        slot.remove();
        assert!(!slot.is_armed());

        let fired = tokio::time::timeout(Duration::from_secs(30), rx.recv()).await;
        assert!(fired.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_after_fire() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut slot = TimeoutSlot::new(tx);

        slot.create(1);
        assert_eq!(rx.recv().await, Some(Event::Timeout));

        // The fired slot is free again
        slot.create(1);
        assert_eq!(rx.recv().await, Some(Event::Timeout));
    }
}
