//! Async drivers that run the state machines over a [`Transport`]
//!
//! A driver owns one machine. It feeds validated inbound messages and
//! completed side effects back into the machine as events, one at a time.
//! Every spawned task is tagged with the driver's epoch; reset and cancel
//! bump the epoch so that late completions are dropped instead of reaching
//! a machine that has moved on.

mod coordinator;
mod participant;

pub use coordinator::{CoordinatorDriver, SigningOutcome};
pub use participant::{ParticipantDriver, ParticipantOutcome};

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::participant::ApprovalRequest;
use crate::transport::{async_trait, InboundMessage, Transport};
use crate::types::{SessionId, TimerId, TimerKind};
use crate::validation::ValidationError;

/// Human-in-the-loop gate consulted before a participant signs
#[async_trait]
pub trait Approver: Send + Sync {
    /// Return `true` to produce a signature share for `request`
    async fn approve(&self, request: &ApprovalRequest) -> bool;
}

/// Approver that always gives the same answer; for unattended runs and tests
#[derive(Debug, Clone, Copy)]
pub struct FixedApprover(pub bool);

#[async_trait]
impl Approver for FixedApprover {
    async fn approve(&self, _request: &ApprovalRequest) -> bool {
        self.0
    }
}

/// Something that woke the driver loop
pub(crate) enum Wakeup<E> {
    Event(E),
    Inbound(InboundMessage),
}

/// Spawned work of one driver, tagged with the epoch it was started in
pub(crate) struct TaskScope<E> {
    epoch: u64,
    tx: mpsc::UnboundedSender<(u64, Wakeup<E>)>,
    rx: mpsc::UnboundedReceiver<(u64, Wakeup<E>)>,
    poller: Option<(watch::Sender<bool>, JoinHandle<()>)>,
    timers: HashMap<TimerKind, JoinHandle<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl<E: Send + 'static> TaskScope<E> {
    pub(crate) fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            epoch: 0,
            tx,
            rx,
            poller: None,
            timers: HashMap::new(),
            tasks: Vec::new(),
        }
    }

    /// Run `task` and deliver its event unless the epoch moved on meanwhile
    pub(crate) fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = E> + Send + 'static,
    {
        let tx = self.tx.clone();
        let epoch = self.epoch;
        self.tasks.retain(|handle| !handle.is_finished());
        self.tasks.push(tokio::spawn(async move {
            let event = task.await;
            let _ = tx.send((epoch, Wakeup::Event(event)));
        }));
    }

    pub(crate) fn start_timer(&mut self, timer: TimerId, duration: Duration, event: E) {
        let tx = self.tx.clone();
        let epoch = self.epoch;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = tx.send((epoch, Wakeup::Event(event)));
        });
        if let Some(previous) = self.timers.insert(timer.kind, handle) {
            previous.abort();
        }
    }

    pub(crate) fn cancel_timer(&mut self, kind: TimerKind) {
        if let Some(handle) = self.timers.remove(&kind) {
            handle.abort();
        }
    }

    /// Poll `session_id` every `interval` until stopped
    pub(crate) fn start_polling(
        &mut self,
        transport: Arc<dyn Transport>,
        session_id: SessionId,
        as_coordinator: bool,
        interval: Duration,
    ) {
        self.stop_polling();
        let tx = self.tx.clone();
        let epoch = self.epoch;
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                match transport.receive(session_id, as_coordinator).await {
                    Ok(messages) => {
                        for message in messages {
                            if tx.send((epoch, Wakeup::Inbound(message))).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => debug!(%session_id, error = %e, "Poll failed"),
                }

                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        });
        self.poller = Some((shutdown_tx, handle));
    }

    pub(crate) fn stop_polling(&mut self) {
        if let Some((shutdown, handle)) = self.poller.take() {
            let _ = shutdown.send(true);
            handle.abort();
        }
    }

    /// Next wakeup of the current epoch
    pub(crate) async fn next(&mut self) -> Option<Wakeup<E>> {
        loop {
            let (epoch, wakeup) = self.rx.recv().await?;
            if epoch == self.epoch {
                return Some(wakeup);
            }
            debug!(epoch, current = self.epoch, "Discarding stale completion");
        }
    }

    /// Next already-queued wakeup of the current epoch, without waiting
    pub(crate) fn try_next(&mut self) -> Option<Wakeup<E>> {
        while let Ok((epoch, wakeup)) = self.rx.try_recv() {
            if epoch == self.epoch {
                return Some(wakeup);
            }
        }
        None
    }

    /// Abandon all outstanding work and start a new epoch
    pub(crate) fn invalidate(&mut self) {
        self.epoch += 1;
        self.stop_polling();
        for (_, handle) in self.timers.drain() {
            handle.abort();
        }
        for handle in self.tasks.drain(..) {
            handle.abort();
        }
    }
}

impl<E> Drop for TaskScope<E> {
    fn drop(&mut self) {
        if let Some((shutdown, handle)) = self.poller.take() {
            let _ = shutdown.send(true);
            handle.abort();
        }
        for (_, handle) in self.timers.drain() {
            handle.abort();
        }
        for handle in self.tasks.drain(..) {
            handle.abort();
        }
    }
}

/// Log a rejected inbound message at the level its code deserves
pub(crate) fn log_rejection(error: &ValidationError) {
    if error.is_retryable() {
        debug!(code = %error.code, message = %error.message, "Inbound message rejected");
    } else {
        warn!(code = %error.code, message = %error.message, "Inbound message rejected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stale_completions_are_dropped() {
        let mut scope: TaskScope<u32> = TaskScope::new();
        scope.spawn(async { 1 });
        scope.invalidate();
        scope.spawn(async { 2 });

        match scope.next().await {
            Some(Wakeup::Event(value)) => assert_eq!(value, 2),
            _ => panic!("expected an event"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_timer_never_fires() {
        let mut scope: TaskScope<&'static str> = TaskScope::new();
        let timer = TimerId {
            kind: TimerKind::Round,
            epoch: 1,
        };
        scope.start_timer(timer, Duration::from_millis(10), "round");
        scope.cancel_timer(TimerKind::Round);
        scope.start_timer(
            TimerId {
                kind: TimerKind::Session,
                epoch: 2,
            },
            Duration::from_millis(30),
            "session",
        );

        match scope.next().await {
            Some(Wakeup::Event(value)) => assert_eq!(value, "session"),
            _ => panic!("expected an event"),
        }
    }

    #[tokio::test]
    async fn test_fixed_approver() {
        let request = ApprovalRequest {
            session_id: uuid::Uuid::new_v4(),
            attempt_id: uuid::Uuid::new_v4(),
            message: b"m".to_vec(),
            signer_ids: vec![1, 2],
            coordinator: crate::PeerKey::new([0; 32]),
        };
        assert!(FixedApprover(true).approve(&request).await);
        assert!(!FixedApprover(false).approve(&request).await);
    }
}
