//! Incoming call presentation.
//!
//! A [`RingController`] shows one incoming call for a bounded time. Declining
//! and letting the countdown run out are the same outcome from the caller's
//! point of view and produce the same missed-call notification, once.

use crate::collaborators::{Notification, NotificationService, RingAlert};
use crate::config::CallConfig;
use crate::error::CallError;
use crate::negotiator::{CallDependencies, CallNegotiator};
use callcore::ring::{Ring, RingOutcome};
use callcore::state::Role;
use callcore::types::{CallId, ParticipantId};
use log::{info, warn};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// An announced call waiting for the callee's decision.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingCall {
    pub call_id: CallId,
    pub caller_id: ParticipantId,
    pub callee_id: ParticipantId,
    pub caller_name: String,
    pub caller_avatar: Option<String>,
}

impl IncomingCall {
    /// Builds the incoming call from a `call` notification addressed to
    /// `callee`. Other notifications yield `None`.
    pub fn from_notification(
        callee: ParticipantId,
        caller: ParticipantId,
        notification: &Notification,
    ) -> Option<Self> {
        match notification {
            Notification::Call {
                call_id,
                caller_name,
                caller_avatar,
            } => Some(Self {
                call_id: call_id.clone(),
                caller_id: caller,
                callee_id: callee,
                caller_name: caller_name.clone(),
                caller_avatar: caller_avatar.clone(),
            }),
            Notification::CallEnded { .. } => None,
        }
    }
}

struct RingState {
    ring: Ring,
    /// Discarded once the ring resolves.
    incoming: Option<IncomingCall>,
    countdown: Option<JoinHandle<()>>,
}

pub struct RingController {
    state: Mutex<RingState>,
    remaining_tx: watch::Sender<u32>,
    outcome_tx: watch::Sender<Option<RingOutcome>>,
    notifications: Arc<dyn NotificationService>,
    alert: Arc<dyn RingAlert>,
}

impl RingController {
    /// Starts ringing: the alert sounds and the countdown begins.
    pub fn ring(
        incoming: IncomingCall,
        notifications: Arc<dyn NotificationService>,
        alert: Arc<dyn RingAlert>,
        config: &CallConfig,
    ) -> Arc<Self> {
        let timeout_secs = u32::try_from(config.ring_timeout.as_secs()).unwrap_or(u32::MAX);
        let (remaining_tx, _) = watch::channel(timeout_secs);
        let (outcome_tx, _) = watch::channel(None);

        info!(
            target: "Call/Ring",
            "Incoming call {} from {} ({timeout_secs}s to answer)",
            incoming.call_id,
            incoming.caller_id
        );
        let controller = Arc::new(Self {
            state: Mutex::new(RingState {
                ring: Ring::new(timeout_secs),
                incoming: Some(incoming),
                countdown: None,
            }),
            remaining_tx,
            outcome_tx,
            notifications,
            alert,
        });
        controller.alert.start();

        let countdown = spawn_countdown(Arc::downgrade(&controller), config.ring_tick);
        controller.state.lock().unwrap().countdown = Some(countdown);
        controller
    }

    /// Seconds left before the call is auto-declined.
    pub fn remaining(&self) -> watch::Receiver<u32> {
        self.remaining_tx.subscribe()
    }

    pub fn outcome(&self) -> Option<RingOutcome> {
        *self.outcome_tx.borrow()
    }

    pub fn watch_outcome(&self) -> watch::Receiver<Option<RingOutcome>> {
        self.outcome_tx.subscribe()
    }

    pub fn incoming(&self) -> Option<IncomingCall> {
        self.state.lock().unwrap().incoming.clone()
    }

    /// Answers the call and hands it to a responder-side negotiator.
    pub fn accept(
        &self,
        deps: CallDependencies,
        config: CallConfig,
    ) -> Result<CallNegotiator, CallError> {
        let incoming = {
            let mut state = self.state.lock().unwrap();
            state.ring.answer()?;
            if let Some(countdown) = state.countdown.take() {
                countdown.abort();
            }
            state.incoming.take().ok_or(CallError::Ended)?
        };
        self.alert.stop();
        self.outcome_tx.send_replace(Some(RingOutcome::Answered));
        info!(target: "Call/Ring", "Answered call {}", incoming.call_id);

        Ok(CallNegotiator::start(
            incoming.callee_id,
            incoming.caller_id,
            Role::Responder,
            deps,
            config,
        ))
    }

    pub async fn decline(&self) -> Result<(), CallError> {
        let incoming = {
            let mut state = self.state.lock().unwrap();
            state.ring.decline()?;
            if let Some(countdown) = state.countdown.take() {
                countdown.abort();
            }
            state.incoming.take()
        };
        info!(target: "Call/Ring", "Declined incoming call");
        self.missed(RingOutcome::Declined, incoming).await;
        Ok(())
    }

    fn tick(&self) -> Option<(RingOutcome, Option<IncomingCall>)> {
        let mut state = self.state.lock().unwrap();
        let outcome = state.ring.tick();
        self.remaining_tx.send_replace(state.ring.remaining_secs());
        let outcome = outcome?;
        // The countdown task is the caller; detach rather than abort it.
        state.countdown.take();
        Some((outcome, state.incoming.take()))
    }

    /// Shared by decline and timeout.
    async fn missed(&self, outcome: RingOutcome, incoming: Option<IncomingCall>) {
        self.alert.stop();
        self.outcome_tx.send_replace(Some(outcome));

        let Some(incoming) = incoming else {
            return;
        };
        if !outcome.notifies_caller() {
            return;
        }
        let notification = Notification::CallEnded {
            duration_seconds: 0,
            missed: true,
        };
        if let Err(e) = self
            .notifications
            .notify(&incoming.caller_id, &incoming.callee_id, notification)
            .await
        {
            warn!(
                target: "Call/Ring",
                "Failed to notify {} of missed call: {e:?}",
                incoming.caller_id
            );
        }
    }
}

impl Drop for RingController {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock()
            && let Some(countdown) = state.countdown.take()
        {
            countdown.abort();
        }
    }
}

fn spawn_countdown(controller: Weak<RingController>, tick: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + tick, tick);
        loop {
            interval.tick().await;
            let Some(controller) = controller.upgrade() else {
                return;
            };
            if let Some((outcome, incoming)) = controller.tick() {
                info!(target: "Call/Ring", "Incoming call timed out");
                controller.missed(outcome, incoming).await;
                return;
            }
        }
    })
}
