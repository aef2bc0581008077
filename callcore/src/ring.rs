//! Incoming call countdown.

use crate::state::InvalidTransition;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RingStatus {
    Ringing,
    Answered,
    Declined,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RingOutcome {
    Answered,
    Declined,
    TimedOut,
}

impl RingOutcome {
    /// Declining and timing out both tell the caller the call was missed.
    pub fn notifies_caller(&self) -> bool {
        matches!(self, Self::Declined | Self::TimedOut)
    }
}

#[derive(Debug, Clone)]
pub struct Ring {
    remaining_secs: u32,
    status: RingStatus,
}

impl Ring {
    pub fn new(timeout_secs: u32) -> Self {
        Self {
            remaining_secs: timeout_secs,
            status: RingStatus::Ringing,
        }
    }

    pub fn remaining_secs(&self) -> u32 {
        self.remaining_secs
    }

    pub fn status(&self) -> RingStatus {
        self.status
    }

    /// Advance the countdown by one second. Returns the outcome exactly once,
    /// when the countdown reaches zero while still ringing.
    pub fn tick(&mut self) -> Option<RingOutcome> {
        if self.status != RingStatus::Ringing {
            return None;
        }
        self.remaining_secs = self.remaining_secs.saturating_sub(1);
        if self.remaining_secs == 0 {
            self.status = RingStatus::TimedOut;
            return Some(RingOutcome::TimedOut);
        }
        None
    }

    pub fn answer(&mut self) -> Result<RingOutcome, InvalidTransition> {
        self.resolve(RingStatus::Answered, RingOutcome::Answered)
    }

    pub fn decline(&mut self) -> Result<RingOutcome, InvalidTransition> {
        self.resolve(RingStatus::Declined, RingOutcome::Declined)
    }

    fn resolve(
        &mut self,
        status: RingStatus,
        outcome: RingOutcome,
    ) -> Result<RingOutcome, InvalidTransition> {
        if self.status != RingStatus::Ringing {
            return Err(InvalidTransition {
                current_state: format!("{:?}", self.status),
                attempted: format!("{outcome:?}"),
            });
        }
        self.status = status;
        Ok(outcome)
    }
}
