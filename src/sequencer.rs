// Print ejection state machine.
//
// Idle -> Flashing -> Pending -> Ejecting -> (committed) -> Idle
//
// The sequencer only tracks state and deadlines; timers and ticks are
// driven from outside (see `booth`), which keeps it testable without time.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::entry::PrintEntry;

/// Paint ticks to wait after Pending before motion starts.
pub const FRAMES_BEFORE_EJECT: u8 = 2;

/// Travel of the print at the end of ejection, as a percentage of its height.
pub const EJECT_TRAVEL_PERCENT: f32 = 115.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PrintPhase {
    Idle,
    Flashing,
    Pending,
    Ejecting,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid print transition from {from:?}: {action}")]
pub struct TransitionError {
    pub from: PrintPhase,
    pub action: &'static str,
}

/// The single in-flight print owned by the sequencer.
#[derive(Debug, Clone)]
pub struct PendingPrint {
    pub entry: PrintEntry,
    pub captured_local: DateTime<Local>,
    pub pending_since: Instant,
}

#[derive(Debug, Clone)]
enum PrintState {
    Idle,
    Flashing,
    Pending { print: PendingPrint, frames: u8 },
    Ejecting { print: PendingPrint, started_at: Instant },
}

#[derive(Debug)]
pub struct PrintSequencer {
    state: PrintState,
    eject_duration: Duration,
}

impl PrintSequencer {
    pub fn new(eject_duration: Duration) -> Self {
        Self {
            state: PrintState::Idle,
            eject_duration,
        }
    }

    pub fn phase(&self) -> PrintPhase {
        match self.state {
            PrintState::Idle => PrintPhase::Idle,
            PrintState::Flashing => PrintPhase::Flashing,
            PrintState::Pending { .. } => PrintPhase::Pending,
            PrintState::Ejecting { .. } => PrintPhase::Ejecting,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, PrintState::Idle)
    }

    pub fn eject_duration(&self) -> Duration {
        self.eject_duration
    }

    /// Admission control for the shutter. Only an idle sequencer admits.
    pub fn try_begin(&mut self) -> bool {
        if !self.is_idle() {
            return false;
        }
        self.state = PrintState::Flashing;
        true
    }

    /// Abandons a capture attempt that failed before producing a still.
    pub fn abort(&mut self) -> Result<(), TransitionError> {
        match self.state {
            PrintState::Flashing => {
                self.state = PrintState::Idle;
                Ok(())
            }
            _ => Err(self.invalid("abort")),
        }
    }

    pub fn hold(&mut self, print: PendingPrint) -> Result<Instant, TransitionError> {
        match self.state {
            PrintState::Flashing => {
                let deadline = print.pending_since + self.eject_duration;
                self.state = PrintState::Pending { print, frames: 0 };
                Ok(deadline)
            }
            _ => Err(self.invalid("hold")),
        }
    }

    /// Records a paint tick. Returns true when this tick starts the ejection.
    pub fn frame_tick(&mut self, at: Instant) -> bool {
        let PrintState::Pending { frames, .. } = &mut self.state else {
            return false;
        };
        *frames += 1;
        if *frames < FRAMES_BEFORE_EJECT {
            return false;
        }
        if let PrintState::Pending { print, .. } =
            std::mem::replace(&mut self.state, PrintState::Idle)
        {
            self.state = PrintState::Ejecting {
                print,
                started_at: at,
            };
        }
        true
    }

    pub fn pending(&self) -> Option<&PendingPrint> {
        match &self.state {
            PrintState::Pending { print, .. } | PrintState::Ejecting { print, .. } => Some(print),
            _ => None,
        }
    }

    pub fn commit_deadline(&self) -> Option<Instant> {
        self.pending()
            .map(|print| print.pending_since + self.eject_duration)
    }

    /// Hands the print over once its ejection delay has fully elapsed.
    pub fn commit(&mut self, at: Instant) -> Result<PendingPrint, TransitionError> {
        match self.commit_deadline() {
            Some(deadline) if at >= deadline => {}
            Some(_) => return Err(self.invalid("commit before deadline")),
            None => return Err(self.invalid("commit")),
        }

        match std::mem::replace(&mut self.state, PrintState::Idle) {
            PrintState::Pending { print, .. } | PrintState::Ejecting { print, .. } => Ok(print),
            other => {
                self.state = other;
                Err(self.invalid("commit"))
            }
        }
    }

    /// Linear ejection progress in `0.0..=1.0`; zero until motion starts.
    pub fn progress(&self, at: Instant) -> f32 {
        match &self.state {
            PrintState::Ejecting { started_at, .. } => {
                let elapsed = at.saturating_duration_since(*started_at);
                (elapsed.as_secs_f32() / self.eject_duration.as_secs_f32()).clamp(0.0, 1.0)
            }
            _ => 0.0,
        }
    }

    /// Vertical offset of the print, in percent of its own height.
    pub fn offset_percent(&self, at: Instant) -> f32 {
        self.progress(at) * EJECT_TRAVEL_PERCENT
    }

    fn invalid(&self, action: &'static str) -> TransitionError {
        TransitionError {
            from: self.phase(),
            action,
        }
    }
}
