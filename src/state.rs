//! Client-side projection of a run's status stream.
//!
//! Pure and synchronous: the tracker feeds transport callbacks in, consumers
//! read the resulting [`TrackerState`] out.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    error::TrackerError,
    events::{parse_timestamp, RunStatus, Step, StatusEvent, WorkflowNode},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    #[default]
    Idle,
    Connecting,
    Open,
    /// A terminal status (or the end-of-stream marker) arrived.
    ClosedTerminal,
    /// The connection failed and the transport will not retry.
    ClosedError,
}

/// Outcome of applying one status event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Updated,
    Unchanged,
    /// The event moved the run into a terminal status; the caller must close
    /// the connection.
    Terminal,
    /// A terminal status was already seen; the event was discarded.
    Ignored,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrackerState {
    pub run_id: Option<String>,
    pub phase: Phase,
    pub status: Option<RunStatus>,
    pub node: Option<WorkflowNode>,
    pub message: Option<String>,
    pub completed_at: Option<String>,
    pub error_message: Option<String>,
    #[serde(rename = "isConnected")]
    pub is_connected: bool,
    #[serde(rename = "connectionError")]
    pub connection_error: Option<TrackerError>,
}

impl TrackerState {
    /// Fresh state for a new watch. Nothing from any earlier run survives.
    pub fn for_run(run_id: impl Into<String>) -> Self {
        Self { run_id: Some(run_id.into()), phase: Phase::Connecting, ..Self::default() }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_some_and(RunStatus::is_terminal)
    }

    pub fn completed_at_utc(&self) -> Option<DateTime<Utc>> {
        self.completed_at.as_deref().and_then(parse_timestamp)
    }

    /// Current stage position, for progress steppers.
    pub fn progress(&self) -> Option<Step> {
        self.node.as_ref().and_then(WorkflowNode::step)
    }

    /// Merges the fields present in `evt`. `status` always overwrites; absent
    /// optional fields keep their previous value.
    pub fn apply(&mut self, evt: &StatusEvent) -> Applied {
        if self.is_terminal() {
            return Applied::Ignored;
        }

        let before = self.clone();
        self.status = Some(evt.status);
        if let Some(node) = &evt.node {
            self.node = Some(node.clone());
        }
        if let Some(message) = &evt.message {
            self.message = Some(message.clone());
        }
        if let Some(at) = &evt.completed_at {
            self.completed_at = Some(at.clone());
        }
        if let Some(error) = &evt.error_message {
            self.error_message = Some(error.clone());
        }

        if evt.status.is_terminal() {
            self.is_connected = false;
            self.phase = Phase::ClosedTerminal;
            return Applied::Terminal;
        }
        if *self == before {
            Applied::Unchanged
        } else {
            Applied::Updated
        }
    }

    /// The transport (re)established its connection.
    pub fn opened(&mut self) {
        if self.phase == Phase::ClosedTerminal {
            return;
        }
        self.phase = Phase::Open;
        self.is_connected = true;
        self.connection_error = None;
    }

    /// Connection-level failure. Known status fields stay visible.
    pub fn connection_lost(&mut self, error: TrackerError, will_retry: bool) {
        if self.phase == Phase::ClosedTerminal {
            return;
        }
        self.is_connected = false;
        self.connection_error = Some(error);
        self.phase = if will_retry { Phase::Connecting } else { Phase::ClosedError };
    }

    /// A frame that could not be decoded. The connection stays up.
    pub fn malformed(&mut self, error: TrackerError) {
        if self.phase == Phase::ClosedTerminal {
            return;
        }
        self.connection_error = Some(error);
    }

    /// Explicit end-of-stream marker.
    pub fn ended(&mut self) {
        self.is_connected = false;
        self.phase = Phase::ClosedTerminal;
    }
}
