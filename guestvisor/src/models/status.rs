//! Guest lifecycle states and the legal transitions between them.

use guestvisor_shared::{GuestvisorError, GuestvisorResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a guest or one of its volumes.
///
/// Serialized as the plain lowercase name. A freshly constructed record has no
/// status at all (`None` in [`Lifecycle::status`]), which is the only state
/// `pending` can be entered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Creating,
    Starting,
    Running,
    Stopping,
    Stopped,
    Migrating,
    Resizing,
    Capturing,
    Captured,
    Destroying,
    Destroyed,
    Pausing,
    Paused,
    Resuming,
    Frozen,
    Thawed,
}

impl Status {
    pub const ALL: [Status; 17] = [
        Status::Pending,
        Status::Creating,
        Status::Starting,
        Status::Running,
        Status::Stopping,
        Status::Stopped,
        Status::Migrating,
        Status::Resizing,
        Status::Capturing,
        Status::Captured,
        Status::Destroying,
        Status::Destroyed,
        Status::Pausing,
        Status::Paused,
        Status::Resuming,
        Status::Frozen,
        Status::Thawed,
    ];

    /// States a record may be in immediately before entering `self`.
    ///
    /// `None` stands for the unset status of a record that was never saved.
    /// The match is exhaustive so a new variant has to be wired in here.
    pub fn predecessors(self) -> &'static [Option<Status>] {
        use Status::*;
        match self {
            Pending => &[None],
            Creating => &[Some(Pending)],
            Starting => &[Some(Stopped), Some(Creating)],
            Running => &[Some(Starting), Some(Resuming)],
            Stopping => &[Some(Running)],
            Stopped => &[Some(Stopping), Some(Migrating), Some(Captured)],
            Capturing => &[Some(Stopped)],
            Captured => &[Some(Capturing)],
            Migrating => &[Some(Stopped)],
            Resizing => &[Some(Stopped), Some(Running)],
            Pausing => &[Some(Running)],
            Paused => &[Some(Pausing)],
            Resuming => &[Some(Paused)],
            Destroying => &[Some(Stopped), Some(Destroyed)],
            Destroyed => &[Some(Destroying)],
            Frozen | Thawed => &[],
        }
    }

    pub fn as_str(self) -> &'static str {
        use Status::*;
        match self {
            Pending => "pending",
            Creating => "creating",
            Starting => "starting",
            Running => "running",
            Stopping => "stopping",
            Stopped => "stopped",
            Migrating => "migrating",
            Resizing => "resizing",
            Capturing => "capturing",
            Captured => "captured",
            Destroying => "destroying",
            Destroyed => "destroyed",
            Pausing => "pausing",
            Paused => "paused",
            Resuming => "resuming",
            Frozen => "frozen",
            Thawed => "thawed",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = GuestvisorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Status::ALL
            .iter()
            .copied()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| GuestvisorError::InvalidArgument(format!("unknown status: {:?}", s)))
    }
}

/// True when `next` may be entered from `current`.
pub fn can_forward(current: Option<Status>, next: Status) -> bool {
    current == Some(next) || next.predecessors().contains(&current)
}

fn display(status: Option<Status>) -> &'static str {
    status.map(Status::as_str).unwrap_or("")
}

/// Guarded status mutation shared by every stateful record.
///
/// Mutation is in memory only; persisting it is up to the caller.
pub trait Lifecycle {
    fn status(&self) -> Option<Status>;

    fn status_mut(&mut self) -> &mut Option<Status>;

    /// Move to `next`, failing unless the transition is legal or forced.
    fn set_status(&mut self, next: Status, force: bool) -> GuestvisorResult<()> {
        let current = self.status();
        if !force && !can_forward(current, next) {
            return Err(GuestvisorError::ForwardStatus {
                from: display(current).to_string(),
                to: next.to_string(),
            });
        }
        *self.status_mut() = Some(next);
        Ok(())
    }

    /// Whether `next` is reachable without changing anything.
    fn check_forward_status(&self, next: Status) -> bool {
        can_forward(self.status(), next)
    }
}
