//! Operation phases and the network event bus.
//!
//! Every orchestrated operation walks a small state machine per link:
//!
//! ```text
//! create/update: absent -> created -> addressed -> reconciled
//!                                  \-> failed -> resetting -> reset
//!                                                          \-> reset-failed
//! delete:        present -> unlinked -> rule-deleted -> gone
//! ```
//!
//! Transitions are published on an [`EventBus`] so callers (and tests) can
//! observe how far an operation got before it failed.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Per-link operation phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationPhase {
    /// The link does not exist yet.
    Absent,
    /// The structural change was made (link created, or located for update).
    Created,
    /// Addresses (and slaves) were applied.
    Addressed,
    /// Final state re-read; terminal success.
    Reconciled,
    /// A step failed.
    Failed,
    /// Rolling back to the saved configuration.
    Resetting,
    /// Rollback succeeded; terminal failure with the host restored.
    Reset,
    /// Rollback failed; terminal fatal, host state unknown.
    ResetFailed,
    /// The link exists (start of a delete).
    Present,
    /// Slaves and masters were detached.
    Unlinked,
    /// Associated traffic rules were removed.
    RuleDeleted,
    /// The link was deleted; terminal success.
    Gone,
}

impl OperationPhase {
    /// Returns true if `next` is a legal successor of this phase.
    #[must_use]
    pub const fn can_transition(&self, next: Self) -> bool {
        use OperationPhase::{
            Absent, Addressed, Created, Failed, Gone, Present, Reconciled, Reset, ResetFailed,
            Resetting, RuleDeleted, Unlinked,
        };
        matches!(
            (self, next),
            (Absent, Created)
                | (Created, Addressed)
                | (Addressed, Reconciled)
                | (Absent | Created | Addressed | Present | Unlinked | RuleDeleted, Failed)
                | (Failed, Resetting)
                | (Resetting, Reset | ResetFailed)
                | (Present, Unlinked | RuleDeleted | Gone)
                | (Unlinked, RuleDeleted | Gone)
                | (RuleDeleted, Unlinked | Gone)
        )
    }

    /// Returns true if no further transition is possible.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Reconciled | Self::Reset | Self::ResetFailed | Self::Gone
        )
    }
}

impl std::fmt::Display for OperationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Absent => write!(f, "absent"),
            Self::Created => write!(f, "created"),
            Self::Addressed => write!(f, "addressed"),
            Self::Reconciled => write!(f, "reconciled"),
            Self::Failed => write!(f, "failed"),
            Self::Resetting => write!(f, "resetting"),
            Self::Reset => write!(f, "reset"),
            Self::ResetFailed => write!(f, "reset-failed"),
            Self::Present => write!(f, "present"),
            Self::Unlinked => write!(f, "unlinked"),
            Self::RuleDeleted => write!(f, "rule-deleted"),
            Self::Gone => write!(f, "gone"),
        }
    }
}

/// Host network events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkEvent {
    /// A link moved between operation phases.
    Transition {
        /// Operation name, e.g. `create_vlan`.
        operation: String,
        /// Link the operation acts on.
        link: String,
        /// Previous phase.
        from: OperationPhase,
        /// New phase.
        to: OperationPhase,
    },
    /// Compensation failed; the host needs operator attention.
    FatalDivergence {
        /// Operation name.
        operation: String,
        /// Link the operation acted on.
        link: String,
        /// Rendered error chain.
        error: String,
    },
    /// The configuration was saved.
    ConfigurationSaved,
    /// The saved configuration was re-applied.
    ChangesReset,
    /// The backup configuration was applied.
    BackupRestored,
}

/// Event bus for host network events.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<NetworkEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self { sender }
    }
}

impl EventBus {
    /// Create a new event bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.sender.subscribe()
    }

    /// Publish an event.
    pub fn publish(&self, event: NetworkEvent) {
        // Ignore SendError (no subscribers)
        let _ = self.sender.send(event);
    }
}

/// Tracks one link through an operation and publishes its transitions.
#[derive(Debug)]
pub struct PhaseTracker {
    operation: &'static str,
    link: String,
    phase: OperationPhase,
    mutated: bool,
    bus: EventBus,
}

impl PhaseTracker {
    /// Start tracking `link` in `initial` phase.
    pub fn new(
        bus: &EventBus,
        operation: &'static str,
        link: impl Into<String>,
        initial: OperationPhase,
    ) -> Self {
        Self {
            operation,
            link: link.into(),
            phase: initial,
            mutated: false,
            bus: bus.clone(),
        }
    }

    /// Current phase.
    #[must_use]
    pub const fn phase(&self) -> OperationPhase {
        self.phase
    }

    /// Note that the host was changed by this operation.
    pub fn record_mutation(&mut self) {
        self.mutated = true;
    }

    /// Returns true once any host mutation succeeded.
    #[must_use]
    pub const fn has_mutated(&self) -> bool {
        self.mutated
    }

    /// Link name being tracked.
    #[must_use]
    pub fn link(&self) -> &str {
        &self.link
    }

    /// Rename the tracked link (e.g. once the kernel-visible name is known).
    pub fn set_link(&mut self, link: impl Into<String>) {
        self.link = link.into();
    }

    /// Move to `next`.
    ///
    /// Illegal transitions are logged and ignored, leaving the phase as is.
    pub fn advance(&mut self, next: OperationPhase) {
        if !self.phase.can_transition(next) {
            tracing::warn!(
                operation = self.operation,
                link = %self.link,
                from = %self.phase,
                to = %next,
                "Ignoring illegal phase transition"
            );
            return;
        }
        tracing::debug!(
            operation = self.operation,
            link = %self.link,
            from = %self.phase,
            to = %next,
            "Phase transition"
        );
        self.bus.publish(NetworkEvent::Transition {
            operation: self.operation.to_string(),
            link: self.link.clone(),
            from: self.phase,
            to: next,
        });
        self.phase = next;
    }

    /// Publish a fatal divergence for the tracked link.
    pub fn fatal(&self, error: &rol_common::RolError) {
        self.bus.publish(NetworkEvent::FatalDivergence {
            operation: self.operation.to_string(),
            link: self.link.clone(),
            error: error.to_string(),
        });
    }
}
