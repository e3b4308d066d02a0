//! Host lifecycle state machine.
//!
//! ```text
//! Created -> Started -> Initialized -> ShuttingDown -> Stopped
//!               \____________________________/^         ^
//!                \_____________________________________/
//! ```
//!
//! Transitions only move forward. The current state lives in a
//! `tokio::sync::watch` channel so transitions are atomic and observers
//! can wait for a state.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;

use super::control::{EXIT_METHOD, INITIALIZE_METHOD};
use crate::error::LifecycleError;
use crate::observability::metrics;

/// Host lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HostState {
    /// Constructed; handlers and services may be registered.
    Created,
    /// Transport and listener loop running; waiting for `initialize`.
    Started,
    /// `initialize` completed; all requests are served.
    Initialized,
    /// `shutdown` received; only `exit` is accepted.
    ShuttingDown,
    /// Terminal.
    Stopped,
}

impl HostState {
    /// Numeric value published on the lifecycle gauge.
    #[must_use]
    pub const fn gauge_value(self) -> f64 {
        match self {
            Self::Created => 0.0,
            Self::Started => 1.0,
            Self::Initialized => 2.0,
            Self::ShuttingDown => 3.0,
            Self::Stopped => 4.0,
        }
    }

    const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Created, Self::Started)
                | (Self::Started, Self::Initialized)
                | (Self::Started | Self::Initialized, Self::ShuttingDown)
                | (
                    Self::Created | Self::Started | Self::Initialized | Self::ShuttingDown,
                    Self::Stopped
                )
        )
    }
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Started => write!(f, "started"),
            Self::Initialized => write!(f, "initialized"),
            Self::ShuttingDown => write!(f, "shutting_down"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Owner of the host state plus the one-shot `initialize` claim.
#[derive(Debug)]
pub struct Lifecycle {
    state: watch::Sender<HostState>,
    initialize_claimed: AtomicBool,
}

impl Lifecycle {
    /// Creates a lifecycle in [`HostState::Created`].
    #[must_use]
    pub fn new() -> Self {
        let (state, _) = watch::channel(HostState::Created);
        Self {
            state,
            initialize_claimed: AtomicBool::new(false),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> HostState {
        *self.state.borrow()
    }

    /// Receiver that observes every transition.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<HostState> {
        self.state.subscribe()
    }

    /// Moves to `to` if the transition is allowed from the current state.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidTransition`] otherwise; the state
    /// is left unchanged.
    pub fn transition(&self, to: HostState) -> Result<HostState, LifecycleError> {
        let mut outcome = Err(LifecycleError::InvalidTransition {
            from: String::new(),
            to: to.to_string(),
        });
        self.state.send_if_modified(|current| {
            let from = *current;
            if from.can_transition_to(to) {
                *current = to;
                outcome = Ok(from);
                true
            } else {
                outcome = Err(LifecycleError::InvalidTransition {
                    from: from.to_string(),
                    to: to.to_string(),
                });
                false
            }
        });

        if let Ok(from) = outcome {
            metrics::set_lifecycle_state(to.gauge_value());
            tracing::info!(%from, %to, "host state changed");
        }
        outcome
    }

    /// Moves to [`HostState::Stopped`] unless already there.
    pub fn force_stop(&self) {
        let _ = self.transition(HostState::Stopped);
    }

    /// Claims the single `initialize` slot.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::AlreadyInitialized`] if `initialize` was
    /// already claimed.
    pub fn claim_initialize(&self) -> Result<(), LifecycleError> {
        if self.initialize_claimed.swap(true, Ordering::AcqRel) {
            return Err(LifecycleError::AlreadyInitialized);
        }
        Ok(())
    }

    /// Gives the `initialize` slot back after a rejected attempt.
    pub fn release_initialize(&self) {
        self.initialize_claimed.store(false, Ordering::Release);
    }

    /// Decides whether a request may be dispatched in the current state.
    ///
    /// # Errors
    ///
    /// Returns the [`LifecycleError`] to report to the client.
    pub fn admit_request(&self, method: &str) -> Result<(), LifecycleError> {
        match self.state() {
            HostState::Created | HostState::Started if method == INITIALIZE_METHOD => Ok(()),
            HostState::Created | HostState::Started => Err(LifecycleError::NotInitialized),
            HostState::Initialized if method == INITIALIZE_METHOD => {
                Err(LifecycleError::AlreadyInitialized)
            }
            HostState::Initialized => Ok(()),
            HostState::ShuttingDown | HostState::Stopped => Err(LifecycleError::ShuttingDown),
        }
    }

    /// Decides whether a notification may be dispatched in the current state.
    #[must_use]
    pub fn admit_notification(&self, method: &str) -> bool {
        method == EXIT_METHOD || self.state() == HostState::Initialized
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}
