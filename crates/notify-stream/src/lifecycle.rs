//! Lifecycle controller.
//!
//! Decides from `(authenticated, identity, foreground)` whether a live
//! connection should exist and for which identity.

use crate::record::Identity;

/// Close reason used when switching to another identity.
pub const REASON_PROFILE_CHANGED: &str = "profile changed";
/// Close reason used when the app goes to the background.
pub const REASON_GOING_INACTIVE: &str = "going inactive";
/// Close reason used on logout.
pub const REASON_LOGGED_OUT: &str = "logged out";
/// Close reason used when the service shuts down.
pub const REASON_SHUTDOWN: &str = "shutting down";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LifecycleInputs {
    pub authenticated: bool,
    pub identity: Option<Identity>,
    pub foreground: bool,
}

impl LifecycleInputs {
    pub fn new(authenticated: bool, identity: Option<Identity>, foreground: bool) -> Self {
        Self {
            authenticated,
            identity,
            foreground,
        }
    }

    /// Identity whose data is in scope, regardless of foreground state.
    pub fn scoped_identity(&self) -> Option<&Identity> {
        self.identity.as_ref().filter(|_| self.authenticated)
    }

    /// Identity a connection should currently target.
    pub fn connect_target(&self) -> Option<&Identity> {
        self.scoped_identity().filter(|_| self.foreground)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleDecision {
    /// Open a connection for this identity.
    Connect(Identity),
    /// Close the live connection and open one for `to`.
    Switch { to: Identity },
    /// Close the live connection (or drop a pending retry) with this reason.
    Disconnect(&'static str),
    Keep,
}

/// What changed between two consecutive input sets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LifecycleChange {
    /// The scoped identity is different (switch, login or logout)
    pub scope_changed: bool,
    /// The app moved from background to foreground
    pub foregrounded: bool,
}

#[derive(Debug, Clone, Default)]
pub struct LifecycleController {
    inputs: LifecycleInputs,
}

impl LifecycleController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inputs(&self) -> &LifecycleInputs {
        &self.inputs
    }

    /// Store new inputs and report what changed.
    pub fn update(&mut self, next: LifecycleInputs) -> LifecycleChange {
        let change = LifecycleChange {
            scope_changed: self.inputs.scoped_identity() != next.scoped_identity(),
            foregrounded: !self.inputs.foreground && next.foreground,
        };
        self.inputs = next;
        change
    }

    /// Decide what to do given the identity of the live connection, if any,
    /// and whether a reconnect is currently waiting on its timer.
    pub fn decide(
        inputs: &LifecycleInputs,
        live: Option<&Identity>,
        reconnect_pending: bool,
    ) -> LifecycleDecision {
        match (inputs.connect_target(), live) {
            (Some(target), Some(live)) if target == live => LifecycleDecision::Keep,
            (Some(target), Some(_)) => LifecycleDecision::Switch { to: target.clone() },
            (Some(target), None) => LifecycleDecision::Connect(target.clone()),
            (None, live) if live.is_some() || reconnect_pending => {
                LifecycleDecision::Disconnect(Self::disconnect_reason(inputs))
            }
            (None, _) => LifecycleDecision::Keep,
        }
    }

    fn disconnect_reason(inputs: &LifecycleInputs) -> &'static str {
        if inputs.scoped_identity().is_none() {
            REASON_LOGGED_OUT
        } else {
            REASON_GOING_INACTIVE
        }
    }
}
