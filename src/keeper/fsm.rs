//! Endpoint state machine.
//!
//! A pure, total transition function: `(state, event) -> (state, effects)`.
//! Effects (plugin calls, lock release) are executed by the keeper's event
//! consumer *after* the transition, so the transition logic itself needs no
//! mocking to test. Pairs with no table row are explicit no-ops — never an
//! error — which removes the "impossible transition" failure class entirely.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Per-endpoint state. Held in process memory only; every process start
/// begins in `Standby` (only the lease and the lock are persistent).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndpointState {
    Standby,
    Activated,
    /// Terminal for this host's management of the endpoint; only a `Fault`
    /// event can pull it back to `Activated`.
    Failing,
}

impl fmt::Display for EndpointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EndpointState::Standby => "STANDBY",
            EndpointState::Activated => "ACTIVATED",
            EndpointState::Failing => "FAILING",
        };
        f.write_str(s)
    }
}

/// Events fed to the state machine by the keeper's concurrent loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointEvent {
    /// Lock-acquisition loop observed mastership.
    Elected,
    /// Lock-acquisition loop observed another owner (or no lock).
    Demoted,
    /// Our relationship with the store cannot be confirmed. Fail-open:
    /// sustained store trouble prefers a dual-activation risk over total
    /// unavailability.
    Fault,
    /// Health check passed.
    HealthCheckSuccess,
    /// Health check failed past the configured threshold.
    HealthCheckFail,
}

/// Side effects the keeper executes on a state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Call the plugin's `activate`.
    Activate,
    /// Call the plugin's `deactivate`.
    Deactivate,
    /// Best-effort unlock (NotMaster is ignored).
    ReleaseLock,
}

/// Result of applying one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: EndpointState,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn stay(state: EndpointState) -> Self {
        Self {
            next: state,
            effects: Vec::new(),
        }
    }

    fn to(next: EndpointState, effects: Vec<Effect>) -> Self {
        Self { next, effects }
    }
}

/// The transition table. Total over all `(state, event)` pairs; effects fire
/// only on actual state entry, so an `Elected` while already `Activated`
/// does not re-activate the plugin.
pub fn transition(state: EndpointState, event: EndpointEvent) -> Transition {
    use EndpointEvent::*;
    use EndpointState::*;

    match (state, event) {
        (Standby, Elected) => Transition::to(Activated, vec![Effect::Activate]),
        (Activated, Elected) => Transition::stay(Activated),

        (Activated, Demoted) => Transition::to(Standby, vec![Effect::Deactivate]),
        (Standby, Demoted) => Transition::stay(Standby),

        // Fail-open: a fault biases toward activation to preserve
        // availability while the store is degraded.
        (Standby, Fault) | (Failing, Fault) => Transition::to(Activated, vec![Effect::Activate]),
        (Activated, Fault) => Transition::stay(Activated),

        // Sustained health failure retires this host's management of the
        // endpoint regardless of lock status.
        (Standby, HealthCheckFail) | (Activated, HealthCheckFail) => {
            Transition::to(Failing, vec![Effect::Deactivate, Effect::ReleaseLock])
        }

        (_, HealthCheckSuccess) => Transition::stay(state),
        (Failing, Elected) | (Failing, Demoted) | (Failing, HealthCheckFail) => {
            Transition::stay(Failing)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use EndpointEvent::*;
    use EndpointState::*;

    const ALL_STATES: [EndpointState; 3] = [Standby, Activated, Failing];
    const ALL_EVENTS: [EndpointEvent; 5] =
        [Elected, Demoted, Fault, HealthCheckSuccess, HealthCheckFail];

    #[test]
    fn test_elected_activates_from_standby() {
        let t = transition(Standby, Elected);
        assert_eq!(t.next, Activated);
        assert_eq!(t.effects, vec![Effect::Activate]);
    }

    #[test]
    fn test_elected_while_activated_is_noop() {
        let t = transition(Activated, Elected);
        assert_eq!(t.next, Activated);
        assert!(t.effects.is_empty());
    }

    #[test]
    fn test_demoted_deactivates_from_activated() {
        let t = transition(Activated, Demoted);
        assert_eq!(t.next, Standby);
        assert_eq!(t.effects, vec![Effect::Deactivate]);
    }

    #[test]
    fn test_demoted_while_standby_is_noop() {
        let t = transition(Standby, Demoted);
        assert_eq!(t.next, Standby);
        assert!(t.effects.is_empty());
    }

    #[test]
    fn test_fault_fails_open() {
        let t = transition(Standby, Fault);
        assert_eq!(t.next, Activated);
        assert_eq!(t.effects, vec![Effect::Activate]);

        // Even a failing endpoint re-enters ACTIVATED on a fault.
        let t = transition(Failing, Fault);
        assert_eq!(t.next, Activated);
        assert_eq!(t.effects, vec![Effect::Activate]);

        let t = transition(Activated, Fault);
        assert_eq!(t.next, Activated);
        assert!(t.effects.is_empty());
    }

    #[test]
    fn test_health_failure_retires_endpoint() {
        for state in [Standby, Activated] {
            let t = transition(state, HealthCheckFail);
            assert_eq!(t.next, Failing);
            assert_eq!(t.effects, vec![Effect::Deactivate, Effect::ReleaseLock]);
        }
    }

    #[test]
    fn test_failing_ignores_lock_events() {
        for event in [Elected, Demoted, HealthCheckFail] {
            let t = transition(Failing, event);
            assert_eq!(t.next, Failing);
            assert!(t.effects.is_empty());
        }
    }

    #[test]
    fn test_totality_no_pair_panics_and_health_success_never_moves() {
        for state in ALL_STATES {
            for event in ALL_EVENTS {
                let t = transition(state, event);
                // Effects only accompany an actual state change.
                if t.next == state {
                    assert!(t.effects.is_empty(), "no-op with effects: {state:?} {event:?}");
                }
            }
            let t = transition(state, HealthCheckSuccess);
            assert_eq!(t.next, state);
        }
    }
}
