//! Observation State Machine
//!
//! Defines the observing lifecycle of one IP-block device and the lane
//! controller: which actions are admissible from which states, and the
//! transition each action performs. The transition table is fixed data;
//! the runtime dispatcher is built over it.

use crate::ObsState;
use std::sync::Mutex;
use thiserror::Error;

/// Actions that can request an observation-state transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObsAction {
    /// Configure command admitted
    ConfigureInvoked,
    /// Configuration applied successfully
    ConfigureCompleted,
    /// Deconfigure command admitted
    DeconfigureInvoked,
    /// Configuration reverted
    DeconfigureCompleted,
    /// Scan command admitted
    ScanInvoked,
    /// Scan running
    ScanCompleted,
    /// EndScan command admitted
    EndScanInvoked,
    /// Scan stopped
    EndScanCompleted,
    /// Return to Idle (also the rewind path of a failed configure)
    GoToIdle,
    /// Abort requested
    AbortInvoked,
    /// All in-flight work aborted
    AbortCompleted,
    /// ObsReset command admitted
    ObsResetInvoked,
    /// Reset finished, back to a clean Idle
    ObsResetCompleted,
    /// A component reported an unrecoverable fault
    ComponentFault,
}

/// Attempted an action with no transition from the current state
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("state-model-error: action {action:?} is not allowed from state {state:?}")]
pub struct StateModelError {
    pub state: ObsState,
    pub action: ObsAction,
}

/// One row of the transition table
struct Transition {
    sources: &'static [ObsState],
    action: ObsAction,
    target: ObsState,
}

use ObsAction::*;
use ObsState::*;

/// The fixed observing-lifecycle transition table.
///
/// `AbortInvoked` uses the permissive source set: Idle, Ready, Scanning,
/// Configuring and Resetting may all enter Aborting.
const TRANSITIONS: &[Transition] = &[
    Transition { sources: &[Idle, Ready], action: ConfigureInvoked, target: Configuring },
    Transition { sources: &[Configuring], action: ConfigureCompleted, target: Ready },
    Transition { sources: &[Idle, Ready], action: DeconfigureInvoked, target: Configuring },
    Transition { sources: &[Configuring], action: DeconfigureCompleted, target: Idle },
    Transition { sources: &[Idle, Ready], action: ScanInvoked, target: Starting },
    Transition { sources: &[Starting], action: ScanCompleted, target: Scanning },
    Transition { sources: &[Scanning], action: EndScanInvoked, target: Stopping },
    Transition { sources: &[Stopping], action: EndScanCompleted, target: Ready },
    Transition { sources: &[Idle, Ready, Configuring], action: GoToIdle, target: Idle },
    Transition {
        sources: &[Idle, Ready, Scanning, Configuring, Resetting],
        action: AbortInvoked,
        target: Aborting,
    },
    Transition { sources: &[Aborting], action: AbortCompleted, target: Aborted },
    Transition { sources: &[Fault, Aborted], action: ObsResetInvoked, target: Resetting },
    Transition { sources: &[Resetting], action: ObsResetCompleted, target: Idle },
    Transition {
        sources: &[
            Idle, Configuring, Ready, Starting, Scanning, Stopping, Aborting, Aborted, Resetting,
            Fault,
        ],
        action: ComponentFault,
        target: Fault,
    },
];

/// Look up the target state for (state, action), if the transition exists
fn lookup(state: ObsState, action: ObsAction) -> Option<ObsState> {
    TRANSITIONS
        .iter()
        .find(|t| t.action == action && t.sources.contains(&state))
        .map(|t| t.target)
}

/// Callback invoked after every successful transition with the new state
pub type TransitionCallback = Box<dyn Fn(ObsState) + Send + Sync>;

/// The per-device observation state model.
///
/// Transitions are serialised by an internal lock; callers never need an
/// external lock. A failed apply leaves the state untouched.
pub struct ObsStateModel {
    state: Mutex<ObsState>,
    callback: Mutex<Option<TransitionCallback>>,
}

impl Default for ObsStateModel {
    fn default() -> Self {
        Self::new()
    }
}

impl ObsStateModel {
    /// Create a new model in Idle
    pub fn new() -> Self {
        Self::with_state(ObsState::Idle)
    }

    /// Create a model in a given starting state
    pub fn with_state(initial: ObsState) -> Self {
        Self {
            state: Mutex::new(initial),
            callback: Mutex::new(None),
        }
    }

    /// Register the transition callback, replacing any previous one
    pub fn set_callback(&self, callback: TransitionCallback) {
        *self.callback.lock().unwrap() = Some(callback);
    }

    /// Current internal state
    pub fn state(&self) -> ObsState {
        *self.state.lock().unwrap()
    }

    /// Current externally published state (refinements collapsed)
    pub fn published(&self) -> ObsState {
        self.state().published()
    }

    /// True iff a transition for `action` exists from the current state
    pub fn is_action_allowed(&self, action: ObsAction) -> bool {
        lookup(self.state(), action).is_some()
    }

    /// Apply an action, returning the new state.
    ///
    /// Fails with `StateModelError` and no state change if the action has
    /// no transition from the current state.
    pub fn apply(&self, action: ObsAction) -> Result<ObsState, StateModelError> {
        let new_state = {
            let mut state = self.state.lock().unwrap();
            let target = lookup(*state, action).ok_or(StateModelError {
                state: *state,
                action,
            })?;
            *state = target;
            target
        };

        if let Some(cb) = self.callback.lock().unwrap().as_ref() {
            cb(new_state);
        }

        Ok(new_state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let model = ObsStateModel::new();
        assert_eq!(model.state(), Idle);
    }

    #[test]
    fn test_configure_cycle() {
        let model = ObsStateModel::new();

        assert_eq!(model.apply(ConfigureInvoked), Ok(Configuring));
        assert_eq!(model.apply(ConfigureCompleted), Ok(Ready));

        // Reconfiguring from Ready is allowed
        assert_eq!(model.apply(ConfigureInvoked), Ok(Configuring));
        assert_eq!(model.apply(DeconfigureCompleted), Ok(Idle));
    }

    #[test]
    fn test_scan_cycle() {
        let model = ObsStateModel::with_state(Ready);

        assert_eq!(model.apply(ScanInvoked), Ok(Starting));
        assert_eq!(model.apply(ScanCompleted), Ok(Scanning));
        assert_eq!(model.apply(EndScanInvoked), Ok(Stopping));
        assert_eq!(model.apply(EndScanCompleted), Ok(Ready));
    }

    #[test]
    fn test_abort_then_reset() {
        let model = ObsStateModel::with_state(Scanning);

        assert_eq!(model.apply(AbortInvoked), Ok(Aborting));
        assert_eq!(model.apply(AbortCompleted), Ok(Aborted));
        assert_eq!(model.apply(ObsResetInvoked), Ok(Resetting));
        assert_eq!(model.apply(ObsResetCompleted), Ok(Idle));
    }

    #[test]
    fn test_fault_from_any_state() {
        for start in [
            Idle, Configuring, Ready, Starting, Scanning, Stopping, Aborting, Aborted, Resetting,
            Fault,
        ] {
            let model = ObsStateModel::with_state(start);
            assert_eq!(model.apply(ComponentFault), Ok(Fault));
        }
    }

    #[test]
    fn test_invalid_action_leaves_state_unchanged() {
        let model = ObsStateModel::new();

        let err = model.apply(ConfigureCompleted).unwrap_err();
        assert_eq!(err.state, Idle);
        assert_eq!(err.action, ConfigureCompleted);
        assert_eq!(model.state(), Idle);
        assert!(err.to_string().contains("state-model-error"));
    }

    #[test]
    fn test_exhaustive_inadmissible_actions_do_not_mutate() {
        let all_states = [
            Idle, Configuring, Ready, Starting, Scanning, Stopping, Aborting, Aborted, Resetting,
            Fault,
        ];
        let all_actions = [
            ConfigureInvoked,
            ConfigureCompleted,
            DeconfigureInvoked,
            DeconfigureCompleted,
            ScanInvoked,
            ScanCompleted,
            EndScanInvoked,
            EndScanCompleted,
            GoToIdle,
            AbortInvoked,
            AbortCompleted,
            ObsResetInvoked,
            ObsResetCompleted,
            ComponentFault,
        ];

        for state in all_states {
            for action in all_actions {
                let model = ObsStateModel::with_state(state);
                if model.is_action_allowed(action) {
                    assert!(model.apply(action).is_ok());
                } else {
                    assert!(model.apply(action).is_err());
                    assert_eq!(model.state(), state, "{:?} mutated by {:?}", state, action);
                }
            }
        }
    }

    #[test]
    fn test_abort_permissive_source_set() {
        for state in [Idle, Ready, Scanning, Configuring, Resetting] {
            let model = ObsStateModel::with_state(state);
            assert!(model.is_action_allowed(AbortInvoked), "abort from {:?}", state);
        }
        let model = ObsStateModel::with_state(Aborted);
        assert!(!model.is_action_allowed(AbortInvoked));
    }

    #[test]
    fn test_callback_fires_on_transition() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let model = ObsStateModel::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        model.set_callback(Box::new(move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        }));

        model.apply(ConfigureInvoked).unwrap();
        model.apply(ConfigureCompleted).unwrap();
        // Failed apply must not fire the callback
        let _ = model.apply(ScanCompleted);

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
