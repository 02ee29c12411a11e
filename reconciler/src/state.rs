// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-key convergence state machine
//!
//! Creation path: `Absent -> Creating -> Created | Failed`.
//! Removal path: `Present -> Destroying -> Destroyed | FailedDestroy`.
//!
//! Transitions are total: calling a transition from a state it does not
//! apply to leaves the state unchanged, which keeps the engine's per-task
//! bookkeeping simple.

use serde::Serialize;
use std::fmt;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergeState {
    /// Desired but not observed; creation has not begun
    Absent,
    Creating,
    Created,
    Failed,
    /// Observed and slated for removal; destruction has not begun
    Present,
    Destroying,
    Destroyed,
    FailedDestroy,
}

impl ConvergeState {
    /// Transition taken when work begins for a key.
    pub fn working(self) -> ConvergeState {
        match self {
            ConvergeState::Absent => ConvergeState::Creating,
            ConvergeState::Present => ConvergeState::Destroying,
            other => other,
        }
    }

    /// Transition taken when the in-flight operation succeeds.
    pub fn succeeded(self) -> ConvergeState {
        match self {
            ConvergeState::Creating => ConvergeState::Created,
            ConvergeState::Destroying => ConvergeState::Destroyed,
            other => other,
        }
    }

    /// Transition taken when the in-flight operation fails.
    pub fn failed(self) -> ConvergeState {
        match self {
            ConvergeState::Creating => ConvergeState::Failed,
            ConvergeState::Destroying => ConvergeState::FailedDestroy,
            other => other,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConvergeState::Created
                | ConvergeState::Failed
                | ConvergeState::Destroyed
                | ConvergeState::FailedDestroy
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            ConvergeState::Absent => "absent",
            ConvergeState::Creating => "creating",
            ConvergeState::Created => "created",
            ConvergeState::Failed => "failed",
            ConvergeState::Present => "present",
            ConvergeState::Destroying => "destroying",
            ConvergeState::Destroyed => "destroyed",
            ConvergeState::FailedDestroy => "failed-destroy",
        }
    }
}

impl fmt::Display for ConvergeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod test {
    use super::ConvergeState::*;

    #[test]
    fn test_creation_path() {
        let state = Absent;
        assert!(!state.is_terminal());
        let state = state.working();
        assert_eq!(state, Creating);
        assert_eq!(state.succeeded(), Created);
        assert_eq!(state.failed(), Failed);
        assert!(state.succeeded().is_terminal());
        assert!(state.failed().is_terminal());
    }

    #[test]
    fn test_removal_path() {
        let state = Present.working();
        assert_eq!(state, Destroying);
        assert_eq!(state.succeeded(), Destroyed);
        assert_eq!(state.failed(), FailedDestroy);
    }

    #[test]
    fn test_terminal_states_fixed() {
        for state in [Created, Failed, Destroyed, FailedDestroy] {
            assert!(state.is_terminal());
            assert_eq!(state.working(), state);
            assert_eq!(state.succeeded(), state);
            assert_eq!(state.failed(), state);
        }
    }
}
