// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error taxonomy for fleet convergence
//!
//! Errors fall into two propagation classes.  Whole-run-fatal errors
//! ([`ValidationError`], [`ResolutionError`]) abort the run before any
//! remote mutation has been issued.  Per-VM errors ([`ProviderError`])
//! are isolated to their key: they appear in the final report and never
//! prevent sibling VMs from converging.

use serde::Deserialize;
use serde::Serialize;
use std::fmt;

/// A desired-state entry failed pre-flight validation.
///
/// Validation runs before handle resolution and before any provider call,
/// so a bad spec can never cause partial side effects.
#[derive(Clone, Debug, thiserror::Error, PartialEq)]
#[error("invalid spec for vm {key:?}: {message}")]
pub struct ValidationError {
    /// Key of the offending entry in the desired-state map
    pub key: String,
    pub message: String,
}

impl ValidationError {
    pub fn new<S: Into<String>>(key: &str, message: S) -> ValidationError {
        ValidationError { key: key.to_string(), message: message.into() }
    }
}

/// The kinds of named infrastructure objects a provider resolves before
/// any per-VM work begins.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum InfraObjectKind {
    Datacenter,
    Cluster,
    Datastore,
    Network,
    Template,
}

impl fmt::Display for InfraObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InfraObjectKind::Datacenter => "datacenter",
            InfraObjectKind::Cluster => "cluster",
            InfraObjectKind::Datastore => "datastore",
            InfraObjectKind::Network => "network",
            InfraObjectKind::Template => "template",
        };
        f.write_str(s)
    }
}

/// Why a named infrastructure object failed to resolve to a handle
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResolutionFailure {
    /// No object of the requested kind has this name.
    NotFound,
    /// More than one object of the requested kind has this name.
    Ambiguous { count: usize },
}

/// A named infrastructure object could not be resolved to exactly one
/// handle.  Fatal to the whole run: no fleet work happens against
/// unresolved handles.
#[derive(Clone, Debug, thiserror::Error, PartialEq)]
pub struct ResolutionError {
    pub kind: InfraObjectKind,
    pub name: String,
    pub reason: ResolutionFailure,
}

impl fmt::Display for ResolutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason {
            ResolutionFailure::NotFound => {
                write!(f, "{} {:?} not found", self.kind, self.name)
            }
            ResolutionFailure::Ambiguous { count } => write!(
                f,
                "{} {:?} is ambiguous: {} objects match",
                self.kind, self.name, count
            ),
        }
    }
}

impl ResolutionError {
    pub fn not_found(kind: InfraObjectKind, name: &str) -> ResolutionError {
        ResolutionError {
            kind,
            name: name.to_string(),
            reason: ResolutionFailure::NotFound,
        }
    }

    pub fn ambiguous(
        kind: InfraObjectKind,
        name: &str,
        count: usize,
    ) -> ResolutionError {
        ResolutionError {
            kind,
            name: name.to_string(),
            reason: ResolutionFailure::Ambiguous { count },
        }
    }
}

/// A remote provider operation failed.
///
/// Carried per key in the final report.  The provider itself never
/// retries; whether to retry is the caller's decision, driven by
/// [`ProviderError::retryable`].
#[derive(Clone, Debug, thiserror::Error, PartialEq)]
pub enum ProviderError {
    /// The provider (or the path to it) is temporarily unavailable.
    #[error("provider unavailable: {message}")]
    Unavailable { message: String },

    /// The requested operation failed outright.
    #[error("provider operation failed: {message}")]
    Operation { message: String },

    /// The provider has no record of the requested VM.
    #[error("no such vm: {key:?}")]
    NoSuchVm { key: String },
}

impl ProviderError {
    /// Returns whether the error is likely transient and could reasonably
    /// be retried
    pub fn retryable(&self) -> bool {
        match self {
            ProviderError::Unavailable { .. } => true,
            ProviderError::Operation { .. }
            | ProviderError::NoSuchVm { .. } => false,
        }
    }

    pub fn unavailable<S: Into<String>>(message: S) -> ProviderError {
        ProviderError::Unavailable { message: message.into() }
    }

    pub fn operation<S: Into<String>>(message: S) -> ProviderError {
        ProviderError::Operation { message: message.into() }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(ProviderError::unavailable("api restarting").retryable());
        assert!(!ProviderError::operation("clone failed").retryable());
        assert!(!ProviderError::NoSuchVm { key: "vm1".to_string() }
            .retryable());
    }

    #[test]
    fn test_resolution_display() {
        let error =
            ResolutionError::not_found(InfraObjectKind::Datastore, "tank");
        assert_eq!(error.to_string(), "datastore \"tank\" not found");
        let error =
            ResolutionError::ambiguous(InfraObjectKind::Network, "lan", 2);
        assert_eq!(
            error.to_string(),
            "network \"lan\" is ambiguous: 2 objects match"
        );
    }
}
