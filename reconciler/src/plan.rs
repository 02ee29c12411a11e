// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Diffing the desired key set against the provider's observed set
//!
//! The desired-state map is the sole authority for which VMs should
//! exist; the observed set is reconciled toward it, never the reverse.
//! Planning is pure: it issues no provider calls and mutates nothing.

use flotilla_common::fleet::FleetDescription;
use flotilla_provider::ObservedVm;
use serde::Serialize;
use std::collections::BTreeSet;

/// The work an apply cycle would do, keyed by VM identity
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Plan {
    /// Desired keys with no observed VM
    pub to_create: Vec<String>,
    /// Observed keys absent from the desired set.  Empty unless pruning
    /// was requested: by default such VMs are left untouched.
    pub to_destroy: Vec<String>,
    /// Keys that are both desired and observed; left alone
    pub unchanged: Vec<String>,
}

impl Plan {
    /// Compute the diff between a desired fleet and the observed VMs.
    pub fn diff(
        fleet: &FleetDescription,
        observed: &[ObservedVm],
        prune: bool,
    ) -> Plan {
        let desired: BTreeSet<&str> =
            fleet.vms.keys().map(String::as_str).collect();
        let present: BTreeSet<&str> =
            observed.iter().map(|vm| vm.key.as_str()).collect();

        let to_create = desired
            .difference(&present)
            .map(|key| key.to_string())
            .collect();
        let to_destroy = if prune {
            present
                .difference(&desired)
                .map(|key| key.to_string())
                .collect()
        } else {
            Vec::new()
        };
        let unchanged = desired
            .intersection(&present)
            .map(|key| key.to_string())
            .collect();
        Plan { to_create, to_destroy, unchanged }
    }

    /// Whether this plan does any work at all.
    pub fn is_noop(&self) -> bool {
        self.to_create.is_empty() && self.to_destroy.is_empty()
    }
}
