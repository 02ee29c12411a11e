// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Aggregated per-VM outcomes of a convergence cycle
//!
//! The report's `results` map mirrors the desired key space exactly: one
//! entry per desired key, success or failure, and nothing else.  Keys the
//! engine pruned (observed but no longer desired) are reported separately
//! so callers can correlate intent to outcome without re-deriving key
//! order.

use flotilla_provider::ObservedVm;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;

/// Terminal outcome for one key
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VmStatus {
    /// Created during this cycle
    Created,
    /// Already present with matching identity; left alone
    Unchanged,
    /// Creation failed; see the result's error
    Failed,
    /// Destroyed during this cycle (or already absent on destroy)
    Destroyed,
    /// Destruction failed; see the result's error
    FailedDestroy,
}

impl VmStatus {
    pub fn is_failure(&self) -> bool {
        matches!(self, VmStatus::Failed | VmStatus::FailedDestroy)
    }
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VmStatus::Created => "created",
            VmStatus::Unchanged => "unchanged",
            VmStatus::Failed => "failed",
            VmStatus::Destroyed => "destroyed",
            VmStatus::FailedDestroy => "failed-destroy",
        };
        f.write_str(s)
    }
}

/// Outcome of one key's convergence
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct VmResult {
    pub key: String,
    pub status: VmStatus,
    /// The provider's record, when the VM exists (created or unchanged)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed: Option<ObservedVm>,
    /// Why the key failed, when it did
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The final report of a convergence cycle
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct FleetReport {
    /// One entry per desired key
    pub results: BTreeMap<String, VmResult>,
    /// Outcomes for pruned keys (observed but not desired)
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub pruned: BTreeMap<String, VmResult>,
}

impl FleetReport {
    pub fn new(
        results: BTreeMap<String, VmResult>,
        pruned: BTreeMap<String, VmResult>,
    ) -> FleetReport {
        FleetReport { results, pruned }
    }

    /// Desired key → guest address, with `None` for keys that have no
    /// running VM (failed or destroyed).
    pub fn ip_addresses(&self) -> BTreeMap<String, Option<Ipv4Addr>> {
        self.results
            .iter()
            .map(|(key, result)| {
                let ip = result
                    .observed
                    .as_ref()
                    .and_then(|observed| observed.guest_ip);
                (key.clone(), ip)
            })
            .collect()
    }

    /// Desired key → provider-side VM name, with `None` for keys that
    /// have no running VM.
    pub fn vm_names(&self) -> BTreeMap<String, Option<String>> {
        self.results
            .iter()
            .map(|(key, result)| {
                let name = result
                    .observed
                    .as_ref()
                    .map(|observed| observed.name.clone());
                (key.clone(), name)
            })
            .collect()
    }

    /// Whether any key (desired or pruned) failed.  Drives the process
    /// exit status.
    pub fn has_failures(&self) -> bool {
        self.results
            .values()
            .chain(self.pruned.values())
            .any(|result| result.status.is_failure())
    }

    pub fn failed_keys(&self) -> Vec<&str> {
        self.results
            .values()
            .chain(self.pruned.values())
            .filter(|result| result.status.is_failure())
            .map(|result| result.key.as_str())
            .collect()
    }
}
