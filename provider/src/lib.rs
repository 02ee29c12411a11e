// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The provider adapter: the boundary to the virtualization platform
//!
//! A [`Provider`] resolves named infrastructure objects to opaque handles
//! and issues the clone/configure/power operations that the reconciliation
//! engine drives.  Providers never retry internally; retry policy belongs
//! to the caller so that backoff is uniform and observable in one place.
//!
//! The only implementation in-tree is [`sim::SimProvider`], an in-process
//! simulation of a hypervisor management API used by the CLI and the test
//! suite.

pub mod sim;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use flotilla_cloudinit::EncodedBootDocuments;
use flotilla_common::error::ProviderError;
use flotilla_common::error::ResolutionError;
use flotilla_common::fleet::InfraNames;
use flotilla_common::fleet::VmSpec;
use serde::Deserialize;
use serde::Serialize;
use std::net::Ipv4Addr;
use uuid::Uuid;

pub use sim::SimProvider;

/// Firmware requested for every created VM.  Fixed policy: EFI with
/// secure boot disabled.  Not configurable per VM.
pub const VM_FIRMWARE: Firmware = Firmware::Efi { secure_boot: false };

/// Firmware flavor for a created VM
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "flavor")]
pub enum Firmware {
    Efi { secure_boot: bool },
    Bios,
}

/// A resolved, read-only reference to one named infrastructure object
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Handle {
    pub id: Uuid,
    pub name: String,
}

/// The full set of handles that all per-VM operations run against.
/// Resolved once per convergence cycle, before any VM work, and shared
/// read-only across the per-VM tasks.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct InfrastructureHandles {
    pub datacenter: Handle,
    pub cluster: Handle,
    pub datastore: Handle,
    pub network: Handle,
    pub template: Handle,
}

/// The provider's ground-truth record of one existing VM
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ObservedVm {
    /// Stable fleet identity, as recorded at creation
    pub key: String,
    pub name: String,
    /// Address reported by the guest, if it has one
    pub guest_ip: Option<Ipv4Addr>,
    pub provider_uuid: Uuid,
    pub time_created: DateTime<Utc>,
}

/// Interface to the virtualization platform's management API.
///
/// All methods are remote (and, for the mutating ones, non-idempotent)
/// from the caller's perspective; the simulated implementation keeps the
/// same contract.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Resolve every named infrastructure object to exactly one handle.
    ///
    /// A name that matches zero or more than one object fails the whole
    /// set; callers must treat that as fatal before any VM work.
    async fn resolve_handles(
        &self,
        names: &InfraNames,
    ) -> Result<InfrastructureHandles, ResolutionError>;

    /// Return the provider's current view of existing VMs.
    async fn list_vms(&self) -> Result<Vec<ObservedVm>, ProviderError>;

    /// Clone a new VM from the source template, attach network and disk
    /// per the spec, inject the boot documents as opaque metadata, and
    /// power it on with [`VM_FIRMWARE`].
    async fn create_vm(
        &self,
        key: &str,
        spec: &VmSpec,
        boot: &EncodedBootDocuments,
        handles: &InfrastructureHandles,
    ) -> Result<ObservedVm, ProviderError>;

    /// Power off and delete an existing VM.
    async fn destroy_vm(
        &self,
        vm: &ObservedVm,
    ) -> Result<(), ProviderError>;
}
