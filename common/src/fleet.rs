// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The desired-state model: a declared target fleet of virtual machines
//!
//! A [`FleetDescription`] is loaded from a TOML document and is the sole
//! authority for which VMs should exist.  The key of each `[vms.<key>]`
//! table is the VM's stable identity; the `name` field is just a property
//! and renaming a VM while keeping its key is a mutation in place, not a
//! replacement.  Duplicate keys cannot be expressed: the TOML parser
//! rejects a document that declares the same table twice.

use crate::error::ValidationError;
use anyhow::Context;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

/// Desired configuration for a single VM, keyed by its identity in
/// [`FleetDescription::vms`].
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct VmSpec {
    /// VM name as shown by the provider (also the guest hostname)
    pub name: String,
    /// Static IPv4 address assigned at first boot
    pub ipv4_address: String,
    /// Virtual CPU count
    pub cpus: u16,
    /// Memory size in mebibytes
    pub memory_mb: u32,
    /// Root disk size in gibibytes
    pub disk_gb: u32,
}

impl VmSpec {
    /// Check the spec's structural invariants, identifying failures by the
    /// VM's `key`.
    pub fn validate(&self, key: &str) -> Result<(), ValidationError> {
        if self.cpus == 0 {
            return Err(ValidationError::new(key, "cpus must be nonzero"));
        }
        if self.memory_mb == 0 {
            return Err(ValidationError::new(key, "memory_mb must be nonzero"));
        }
        if self.disk_gb == 0 {
            return Err(ValidationError::new(key, "disk_gb must be nonzero"));
        }
        if self.name.is_empty() {
            return Err(ValidationError::new(key, "name must not be empty"));
        }
        self.ipv4(key)?;
        Ok(())
    }

    /// Parse the spec's static address.
    pub fn ipv4(&self, key: &str) -> Result<Ipv4Addr, ValidationError> {
        self.ipv4_address.parse().map_err(|_| {
            ValidationError::new(
                key,
                format!(
                    "cannot parse {:?} as an IPv4 address",
                    self.ipv4_address
                ),
            )
        })
    }
}

/// Guest parameters shared by every VM in the fleet
///
/// These are templated into each VM's boot configuration at creation time
/// only; changing them does not retroactively update existing VMs.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CommonParams {
    /// Default gateway for the guest's static network configuration
    pub gateway: String,
    /// Network prefix length for the guest address
    #[serde(default = "default_prefix_len")]
    pub prefix_len: u8,
    /// DNS servers for the guest (the boot templates require exactly two)
    pub dns_servers: Vec<String>,
    /// DNS search domain
    pub search_domain: String,
    /// Name of the admin user created at first boot
    pub ssh_username: String,
    /// SSH public key installed for the admin user
    pub ssh_public_key: String,
    /// Packages installed at first boot
    #[serde(default = "default_packages")]
    pub packages: Vec<String>,
}

fn default_prefix_len() -> u8 {
    24
}

fn default_packages() -> Vec<String> {
    vec!["qemu-guest-agent".to_string(), "open-vm-tools".to_string()]
}

/// Names of the infrastructure objects that all VM operations run against.
/// Each must resolve to exactly one object in the target environment.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct InfraNames {
    pub datacenter: String,
    pub cluster: String,
    pub datastore: String,
    pub network: String,
    /// Source template the fleet is cloned from
    pub template: String,
}

/// Which provider implementation to converge against
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderMode {
    /// The in-process simulated provider
    #[default]
    Sim,
}

/// Provider selection and provider-specific settings
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    #[serde(default)]
    pub mode: ProviderMode,
    /// Where the simulated provider persists its state between runs.  With
    /// no path, each run starts from an empty environment.
    #[serde(default)]
    pub state_path: Option<Utf8PathBuf>,
}

/// The desired state of the whole fleet, as loaded from the input document
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FleetDescription {
    pub infrastructure: InfraNames,
    pub guest: CommonParams,
    #[serde(default)]
    pub provider: ProviderConfig,
    pub vms: BTreeMap<String, VmSpec>,
}

impl FleetDescription {
    /// Load a `FleetDescription` from the given TOML file.
    pub fn from_file(path: &Utf8Path) -> Result<FleetDescription, anyhow::Error> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("read {:?}", path))?;
        let fleet: FleetDescription = toml::from_str(&contents)
            .with_context(|| format!("parse {:?}", path))?;
        Ok(fleet)
    }

    /// Validate every VM spec in the fleet.  Runs to the first failure;
    /// called before any provider work.
    pub fn validate(&self) -> Result<(), ValidationError> {
        for (key, spec) in &self.vms {
            spec.validate(key)?;
        }
        Ok(())
    }
}
