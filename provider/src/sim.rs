// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated provider: an in-process hypervisor management API
//!
//! [`SimProvider`] models a small virtualization environment: an inventory
//! of named infrastructure objects and a set of VMs.  It implements the
//! full [`Provider`] contract, including failure modes (missing or
//! ambiguous names, injected clone and listing failures) so the
//! reconciliation engine can be exercised without a real hypervisor.
//!
//! With a state path configured, the provider loads its state on open and
//! persists it after every mutation, so consecutive CLI runs observe VMs
//! created by earlier runs.

use crate::Firmware;
use crate::Handle;
use crate::InfrastructureHandles;
use crate::ObservedVm;
use crate::Provider;
use crate::VM_FIRMWARE;
use anyhow::Context;
use async_trait::async_trait;
use camino::Utf8Path;
use camino::Utf8PathBuf;
use chrono::Utc;
use flotilla_cloudinit::EncodedBootDocuments;
use flotilla_common::error::InfraObjectKind;
use flotilla_common::error::ProviderError;
use flotilla_common::error::ResolutionError;
use flotilla_common::fleet::InfraNames;
use flotilla_common::fleet::VmSpec;
use serde::Deserialize;
use serde::Serialize;
use slog::{debug, info, o, Logger};
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::VecDeque;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use tokio::sync::Mutex;
use uuid::Uuid;

/// One named object in the simulated environment's inventory
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct InventoryObject {
    pub kind: InfraObjectKind,
    pub name: String,
    pub id: Uuid,
}

impl InventoryObject {
    pub fn new(kind: InfraObjectKind, name: &str) -> InventoryObject {
        InventoryObject {
            kind,
            name: name.to_string(),
            id: Uuid::new_v4(),
        }
    }
}

/// A VM in the simulated environment, with everything the "hypervisor"
/// was told at creation time
#[derive(Clone, Debug, Deserialize, Serialize)]
struct SimVm {
    observed: ObservedVm,
    cpus: u16,
    memory_mb: u32,
    disk_gb: u32,
    firmware: Firmware,
    boot: EncodedBootDocuments,
    /// Source template this VM was cloned from
    template_id: Uuid,
}

/// The provider's durable state: what would live on the hypervisor
#[derive(Debug, Default, Deserialize, Serialize)]
struct SimState {
    inventory: Vec<InventoryObject>,
    vms: BTreeMap<String, SimVm>,
}

pub struct SimProvider {
    log: Logger,
    inner: Mutex<SimState>,
    state_path: Option<Utf8PathBuf>,
    create_calls: AtomicUsize,
    /// Keys whose next create should fail (test interface)
    fail_create: Mutex<BTreeSet<String>>,
    /// Errors to return from upcoming list calls, oldest first
    /// (test interface)
    fail_list: Mutex<VecDeque<ProviderError>>,
}

impl SimProvider {
    /// Create a provider over an explicit inventory and no VMs.
    pub fn with_inventory(
        log: Logger,
        inventory: Vec<InventoryObject>,
    ) -> SimProvider {
        SimProvider {
            log: log.new(o!("component" => "sim-provider")),
            inner: Mutex::new(SimState { inventory, vms: BTreeMap::new() }),
            state_path: None,
            create_calls: AtomicUsize::new(0),
            fail_create: Mutex::new(BTreeSet::new()),
            fail_list: Mutex::new(VecDeque::new()),
        }
    }

    /// Create a provider whose inventory has exactly one object for each
    /// of the given names: an environment where resolution always
    /// succeeds.
    pub fn seeded(log: Logger, names: &InfraNames) -> SimProvider {
        SimProvider::with_inventory(log, seed_inventory(names))
    }

    /// Open a provider backed by a state file.  If the file exists its
    /// state is loaded; otherwise the provider starts from a seeded
    /// environment and the file is written on first mutation.
    pub fn open(
        log: Logger,
        names: &InfraNames,
        state_path: Option<&Utf8Path>,
    ) -> Result<SimProvider, anyhow::Error> {
        let log = log.new(o!("component" => "sim-provider"));
        let state = match state_path {
            Some(path) if path.exists() => {
                let contents = std::fs::read_to_string(path)
                    .with_context(|| format!("read sim state {:?}", path))?;
                let state: SimState = serde_json::from_str(&contents)
                    .with_context(|| format!("parse sim state {:?}", path))?;
                info!(log, "loaded sim state";
                    "path" => %path, "nvms" => state.vms.len());
                state
            }
            _ => SimState {
                inventory: seed_inventory(names),
                vms: BTreeMap::new(),
            },
        };
        Ok(SimProvider {
            log,
            inner: Mutex::new(state),
            state_path: state_path.map(|p| p.to_owned()),
            create_calls: AtomicUsize::new(0),
            fail_create: Mutex::new(BTreeSet::new()),
            fail_list: Mutex::new(VecDeque::new()),
        })
    }

    /// How many create operations have been issued to this provider,
    /// including ones that failed.
    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// Arrange for the next create of `key` to fail with a clone error.
    pub async fn inject_create_failure(&self, key: &str) {
        self.fail_create.lock().await.insert(key.to_string());
    }

    /// Arrange for the next `count` list calls to fail with a retryable
    /// error, as if the provider were briefly unreachable.
    pub async fn inject_list_failures(&self, count: usize) {
        let mut queue = self.fail_list.lock().await;
        for _ in 0..count {
            queue.push_back(ProviderError::unavailable(
                "simulated provider outage",
            ));
        }
    }

    /// Arrange for the next list call to fail with a non-retryable error.
    pub async fn inject_list_failure_permanent(&self) {
        self.fail_list
            .lock()
            .await
            .push_back(ProviderError::operation("simulated listing failure"));
    }

    /// Firmware recorded for an existing VM, if it exists.
    pub async fn vm_firmware(&self, key: &str) -> Option<Firmware> {
        self.inner.lock().await.vms.get(key).map(|vm| vm.firmware)
    }

    async fn persist(&self, state: &SimState) -> Result<(), ProviderError> {
        let Some(path) = &self.state_path else {
            return Ok(());
        };
        let contents = serde_json::to_string_pretty(state)
            .map_err(|error| ProviderError::operation(error.to_string()))?;
        tokio::fs::write(path, contents).await.map_err(|error| {
            ProviderError::operation(format!(
                "writing sim state {:?}: {}",
                path, error
            ))
        })
    }
}

fn seed_inventory(names: &InfraNames) -> Vec<InventoryObject> {
    vec![
        InventoryObject::new(InfraObjectKind::Datacenter, &names.datacenter),
        InventoryObject::new(InfraObjectKind::Cluster, &names.cluster),
        InventoryObject::new(InfraObjectKind::Datastore, &names.datastore),
        InventoryObject::new(InfraObjectKind::Network, &names.network),
        InventoryObject::new(InfraObjectKind::Template, &names.template),
    ]
}

fn resolve_one(
    inventory: &[InventoryObject],
    kind: InfraObjectKind,
    name: &str,
) -> Result<Handle, ResolutionError> {
    let mut matches = inventory
        .iter()
        .filter(|object| object.kind == kind && object.name == name);
    let Some(first) = matches.next() else {
        return Err(ResolutionError::not_found(kind, name));
    };
    let rest = matches.count();
    if rest > 0 {
        return Err(ResolutionError::ambiguous(kind, name, rest + 1));
    }
    Ok(Handle { id: first.id, name: first.name.clone() })
}

#[async_trait]
impl Provider for SimProvider {
    async fn resolve_handles(
        &self,
        names: &InfraNames,
    ) -> Result<InfrastructureHandles, ResolutionError> {
        let state = self.inner.lock().await;
        let inventory = &state.inventory;
        let handles = InfrastructureHandles {
            datacenter: resolve_one(
                inventory,
                InfraObjectKind::Datacenter,
                &names.datacenter,
            )?,
            cluster: resolve_one(
                inventory,
                InfraObjectKind::Cluster,
                &names.cluster,
            )?,
            datastore: resolve_one(
                inventory,
                InfraObjectKind::Datastore,
                &names.datastore,
            )?,
            network: resolve_one(
                inventory,
                InfraObjectKind::Network,
                &names.network,
            )?,
            template: resolve_one(
                inventory,
                InfraObjectKind::Template,
                &names.template,
            )?,
        };
        debug!(self.log, "resolved infrastructure handles";
            "template" => %handles.template.id);
        Ok(handles)
    }

    async fn list_vms(&self) -> Result<Vec<ObservedVm>, ProviderError> {
        if let Some(error) = self.fail_list.lock().await.pop_front() {
            return Err(error);
        }
        let state = self.inner.lock().await;
        Ok(state.vms.values().map(|vm| vm.observed.clone()).collect())
    }

    async fn create_vm(
        &self,
        key: &str,
        spec: &VmSpec,
        boot: &EncodedBootDocuments,
        handles: &InfrastructureHandles,
    ) -> Result<ObservedVm, ProviderError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);

        if self.fail_create.lock().await.remove(key) {
            return Err(ProviderError::operation(format!(
                "simulated clone failure for vm {:?}",
                key
            )));
        }

        let guest_ip = spec.ipv4_address.parse().map_err(|_| {
            ProviderError::operation(format!(
                "guest address {:?} is not an IPv4 address",
                spec.ipv4_address
            ))
        })?;

        let mut state = self.inner.lock().await;
        if state.vms.contains_key(key) {
            return Err(ProviderError::operation(format!(
                "vm {:?} already exists",
                key
            )));
        }

        let observed = ObservedVm {
            key: key.to_string(),
            name: spec.name.clone(),
            guest_ip: Some(guest_ip),
            provider_uuid: Uuid::new_v4(),
            time_created: Utc::now(),
        };
        state.vms.insert(key.to_string(), SimVm {
            observed: observed.clone(),
            cpus: spec.cpus,
            memory_mb: spec.memory_mb,
            disk_gb: spec.disk_gb,
            firmware: VM_FIRMWARE,
            boot: boot.clone(),
            template_id: handles.template.id,
        });
        self.persist(&state).await?;
        info!(self.log, "cloned vm from template";
            "key" => key,
            "name" => &spec.name,
            "uuid" => %observed.provider_uuid);
        Ok(observed)
    }

    async fn destroy_vm(
        &self,
        vm: &ObservedVm,
    ) -> Result<(), ProviderError> {
        let mut state = self.inner.lock().await;
        match state.vms.get(&vm.key) {
            Some(found)
                if found.observed.provider_uuid == vm.provider_uuid =>
            {
                state.vms.remove(&vm.key);
                self.persist(&state).await?;
                info!(self.log, "destroyed vm"; "key" => &vm.key);
                Ok(())
            }
            _ => Err(ProviderError::NoSuchVm { key: vm.key.clone() }),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;
    use camino_tempfile::Utf8TempDir;
    use flotilla_common::error::ResolutionFailure;

    fn log() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn names() -> InfraNames {
        InfraNames {
            datacenter: "dc-01".to_string(),
            cluster: "cluster-01".to_string(),
            datastore: "datastore-01".to_string(),
            network: "VM Network".to_string(),
            template: "ubuntu24-04-template".to_string(),
        }
    }

    fn spec(name: &str, address: &str) -> VmSpec {
        VmSpec {
            name: name.to_string(),
            ipv4_address: address.to_string(),
            cpus: 1,
            memory_mb: 2048,
            disk_gb: 40,
        }
    }

    fn boot_documents(key: &str, spec: &VmSpec) -> EncodedBootDocuments {
        let common = flotilla_common::fleet::CommonParams {
            gateway: "192.168.1.1".to_string(),
            prefix_len: 24,
            dns_servers: vec!["1.1.1.1".to_string(), "8.8.8.8".to_string()],
            search_domain: "home.lab".to_string(),
            ssh_username: "ubuntu".to_string(),
            ssh_public_key: "ssh-ed25519 AAAAC3Nza lab".to_string(),
            packages: vec!["qemu-guest-agent".to_string()],
        };
        flotilla_cloudinit::render(key, spec, &common)
            .expect("render")
            .encode()
    }

    #[tokio::test]
    async fn test_resolution() {
        let provider = SimProvider::seeded(log(), &names());
        let handles = provider.resolve_handles(&names()).await.unwrap();
        assert_eq!(handles.template.name, "ubuntu24-04-template");

        let mut bad = names();
        bad.datastore = "tank".to_string();
        let error = provider.resolve_handles(&bad).await.unwrap_err();
        assert_eq!(error.kind, InfraObjectKind::Datastore);
        assert_eq!(error.reason, ResolutionFailure::NotFound);
    }

    #[tokio::test]
    async fn test_resolution_ambiguous() {
        let mut inventory = seed_inventory(&names());
        inventory
            .push(InventoryObject::new(InfraObjectKind::Network, "VM Network"));
        let provider = SimProvider::with_inventory(log(), inventory);
        let error = provider.resolve_handles(&names()).await.unwrap_err();
        assert_eq!(error.kind, InfraObjectKind::Network);
        assert_eq!(error.reason, ResolutionFailure::Ambiguous { count: 2 });
    }

    #[tokio::test]
    async fn test_create_list_destroy() {
        let provider = SimProvider::seeded(log(), &names());
        let handles = provider.resolve_handles(&names()).await.unwrap();
        let spec = spec("ubuntu24-04-vm1", "192.168.1.97");
        let boot = boot_documents("vm1", &spec);

        let observed = provider
            .create_vm("vm1", &spec, &boot, &handles)
            .await
            .unwrap();
        assert_eq!(observed.key, "vm1");
        assert_eq!(observed.name, "ubuntu24-04-vm1");
        assert_eq!(observed.guest_ip, Some("192.168.1.97".parse().unwrap()));

        // The fixed firmware policy applies to every created VM.
        assert_eq!(
            provider.vm_firmware("vm1").await,
            Some(Firmware::Efi { secure_boot: false })
        );

        let vms = provider.list_vms().await.unwrap();
        assert_eq!(vms, vec![observed.clone()]);

        // A second create under the same key is refused.
        let error = provider
            .create_vm("vm1", &spec, &boot, &handles)
            .await
            .unwrap_err();
        assert_matches!(error, ProviderError::Operation { .. });
        assert_eq!(provider.create_calls(), 2);

        provider.destroy_vm(&observed).await.unwrap();
        assert!(provider.list_vms().await.unwrap().is_empty());
        let error = provider.destroy_vm(&observed).await.unwrap_err();
        assert_matches!(error, ProviderError::NoSuchVm { .. });
    }

    #[tokio::test]
    async fn test_injected_create_failure() {
        let provider = SimProvider::seeded(log(), &names());
        let handles = provider.resolve_handles(&names()).await.unwrap();
        let spec = spec("ubuntu24-04-vm1", "192.168.1.97");
        let boot = boot_documents("vm1", &spec);

        provider.inject_create_failure("vm1").await;
        let error = provider
            .create_vm("vm1", &spec, &boot, &handles)
            .await
            .unwrap_err();
        assert!(!error.retryable());
        assert!(provider.list_vms().await.unwrap().is_empty());

        // The injection is one-shot.
        provider.create_vm("vm1", &spec, &boot, &handles).await.unwrap();
    }

    #[tokio::test]
    async fn test_injected_list_failures() {
        let provider = SimProvider::seeded(log(), &names());

        provider.inject_list_failures(2).await;
        assert!(provider.list_vms().await.unwrap_err().retryable());
        assert!(provider.list_vms().await.unwrap_err().retryable());
        // The queue drains.
        assert!(provider.list_vms().await.unwrap().is_empty());

        provider.inject_list_failure_permanent().await;
        let error = provider.list_vms().await.unwrap_err();
        assert!(!error.retryable());
        assert_matches!(error, ProviderError::Operation { .. });
    }

    #[tokio::test]
    async fn test_state_file_round_trip() {
        let dir = Utf8TempDir::new().unwrap();
        let path = dir.path().join("sim-state.json");

        let provider =
            SimProvider::open(log(), &names(), Some(path.as_path())).unwrap();
        let handles = provider.resolve_handles(&names()).await.unwrap();
        let spec = spec("ubuntu24-04-vm1", "192.168.1.97");
        let boot = boot_documents("vm1", &spec);
        let observed = provider
            .create_vm("vm1", &spec, &boot, &handles)
            .await
            .unwrap();
        drop(provider);

        // A new provider over the same state file observes the VM, and
        // resolution still works against the persisted inventory.
        let reopened =
            SimProvider::open(log(), &names(), Some(path.as_path())).unwrap();
        assert_eq!(reopened.list_vms().await.unwrap(), vec![observed]);
        reopened.resolve_handles(&names()).await.unwrap();
    }
}
