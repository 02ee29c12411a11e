// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end convergence tests against the simulated provider

use assert_matches::assert_matches;
use flotilla_common::fleet::FleetDescription;
use flotilla_provider::Firmware;
use flotilla_provider::Provider;
use flotilla_provider::SimProvider;
use flotilla_reconciler::Error;
use flotilla_reconciler::Reconciler;
use flotilla_reconciler::ReconcilerConfig;
use flotilla_reconciler::VmStatus;
use slog::o;
use slog::Logger;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

const FLEET: &str = r#"
    [infrastructure]
    datacenter = "dc-01"
    cluster = "cluster-01"
    datastore = "datastore-01"
    network = "VM Network"
    template = "ubuntu24-04-template"

    [guest]
    gateway = "192.168.1.1"
    dns_servers = ["1.1.1.1", "8.8.8.8"]
    search_domain = "home.lab"
    ssh_username = "ubuntu"
    ssh_public_key = "ssh-ed25519 AAAAC3Nza lab"

    [vms.vm1]
    name = "ubuntu24-04-vm1"
    ipv4_address = "192.168.1.97"
    cpus = 1
    memory_mb = 2048
    disk_gb = 40

    [vms.vm2]
    name = "ubuntu24-04-vm2"
    ipv4_address = "192.168.1.98"
    cpus = 1
    memory_mb = 2048
    disk_gb = 40
"#;

fn log() -> Logger {
    Logger::root(slog::Discard, o!())
}

fn fleet() -> FleetDescription {
    toml::from_str(FLEET).unwrap()
}

fn harness(fleet: &FleetDescription) -> (Arc<SimProvider>, Reconciler<SimProvider>) {
    harness_with_config(fleet, ReconcilerConfig::default())
}

fn harness_with_config(
    fleet: &FleetDescription,
    config: ReconcilerConfig,
) -> (Arc<SimProvider>, Reconciler<SimProvider>) {
    let provider =
        Arc::new(SimProvider::seeded(log(), &fleet.infrastructure));
    let reconciler = Reconciler::new(Arc::clone(&provider), config, &log());
    (provider, reconciler)
}

fn addr(s: &str) -> Option<Ipv4Addr> {
    Some(s.parse().unwrap())
}

// Empty observed set: both VMs are created and the keyed output maps
// mirror the desired key space.
#[tokio::test]
async fn test_apply_creates_fleet() {
    let fleet = fleet();
    let (provider, reconciler) = harness(&fleet);

    let report = reconciler.apply(&fleet).await.unwrap();
    assert!(!report.has_failures());
    assert_eq!(report.results.len(), 2);
    assert_eq!(report.results["vm1"].status, VmStatus::Created);
    assert_eq!(report.results["vm2"].status, VmStatus::Created);

    assert_eq!(
        report.ip_addresses(),
        BTreeMap::from([
            ("vm1".to_string(), addr("192.168.1.97")),
            ("vm2".to_string(), addr("192.168.1.98")),
        ])
    );
    assert_eq!(
        report.vm_names(),
        BTreeMap::from([
            ("vm1".to_string(), Some("ubuntu24-04-vm1".to_string())),
            ("vm2".to_string(), Some("ubuntu24-04-vm2".to_string())),
        ])
    );

    assert_eq!(provider.create_calls(), 2);
    // The fixed firmware policy applied to both VMs.
    for key in ["vm1", "vm2"] {
        assert_eq!(
            provider.vm_firmware(key).await,
            Some(Firmware::Efi { secure_boot: false })
        );
    }
}

// A key already present remotely is left alone; only the missing sibling
// is created.
#[tokio::test]
async fn test_apply_skips_existing() {
    let fleet = fleet();
    let (provider, reconciler) = harness(&fleet);

    let mut only_vm1 = fleet.clone();
    only_vm1.vms.remove("vm2");
    let report = reconciler.apply(&only_vm1).await.unwrap();
    assert_eq!(report.results.len(), 1);
    let vm1_uuid =
        report.results["vm1"].observed.as_ref().unwrap().provider_uuid;

    let report = reconciler.apply(&fleet).await.unwrap();
    assert_eq!(report.results["vm1"].status, VmStatus::Unchanged);
    assert_eq!(report.results["vm2"].status, VmStatus::Created);
    assert_eq!(
        report.results["vm1"].observed.as_ref().unwrap().provider_uuid,
        vm1_uuid
    );
    // One create per key, ever.
    assert_eq!(provider.create_calls(), 2);
}

// Converging twice with no drift creates nothing on the second run.
#[tokio::test]
async fn test_apply_idempotent() {
    let fleet = fleet();
    let (provider, reconciler) = harness(&fleet);

    reconciler.apply(&fleet).await.unwrap();
    assert_eq!(provider.create_calls(), 2);

    let plan = reconciler.plan(&fleet).await.unwrap();
    assert!(plan.is_noop());
    assert_eq!(plan.unchanged.len(), 2);

    let report = reconciler.apply(&fleet).await.unwrap();
    assert_eq!(provider.create_calls(), 2);
    assert!(report
        .results
        .values()
        .all(|result| result.status == VmStatus::Unchanged));
}

// One key's provider failure does not prevent the sibling from reaching
// Created, and the failed key never shows up as created.
#[tokio::test]
async fn test_per_key_fault_isolation() {
    let fleet = fleet();
    let (provider, reconciler) = harness(&fleet);
    provider.inject_create_failure("vm1").await;

    let report = reconciler.apply(&fleet).await.unwrap();
    assert!(report.has_failures());
    assert_eq!(report.failed_keys(), vec!["vm1"]);

    let vm1 = &report.results["vm1"];
    assert_eq!(vm1.status, VmStatus::Failed);
    assert!(vm1.observed.is_none());
    assert!(vm1.error.as_ref().unwrap().contains("clone failure"));

    let vm2 = &report.results["vm2"];
    assert_eq!(vm2.status, VmStatus::Created);

    // Key-space fidelity: exactly the desired keys, nothing else.
    assert_eq!(
        report.results.keys().collect::<Vec<_>>(),
        vec!["vm1", "vm2"]
    );
    assert_eq!(report.ip_addresses()["vm1"], None);
    assert_eq!(report.vm_names()["vm1"], None);

    // The failed key converges on the next run.
    let report = reconciler.apply(&fleet).await.unwrap();
    assert!(!report.has_failures());
    assert_eq!(report.results["vm1"].status, VmStatus::Created);
    assert_eq!(report.results["vm2"].status, VmStatus::Unchanged);
}

// Transient listing errors during observation are retried with backoff;
// the run still converges without surfacing them.
#[tokio::test]
async fn test_transient_list_errors_are_retried() {
    let fleet = fleet();
    let (provider, reconciler) = harness(&fleet);
    provider.inject_list_failures(2).await;

    let report = reconciler.apply(&fleet).await.unwrap();
    assert!(!report.has_failures());
    assert_eq!(report.results["vm1"].status, VmStatus::Created);
    assert_eq!(report.results["vm2"].status, VmStatus::Created);
    assert_eq!(provider.create_calls(), 2);
}

// A non-retryable listing error fails the run immediately, before any
// mutation.
#[tokio::test]
async fn test_permanent_list_error_is_fatal() {
    let fleet = fleet();
    let (provider, reconciler) = harness(&fleet);
    provider.inject_list_failure_permanent().await;

    let error = reconciler.apply(&fleet).await.unwrap_err();
    assert_matches!(error, Error::Provider(_));
    assert_eq!(provider.create_calls(), 0);
    assert!(provider.list_vms().await.unwrap().is_empty());
}

// A template problem aborts the run before any create is issued, for
// every key.
#[tokio::test]
async fn test_template_error_is_preflight() {
    let mut fleet = fleet();
    fleet.guest.dns_servers.truncate(1);
    let (provider, reconciler) = harness(&fleet);

    let error = reconciler.apply(&fleet).await.unwrap_err();
    assert_matches!(error, Error::Template(_));
    assert_eq!(provider.create_calls(), 0);
    assert!(provider.list_vms().await.unwrap().is_empty());
}

// An invalid spec aborts the run before any provider mutation.
#[tokio::test]
async fn test_validation_is_preflight() {
    let mut fleet = fleet();
    fleet.vms.get_mut("vm1").unwrap().cpus = 0;
    let (provider, reconciler) = harness(&fleet);

    let error = reconciler.apply(&fleet).await.unwrap_err();
    assert_matches!(error, Error::Validation(_));
    assert_eq!(provider.create_calls(), 0);
}

// Unresolvable infrastructure names are fatal before any fleet work.
#[tokio::test]
async fn test_resolution_is_fatal() {
    let fleet = fleet();
    let provider = {
        let mut other = fleet.infrastructure.clone();
        other.template = "some-other-template".to_string();
        Arc::new(SimProvider::seeded(log(), &other))
    };
    let reconciler = Reconciler::new(
        Arc::clone(&provider),
        ReconcilerConfig::default(),
        &log(),
    );

    let error = reconciler.apply(&fleet).await.unwrap_err();
    assert_matches!(error, Error::Resolution(_));
    assert_eq!(provider.create_calls(), 0);
}

// By default a remote VM missing from the desired set is left untouched;
// with pruning enabled it is destroyed and reported outside the
// desired-key results.
#[tokio::test]
async fn test_prune_policy() {
    let fleet = fleet();
    let (provider, reconciler) = harness(&fleet);

    let mut with_extra = fleet.clone();
    with_extra.vms.insert("vm9".to_string(), {
        let mut spec = fleet.vms["vm1"].clone();
        spec.name = "ubuntu24-04-vm9".to_string();
        spec.ipv4_address = "192.168.1.99".to_string();
        spec
    });
    reconciler.apply(&with_extra).await.unwrap();
    assert_eq!(provider.list_vms().await.unwrap().len(), 3);

    // vm9 is no longer desired.  Default policy leaves it running.
    let report = reconciler.apply(&fleet).await.unwrap();
    assert_eq!(report.results.len(), 2);
    assert!(report.pruned.is_empty());
    assert_eq!(provider.list_vms().await.unwrap().len(), 3);

    let pruning = Reconciler::new(
        Arc::clone(&provider),
        ReconcilerConfig { prune: true, ..Default::default() },
        &log(),
    );
    let report = pruning.apply(&fleet).await.unwrap();
    assert_eq!(
        report.results.keys().collect::<Vec<_>>(),
        vec!["vm1", "vm2"]
    );
    assert_eq!(report.pruned["vm9"].status, VmStatus::Destroyed);
    assert_eq!(provider.list_vms().await.unwrap().len(), 2);
}

// destroy removes every desired-tracked VM; rerunning it reports the
// keys as destroyed even though they are already gone.
#[tokio::test]
async fn test_destroy() {
    let fleet = fleet();
    let (provider, reconciler) = harness(&fleet);
    reconciler.apply(&fleet).await.unwrap();

    let report = reconciler.destroy(&fleet).await.unwrap();
    assert!(!report.has_failures());
    assert!(report
        .results
        .values()
        .all(|result| result.status == VmStatus::Destroyed));
    assert!(provider.list_vms().await.unwrap().is_empty());

    let report = reconciler.destroy(&fleet).await.unwrap();
    assert_eq!(report.results.len(), 2);
    assert!(report
        .results
        .values()
        .all(|result| result.status == VmStatus::Destroyed));
}

// A large fleet converges correctly with a small concurrency bound.
#[tokio::test]
async fn test_bounded_fan_out() {
    let mut fleet = fleet();
    let base = fleet.vms["vm1"].clone();
    for i in 3..=20 {
        let mut spec = base.clone();
        spec.name = format!("ubuntu24-04-vm{}", i);
        spec.ipv4_address = format!("192.168.1.{}", 100 + i);
        fleet.vms.insert(format!("vm{}", i), spec);
    }
    let (provider, reconciler) = harness_with_config(
        &fleet,
        ReconcilerConfig { max_concurrency: 3, ..Default::default() },
    );

    let report = reconciler.apply(&fleet).await.unwrap();
    assert!(!report.has_failures());
    assert_eq!(report.results.len(), fleet.vms.len());
    assert_eq!(provider.create_calls(), fleet.vms.len());
    assert_eq!(
        provider.list_vms().await.unwrap().len(),
        fleet.vms.len()
    );
}
