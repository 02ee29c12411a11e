// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The convergence engine
//!
//! An apply cycle runs in strict phases:
//!
//! 1. Validate every desired spec (fatal, no remote calls yet).
//! 2. Resolve infrastructure handles, exactly once (fatal on failure; the
//!    handles are shared read-only by all per-VM work).
//! 3. Observe the provider's current VM set, retrying transient errors
//!    with backoff.
//! 4. Render every boot document (fatal on template errors, still before
//!    the first mutation).
//! 5. Fan out per-key creates (and prune destroys), bounded, each with
//!    its own fault boundary.
//! 6. Aggregate per-key results into a [`FleetReport`].
//!
//! There is no ordering guarantee among sibling per-VM operations and no
//! rollback: independently-succeeding VMs stay created even when a
//! sibling fails.  Mutations are never retried automatically.

use crate::plan::Plan;
use crate::report::FleetReport;
use crate::report::VmResult;
use crate::report::VmStatus;
use crate::state::ConvergeState;
use crate::tasks::FanOut;
use flotilla_cloudinit::TemplateError;
use flotilla_common::backoff;
use flotilla_common::backoff::BackoffError;
use flotilla_common::error::ProviderError;
use flotilla_common::error::ResolutionError;
use flotilla_common::error::ValidationError;
use flotilla_common::fleet::FleetDescription;
use flotilla_provider::InfrastructureHandles;
use flotilla_provider::ObservedVm;
use flotilla_provider::Provider;
use slog::{info, o, warn, Logger};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Default bound on concurrently in-flight per-VM operations
pub const DEFAULT_MAX_CONCURRENCY: usize = 16;

/// A whole-run-fatal convergence failure.  Every variant is raised before
/// the first remote mutation of the cycle; per-VM failures are carried in
/// the report instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    #[error(transparent)]
    Template(#[from] TemplateError),
    /// The provider could not even be observed (listing VMs failed after
    /// retries).
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

#[derive(Clone, Copy, Debug)]
pub struct ReconcilerConfig {
    /// Bound on concurrently in-flight per-VM operations
    pub max_concurrency: usize,
    /// Whether apply destroys observed VMs absent from the desired set.
    /// Off by default: the default policy is non-destructive.
    pub prune: bool,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        ReconcilerConfig {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            prune: false,
        }
    }
}

pub struct Reconciler<P> {
    provider: Arc<P>,
    config: ReconcilerConfig,
    log: Logger,
}

impl<P: Provider + 'static> Reconciler<P> {
    pub fn new(
        provider: Arc<P>,
        config: ReconcilerConfig,
        log: &Logger,
    ) -> Reconciler<P> {
        Reconciler {
            provider,
            config,
            log: log.new(o!("component" => "reconciler")),
        }
    }

    /// Observe the provider's current VM set, retrying transient failures.
    async fn observe(&self) -> Result<Vec<ObservedVm>, Error> {
        let log = self.log.clone();
        let list = || async {
            self.provider.list_vms().await.map_err(|error| {
                if error.retryable() {
                    BackoffError::transient(error)
                } else {
                    BackoffError::permanent(error)
                }
            })
        };
        let log_retry = |error, delay| {
            warn!(log, "transient error listing vms, will retry in {:?}",
                delay; "error" => %error);
        };
        let observed = backoff::retry_notify(
            backoff::provider_query_policy(),
            list,
            log_retry,
        )
        .await?;
        Ok(observed)
    }

    /// Validate, resolve, observe, and diff.  The shared pre-flight for
    /// every verb; mutates nothing.
    async fn preflight(
        &self,
        fleet: &FleetDescription,
        prune: bool,
    ) -> Result<(InfrastructureHandles, Vec<ObservedVm>, Plan), Error> {
        fleet.validate()?;
        let handles =
            self.provider.resolve_handles(&fleet.infrastructure).await?;
        let observed = self.observe().await?;
        let plan = Plan::diff(fleet, &observed, prune);
        Ok((handles, observed, plan))
    }

    /// Compute what an apply cycle would do.  No mutation.
    pub async fn plan(
        &self,
        fleet: &FleetDescription,
    ) -> Result<Plan, Error> {
        let (_, _, plan) =
            self.preflight(fleet, self.config.prune).await?;
        Ok(plan)
    }

    /// Converge the observed fleet toward the desired one.
    ///
    /// Returns a report keyed exactly by the desired key space.  A report
    /// with failed keys is still `Ok`: per-VM failures are not fatal to
    /// the cycle, and the caller decides what a failed key means for the
    /// process exit status.
    pub async fn apply(
        &self,
        fleet: &FleetDescription,
    ) -> Result<FleetReport, Error> {
        let (handles, observed, plan) =
            self.preflight(fleet, self.config.prune).await?;
        info!(self.log, "computed plan";
            "create" => plan.to_create.len(),
            "destroy" => plan.to_destroy.len(),
            "unchanged" => plan.unchanged.len());

        // Render every boot document before issuing the first create, so
        // a template problem aborts the cycle with zero remote mutations.
        let mut boot_documents = BTreeMap::new();
        for key in &plan.to_create {
            let documents =
                flotilla_cloudinit::render(key, &fleet.vms[key], &fleet.guest)?;
            boot_documents.insert(key.clone(), documents.encode());
        }

        let observed_by_key: BTreeMap<String, ObservedVm> = observed
            .into_iter()
            .map(|vm| (vm.key.clone(), vm))
            .collect();

        let handles = Arc::new(handles);
        let mut fanout = FanOut::new(self.config.max_concurrency);

        for (key, boot) in boot_documents {
            let provider = Arc::clone(&self.provider);
            let handles = Arc::clone(&handles);
            let spec = fleet.vms[&key].clone();
            let log = self.log.new(o!("vm" => key.clone()));
            fanout.spawn(async move {
                let state = ConvergeState::Absent.working();
                info!(log, "creating vm"; "state" => %state,
                    "name" => &spec.name);
                match provider.create_vm(&key, &spec, &boot, &handles).await
                {
                    Ok(vm) => {
                        let state = state.succeeded();
                        info!(log, "vm created"; "state" => %state,
                            "uuid" => %vm.provider_uuid);
                        let result = VmResult {
                            key: key.clone(),
                            status: VmStatus::Created,
                            observed: Some(vm),
                            error: None,
                        };
                        (key, result, false)
                    }
                    Err(error) => {
                        let state = state.failed();
                        warn!(log, "vm creation failed"; "state" => %state,
                            "error" => %error);
                        let result = VmResult {
                            key: key.clone(),
                            status: VmStatus::Failed,
                            observed: None,
                            error: Some(error.to_string()),
                        };
                        (key, result, false)
                    }
                }
            });
        }

        for key in &plan.to_destroy {
            // The key came out of the diff against `observed`, so the
            // record is necessarily there.
            let vm = observed_by_key[key].clone();
            self.spawn_destroy(&mut fanout, vm, true);
        }

        let mut results = BTreeMap::new();
        let mut pruned = BTreeMap::new();
        for (key, result, was_pruned) in fanout.join_all().await {
            if was_pruned {
                pruned.insert(key, result);
            } else {
                results.insert(key, result);
            }
        }

        // Keys that were already converged appear in the report unchanged,
        // so the result key space is exactly the desired key space.
        for key in &plan.unchanged {
            results.insert(key.clone(), VmResult {
                key: key.clone(),
                status: VmStatus::Unchanged,
                observed: observed_by_key.get(key).cloned(),
                error: None,
            });
        }

        let report = FleetReport::new(results, pruned);
        if report.has_failures() {
            warn!(self.log, "apply finished with failures";
                "failed" => ?report.failed_keys());
        } else {
            info!(self.log, "apply finished";
                "vms" => report.results.len());
        }
        Ok(report)
    }

    /// Destroy every desired-tracked VM that exists remotely.  Keys that
    /// are already absent report `Destroyed` with no observed record.
    pub async fn destroy(
        &self,
        fleet: &FleetDescription,
    ) -> Result<FleetReport, Error> {
        fleet.validate()?;
        let observed = self.observe().await?;
        let observed_by_key: BTreeMap<String, ObservedVm> = observed
            .into_iter()
            .map(|vm| (vm.key.clone(), vm))
            .collect();

        let mut fanout = FanOut::new(self.config.max_concurrency);
        let mut results = BTreeMap::new();
        for key in fleet.vms.keys() {
            match observed_by_key.get(key) {
                Some(vm) => {
                    self.spawn_destroy(&mut fanout, vm.clone(), false)
                }
                None => {
                    results.insert(key.clone(), VmResult {
                        key: key.clone(),
                        status: VmStatus::Destroyed,
                        observed: None,
                        error: None,
                    });
                }
            }
        }

        for (key, result, _) in fanout.join_all().await {
            results.insert(key, result);
        }
        let report = FleetReport::new(results, BTreeMap::new());
        info!(self.log, "destroy finished";
            "vms" => report.results.len(),
            "failed" => report.failed_keys().len());
        Ok(report)
    }

    fn spawn_destroy(
        &self,
        fanout: &mut FanOut<(String, VmResult, bool)>,
        vm: ObservedVm,
        was_pruned: bool,
    ) {
        let provider = Arc::clone(&self.provider);
        let log = self.log.new(o!("vm" => vm.key.clone()));
        fanout.spawn(async move {
            let key = vm.key.clone();
            let state = ConvergeState::Present.working();
            info!(log, "destroying vm"; "state" => %state,
                "uuid" => %vm.provider_uuid);
            match provider.destroy_vm(&vm).await {
                Ok(()) => {
                    let state = state.succeeded();
                    info!(log, "vm destroyed"; "state" => %state);
                    let result = VmResult {
                        key: key.clone(),
                        status: VmStatus::Destroyed,
                        observed: None,
                        error: None,
                    };
                    (key, result, was_pruned)
                }
                Err(error) => {
                    let state = state.failed();
                    warn!(log, "vm destroy failed"; "state" => %state,
                        "error" => %error);
                    let result = VmResult {
                        key: key.clone(),
                        status: VmStatus::FailedDestroy,
                        observed: Some(vm),
                        error: Some(error.to_string()),
                    };
                    (key, result, was_pruned)
                }
            }
        });
    }
}
