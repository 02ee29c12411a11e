// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The reconciliation engine: single-shot convergence of a VM fleet
//!
//! Given a desired fleet and a provider, the engine computes the
//! difference between the desired and observed key sets and drives
//! convergence: create missing VMs, leave existing ones untouched, and
//! (only when pruning is requested) destroy VMs that are no longer
//! desired.  Per-key operations are independent, run with bounded
//! parallelism, and each carries its own fault boundary, so one VM's
//! failure never aborts its siblings.
//!
//! This is run-to-completion convergence, not a control loop: the engine
//! does not watch for drift, and a VM whose key already exists is left
//! alone.

mod engine;
mod plan;
mod report;
mod state;
mod tasks;

pub use engine::Error;
pub use engine::Reconciler;
pub use engine::ReconcilerConfig;
pub use engine::DEFAULT_MAX_CONCURRENCY;
pub use plan::Plan;
pub use report::FleetReport;
pub use report::VmResult;
pub use report::VmStatus;
pub use state::ConvergeState;
