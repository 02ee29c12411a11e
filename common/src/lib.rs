// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Facilities shared by all flotilla components: the desired-state model,
//! the error taxonomy, and retry policies.
//!
//! Flotilla converges a declared fleet of virtual machines toward its
//! desired state by cloning missing VMs from a golden template image.  This
//! crate holds the types that describe that desired state and the errors
//! that the rest of the system reports.

pub mod backoff;
pub mod error;
pub mod fleet;
