// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded parallel fan-out for per-key convergence work
//!
//! Tasks are spawned eagerly onto a [`JoinSet`] but each waits for a
//! semaphore permit before doing any work, so at most `limit` of them
//! execute at a time.  The remote API never sees more than `limit`
//! in-flight operations regardless of fleet size.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

pub struct FanOut<T> {
    semaphore: Arc<Semaphore>,
    tasks: JoinSet<T>,
}

impl<T: Send + 'static> FanOut<T> {
    /// Create a fan-out that runs at most `limit` tasks at a time.
    pub fn new(limit: usize) -> FanOut<T> {
        assert!(limit > 0, "fan-out limit must be nonzero");
        FanOut {
            semaphore: Arc::new(Semaphore::new(limit)),
            tasks: JoinSet::new(),
        }
    }

    /// Spawn a unit of work.  It begins executing once a permit is
    /// available and holds the permit until it finishes.
    pub fn spawn<F>(&mut self, work: F)
    where
        F: Future<Output = T> + Send + 'static,
    {
        let semaphore = Arc::clone(&self.semaphore);
        self.tasks.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .expect("semaphore is never closed");
            work.await
        });
    }

    /// Wait for every spawned task and collect the results, in completion
    /// order.
    ///
    /// # Panics
    ///
    /// Panics if a task panicked or was aborted.
    pub async fn join_all(self) -> Vec<T> {
        self.tasks.join_all().await
    }
}
