//! Per-provider concurrency caps.

use std::collections::HashMap;

use tokio::sync::{Semaphore, SemaphorePermit};

use crate::models::Provider;

/// FIFO semaphores bounding in-flight upstream calls per provider.
/// Exceeding capacity blocks the caller; acquisition never fails.
pub struct ProviderLimiter {
    semaphores: HashMap<Provider, Semaphore>,
}

impl ProviderLimiter {
    pub fn new() -> Self {
        let semaphores = Provider::all()
            .into_iter()
            .map(|p| (p, Semaphore::new(p.max_concurrency())))
            .collect();
        Self { semaphores }
    }

    /// Acquire a slot for one upstream call. The permit is released on drop,
    /// including on cancellation.
    pub async fn acquire(&self, provider: Provider) -> SemaphorePermit<'_> {
        self.semaphores[&provider]
            .acquire()
            .await
            .expect("provider semaphore is never closed")
    }

    /// Currently free slots for a provider.
    pub fn available(&self, provider: Provider) -> usize {
        self.semaphores[&provider].available_permits()
    }
}

impl Default for ProviderLimiter {
    fn default() -> Self {
        Self::new()
    }
}
