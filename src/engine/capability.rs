//! Structured-output capability cache.
//!
//! Answers "does runtime probing show this model emits structured output?"
//! with a TTL. Concurrent first-time lookups share a single in-flight probe
//! through a per-key watch channel.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::debug;

/// How long a probe result stays valid.
pub const CAPABILITY_TTL: Duration = Duration::from_secs(3600);

pub struct CapabilityCache {
    ttl: Duration,
    slots: Mutex<HashMap<String, Slot>>,
}

enum Slot {
    Ready { value: bool, inserted_at: Instant },
    Probing(watch::Receiver<Option<bool>>),
}

enum Action {
    Return(bool),
    Wait(watch::Receiver<Option<bool>>),
    Probe(watch::Sender<Option<bool>>),
}

impl CapabilityCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Fresh cached value, if any. Stale entries are dropped.
    pub fn get(&self, model_id: &str) -> Option<bool> {
        let mut slots = self.slots.lock().unwrap();
        match slots.get(model_id) {
            Some(Slot::Ready { value, inserted_at }) if inserted_at.elapsed() <= self.ttl => {
                Some(*value)
            }
            Some(Slot::Ready { .. }) => {
                slots.remove(model_id);
                None
            }
            _ => None,
        }
    }

    /// Record a value, restarting its TTL window.
    pub fn insert(&self, model_id: &str, value: bool) {
        self.slots.lock().unwrap().insert(
            model_id.to_string(),
            Slot::Ready {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Drop any entry for the model.
    pub fn invalidate(&self, model_id: &str) {
        self.slots.lock().unwrap().remove(model_id);
    }

    /// Resolve the capability, probing at most once per model id across
    /// concurrent callers. The probe returns `Some(value)` to cache a
    /// result, or `None` when inconclusive (nothing is cached and other
    /// waiters retry).
    pub async fn resolve<F, Fut>(&self, model_id: &str, probe: F) -> Option<bool>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Option<bool>>,
    {
        let mut probe = Some(probe);
        loop {
            let action = {
                let mut slots = self.slots.lock().unwrap();
                match slots.get(model_id) {
                    Some(Slot::Ready { value, inserted_at })
                        if inserted_at.elapsed() <= self.ttl =>
                    {
                        Action::Return(*value)
                    }
                    Some(Slot::Probing(rx)) => Action::Wait(rx.clone()),
                    _ => {
                        let (tx, rx) = watch::channel(None);
                        slots.insert(model_id.to_string(), Slot::Probing(rx));
                        Action::Probe(tx)
                    }
                }
            };

            match action {
                Action::Return(value) => return Some(value),
                Action::Wait(mut rx) => {
                    loop {
                        if let Some(value) = *rx.borrow() {
                            return Some(value);
                        }
                        // Sender dropped without a value: the prober gave up.
                        if rx.changed().await.is_err() {
                            self.clear_probing(model_id, &rx);
                            break;
                        }
                    }
                }
                Action::Probe(tx) => {
                    let Some(probe) = probe.take() else {
                        // Already probed once this call; leave the slot clear.
                        self.clear_probing(model_id, &tx.subscribe());
                        return None;
                    };
                    debug!(model = model_id, "running capability probe");
                    let outcome = probe().await;
                    match outcome {
                        Some(value) => {
                            self.insert(model_id, value);
                            let _ = tx.send(Some(value));
                            return Some(value);
                        }
                        None => {
                            self.clear_probing(model_id, &tx.subscribe());
                            return None;
                        }
                    }
                }
            }
        }
    }

    /// Remove the probing slot for `model_id`, but only if it still belongs
    /// to the given channel; a newer probe's slot is left alone.
    fn clear_probing(&self, model_id: &str, channel: &watch::Receiver<Option<bool>>) {
        let mut slots = self.slots.lock().unwrap();
        if let Some(Slot::Probing(existing)) = slots.get(model_id) {
            if existing.same_channel(channel) {
                slots.remove(model_id);
            }
        }
    }
}

impl Default for CapabilityCache {
    fn default() -> Self {
        Self::new(CAPABILITY_TTL)
    }
}
