//! In-memory map from task id to its armed timer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Called with `(task_id, fire_at)` when an armed timer expires.
pub type FireCallback = Arc<dyn Fn(String, DateTime<Utc>) + Send + Sync>;

struct ArmedTimer {
    fire_at: DateTime<Utc>,
    generation: u64,
    cancel: CancellationToken,
}

/// At most one timer per task. Re-arming replaces (and cancels) the previous
/// timer, so an old schedule can never fire after an update.
pub struct JobRegistry {
    timers: Arc<DashMap<String, ArmedTimer>>,
    generation: AtomicU64,
    on_fire: FireCallback,
}

impl JobRegistry {
    pub fn new(on_fire: FireCallback) -> Self {
        Self {
            timers: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
            on_fire,
        }
    }

    /// Arm (or re-arm) `task_id` to fire at `fire_at`. A time in the past
    /// fires immediately. Must be called from within a Tokio runtime.
    pub fn arm(&self, task_id: &str, fire_at: DateTime<Utc>) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let replaced = self.timers.insert(
            task_id.to_string(),
            ArmedTimer {
                fire_at,
                generation,
                cancel: cancel.clone(),
            },
        );
        if let Some(old) = replaced {
            old.cancel.cancel();
        }
        debug!(task_id, %fire_at, "timer armed");

        let delay = (fire_at - Utc::now()).to_std().unwrap_or_default();
        let timers = Arc::clone(&self.timers);
        let on_fire = Arc::clone(&self.on_fire);
        let id = task_id.to_string();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    // Only the timer that is still registered may fire.
                    if timers.remove_if(&id, |_, t| t.generation == generation).is_some() {
                        on_fire(id, fire_at);
                    }
                }
            }
        });
    }

    /// Cancel the timer for `task_id`. Returns whether one was armed.
    pub fn disarm(&self, task_id: &str) -> bool {
        match self.timers.remove(task_id) {
            Some((_, timer)) => {
                timer.cancel.cancel();
                debug!(task_id, "timer disarmed");
                true
            }
            None => false,
        }
    }

    pub fn disarm_all(&self) {
        let ids: Vec<String> = self.timers.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.disarm(&id);
        }
    }

    pub fn is_armed(&self, task_id: &str) -> bool {
        self.timers.contains_key(task_id)
    }

    pub fn fire_time(&self, task_id: &str) -> Option<DateTime<Utc>> {
        self.timers.get(task_id).map(|t| t.fire_at)
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    fn recording() -> (JobRegistry, Arc<Mutex<Vec<String>>>) {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&fired);
        let registry = JobRegistry::new(Arc::new(move |id, _| sink.lock().unwrap().push(id)));
        (registry, fired)
    }

    #[tokio::test]
    async fn fires_once_and_unregisters() {
        let (registry, fired) = recording();
        registry.arm("a", Utc::now() + chrono::Duration::milliseconds(20));
        assert!(registry.is_armed("a"));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(*fired.lock().unwrap(), vec!["a".to_string()]);
        assert!(!registry.is_armed("a"));
    }

    #[tokio::test]
    async fn rearm_replaces_previous_timer() {
        let (registry, fired) = recording();
        let later = Utc::now() + chrono::Duration::seconds(30);
        registry.arm("a", Utc::now() + chrono::Duration::milliseconds(20));
        registry.arm("a", later);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.fire_time("a"), Some(later));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(fired.lock().unwrap().is_empty());
        assert!(registry.is_armed("a"));
    }

    #[tokio::test]
    async fn disarm_prevents_fire() {
        let (registry, fired) = recording();
        registry.arm("a", Utc::now() + chrono::Duration::milliseconds(20));
        registry.arm("b", Utc::now() + chrono::Duration::milliseconds(20));
        assert!(registry.disarm("a"));
        assert!(!registry.disarm("a"));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(*fired.lock().unwrap(), vec!["b".to_string()]);

        registry.arm("c", Utc::now() + chrono::Duration::seconds(30));
        registry.disarm_all();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn past_fire_time_fires_immediately() {
        let (registry, fired) = recording();
        registry.arm("late", Utc::now() - chrono::Duration::minutes(5));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.lock().unwrap().len(), 1);
    }
}
