// Shared harness for the scheduler integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use datagen_core::config::{OutputConfig, SchedulerConfig};
use datagen_core::types::{FieldSpec, Row};
use datagen_generator::{BuiltinGenerator, DataGenerator, GenerateError};
use datagen_scheduler::output::OutputDispatcher;
use datagen_scheduler::{NewTask, SchedulerService, TaskLifecycle, TaskStore};

pub const OWNER: &str = "alice";

/// Always fails, like a generator handed a field type it does not know.
pub struct Failing;

impl DataGenerator for Failing {
    fn generate(&self, _fields: &[FieldSpec], _count: u32) -> datagen_generator::Result<Vec<Row>> {
        Err(GenerateError::Failed("upstream sample pool unavailable".into()))
    }
}

/// Built-in generation that takes at least `delay`.
pub struct Slow {
    pub delay: Duration,
}

impl DataGenerator for Slow {
    fn generate(&self, fields: &[FieldSpec], count: u32) -> datagen_generator::Result<Vec<Row>> {
        std::thread::sleep(self.delay);
        BuiltinGenerator::new().generate(fields, count)
    }
}

pub fn scheduler_config() -> SchedulerConfig {
    SchedulerConfig {
        workers: 4,
        shutdown_timeout_secs: 5,
        ..SchedulerConfig::default()
    }
}

pub fn lifecycle_with(store: TaskStore, generator: Arc<dyn DataGenerator>) -> TaskLifecycle {
    let dispatcher = Arc::new(OutputDispatcher::new(&OutputConfig::default()).unwrap());
    let service = SchedulerService::new(&scheduler_config(), Arc::new(store), generator, dispatcher);
    service.start().unwrap();
    TaskLifecycle::new(service)
}

pub fn lifecycle(generator: Arc<dyn DataGenerator>) -> TaskLifecycle {
    lifecycle_with(TaskStore::open_in_memory().unwrap(), generator)
}

pub fn builtin() -> Arc<dyn DataGenerator> {
    Arc::new(BuiltinGenerator::new())
}

pub fn task_spec(cron: &str, row_count: u32) -> NewTask {
    let mut spec = NewTask::new(
        "daily customers",
        cron,
        vec![
            FieldSpec::new("id", "uuid"),
            FieldSpec::new("name", "englishName"),
            FieldSpec::new("email", "email"),
        ],
    );
    spec.timezone = Some("UTC".into());
    spec.row_count = row_count;
    spec
}

/// Poll `check` every 20ms for up to 5s.
pub async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..250 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

/// Wait until `task_id` has `runs` finalised runs and its settle step is done.
pub async fn wait_for_runs(lc: &TaskLifecycle, task_id: &str, runs: u32) -> bool {
    wait_until(|| {
        let done = lc
            .service()
            .store()
            .get_task(task_id)
            .unwrap()
            .is_some_and(|t| t.run_count >= runs);
        done && !lc.service().is_in_flight(task_id)
    })
    .await
}
