use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};

/// Execution context passed explicitly through every engine and executor
/// call. Time and id generation sit behind traits so tests can pin both.
#[derive(Clone)]
pub struct RuntimeContext {
    pub time_provider: Arc<dyn TimeProvider>,
    pub id_generator: Arc<dyn IdGenerator>,
}

impl Default for RuntimeContext {
    fn default() -> Self {
        Self {
            time_provider: Arc::new(RealTimeProvider),
            id_generator: Arc::new(RealIdGenerator),
        }
    }
}

impl RuntimeContext {
    pub fn new(
        time_provider: Arc<dyn TimeProvider>,
        id_generator: Arc<dyn IdGenerator>,
    ) -> Self {
        Self {
            time_provider,
            id_generator,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.time_provider.now()
    }

    pub fn next_id(&self) -> String {
        self.id_generator.next_id()
    }
}

pub trait TimeProvider: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn now_timestamp(&self) -> i64 {
        self.now().timestamp()
    }

    fn elapsed_secs(&self, since: DateTime<Utc>) -> u64 {
        let delta = self.now().signed_duration_since(since).num_seconds();
        delta.max(0) as u64
    }
}

pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> String;
}

pub struct RealTimeProvider;

impl TimeProvider for RealTimeProvider {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub struct RealIdGenerator;

impl IdGenerator for RealIdGenerator {
    fn next_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

/// Clock pinned to an epoch-seconds value, advanceable from tests.
pub struct FakeTimeProvider {
    timestamp: AtomicI64,
}

impl FakeTimeProvider {
    pub fn new(timestamp: i64) -> Self {
        Self {
            timestamp: AtomicI64::new(timestamp),
        }
    }

    pub fn advance_secs(&self, secs: i64) {
        self.timestamp.fetch_add(secs, Ordering::SeqCst);
    }
}

impl TimeProvider for FakeTimeProvider {
    fn now(&self) -> DateTime<Utc> {
        let ts = self.timestamp.load(Ordering::SeqCst);
        Utc.timestamp_opt(ts, 0).single().unwrap_or_default()
    }
}

pub struct FakeIdGenerator {
    prefix: String,
    counter: AtomicU64,
}

impl FakeIdGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: AtomicU64::new(0),
        }
    }
}

impl IdGenerator for FakeIdGenerator {
    fn next_id(&self) -> String {
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        format!("{}-{}", self.prefix, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fake_time_advances() {
        let time = FakeTimeProvider::new(1_000);
        let start = time.now();
        time.advance_secs(42);
        assert_eq!(time.elapsed_secs(start), 42);
    }

    #[test]
    fn test_fake_ids_are_sequential() {
        let ids = FakeIdGenerator::new("exec");
        assert_eq!(ids.next_id(), "exec-0");
        assert_eq!(ids.next_id(), "exec-1");
    }

    #[test]
    fn test_real_id_generator_unique() {
        let ids = RealIdGenerator;
        assert_ne!(ids.next_id(), ids.next_id());
    }
}
