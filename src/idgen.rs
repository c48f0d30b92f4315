use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use uuid::Uuid;

/// Generates 64-bit job identifiers that are monotonic within the process
/// and unique across restarts: the counter is seeded with the startup time
/// shifted left, leaving 2^20 ids per millisecond of headroom. Decimal
/// rendering of every generated id has the same width, so key-ascending
/// order over `jobs/pending/` equals submission order.
#[derive(Debug)]
pub struct JobIdGenerator {
    next: AtomicU64,
}

impl JobIdGenerator {
    pub fn new() -> Self {
        let seed = (Utc::now().timestamp_millis() as u64) << 20;
        Self {
            next: AtomicU64::new(seed),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for JobIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Name under which an execution is tracked on the container orchestrator.
pub fn generate_k8s_name() -> String {
    format!("octavius-{}", Uuid::new_v4())
}
