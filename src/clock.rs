use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

/// Process-local clock used for server-timestamp assignment.
///
/// `now()` is plain wall-clock UTC. `next_timestamp()` is wall-clock
/// milliseconds made strictly increasing: two calls landing in the same
/// millisecond are tie-broken by bumping past the last value handed out.
/// Sync ordering (per-user delta order, high-water marks) relies on this.
#[derive(Debug, Default)]
pub struct Clock {
    last_ms: AtomicI64,
}

impl Clock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    pub fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }

    /// Strictly increasing millisecond timestamp.
    pub fn next_timestamp(&self) -> i64 {
        let wall = self.now_ms();
        let mut prev = self.last_ms.load(Ordering::Relaxed);
        loop {
            let next = if wall > prev { wall } else { prev + 1 };
            match self.last_ms.compare_exchange_weak(
                prev,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(observed) => prev = observed,
            }
        }
    }
}

/// 128-bit opaque identifier with negligible collision probability.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn timestamps_strictly_increase() {
        let clock = Clock::new();
        let mut prev = clock.next_timestamp();
        for _ in 0..10_000 {
            let next = clock.next_timestamp();
            assert!(next > prev, "expected {} > {}", next, prev);
            prev = next;
        }
    }

    #[test]
    fn timestamps_strictly_increase_across_threads() {
        let clock = Arc::new(Clock::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let clock = clock.clone();
            handles.push(std::thread::spawn(move || {
                (0..1_000).map(|_| clock.next_timestamp()).collect::<Vec<_>>()
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.join().unwrap());
        }

        let unique: HashSet<i64> = all.iter().copied().collect();
        assert_eq!(unique.len(), all.len());
    }

    #[test]
    fn ids_are_unique() {
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            assert!(seen.insert(new_id()));
        }
    }
}
