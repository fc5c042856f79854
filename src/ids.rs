use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static ROUTE_SEQ: AtomicU64 = AtomicU64::new(1);

/// Monotonic counter prefixed `rt-`. Unique for the life of the process.
pub fn next_route_id() -> String {
    let n = ROUTE_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("rt-{n:x}")
}

/// Timestamp-derived salt prefixed `sess-`. Collisions are acceptable at the
/// granularity of one process (no two sessions register in the same
/// nanosecond with the same random tail).
pub fn next_session_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let salt: u32 = rand::random();
    format!("sess-{nanos:x}-{salt:08x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_ids_are_unique_and_prefixed() {
        let a = next_route_id();
        let b = next_route_id();
        assert_ne!(a, b);
        assert!(a.starts_with("rt-"));
        assert!(b.starts_with("rt-"));
    }

    #[test]
    fn session_ids_are_unique_and_prefixed() {
        let a = next_session_id();
        let b = next_session_id();
        assert_ne!(a, b);
        assert!(a.starts_with("sess-"));
    }
}
