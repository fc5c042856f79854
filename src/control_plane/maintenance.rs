use crate::control_plane::registry::SessionRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

const MAX_ATTEMPTS: u32 = 60;
const POLL_INTERVAL: Duration = Duration::from_secs(1);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const TOTAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Bounded worker pool (5 concurrent) backing `MAINT_ENTER`'s asynchronous
/// page verifier. Each verifier polls `page_url` once per second for up to
/// `MAX_ATTEMPTS`, and is cancellable by a superseding `MAINT_ENTER` or
/// session teardown for the same `(session_id, target)`.
pub struct MaintenanceWorkers {
    semaphore: Arc<Semaphore>,
    inflight: std::sync::Mutex<std::collections::HashMap<(String, String), JoinHandle<()>>>,
}

impl Default for MaintenanceWorkers {
    fn default() -> Self {
        Self::new(5)
    }
}

impl MaintenanceWorkers {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            inflight: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Cancels any prior verifier for this `(session_id, target)` and spawns
    /// a fresh one. `registry.push_event` delivers the eventual
    /// `MAINT_OK|<target>` or `ERROR|...` line over the session's connection.
    pub fn start_verify(
        self: &Arc<Self>,
        registry: Arc<SessionRegistry>,
        session_id: String,
        target: String,
        page_url: String,
    ) {
        self.cancel(&session_id, &target);
        if page_url.is_empty() {
            return;
        }

        let key = (session_id.clone(), target.clone());
        let workers = self.clone();
        let semaphore = self.semaphore.clone();

        let handle = tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else { return };
            let client = match reqwest::Client::builder().connect_timeout(CONNECT_TIMEOUT).timeout(TOTAL_TIMEOUT).build() {
                Ok(c) => c,
                Err(e) => {
                    registry.push_event(&session_id, format!("ERROR|maintenance verifier build failed: {e}"));
                    return;
                }
            };

            for _ in 0..MAX_ATTEMPTS {
                match client.get(&page_url).send().await {
                    Ok(resp) if resp.status().as_u16() < 500 => {
                        registry.push_event(&session_id, format!("MAINT_OK|{target}"));
                        return;
                    }
                    _ => {}
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
            registry.push_event(&session_id, format!("ERROR|timeout verifying {target}"));
        });

        self.inflight.lock().unwrap().insert(key, handle);
    }

    pub fn cancel(&self, session_id: &str, target: &str) {
        if let Some(handle) = self.inflight.lock().unwrap().remove(&(session_id.to_string(), target.to_string())) {
            handle.abort();
        }
    }

    pub fn cancel_session(&self, session_id: &str) {
        let mut inflight = self.inflight.lock().unwrap();
        let keys: Vec<(String, String)> = inflight.keys().filter(|(s, _)| s == session_id).cloned().collect();
        for key in keys {
            if let Some(handle) = inflight.remove(&key) {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_workers_start_with_no_inflight() {
        let workers = MaintenanceWorkers::new(5);
        assert!(workers.inflight.lock().unwrap().is_empty());
    }

    #[test]
    fn default_capacity_is_five() {
        let workers = MaintenanceWorkers::default();
        assert_eq!(workers.semaphore.available_permits(), 5);
    }
}
