use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Per-origin version counters enforcing FIFO apply order for replicated
/// operations. Local versions stamp outgoing messages; remote waits gate
/// incoming ones. Waits wake every `wait_timeout` to re-check and loop —
/// there is no overall deadline, slow peers only delay, never error.
pub struct VersionRegistry {
    wait_timeout: Duration,
    versions: Mutex<HashMap<String, i64>>,
    cond: Condvar,
}

impl VersionRegistry {
    pub fn new(wait_replica_timeout_s: u64) -> Self {
        Self {
            wait_timeout: Duration::from_secs(wait_replica_timeout_s.max(1)),
            versions: Mutex::new(HashMap::new()),
            cond: Condvar::new(),
        }
    }

    /// Post-increment the local version for `sid`, returning the new value
    /// used to stamp the outgoing message.
    pub fn update_local_version(&self, sid: &str) -> i64 {
        let mut versions = self.versions.lock().expect("version registry lock poisoned");
        let version = versions.entry(sid.to_string()).or_insert(0);
        *version += 1;
        *version
    }

    pub fn get_local_version(&self, sid: &str) -> i64 {
        let versions = self.versions.lock().expect("version registry lock poisoned");
        versions.get(sid).copied().unwrap_or(0)
    }

    /// Block until `version - 1` is the stored value for `sid`, then store
    /// `version` and wake waiters. This is the FIFO apply barrier for
    /// replicated registrations from one origin.
    pub fn wait_update_remote_version(&self, sid: &str, version: i64) {
        let mut versions = self.versions.lock().expect("version registry lock poisoned");
        while versions.get(sid).copied().unwrap_or(0) != version - 1 {
            versions = self
                .cond
                .wait_timeout(versions, self.wait_timeout)
                .expect("version registry lock poisoned")
                .0;
        }
        versions.insert(sid.to_string(), version);
        self.cond.notify_all();
    }

    /// Store `version` unconditionally and wake waiters.
    pub fn update_remote_version(&self, sid: &str, version: i64) {
        let mut versions = self.versions.lock().expect("version registry lock poisoned");
        versions.insert(sid.to_string(), version);
        self.cond.notify_all();
    }

    /// Block until the stored value for `sid` is at least `version`,
    /// without mutating. Used by operations that must observe a write
    /// previously replicated from that origin.
    pub fn wait_remote_version(&self, sid: &str, version: i64) {
        let mut versions = self.versions.lock().expect("version registry lock poisoned");
        while versions.get(sid).copied().unwrap_or(0) < version {
            versions = self
                .cond
                .wait_timeout(versions, self.wait_timeout)
                .expect("version registry lock poisoned")
                .0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn local_versions_increment() {
        let registry = VersionRegistry::new(60);
        assert_eq!(registry.get_local_version("a"), 0);
        assert_eq!(registry.update_local_version("a"), 1);
        assert_eq!(registry.update_local_version("a"), 2);
        assert_eq!(registry.update_local_version("b"), 1);
        assert_eq!(registry.get_local_version("a"), 2);
    }

    #[test]
    fn out_of_order_arrivals_apply_in_fifo() {
        // version 2 arrives before version 1; the apply barrier holds it
        // back until 1 lands
        let registry = Arc::new(VersionRegistry::new(60));
        let order = Arc::new(Mutex::new(Vec::new()));

        let second = {
            let registry = registry.clone();
            let order = order.clone();
            std::thread::spawn(move || {
                registry.wait_update_remote_version("a", 2);
                order.lock().unwrap().push(2);
            })
        };
        std::thread::sleep(Duration::from_millis(100));
        assert!(order.lock().unwrap().is_empty());

        registry.wait_update_remote_version("a", 1);
        order.lock().unwrap().push(1);
        second.join().unwrap();

        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
        assert_eq!(registry.get_local_version("a"), 2);
    }

    #[test]
    fn wait_remote_version_observes_progress() {
        let registry = Arc::new(VersionRegistry::new(60));
        let waiter = {
            let registry = registry.clone();
            std::thread::spawn(move || registry.wait_remote_version("a", 3))
        };
        registry.update_remote_version("a", 3);
        waiter.join().unwrap();
        // no mutation beyond what the update applied
        assert_eq!(registry.get_local_version("a"), 3);
    }
}
