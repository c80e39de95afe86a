//! Request registry, identifier generation, pub/sub fan-out, and the
//! background reclamation of stale requests and subscribers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use rendezvous_types::compose_full_id;
use tracing::instrument;
use utils::context::AppContext;
use utils::telemetry::ServerMetrics;

use crate::config::Config;
use crate::metadata::branch::Branch;
use crate::metadata::request::{
    CloseOutcome, Dependencies, DetailedStatus, RegisterError, Request, WaitOutcome,
};
use crate::metadata::Subscriber;
use crate::replicas::VersionRegistry;

pub struct Server {
    sid: String,
    started_at: SystemTime,
    next_rid: AtomicI64,

    cleanup_requests_interval_m: i64,
    cleanup_requests_validity_m: i64,
    cleanup_subscribers_interval_m: i64,
    cleanup_subscribers_validity_m: i64,
    subscribers_refresh_interval_s: u64,
    wait_replica_timeout_s: u64,

    requests: DashMap<String, Arc<Request>>,
    /// Placeholder registry for fully-closed requests. Nothing promotes
    /// into it yet, but lookups and the reaper already cover it.
    closed_requests: DashMap<String, Arc<Request>>,

    // <service, <region, subscriber>>
    subscribers: RwLock<HashMap<String, HashMap<String, Arc<Subscriber>>>>,

    prevented_inconsistencies: AtomicI64,
    metrics: ServerMetrics,
}

impl Server {
    pub fn new(config: &Config, metrics: ServerMetrics) -> Self {
        tracing::info!(
            "replica '{}': request reaper {}m/{}m, subscriber reaper {}m/{}m, \
             subscriber refresh {}s, replica wait {}s",
            config.replica_id,
            config.cleanup_requests_interval_m,
            config.cleanup_requests_validity_m,
            config.cleanup_subscribers_interval_m,
            config.cleanup_subscribers_validity_m,
            config.subscribers_refresh_interval_s,
            config.wait_replica_timeout_s,
        );
        Self {
            sid: config.replica_id.clone(),
            started_at: SystemTime::now(),
            next_rid: AtomicI64::new(0),
            cleanup_requests_interval_m: config.cleanup_requests_interval_m,
            cleanup_requests_validity_m: config.cleanup_requests_validity_m,
            cleanup_subscribers_interval_m: config.cleanup_subscribers_interval_m,
            cleanup_subscribers_validity_m: config.cleanup_subscribers_validity_m,
            subscribers_refresh_interval_s: config.subscribers_refresh_interval_s,
            wait_replica_timeout_s: config.wait_replica_timeout_s,
            requests: DashMap::new(),
            closed_requests: DashMap::new(),
            subscribers: RwLock::new(HashMap::new()),
            prevented_inconsistencies: AtomicI64::new(0),
            metrics,
        }
    }

    pub fn sid(&self) -> &str {
        &self.sid
    }

    pub fn started_at(&self) -> SystemTime {
        self.started_at
    }

    pub fn num_requests(&self) -> usize {
        self.requests.len()
    }

    pub fn num_prevented_inconsistencies(&self) -> i64 {
        self.prevented_inconsistencies.load(Ordering::SeqCst)
    }

    pub fn wait_replica_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_replica_timeout_s)
    }

    // -----------
    // Identifiers
    // -----------

    pub fn gen_rid(&self) -> String {
        format!("rv_{}_{}", self.sid, self.next_rid.fetch_add(1, Ordering::SeqCst))
    }

    pub fn gen_bid(&self, request: &Request) -> String {
        format!("rv_{}_{}", self.sid, request.gen_id())
    }

    // --------
    // Registry
    // --------

    pub fn get_request(&self, rid: &str) -> Option<Arc<Request>> {
        if let Some(request) = self.requests.get(rid) {
            return Some(request.clone());
        }
        // the request may already have been promoted out of the live set
        self.closed_requests.get(rid).map(|request| request.clone())
    }

    /// Create at most one `Request` per rid; an empty rid gets a generated
    /// one. The entry call below makes the check-then-insert race benign.
    pub fn get_or_register_request(&self, rid: &str) -> Arc<Request> {
        let rid = if rid.is_empty() {
            self.gen_rid()
        } else {
            rid.to_string()
        };

        if let Some(request) = self.requests.get(&rid) {
            return request.clone();
        }

        let request = self
            .requests
            .entry(rid.clone())
            .or_insert_with(|| {
                self.metrics.increment_registered_requests();
                Arc::new(Request::new(
                    rid.clone(),
                    self.sid.len(),
                    VersionRegistry::new(self.wait_replica_timeout_s),
                ))
            })
            .clone();
        request
    }

    // -----------------
    // Publish-subscribe
    // -----------------

    /// Subscriber for (service, region), created on first use.
    pub fn get_subscriber(&self, service: &str, region: &str) -> Arc<Subscriber> {
        {
            let subscribers = self.subscribers.read().expect("subscribers lock poisoned");
            if let Some(subscriber) = subscribers.get(service).and_then(|r| r.get(region)) {
                return subscriber.clone();
            }
        }

        let mut subscribers = self.subscribers.write().expect("subscribers lock poisoned");
        subscribers
            .entry(service.to_string())
            .or_default()
            .entry(region.to_string())
            .or_insert_with(|| {
                Arc::new(Subscriber::new(Duration::from_secs(
                    self.subscribers_refresh_interval_s,
                )))
            })
            .clone()
    }

    /// Push a newly opened branch to every subscriber of its service.
    pub fn publish_branches(&self, service: &str, tag: &str, bid: &str) {
        let subscribers = self.subscribers.read().expect("subscribers lock poisoned");
        if let Some(regions) = subscribers.get(service) {
            for subscriber in regions.values() {
                subscriber.push(bid, tag);
            }
        }
    }

    // ---------------------
    // Core rendezvous logic
    // ---------------------

    pub fn add_next_async_zone(
        &self,
        request: &Request,
        async_zone_id: &str,
        gen_id: bool,
    ) -> Option<String> {
        request.add_next_async_zone(&self.sid, async_zone_id, gen_id)
    }

    #[allow(clippy::too_many_arguments)]
    #[instrument(level = "debug", skip(self, request, regions), fields(subsys = "Server"))]
    pub fn register_branch(
        &self,
        request: &Request,
        async_zone_id: &str,
        service: &str,
        regions: &[String],
        tag: &str,
        parent_service: &str,
        bid: &str,
        monitor: bool,
    ) -> Result<Arc<Branch>, RegisterError> {
        let branch = request.register_branch_with_parent(
            async_zone_id,
            bid,
            service,
            tag,
            regions,
            parent_service,
        )?;
        request.touch();
        self.metrics.increment_registered_branches();

        if monitor {
            let composed_bid = compose_full_id(bid, request.rid());
            self.publish_branches(service, tag, &composed_bid);
        }
        Ok(branch)
    }

    #[instrument(level = "debug", skip(self, request), fields(subsys = "Server"))]
    pub fn close_branch(&self, request: &Request, bid: &str, region: &str) -> CloseOutcome {
        let outcome = request.close_branch(bid, region);
        request.touch();
        if outcome == CloseOutcome::Closed {
            self.metrics.increment_closed_branches();
        }
        outcome
    }

    /// Route a wait to the predicate matching its context and account for
    /// prevented inconsistencies.
    #[allow(clippy::too_many_arguments)]
    #[instrument(level = "debug", skip(self, request), fields(subsys = "Server"))]
    pub fn wait(
        &self,
        request: &Request,
        async_zone_id: &str,
        service: &str,
        region: &str,
        tag: &str,
        async_mode: bool,
        timeout: i64,
        current_service: &str,
        wait_deps: bool,
    ) -> WaitOutcome {
        request.touch();
        let outcome = match (!service.is_empty(), !region.is_empty()) {
            (true, true) => request.wait_service_region(
                service,
                region,
                tag,
                current_service,
                async_mode,
                timeout,
                wait_deps,
            ),
            (true, false) => {
                request.wait_service(service, tag, current_service, async_mode, timeout, wait_deps)
            }
            (false, true) => {
                request.wait_region(async_zone_id, region, current_service, async_mode, timeout)
            }
            (false, false) => request.wait(async_zone_id, current_service, async_mode, timeout),
        };

        if outcome.prevented_inconsistency() {
            self.prevented_inconsistencies.fetch_add(1, Ordering::SeqCst);
            self.metrics.increment_prevented_inconsistencies();
        }
        outcome
    }

    /// Route a status probe; `None` means the async zone is unknown.
    pub fn check_status(
        &self,
        request: &Request,
        async_zone_id: &str,
        service: &str,
        region: &str,
        detailed: bool,
    ) -> Option<DetailedStatus> {
        match (!service.is_empty(), !region.is_empty()) {
            (true, true) => Some(request.check_status_service_region(service, region, detailed)),
            (true, false) => Some(request.check_status_service(service, detailed)),
            (false, true) => request
                .check_status_region(async_zone_id, region)
                .map(DetailedStatus::from_status),
            (false, false) => request
                .check_status(async_zone_id)
                .map(DetailedStatus::from_status),
        }
    }

    /// `None` means the service is unknown.
    pub fn fetch_dependencies(&self, request: &Request, service: &str) -> Option<Dependencies> {
        request.fetch_dependencies(service)
    }

    // ------------------
    // Garbage collectors
    // ------------------

    pub fn start_reapers(self: &Arc<Self>, ctx: &AppContext) {
        self.clone().start_requests_reaper(ctx.clone());
        self.clone().start_subscribers_reaper(ctx.clone());
    }

    fn start_requests_reaper(self: Arc<Self>, ctx: AppContext) {
        if self.cleanup_requests_interval_m <= 0 {
            return;
        }
        let interval = Duration::from_secs(self.cleanup_requests_interval_m as u64 * 60);
        std::thread::spawn(move || loop {
            if sleep_or_killed(&ctx, interval) {
                break;
            }
            self.collect_requests();
        });
    }

    fn start_subscribers_reaper(self: Arc<Self>, ctx: AppContext) {
        if self.cleanup_subscribers_interval_m <= 0 {
            return;
        }
        let interval = Duration::from_secs(self.cleanup_subscribers_interval_m as u64 * 60);
        std::thread::spawn(move || loop {
            if sleep_or_killed(&ctx, interval) {
                break;
            }
            self.collect_subscribers();
        });
    }

    /// Evict requests whose last activity is older than the validity
    /// window, in both the live and the closed registries.
    pub fn collect_requests(&self) {
        let validity = Duration::from_secs(self.cleanup_requests_validity_m.max(0) as u64 * 60);
        let now = SystemTime::now();
        for registry in [&self.requests, &self.closed_requests] {
            let initial = registry.len();
            registry.retain(|_, request| {
                now.duration_since(request.last_activity())
                    .map(|age| age <= validity)
                    .unwrap_or(true)
            });
            tracing::info!(
                "request reaper: collected {} of {} requests",
                initial - registry.len(),
                initial
            );
        }
    }

    /// Evict idle subscribers, then prune services left with none.
    pub fn collect_subscribers(&self) {
        let validity = Duration::from_secs(self.cleanup_subscribers_validity_m.max(0) as u64 * 60);
        let now = SystemTime::now();
        let mut subscribers = self.subscribers.write().expect("subscribers lock poisoned");
        let initial: usize = subscribers.values().map(|regions| regions.len()).sum();
        for regions in subscribers.values_mut() {
            regions.retain(|_, subscriber| {
                now.duration_since(subscriber.last_activity())
                    .map(|age| age <= validity)
                    .unwrap_or(true)
            });
        }
        subscribers.retain(|_, regions| !regions.is_empty());
        let remaining: usize = subscribers.values().map(|regions| regions.len()).sum();
        tracing::info!(
            "subscriber reaper: collected {} of {} subscribers",
            initial - remaining,
            initial
        );
    }
}

/// Sleep `total` in one-second steps, returning true as soon as the app
/// context is killed so reapers shut down promptly.
fn sleep_or_killed(ctx: &AppContext, total: Duration) -> bool {
    let step = Duration::from_secs(1);
    let mut slept = Duration::ZERO;
    while slept < total {
        if ctx.killed() {
            return true;
        }
        let chunk = step.min(total - slept);
        std::thread::sleep(chunk);
        slept += chunk;
    }
    ctx.killed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::global;
    use rendezvous_types::RequestStatus;

    pub(crate) fn test_server(sid: &str) -> Server {
        let config = Config {
            replica_id: sid.to_string(),
            cleanup_requests_validity_m: 0,
            cleanup_subscribers_validity_m: 0,
            ..Default::default()
        };
        let meter = global::meter("rendezvous-tests");
        Server::new(&config, ServerMetrics::init(&meter))
    }

    const SID: &str = "eu-central-1";
    const RID: &str = "myrequestid";

    fn bid(n: usize) -> String {
        format!("rv_{SID}_{n}")
    }

    #[test]
    fn rid_generation_distinct() {
        let server = test_server(SID);
        let a = server.gen_rid();
        let b = server.gen_rid();
        assert_eq!(a, format!("rv_{SID}_0"));
        assert_ne!(a, b);
    }

    #[test]
    fn get_or_register_is_idempotent() {
        let server = test_server(SID);
        let request = server.get_or_register_request(RID);
        assert_eq!(request.rid(), RID);
        let again = server.get_or_register_request(RID);
        assert!(Arc::ptr_eq(&request, &again));
        assert!(server.get_request("unknown").is_none());
        assert!(server.get_request(RID).is_some());
    }

    #[test]
    fn empty_rid_generates_one() {
        let server = test_server(SID);
        let request = server.get_or_register_request("");
        assert_eq!(request.rid(), format!("rv_{SID}_0"));
        assert_eq!(server.num_requests(), 1);
    }

    #[test]
    fn register_close_check_all_contexts() {
        let server = test_server(SID);
        let request = server.get_or_register_request(RID);

        let no_regions: Vec<String> = Vec::new();
        let region_r = vec!["r".to_string()];

        for (service, regions) in [
            ("s1", &no_regions),
            ("s2", &no_regions),
            ("s1", &region_r),
            ("s2", &region_r),
        ] {
            let new_bid = server.gen_bid(&request);
            server
                .register_branch(&request, "r", service, regions, "", "", &new_bid, false)
                .unwrap();
        }

        let status = |service: &str, region: &str| {
            server
                .check_status(&request, "r", service, region, false)
                .unwrap()
                .status
        };

        assert_eq!(status("s1", ""), RequestStatus::Open);
        assert_eq!(status("s2", ""), RequestStatus::Open);
        assert_eq!(status("s1", "r"), RequestStatus::Open);

        assert_eq!(server.close_branch(&request, &bid(0), ""), CloseOutcome::Closed);
        assert_eq!(status("s1", ""), RequestStatus::Open);

        assert_eq!(server.close_branch(&request, &bid(1), ""), CloseOutcome::Closed);
        assert_eq!(server.close_branch(&request, &bid(3), "r"), CloseOutcome::Closed);
        assert_eq!(status("s2", ""), RequestStatus::Closed);

        assert_eq!(status("s1", "r"), RequestStatus::Open);
        assert_eq!(server.close_branch(&request, &bid(2), "r"), CloseOutcome::Closed);
        assert_eq!(status("s1", "r"), RequestStatus::Closed);
        assert_eq!(status("s1", ""), RequestStatus::Closed);

        // whole request drained
        assert_eq!(
            server.check_status(&request, "r", "", "", false).unwrap().status,
            RequestStatus::Closed
        );
    }

    #[test]
    fn close_error_outcomes() {
        let server = test_server(SID);
        let request = server.get_or_register_request(RID);
        let new_bid = server.gen_bid(&request);
        server
            .register_branch(
                &request,
                "r",
                "post-storage",
                &["EU".to_string()],
                "",
                "",
                &new_bid,
                false,
            )
            .unwrap();

        assert_eq!(
            server.close_branch(&request, &bid(1), "EU"),
            CloseOutcome::BranchNotFound
        );
        assert_eq!(
            server.close_branch(&request, &bid(0), "wrong-region"),
            CloseOutcome::RegionNotFound
        );
        assert_eq!(server.close_branch(&request, &bid(0), "EU"), CloseOutcome::Closed);
        assert_eq!(
            server.close_branch(&request, &bid(0), "EU"),
            CloseOutcome::AlreadyClosed
        );
    }

    #[test]
    fn publish_reaches_all_region_subscribers() {
        let server = test_server(SID);
        let eu = server.get_subscriber("post_storage", "EU");
        let us = server.get_subscriber("post_storage", "US");
        // same pair resolves to the same subscriber
        assert!(Arc::ptr_eq(&eu, &server.get_subscriber("post_storage", "EU")));

        server.publish_branches("post_storage", "write_post", "rv_eu_0:rid");

        let cancel = tokio_util::sync::CancellationToken::new();
        for subscriber in [eu, us] {
            let event = subscriber.pop(&cancel).unwrap();
            assert_eq!(event.bid, "rv_eu_0:rid");
            assert_eq!(event.tag, "write_post");
        }
    }

    #[test]
    fn monitored_registration_publishes_composed_bid() {
        let server = test_server(SID);
        let request = server.get_or_register_request(RID);
        let subscriber = server.get_subscriber("post_storage", "EU");

        let new_bid = server.gen_bid(&request);
        server
            .register_branch(
                &request,
                "r",
                "post_storage",
                &["EU".to_string()],
                "write_post",
                "",
                &new_bid,
                true,
            )
            .unwrap();

        let cancel = tokio_util::sync::CancellationToken::new();
        let event = subscriber.pop(&cancel).unwrap();
        assert_eq!(event.bid, format!("{}:{RID}", bid(0)));
        assert_eq!(event.tag, "write_post");
    }

    #[test]
    fn wait_counts_prevented_inconsistencies() {
        let server = Arc::new(test_server(SID));
        let request = server.get_or_register_request(RID);
        let new_bid = server.gen_bid(&request);
        server
            .register_branch(&request, "r", "s", &[], "", "", &new_bid, false)
            .unwrap();

        let waiter = {
            let server = server.clone();
            let request = request.clone();
            std::thread::spawn(move || {
                server.wait(&request, "r", "", "", "", false, 5, "", false)
            })
        };
        std::thread::sleep(Duration::from_millis(200));
        server.close_branch(&request, &bid(0), "");
        assert_eq!(waiter.join().unwrap(), WaitOutcome::fulfilled(true));
        assert_eq!(server.num_prevented_inconsistencies(), 1);
    }

    #[test]
    fn reapers_evict_stale_entries() {
        // validity 0 in the test config evicts anything idle for >0s
        let server = test_server(SID);
        server.get_or_register_request(RID);
        server.get_subscriber("post_storage", "EU");
        assert_eq!(server.num_requests(), 1);

        std::thread::sleep(Duration::from_millis(50));
        server.collect_requests();
        server.collect_subscribers();

        assert_eq!(server.num_requests(), 0);
        let subscribers = server.subscribers.read().unwrap();
        assert!(subscribers.is_empty());
    }
}
