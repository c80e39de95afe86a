//! The per-request metadata engine.
//!
//! A `Request` tracks every branch opened on behalf of one distributed
//! request: per-region open counts, the service dependency graph, the
//! async-zone tree, and the wait-log used for cycle avoidance between
//! concurrent waits. All blocking is real (condvars with timeouts); the
//! HTTP layer bridges in with `spawn_blocking`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant, SystemTime};

use dashmap::DashMap;
use rendezvous_types::{RequestStatus, FULL_ID_DELIMITER, ROOT_ASYNC_ZONE_ID, ROOT_ASYNC_ZONE_PATH};
use thiserror::Error;

use crate::metadata::branch::{Branch, BranchClose};
use crate::replicas::version_registry::VersionRegistry;

/// Per-wake ceiling applied when the caller asked for no overall deadline.
const WAIT_WAKE_CEILING: Duration = Duration::from_secs(60);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegisterError {
    #[error("a branch was already registered with the provided identifier")]
    BranchAlreadyExists,

    #[error("unknown parent service '{0}'")]
    UnknownParentService(String),

    #[error("unknown async zone '{0}'")]
    UnknownAsyncZone(String),
}

/// Result of closing one region of one branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    Closed,
    AlreadyClosed,
    BranchNotFound,
    RegionNotFound,
}

/// Result of a blocking predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The predicate holds. `prevented_inconsistency` is set when the call
    /// blocked at least once before it could return.
    Fulfilled { prevented_inconsistency: bool },
    TimedOut,
    /// The service/region context does not exist (sync mode only).
    MissingContext,
    /// The calling service was never registered on this request.
    MissingParent,
    /// Unknown tag, or unknown async zone.
    UnknownTagOrZone,
}

impl WaitOutcome {
    pub fn fulfilled(prevented: bool) -> Self {
        WaitOutcome::Fulfilled {
            prevented_inconsistency: prevented,
        }
    }

    pub fn prevented_inconsistency(&self) -> bool {
        matches!(
            self,
            WaitOutcome::Fulfilled {
                prevented_inconsistency: true
            }
        )
    }
}

/// Detailed check-status view of a service node.
#[derive(Debug, Clone)]
pub struct DetailedStatus {
    pub status: RequestStatus,
    pub tagged: BTreeMap<String, RequestStatus>,
    pub regions: BTreeMap<String, RequestStatus>,
}

impl DetailedStatus {
    pub fn from_status(status: RequestStatus) -> Self {
        Self {
            status,
            tagged: BTreeMap::new(),
            regions: BTreeMap::new(),
        }
    }

    fn plain(status: RequestStatus) -> Self {
        Self::from_status(status)
    }
}

/// Direct and transitive dependencies of a service node.
#[derive(Debug, Clone, Default)]
pub struct Dependencies {
    pub deps: BTreeSet<String>,
    pub indirect_deps: BTreeSet<String>,
}

/// A node in the async-zone (sub-request) tree. Counters are atomics so
/// branch tracking can update them without holding the wait-coordination
/// lock longer than necessary.
#[derive(Debug)]
pub struct AsyncZone {
    /// Order of insertion within the request; ties break the path order.
    index: i64,
    id: String,
    next_child_index: AtomicI64,
    opened_branches: AtomicI64,
    opened_global_region: AtomicI64,
    opened_regions: DashMap<String, i64>,
}

impl AsyncZone {
    fn new(index: i64, id: String) -> Self {
        Self {
            index,
            id,
            next_child_index: AtomicI64::new(0),
            opened_branches: AtomicI64::new(0),
            opened_global_region: AtomicI64::new(0),
            opened_regions: DashMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn opened_branches(&self) -> i64 {
        self.opened_branches.load(Ordering::SeqCst)
    }

    fn opened_region(&self, region: &str) -> i64 {
        self.opened_regions.get(region).map(|v| *v).unwrap_or(0)
    }
}

/// One service observed within the request. Counters are inclusive: a
/// branch registered at a service contributes to that node and to every
/// ancestor up to the root.
#[derive(Debug)]
struct ServiceNode {
    name: String,
    parent: Option<usize>,
    children: Vec<usize>,
    opened_branches: i64,
    opened_global_region: i64,
    opened_regions: HashMap<String, i64>,
    tagged: HashMap<String, Vec<Arc<Branch>>>,
    /// Active service-scoped waits, mirrored to peers as wait-log markers.
    current_waits: i64,
}

impl ServiceNode {
    fn new(name: String, parent: Option<usize>) -> Self {
        Self {
            name,
            parent,
            children: Vec::new(),
            opened_branches: 0,
            opened_global_region: 0,
            opened_regions: HashMap::new(),
            tagged: HashMap::new(),
            current_waits: 0,
        }
    }

    fn opened_region(&self, region: &str) -> i64 {
        self.opened_regions.get(region).copied().unwrap_or(0)
    }
}

/// Index arena for service nodes. Parent/child links are indices so the
/// graph is owned in one place and nodes never dangle (the whole arena dies
/// with the request).
#[derive(Debug)]
struct ServiceGraph {
    nodes: Vec<ServiceNode>,
    index: HashMap<String, usize>,
}

impl ServiceGraph {
    fn new() -> Self {
        let root = ServiceNode::new(String::new(), None);
        Self {
            nodes: vec![root],
            index: HashMap::from([(String::new(), 0)]),
        }
    }

    fn get(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Create the node if missing and link it under `parent`.
    fn ensure(&mut self, name: &str, parent: usize) -> usize {
        if let Some(idx) = self.get(name) {
            return idx;
        }
        let idx = self.nodes.len();
        self.nodes.push(ServiceNode::new(name.to_string(), Some(parent)));
        self.nodes[parent].children.push(idx);
        self.index.insert(name.to_string(), idx);
        idx
    }

    /// Apply `f` to `idx` and every ancestor up to the root.
    fn for_ancestors(&mut self, idx: usize, mut f: impl FnMut(&mut ServiceNode)) {
        let mut cursor = Some(idx);
        while let Some(i) = cursor {
            f(&mut self.nodes[i]);
            cursor = self.nodes[i].parent;
        }
    }

    /// Branches open at this node alone, excluding the subtree share.
    fn own_opened_branches(&self, idx: usize) -> i64 {
        let node = &self.nodes[idx];
        let children: i64 = node
            .children
            .iter()
            .map(|&c| self.nodes[c].opened_branches)
            .sum();
        node.opened_branches - children
    }

    fn own_opened_region(&self, idx: usize, region: &str) -> i64 {
        let node = &self.nodes[idx];
        let children: i64 = node
            .children
            .iter()
            .map(|&c| self.nodes[c].opened_region(region))
            .sum();
        node.opened_region(region) - children
    }
}

/// The set of async zones currently blocked in a wait predicate, keyed by
/// zone id with the number of concurrent waits from that zone. Also the
/// serialization point between residual computations and counter updates.
#[derive(Debug, Default)]
struct WaitLog {
    entries: HashMap<String, i64>,
}

pub struct Request {
    rid: String,
    /// Length of replica ids, needed to split zone path segments.
    sid_len: usize,
    created_at: SystemTime,
    last_activity: Mutex<SystemTime>,
    closed: AtomicBool,

    next_bid: AtomicI64,
    /// Insertion order handed to new zones; the root zone took 0.
    zone_insertions: AtomicI64,
    opened_branches: AtomicI64,
    opened_global_region: AtomicI64,
    /// Set once the first branch ever registers; async global waits block
    /// on it so a wait racing ahead of replication does not fall through.
    ever_registered: AtomicBool,

    branches: Mutex<HashMap<String, Arc<Branch>>>,
    branch_cv: Condvar,

    services: Mutex<ServiceGraph>,
    service_cv: Condvar,
    new_service_cv: Condvar,

    zones: DashMap<String, Arc<AsyncZone>>,
    wait_coord: Mutex<WaitLog>,
    wait_cv: Condvar,

    opened_regions: Mutex<HashMap<String, i64>>,

    versions: VersionRegistry,
}

impl Request {
    pub fn new(rid: impl Into<String>, sid_len: usize, versions: VersionRegistry) -> Self {
        let zones = DashMap::new();
        zones.insert(
            ROOT_ASYNC_ZONE_ID.to_string(),
            Arc::new(AsyncZone::new(0, ROOT_ASYNC_ZONE_ID.to_string())),
        );
        Self {
            rid: rid.into(),
            sid_len,
            created_at: SystemTime::now(),
            last_activity: Mutex::new(SystemTime::now()),
            closed: AtomicBool::new(false),
            next_bid: AtomicI64::new(0),
            zone_insertions: AtomicI64::new(1),
            opened_branches: AtomicI64::new(0),
            opened_global_region: AtomicI64::new(0),
            ever_registered: AtomicBool::new(false),
            branches: Mutex::new(HashMap::new()),
            branch_cv: Condvar::new(),
            services: Mutex::new(ServiceGraph::new()),
            service_cv: Condvar::new(),
            new_service_cv: Condvar::new(),
            zones,
            wait_coord: Mutex::new(WaitLog::default()),
            wait_cv: Condvar::new(),
            opened_regions: Mutex::new(HashMap::new()),
            versions,
        }
    }

    pub fn rid(&self) -> &str {
        &self.rid
    }

    pub fn versions(&self) -> &VersionRegistry {
        &self.versions
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn last_activity(&self) -> SystemTime {
        *self.last_activity.lock().expect("last activity lock poisoned")
    }

    pub fn touch(&self) {
        *self.last_activity.lock().expect("last activity lock poisoned") = SystemTime::now();
    }

    /// Sticky closure flag. Nothing sets it today; the promotion of fully
    /// closed requests into the server's closed registry is still an open
    /// policy, but callers already short-circuit on it.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn num_opened_branches(&self) -> i64 {
        self.opened_branches.load(Ordering::SeqCst)
    }

    /// Next per-request branch index.
    pub fn gen_id(&self) -> i64 {
        self.next_bid.fetch_add(1, Ordering::SeqCst)
    }

    // -----------
    // Async zones
    // -----------

    fn is_root_zone(zone_id: &str) -> bool {
        zone_id.is_empty() || zone_id == ROOT_ASYNC_ZONE_ID
    }

    pub fn validate_zone(&self, zone_id: &str) -> Option<Arc<AsyncZone>> {
        self.zones.get(zone_id).map(|entry| entry.clone())
    }

    /// Create the next async zone under `zone_id` (empty means root) and
    /// return its canonical path id. With `gen_id` disabled the given id is
    /// inserted as-is, which is how replicas adopt ids minted elsewhere.
    pub fn add_next_async_zone(
        &self,
        sid: &str,
        zone_id: &str,
        gen_id: bool,
    ) -> Option<String> {
        let next_id = if gen_id {
            if zone_id.is_empty() || zone_id == ROOT_ASYNC_ZONE_ID {
                let root = self.validate_zone(ROOT_ASYNC_ZONE_ID)?;
                let n = root.next_child_index.fetch_add(1, Ordering::SeqCst);
                format!("{ROOT_ASYNC_ZONE_PATH}{FULL_ID_DELIMITER}{sid}{n}")
            } else {
                let parent = self.validate_zone(zone_id)?;
                let n = parent.next_child_index.fetch_add(1, Ordering::SeqCst);
                format!("{zone_id}{FULL_ID_DELIMITER}{sid}{n}")
            }
        } else {
            zone_id.to_string()
        };

        if next_id != ROOT_ASYNC_ZONE_ID {
            let index = self.zone_insertions.fetch_add(1, Ordering::SeqCst);
            self.zones
                .entry(next_id.clone())
                .or_insert_with(|| Arc::new(AsyncZone::new(index, next_id.clone())));
        }
        Some(next_id)
    }

    // ---------------------
    // Core rendezvous logic
    // ---------------------

    pub fn register_branch(
        &self,
        zone_id: &str,
        bid: &str,
        service: &str,
        tag: &str,
        regions: &[String],
    ) -> Result<Arc<Branch>, RegisterError> {
        self.register_branch_with_parent(zone_id, bid, service, tag, regions, "")
    }

    pub fn register_branch_with_parent(
        &self,
        zone_id: &str,
        bid: &str,
        service: &str,
        tag: &str,
        regions: &[String],
        parent_service: &str,
    ) -> Result<Arc<Branch>, RegisterError> {
        // validate the zone up front so tracking never has to roll back
        // half-applied counters
        if self.validate_zone(zone_id).is_none() {
            return Err(RegisterError::UnknownAsyncZone(zone_id.to_string()));
        }

        let branch = {
            let mut branches = self.branches.lock().expect("branches lock poisoned");
            if branches.contains_key(bid) {
                return Err(RegisterError::BranchAlreadyExists);
            }
            let branch = Arc::new(Branch::new(service, tag, zone_id, regions));
            branches.insert(bid.to_string(), branch.clone());
            self.ever_registered.store(true, Ordering::SeqCst);
            self.branch_cv.notify_all();
            branch
        };

        if let Err(err) = self.track_branch(zone_id, service, regions, parent_service, &branch) {
            let mut branches = self.branches.lock().expect("branches lock poisoned");
            branches.remove(bid);
            return Err(err);
        }

        Ok(branch)
    }

    pub fn close_branch(&self, bid: &str, region: &str) -> CloseOutcome {
        let (branch, result, globally_closed) = {
            let branches = self.branches.lock().expect("branches lock poisoned");
            let Some(branch) = branches.get(bid).cloned() else {
                return CloseOutcome::BranchNotFound;
            };
            let result = branch.close(region);
            let globally_closed = branch.is_globally_closed();
            (branch, result, globally_closed)
        };

        match result {
            BranchClose::UnknownRegion => CloseOutcome::RegionNotFound,
            BranchClose::AlreadyClosed => CloseOutcome::AlreadyClosed,
            BranchClose::Closed => {
                self.untrack_branch(
                    branch.async_zone_id(),
                    branch.service(),
                    region,
                    globally_closed,
                );
                CloseOutcome::Closed
            }
        }
    }

    /// Commit the counter increments for a freshly registered branch: the
    /// service graph first, then (under the wait-coordination lock, so no
    /// waiter computes a residual from a half-applied update) the zone,
    /// region and request-wide counters.
    fn track_branch(
        &self,
        zone_id: &str,
        service: &str,
        regions: &[String],
        parent_service: &str,
        branch: &Arc<Branch>,
    ) -> Result<(), RegisterError> {
        {
            let mut graph = self.services.lock().expect("service graph lock poisoned");
            let Some(parent_idx) = graph.get(parent_service) else {
                return Err(RegisterError::UnknownParentService(
                    parent_service.to_string(),
                ));
            };
            let idx = graph.ensure(service, parent_idx);
            if branch.has_tag() {
                graph.nodes[idx]
                    .tagged
                    .entry(branch.tag().to_string())
                    .or_default()
                    .push(branch.clone());
            }
            if regions.is_empty() {
                graph.for_ancestors(idx, |node| {
                    node.opened_branches += 1;
                    node.opened_global_region += 1;
                });
            } else {
                graph.for_ancestors(idx, |node| {
                    node.opened_branches += 1;
                    for region in regions {
                        *node.opened_regions.entry(region.clone()).or_insert(0) += 1;
                    }
                });
            }
            // async waits may be blocked on the creation of this context
            self.new_service_cv.notify_all();
        }

        {
            let _coord = self.wait_coord.lock().expect("wait coordination lock poisoned");
            // Branches in the root zone are the request's synchronous core:
            // they are never discounted from anyone's residual, so the root
            // zone's own counters stay at zero. The zone was validated on
            // entry; a zone is never removed before its request.
            if !Self::is_root_zone(zone_id) {
                if let Some(zone) = self.validate_zone(zone_id) {
                    zone.opened_branches.fetch_add(1, Ordering::SeqCst);
                    if regions.is_empty() {
                        zone.opened_global_region.fetch_add(1, Ordering::SeqCst);
                    } else {
                        for region in regions {
                            *zone.opened_regions.entry(region.clone()).or_insert(0) += 1;
                        }
                    }
                }
            }

            {
                let mut opened = self.opened_regions.lock().expect("regions lock poisoned");
                for region in regions {
                    *opened.entry(region.clone()).or_insert(0) += 1;
                }
            }
            if regions.is_empty() {
                self.opened_global_region.fetch_add(1, Ordering::SeqCst);
            }
            self.opened_branches.fetch_add(1, Ordering::SeqCst);
            self.wait_cv.notify_all();
        }

        Ok(())
    }

    /// Undo the increments of [`Self::track_branch`] for one closed region.
    /// Region decrements come last so a waiter that observes the region
    /// counter move already sees the matching zone decrement.
    fn untrack_branch(&self, zone_id: &str, service: &str, region: &str, globally_closed: bool) {
        {
            let mut graph = self.services.lock().expect("service graph lock poisoned");
            if let Some(idx) = graph.get(service) {
                if region.is_empty() {
                    graph.for_ancestors(idx, |node| {
                        node.opened_branches -= 1;
                        node.opened_global_region -= 1;
                    });
                } else {
                    graph.for_ancestors(idx, |node| {
                        if globally_closed {
                            node.opened_branches -= 1;
                        }
                        *node.opened_regions.entry(region.to_string()).or_insert(0) -= 1;
                    });
                }
            }
            self.service_cv.notify_all();
        }

        {
            let _coord = self.wait_coord.lock().expect("wait coordination lock poisoned");
            if !Self::is_root_zone(zone_id) {
                if let Some(zone) = self.validate_zone(zone_id) {
                    if globally_closed {
                        zone.opened_branches.fetch_add(-1, Ordering::SeqCst);
                    }
                    if region.is_empty() {
                        zone.opened_global_region.fetch_add(-1, Ordering::SeqCst);
                    } else if let Some(mut count) = zone.opened_regions.get_mut(region) {
                        *count -= 1;
                    }
                }
            }

            if region.is_empty() {
                self.opened_global_region.fetch_add(-1, Ordering::SeqCst);
            } else {
                let mut opened = self.opened_regions.lock().expect("regions lock poisoned");
                if let Some(count) = opened.get_mut(region) {
                    *count -= 1;
                }
            }
            if globally_closed {
                self.opened_branches.fetch_add(-1, Ordering::SeqCst);
            }
            self.wait_cv.notify_all();
        }
    }

    // --------
    // Wait log
    // --------

    fn add_to_wait_log(&self, log: &mut WaitLog, zone_id: &str) {
        *log.entries.entry(zone_id.to_string()).or_insert(0) += 1;
        // wake current waiters: a zone registered earlier may be blocked in
        // a wait issued *after* ours and needs to recompute its preceding
        // set to discard us
        self.wait_cv.notify_all();
    }

    fn remove_from_wait_log(&self, log: &mut WaitLog, zone_id: &str) {
        if let Some(count) = log.entries.get_mut(zone_id) {
            *count -= 1;
            if *count <= 0 {
                log.entries.remove(zone_id);
            }
        }
    }

    /// Peer-replicated wait-log membership (zone-scoped).
    pub fn add_remote_wait_log(&self, zone_id: &str) -> bool {
        if self.validate_zone(zone_id).is_none() {
            return false;
        }
        let mut log = self.wait_coord.lock().expect("wait coordination lock poisoned");
        self.add_to_wait_log(&mut log, zone_id);
        true
    }

    pub fn remove_remote_wait_log(&self, zone_id: &str) -> bool {
        if self.validate_zone(zone_id).is_none() {
            return false;
        }
        let mut log = self.wait_coord.lock().expect("wait coordination lock poisoned");
        self.remove_from_wait_log(&mut log, zone_id);
        true
    }

    /// Peer-replicated wait marker on a service node.
    pub fn add_service_wait_marker(&self, service: &str) -> bool {
        let mut graph = self.services.lock().expect("service graph lock poisoned");
        match graph.get(service) {
            Some(idx) => {
                graph.nodes[idx].current_waits += 1;
                self.service_cv.notify_all();
                true
            }
            None => false,
        }
    }

    pub fn remove_service_wait_marker(&self, service: &str) -> bool {
        let mut graph = self.services.lock().expect("service graph lock poisoned");
        match graph.get(service) {
            Some(idx) => {
                graph.nodes[idx].current_waits -= 1;
                true
            }
            None => false,
        }
    }

    /// Zone ordering for cycle avoidance: walk the colon-delimited paths in
    /// lock-step after dropping the head segment. An ancestor precedes its
    /// descendants; siblings from the same replica order by insertion
    /// index; siblings from different replicas order by their parents'
    /// insertion indices, defaulting to "preceding" so a cycle always has a
    /// deterministic way out.
    fn is_preceding_zone(&self, first: &AsyncZone, second: &AsyncZone) -> bool {
        let a_rest = first.id.split_once(FULL_ID_DELIMITER).map(|(_, rest)| rest);
        let b_rest = second.id.split_once(FULL_ID_DELIMITER).map(|(_, rest)| rest);

        let (a_rest, b_rest) = match (a_rest, b_rest) {
            (None, None) => return false,
            (None, Some(_)) => return true,
            (Some(_), None) => return false,
            (Some(a), Some(b)) => (a, b),
        };

        let mut a_segments = a_rest.split(FULL_ID_DELIMITER);
        let mut b_segments = b_rest.split(FULL_ID_DELIMITER);
        let mut depth = 0usize;
        loop {
            depth += 1;
            match (a_segments.next(), b_segments.next()) {
                (None, None) => return false,
                (None, Some(_)) => return true,
                (Some(_), None) => return false,
                (Some(seg_a), Some(seg_b)) => {
                    if seg_a == seg_b {
                        continue;
                    }
                    let split_a = self.sid_len.min(seg_a.len());
                    let split_b = self.sid_len.min(seg_b.len());
                    let (sid_a, idx_a) = seg_a.split_at(split_a);
                    let (sid_b, idx_b) = seg_b.split_at(split_b);
                    if sid_a == sid_b {
                        return match (idx_a.parse::<i64>(), idx_b.parse::<i64>()) {
                            (Ok(na), Ok(nb)) => na < nb,
                            _ => idx_a < idx_b,
                        };
                    }
                    let parent_a = self.zone_path_prefix(&first.id, depth);
                    let parent_b = self.zone_path_prefix(&second.id, depth);
                    let pa = self.zones.get(&parent_a).map(|z| z.index);
                    let pb = self.zones.get(&parent_b).map(|z| z.index);
                    return match (pa, pb) {
                        (Some(pa), Some(pb)) if pa != pb => pa < pb,
                        _ => true,
                    };
                }
            }
        }
    }

    /// Path of the direct parent of the segment at `depth` (1-based, not
    /// counting the head). Depth 1 resolves to the root zone.
    fn zone_path_prefix(&self, id: &str, depth: usize) -> String {
        let mut parts = id.split(FULL_ID_DELIMITER);
        let head = parts.next().unwrap_or_default();
        let kept: Vec<&str> = parts.take(depth - 1).collect();
        if kept.is_empty() {
            return ROOT_ASYNC_ZONE_ID.to_string();
        }
        let mut out = String::from(head);
        for segment in kept {
            out.push(FULL_ID_DELIMITER);
            out.push_str(segment);
        }
        out
    }

    fn preceding_zones(&self, log: &WaitLog, current: &AsyncZone) -> Vec<Arc<AsyncZone>> {
        log.entries
            .keys()
            .filter_map(|zone_id| self.zones.get(zone_id).map(|z| z.clone()))
            .filter(|zone| zone.id != current.id && self.is_preceding_zone(zone, current))
            .collect()
    }

    fn opened_branches_of(zones: &[Arc<AsyncZone>]) -> i64 {
        zones.iter().map(|z| z.opened_branches()).sum()
    }

    fn opened_regions_of(zones: &[Arc<AsyncZone>], region: &str) -> (i64, i64) {
        zones.iter().fold((0, 0), |(global, regional), zone| {
            (
                global + zone.opened_global_region.load(Ordering::SeqCst),
                regional + zone.opened_region(region),
            )
        })
    }

    // ---------------
    // Wait predicates
    // ---------------

    fn remaining_timeout(timeout: i64, start: Instant) -> Duration {
        if timeout != 0 {
            Duration::from_secs(timeout.max(0) as u64).saturating_sub(start.elapsed())
        } else {
            WAIT_WAKE_CEILING
        }
    }

    /// Block until the first branch ever registers on this request. Used
    /// by async-mode global waits racing ahead of replication.
    fn wait_first_branch(&self, start: Instant, timeout: i64) -> bool {
        let mut branches = self.branches.lock().expect("branches lock poisoned");
        while !self.ever_registered.load(Ordering::SeqCst) {
            let remaining = Self::remaining_timeout(timeout, start);
            if timeout != 0 && remaining.is_zero() {
                return false;
            }
            branches = self
                .branch_cv
                .wait_timeout(branches, remaining)
                .expect("branches lock poisoned")
                .0;
        }
        true
    }

    /// Wait until every branch causally preceding the calling zone is
    /// closed, across all regions.
    pub fn wait(
        &self,
        zone_id: &str,
        current_service: &str,
        async_mode: bool,
        timeout: i64,
    ) -> WaitOutcome {
        let start = Instant::now();

        if self
            .services
            .lock()
            .expect("service graph lock poisoned")
            .get(current_service)
            .is_none()
        {
            return WaitOutcome::MissingParent;
        }
        let Some(zone) = self.validate_zone(zone_id) else {
            return WaitOutcome::UnknownTagOrZone;
        };

        let mut prevented = false;
        if async_mode && !self.wait_first_branch(start, timeout) {
            return WaitOutcome::TimedOut;
        }

        let mut log = self.wait_coord.lock().expect("wait coordination lock poisoned");
        self.add_to_wait_log(&mut log, &zone.id);
        loop {
            let preceding = self.preceding_zones(&log, &zone);
            let offset = Self::opened_branches_of(&preceding);
            let residual = self.opened_branches.load(Ordering::SeqCst)
                - zone.opened_branches()
                - offset;
            if residual == 0 {
                break;
            }
            let remaining = Self::remaining_timeout(timeout, start);
            if timeout != 0 && remaining.is_zero() {
                self.remove_from_wait_log(&mut log, &zone.id);
                return WaitOutcome::TimedOut;
            }
            prevented = true;
            log = self
                .wait_cv
                .wait_timeout(log, remaining)
                .expect("wait coordination lock poisoned")
                .0;
        }
        self.remove_from_wait_log(&mut log, &zone.id);

        WaitOutcome::fulfilled(prevented)
    }

    /// Wait until every causally preceding branch covering `region` (or the
    /// global region) is closed.
    pub fn wait_region(
        &self,
        zone_id: &str,
        region: &str,
        current_service: &str,
        async_mode: bool,
        timeout: i64,
    ) -> WaitOutcome {
        let start = Instant::now();

        if self
            .services
            .lock()
            .expect("service graph lock poisoned")
            .get(current_service)
            .is_none()
        {
            return WaitOutcome::MissingParent;
        }
        let Some(zone) = self.validate_zone(zone_id) else {
            return WaitOutcome::UnknownTagOrZone;
        };

        let mut prevented = false;
        let mut log = self.wait_coord.lock().expect("wait coordination lock poisoned");

        let region_exists = |this: &Self| {
            this.opened_regions
                .lock()
                .expect("regions lock poisoned")
                .contains_key(region)
        };

        if async_mode {
            while !region_exists(self) {
                let remaining = Self::remaining_timeout(timeout, start);
                if timeout != 0 && remaining.is_zero() {
                    return WaitOutcome::TimedOut;
                }
                prevented = true;
                log = self
                    .wait_cv
                    .wait_timeout(log, remaining)
                    .expect("wait coordination lock poisoned")
                    .0;
            }
        } else if !region_exists(self) {
            // a region nobody ever opened has nothing to wait for
            return WaitOutcome::fulfilled(false);
        }

        self.add_to_wait_log(&mut log, &zone.id);
        loop {
            let zone_global = zone.opened_global_region.load(Ordering::SeqCst);
            let zone_region = zone.opened_region(region);
            let preceding = self.preceding_zones(&log, &zone);
            let (offset_global, offset_region) = Self::opened_regions_of(&preceding, region);
            let total_region = {
                let opened = self.opened_regions.lock().expect("regions lock poisoned");
                opened.get(region).copied().unwrap_or(0)
            };
            let blocked = self.opened_global_region.load(Ordering::SeqCst)
                - zone_global
                - offset_global
                != 0
                || total_region - zone_region - offset_region != 0;
            if !blocked {
                break;
            }
            let remaining = Self::remaining_timeout(timeout, start);
            if timeout != 0 && remaining.is_zero() {
                self.remove_from_wait_log(&mut log, &zone.id);
                return WaitOutcome::TimedOut;
            }
            prevented = true;
            log = self
                .wait_cv
                .wait_timeout(log, remaining)
                .expect("wait coordination lock poisoned")
                .0;
        }
        self.remove_from_wait_log(&mut log, &zone.id);

        WaitOutcome::fulfilled(prevented)
    }

    /// Wait until the service context is closed. With a tag, waits on every
    /// branch currently listed under that tag; with `wait_deps`, waits on
    /// the whole dependency subtree of the service instead of the branches
    /// registered at the service alone.
    pub fn wait_service(
        &self,
        service: &str,
        tag: &str,
        current_service: &str,
        async_mode: bool,
        timeout: i64,
        wait_deps: bool,
    ) -> WaitOutcome {
        self.wait_service_scoped(service, "", tag, current_service, async_mode, timeout, wait_deps)
    }

    /// Region-scoped variant of [`Self::wait_service`].
    pub fn wait_service_region(
        &self,
        service: &str,
        region: &str,
        tag: &str,
        current_service: &str,
        async_mode: bool,
        timeout: i64,
        wait_deps: bool,
    ) -> WaitOutcome {
        self.wait_service_scoped(
            service,
            region,
            tag,
            current_service,
            async_mode,
            timeout,
            wait_deps,
        )
    }

    fn wait_service_scoped(
        &self,
        service: &str,
        region: &str,
        tag: &str,
        current_service: &str,
        async_mode: bool,
        timeout: i64,
        wait_deps: bool,
    ) -> WaitOutcome {
        let start = Instant::now();
        let mut graph = self.services.lock().expect("service graph lock poisoned");

        if graph.get(current_service).is_none() {
            return WaitOutcome::MissingParent;
        }

        let mut prevented = false;
        if async_mode {
            // wait for the service context to appear
            while graph.get(service).is_none() {
                let remaining = Self::remaining_timeout(timeout, start);
                if timeout != 0 && remaining.is_zero() {
                    return WaitOutcome::TimedOut;
                }
                graph = self
                    .new_service_cv
                    .wait_timeout(graph, remaining)
                    .expect("service graph lock poisoned")
                    .0;
            }
            // then for the region and tag contexts, when scoped
            loop {
                let idx = graph.get(service).expect("service vanished from graph");
                let region_ok = region.is_empty()
                    || graph.nodes[idx].opened_regions.contains_key(region);
                let tag_ok = tag.is_empty() || graph.nodes[idx].tagged.contains_key(tag);
                if region_ok && tag_ok {
                    break;
                }
                let remaining = Self::remaining_timeout(timeout, start);
                if timeout != 0 && remaining.is_zero() {
                    return WaitOutcome::TimedOut;
                }
                prevented = true;
                graph = self
                    .new_service_cv
                    .wait_timeout(graph, remaining)
                    .expect("service graph lock poisoned")
                    .0;
            }
        } else {
            let Some(idx) = graph.get(service) else {
                return WaitOutcome::MissingContext;
            };
            if !region.is_empty() && !graph.nodes[idx].opened_regions.contains_key(region) {
                return WaitOutcome::MissingContext;
            }
            if !tag.is_empty() && !graph.nodes[idx].tagged.contains_key(tag) {
                // region-scoped waits distinguish a bad tag from a bad
                // service/region context
                return if region.is_empty() {
                    WaitOutcome::MissingContext
                } else {
                    WaitOutcome::UnknownTagOrZone
                };
            }
        }

        let idx = graph.get(service).expect("service vanished from graph");
        graph.nodes[idx].current_waits += 1;
        self.service_cv.notify_all();

        let outcome = if !tag.is_empty() {
            let tagged: Vec<Arc<Branch>> =
                graph.nodes[idx].tagged.get(tag).cloned().unwrap_or_default();
            loop {
                let all_closed = if region.is_empty() {
                    tagged.iter().all(|b| b.is_globally_closed())
                } else {
                    tagged.iter().all(|b| b.is_closed_for(region))
                };
                if all_closed {
                    break WaitOutcome::fulfilled(prevented);
                }
                let remaining = Self::remaining_timeout(timeout, start);
                if timeout != 0 && remaining.is_zero() {
                    break WaitOutcome::TimedOut;
                }
                prevented = true;
                graph = self
                    .service_cv
                    .wait_timeout(graph, remaining)
                    .expect("service graph lock poisoned")
                    .0;
            }
        } else {
            loop {
                let open = match (region.is_empty(), wait_deps) {
                    (true, true) => graph.nodes[idx].opened_branches,
                    (true, false) => graph.own_opened_branches(idx),
                    (false, true) => graph.nodes[idx].opened_region(region),
                    (false, false) => graph.own_opened_region(idx, region),
                };
                if open == 0 {
                    break WaitOutcome::fulfilled(prevented);
                }
                let remaining = Self::remaining_timeout(timeout, start);
                if timeout != 0 && remaining.is_zero() {
                    break WaitOutcome::TimedOut;
                }
                prevented = true;
                graph = self
                    .service_cv
                    .wait_timeout(graph, remaining)
                    .expect("service graph lock poisoned")
                    .0;
            }
        };

        let idx = graph.get(service).expect("service vanished from graph");
        graph.nodes[idx].current_waits -= 1;
        outcome
    }

    // -----------
    // Observation
    // -----------

    /// Request status as seen from `zone_id`: open branches outside the
    /// zone keep the request OPEN. `None` means the zone is unknown.
    pub fn check_status(&self, zone_id: &str) -> Option<RequestStatus> {
        let zone = self.validate_zone(zone_id)?;
        let outside = self.opened_branches.load(Ordering::SeqCst) - zone.opened_branches();
        Some(if outside > 0 {
            RequestStatus::Open
        } else {
            RequestStatus::Closed
        })
    }

    /// Region-scoped status from `zone_id`. A region nobody ever opened is
    /// UNKNOWN. Note the documented corner: the comparison folds in the
    /// global-region counter, so a request whose remaining open branches
    /// sit in *other* named regions still reports CLOSED here.
    pub fn check_status_region(&self, zone_id: &str, region: &str) -> Option<RequestStatus> {
        let zone = self.validate_zone(zone_id)?;
        let opened = self.opened_regions.lock().expect("regions lock poisoned");
        let Some(&total_region) = opened.get(region) else {
            return Some(RequestStatus::Unknown);
        };
        let zone_global = zone.opened_global_region.load(Ordering::SeqCst);
        let zone_region = zone.opened_region(region);
        let status = if total_region != zone_region
            || self.opened_global_region.load(Ordering::SeqCst) != zone_global
        {
            RequestStatus::Open
        } else {
            RequestStatus::Closed
        };
        Some(status)
    }

    pub fn check_status_service(&self, service: &str, detailed: bool) -> DetailedStatus {
        let graph = self.services.lock().expect("service graph lock poisoned");
        let Some(idx) = graph.get(service) else {
            return DetailedStatus::plain(RequestStatus::Unknown);
        };
        let node = &graph.nodes[idx];
        let status = if node.opened_branches == 0 {
            RequestStatus::Closed
        } else {
            RequestStatus::Open
        };
        if !detailed {
            return DetailedStatus::plain(status);
        }

        let mut result = DetailedStatus::plain(status);
        for (tag, branches) in &node.tagged {
            let tag_status = if branches.iter().all(|b| b.is_globally_closed()) {
                RequestStatus::Closed
            } else {
                RequestStatus::Open
            };
            result.tagged.insert(tag.clone(), tag_status);
        }
        for (region, count) in &node.opened_regions {
            let region_status = if *count == 0 {
                RequestStatus::Closed
            } else {
                RequestStatus::Open
            };
            result.regions.insert(region.clone(), region_status);
        }
        result
    }

    pub fn check_status_service_region(
        &self,
        service: &str,
        region: &str,
        detailed: bool,
    ) -> DetailedStatus {
        let graph = self.services.lock().expect("service graph lock poisoned");
        let Some(idx) = graph.get(service) else {
            return DetailedStatus::plain(RequestStatus::Unknown);
        };
        let node = &graph.nodes[idx];
        if !node.opened_regions.contains_key(region) {
            return DetailedStatus::plain(RequestStatus::Unknown);
        }
        let status = if node.opened_region(region) == 0 {
            RequestStatus::Closed
        } else {
            RequestStatus::Open
        };
        if !detailed {
            return DetailedStatus::plain(status);
        }

        let mut result = DetailedStatus::plain(status);
        for (tag, branches) in &node.tagged {
            let tag_status = if branches.iter().all(|b| b.is_closed_for(region)) {
                RequestStatus::Closed
            } else {
                RequestStatus::Open
            };
            result.tagged.insert(tag.clone(), tag_status);
        }
        result
    }

    /// Direct children of the service node (empty service means root) and
    /// the transitive closure of further descendants, as two disjoint sets.
    pub fn fetch_dependencies(&self, service: &str) -> Option<Dependencies> {
        let graph = self.services.lock().expect("service graph lock poisoned");
        let idx = graph.get(service)?;

        let mut result = Dependencies::default();
        let mut lookup = Vec::new();
        for &child in &graph.nodes[idx].children {
            result.deps.insert(graph.nodes[child].name.clone());
            for &grandchild in &graph.nodes[child].children {
                lookup.push(grandchild);
            }
        }
        while let Some(current) = lookup.pop() {
            if result.indirect_deps.insert(graph.nodes[current].name.clone()) {
                for &child in &graph.nodes[current].children {
                    lookup.push(child);
                }
            }
        }
        Some(result)
    }

    // ----------------------
    // Replication visibility
    // ----------------------

    /// Mark a branch safe for peers to reference.
    pub fn mark_branch_replication_ready(&self, bid: &str) {
        let branches = self.branches.lock().expect("branches lock poisoned");
        if let Some(branch) = branches.get(bid) {
            branch.replicated.store(true, Ordering::SeqCst);
        }
        self.branch_cv.notify_all();
    }

    /// Block until every named bid exists and is replication-ready, bounded
    /// by `timeout`. Used by closes carrying `visible_bids`.
    pub fn wait_branches_visible(&self, bids: &[String], timeout: Duration) -> bool {
        let start = Instant::now();
        let mut branches = self.branches.lock().expect("branches lock poisoned");
        loop {
            let all_visible = bids.iter().all(|bid| {
                branches
                    .get(bid)
                    .map(|b| b.replicated.load(Ordering::SeqCst))
                    .unwrap_or(false)
            });
            if all_visible {
                return true;
            }
            let remaining = timeout.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                return false;
            }
            branches = self
                .branch_cv
                .wait_timeout(branches, remaining)
                .expect("branches lock poisoned")
                .0;
        }
    }

    #[cfg(test)]
    pub(crate) fn wait_log_len(&self) -> usize {
        self.wait_coord
            .lock()
            .expect("wait coordination lock poisoned")
            .entries
            .len()
    }
}
