use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Mutex;

use rendezvous_types::RequestStatus;

/// Pseudo-region representing a branch with no region fan-out.
pub const GLOBAL_REGION: &str = "";

/// Result of closing one region slot of a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchClose {
    /// The region is not part of this branch.
    UnknownRegion,
    /// The slot was already closed; counters must not move again.
    AlreadyClosed,
    /// The slot transitioned from open to closed.
    Closed,
}

/// A logically single write from a service, potentially fanned out across
/// regions. The region set is fixed at creation; only the per-region state
/// mutates, always under the owning request's branch lock.
#[derive(Debug)]
pub struct Branch {
    // no PartialEq derive: `regions`/`replicated` are interior-mutable and
    // carry no meaningful notion of value equality across mutations, so
    // equality below is defined as pointer identity instead.
    service: String,
    tag: String,
    async_zone_id: String,
    // region -> closed
    regions: Mutex<HashMap<String, bool>>,
    /// Set once this branch is safe to reference from peers (stamped on the
    /// origin, applied on replicas). Read by visibility waits.
    pub replicated: AtomicBool,
}

impl PartialEq for Branch {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

impl Branch {
    pub fn new(
        service: impl Into<String>,
        tag: impl Into<String>,
        async_zone_id: impl Into<String>,
        region_names: &[String],
    ) -> Self {
        let mut regions = HashMap::new();
        if region_names.is_empty() {
            regions.insert(GLOBAL_REGION.to_string(), false);
        } else {
            for region in region_names {
                regions.insert(region.clone(), false);
            }
        }
        Self {
            service: service.into(),
            tag: tag.into(),
            async_zone_id: async_zone_id.into(),
            regions: Mutex::new(regions),
            replicated: AtomicBool::new(false),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn has_tag(&self) -> bool {
        !self.tag.is_empty()
    }

    pub fn async_zone_id(&self) -> &str {
        &self.async_zone_id
    }

    pub fn close(&self, region: &str) -> BranchClose {
        let mut regions = self.regions.lock().expect("branch regions lock poisoned");
        match regions.get_mut(region) {
            None => BranchClose::UnknownRegion,
            Some(closed) if *closed => BranchClose::AlreadyClosed,
            Some(closed) => {
                *closed = true;
                BranchClose::Closed
            }
        }
    }

    pub fn is_globally_closed(&self) -> bool {
        let regions = self.regions.lock().expect("branch regions lock poisoned");
        regions.values().all(|closed| *closed)
    }

    /// Status of a single region, or the conjunction across all regions
    /// when `region` is empty.
    pub fn status(&self, region: &str) -> RequestStatus {
        if region.is_empty() {
            return if self.is_globally_closed() {
                RequestStatus::Closed
            } else {
                RequestStatus::Open
            };
        }
        let regions = self.regions.lock().expect("branch regions lock poisoned");
        match regions.get(region) {
            None => RequestStatus::Unknown,
            Some(true) => RequestStatus::Closed,
            Some(false) => RequestStatus::Open,
        }
    }

    /// True when the branch is closed as far as `region` is concerned: the
    /// slot is closed, or the branch never spanned that region.
    pub fn is_closed_for(&self, region: &str) -> bool {
        self.status(region) != RequestStatus::Open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_is_idempotent() {
        let branch = Branch::new("post-storage", "", "r", &["EU".to_string()]);
        assert_eq!(branch.close("EU"), BranchClose::Closed);
        assert_eq!(branch.close("EU"), BranchClose::AlreadyClosed);
    }

    #[test]
    fn unknown_region_rejected() {
        let branch = Branch::new("post-storage", "", "r", &["EU".to_string()]);
        assert_eq!(branch.close("US"), BranchClose::UnknownRegion);
    }

    #[test]
    fn empty_regions_become_global() {
        let branch = Branch::new("notifier", "", "r", &[]);
        assert_eq!(branch.status(GLOBAL_REGION), RequestStatus::Open);
        assert_eq!(branch.close(""), BranchClose::Closed);
        assert!(branch.is_globally_closed());
    }

    #[test]
    fn global_status_is_conjunction() {
        let branch = Branch::new(
            "post-storage",
            "write_post",
            "r",
            &["EU".to_string(), "US".to_string()],
        );
        branch.close("EU");
        assert_eq!(branch.status(""), RequestStatus::Open);
        assert_eq!(branch.status("EU"), RequestStatus::Closed);
        assert_eq!(branch.status("US"), RequestStatus::Open);
        assert_eq!(branch.status("AP"), RequestStatus::Unknown);
        branch.close("US");
        assert_eq!(branch.status(""), RequestStatus::Closed);
    }
}
