//! End-to-end scenarios driven through the client service layer.

mod helpers;

use std::time::{Duration, Instant};

use helpers::SID;
use rendezvous_types::{
    ApiError, CheckStatusRequest, CloseBranchRequest, FetchDependenciesRequest,
    RegisterBranchRequest, RegisterRequest, RequestStatus, WaitRequest,
};

fn register_branch(rid: &str, service: &str, regions: &[&str]) -> RegisterBranchRequest {
    RegisterBranchRequest {
        rid: rid.to_string(),
        service: service.to_string(),
        regions: regions.iter().map(|r| r.to_string()).collect(),
        ..Default::default()
    }
}

fn check_status(rid: &str, service: &str, region: &str) -> CheckStatusRequest {
    CheckStatusRequest {
        rid: rid.to_string(),
        service: service.to_string(),
        region: region.to_string(),
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn single_region_round_trip() {
    let app = helpers::standalone(SID);

    let rid = app
        .client
        .register_request(RegisterRequest { rid: "R".into() })
        .await
        .unwrap()
        .rid;
    assert_eq!(rid, "R");

    let branch = app
        .client
        .register_branch(register_branch("R", "S", &["EU", "US"]))
        .await
        .unwrap();
    assert_eq!(branch.bid, format!("rv_{SID}_0:R"));

    let status = app.client.check_status(check_status("R", "", "EU")).await.unwrap();
    assert_eq!(status.status, RequestStatus::Open);

    for region in ["EU", "US"] {
        app.client
            .close_branch(CloseBranchRequest {
                bid: branch.bid.clone(),
                region: region.to_string(),
                visible_bids: Vec::new(),
            })
            .await
            .unwrap();
    }

    let status = app.client.check_status(check_status("R", "", "")).await.unwrap();
    assert_eq!(status.status, RequestStatus::Closed);
}

#[tokio::test(flavor = "multi_thread")]
async fn async_zone_wait_ignores_own_branches() {
    let app = helpers::standalone(SID);
    app.client
        .register_request(RegisterRequest { rid: "R".into() })
        .await
        .unwrap();

    // compose-post in the root zone
    let compose = app
        .client
        .register_branch(register_branch("R", "compose-post", &[]))
        .await
        .unwrap();

    // an async continuation with its own branch
    let zone = app
        .client
        .add_async_zone(rendezvous_types::AddAsyncZoneRequest {
            rid: "R".into(),
            async_zone: String::new(),
        })
        .await
        .unwrap()
        .async_zone;
    assert_eq!(zone, format!("root:{SID}0"));

    app.client
        .register_branch(RegisterBranchRequest {
            async_zone: zone.clone(),
            ..register_branch("R", "post-storage", &[])
        })
        .await
        .unwrap();

    let waiter = tokio::spawn({
        let client = app.client.clone();
        let zone = zone.clone();
        async move {
            client
                .wait_request(WaitRequest {
                    rid: "R".into(),
                    async_zone: zone,
                    timeout: 5,
                    ..Default::default()
                })
                .await
        }
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!waiter.is_finished());

    // closing compose-post releases the zone's wait; its own branch is
    // never waited on
    app.client
        .close_branch(CloseBranchRequest {
            bid: compose.bid,
            region: String::new(),
            visible_bids: Vec::new(),
        })
        .await
        .unwrap();

    let response = waiter.await.unwrap().unwrap();
    assert!(response.prevented_inconsistency);
    assert!(!response.timed_out);
    assert_eq!(app.server.num_prevented_inconsistencies(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn tagged_service_wait_needs_both_regions() {
    let app = helpers::standalone(SID);
    app.client
        .register_request(RegisterRequest { rid: "R".into() })
        .await
        .unwrap();

    let branch = app
        .client
        .register_branch(RegisterBranchRequest {
            tag: "write_post".into(),
            ..register_branch("R", "post_storage", &["EU", "US"])
        })
        .await
        .unwrap();

    let waiter = tokio::spawn({
        let client = app.client.clone();
        async move {
            client
                .wait_request(WaitRequest {
                    rid: "R".into(),
                    service: "post_storage".into(),
                    tag: "write_post".into(),
                    timeout: 5,
                    ..Default::default()
                })
                .await
        }
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    app.client
        .close_branch(CloseBranchRequest {
            bid: branch.bid.clone(),
            region: "EU".into(),
            visible_bids: Vec::new(),
        })
        .await
        .unwrap();

    // EU alone leaves the tag open
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!waiter.is_finished());

    app.client
        .close_branch(CloseBranchRequest {
            bid: branch.bid,
            region: "US".into(),
            visible_bids: Vec::new(),
        })
        .await
        .unwrap();

    let response = waiter.await.unwrap().unwrap();
    assert!(response.prevented_inconsistency);
}

#[tokio::test(flavor = "multi_thread")]
async fn region_wait_times_out() {
    let app = helpers::standalone(SID);
    app.client
        .register_request(RegisterRequest { rid: "R".into() })
        .await
        .unwrap();
    app.client
        .register_branch(register_branch("R", "S", &["EU"]))
        .await
        .unwrap();

    let start = Instant::now();
    let response = app
        .client
        .wait_request(WaitRequest {
            rid: "R".into(),
            region: "EU".into(),
            timeout: 1,
            ..Default::default()
        })
        .await
        .unwrap();

    assert!(response.timed_out);
    assert!(!response.prevented_inconsistency);
    assert!(start.elapsed() >= Duration::from_millis(900));

    // counters untouched: the branch is still open
    let status = app.client.check_status(check_status("R", "", "EU")).await.unwrap();
    assert_eq!(status.status, RequestStatus::Open);
}

#[tokio::test(flavor = "multi_thread")]
async fn wait_argument_validation() {
    let app = helpers::standalone(SID);
    app.client
        .register_request(RegisterRequest { rid: "R".into() })
        .await
        .unwrap();

    let invalid_timeout = app
        .client
        .wait_request(WaitRequest {
            rid: "R".into(),
            timeout: -1,
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(invalid_timeout, ApiError::InvalidArgument(_)));

    let exclusive = app
        .client
        .wait_request(WaitRequest {
            rid: "R".into(),
            service: "a".into(),
            services: vec!["b".into()],
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(exclusive, ApiError::InvalidArgument(_)));

    let tag_needs_service = app
        .client
        .wait_request(WaitRequest {
            rid: "R".into(),
            tag: "t".into(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(tag_needs_service, ApiError::InvalidArgument(_)));

    // single replica: unknown rid is an error, not an implicit register
    let unknown = app
        .client
        .wait_request(WaitRequest {
            rid: "nope".into(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(unknown, ApiError::NotFound(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn register_branch_validation() {
    let app = helpers::standalone(SID);
    app.client
        .register_request(RegisterRequest { rid: "R".into() })
        .await
        .unwrap();

    let empty_service = app
        .client
        .register_branch(register_branch("R", "", &[]))
        .await
        .unwrap_err();
    assert!(matches!(empty_service, ApiError::InvalidArgument(_)));

    // duplicate pre-assigned bid
    app.client
        .register_branch(RegisterBranchRequest {
            bid: "rv_x_7:R".into(),
            ..register_branch("R", "S", &[])
        })
        .await
        .unwrap();
    let duplicate = app
        .client
        .register_branch(RegisterBranchRequest {
            bid: "rv_x_7:R".into(),
            ..register_branch("R", "S", &[])
        })
        .await
        .unwrap_err();
    assert!(matches!(duplicate, ApiError::AlreadyExists(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn multi_service_wait() {
    let app = helpers::standalone(SID);
    app.client
        .register_request(RegisterRequest { rid: "R".into() })
        .await
        .unwrap();
    let a = app
        .client
        .register_branch(register_branch("R", "svc-a", &[]))
        .await
        .unwrap();
    let b = app
        .client
        .register_branch(register_branch("R", "svc-b", &[]))
        .await
        .unwrap();

    let waiter = tokio::spawn({
        let client = app.client.clone();
        async move {
            client
                .wait_request(WaitRequest {
                    rid: "R".into(),
                    services: vec!["svc-a".into(), "svc-b".into()],
                    timeout: 5,
                    ..Default::default()
                })
                .await
        }
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    for bid in [a.bid, b.bid] {
        app.client
            .close_branch(CloseBranchRequest {
                bid,
                region: String::new(),
                visible_bids: Vec::new(),
            })
            .await
            .unwrap();
    }
    let response = waiter.await.unwrap().unwrap();
    assert!(!response.timed_out);
}

#[tokio::test(flavor = "multi_thread")]
async fn fetch_dependencies_walks_the_graph() {
    let app = helpers::standalone(SID);
    app.client
        .register_request(RegisterRequest { rid: "R".into() })
        .await
        .unwrap();
    app.client
        .register_branch(register_branch("R", "api", &[]))
        .await
        .unwrap();
    app.client
        .register_branch(RegisterBranchRequest {
            parent_service: "api".into(),
            ..register_branch("R", "storage", &[])
        })
        .await
        .unwrap();
    app.client
        .register_branch(RegisterBranchRequest {
            parent_service: "storage".into(),
            ..register_branch("R", "cache", &[])
        })
        .await
        .unwrap();

    let from_root = app
        .client
        .fetch_dependencies(FetchDependenciesRequest {
            rid: "R".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(from_root.deps, vec!["api".to_string()]);
    assert_eq!(
        from_root.indirect_deps,
        vec!["cache".to_string(), "storage".to_string()]
    );

    let from_api = app
        .client
        .fetch_dependencies(FetchDependenciesRequest {
            rid: "R".into(),
            service: "api".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(from_api.deps, vec!["storage".to_string()]);
    assert_eq!(from_api.indirect_deps, vec!["cache".to_string()]);

    let invalid = app
        .client
        .fetch_dependencies(FetchDependenciesRequest {
            rid: "R".into(),
            service: "ghost".into(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(invalid, ApiError::InvalidArgument(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn consistency_gate_short_circuits() {
    let app = helpers::gated(SID);

    // nothing registers, nothing errors
    let branch = app
        .client
        .register_branch(register_branch("R", "S", &["EU"]))
        .await
        .unwrap();
    assert!(branch.bid.is_empty());

    let response = app
        .client
        .wait_request(WaitRequest {
            rid: "R".into(),
            timeout: 1,
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(!response.timed_out);
    assert_eq!(app.server.num_requests(), 0);
}
