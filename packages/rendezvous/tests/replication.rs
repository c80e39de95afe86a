//! Cross-replica behavior: fan-out of registrations and closures, and the
//! FIFO apply barrier for out-of-order arrivals.

mod helpers;

use std::time::Duration;

use opentelemetry::global;
use rendezvous_types::{
    CheckStatusRequest, CloseBranchRequest, RegisterBranchRequest, RegisterRequest,
    ReplicaCloseBranch, ReplicaContext, ReplicaRegisterBranch, RequestStatus,
};
use utils::telemetry::Metrics;

async fn spawn_app(app: &helpers::TestApp) -> std::net::SocketAddr {
    let metrics = Metrics::init(&global::meter("rendezvous-tests"));
    let router = rendezvous::http::server::make_router(
        app.config.clone(),
        app.server.clone(),
        app.client.clone(),
        app.replica.clone(),
        metrics.http,
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

#[tokio::test(flavor = "multi_thread")]
async fn sync_replication_mirrors_register_and_close() {
    let replica_b = helpers::standalone("us");
    let addr_b = spawn_app(&replica_b).await;

    let replica_a = helpers::with_peers("eu", vec![format!("http://{addr_b}")], false);

    replica_a
        .client
        .register_request(RegisterRequest { rid: "R".into() })
        .await
        .unwrap();
    let branch = replica_a
        .client
        .register_branch(RegisterBranchRequest {
            rid: "R".into(),
            service: "post_storage".into(),
            regions: vec!["EU".into()],
            ..Default::default()
        })
        .await
        .unwrap();

    // synchronous dispatch: by the time the call returned, B has the branch
    let request_b = replica_b.server.get_request("R").expect("request replicated");
    assert_eq!(request_b.num_opened_branches(), 1);

    replica_a
        .client
        .close_branch(CloseBranchRequest {
            bid: branch.bid,
            region: "EU".into(),
            visible_bids: Vec::new(),
        })
        .await
        .unwrap();

    let status = replica_b
        .client
        .check_status(CheckStatusRequest {
            rid: "R".into(),
            region: "EU".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(status.status, RequestStatus::Closed);
    assert_eq!(request_b.num_opened_branches(), 0);
}

/// A register stamped v=1 and its close arrive in the wrong order; the
/// apply barrier holds the close until the register lands, so an observer
/// sees OPEN then CLOSED, never a missing branch.
#[test]
fn out_of_order_close_waits_for_its_register() {
    let replica_b = helpers::replicated_standalone("us");

    let close = {
        let replica = replica_b.replica.clone();
        std::thread::spawn(move || {
            replica.close_branch(ReplicaCloseBranch {
                rid: "R".into(),
                core_bid: "rv_eu_0".into(),
                region: "EU".into(),
                context: ReplicaContext {
                    sid: "eu".into(),
                    version: 1,
                },
            })
        })
    };

    std::thread::sleep(Duration::from_millis(200));
    assert!(!close.is_finished());

    replica_b
        .replica
        .register_branch(ReplicaRegisterBranch {
            rid: "R".into(),
            async_zone: "r".into(),
            core_bid: "rv_eu_0".into(),
            service: "post_storage".into(),
            regions: vec!["EU".into()],
            context: ReplicaContext {
                sid: "eu".into(),
                version: 1,
            },
            ..Default::default()
        })
        .unwrap();

    close.join().unwrap().unwrap();

    let request = replica_b.server.get_request("R").unwrap();
    assert_eq!(request.num_opened_branches(), 0);
    assert_eq!(
        request.check_status_region("r", "EU"),
        Some(RequestStatus::Closed)
    );
}

/// Replicated registrations adopt async zones minted by the origin.
#[test]
fn replicated_branch_adopts_foreign_zone() {
    let replica_b = helpers::replicated_standalone("us");

    replica_b
        .replica
        .register_branch(ReplicaRegisterBranch {
            rid: "R".into(),
            async_zone: "root:eu0".into(),
            core_bid: "rv_eu_0".into(),
            service: "notifier".into(),
            ..Default::default()
        })
        .unwrap();

    let request = replica_b.server.get_request("R").unwrap();
    assert!(request.validate_zone("root:eu0").is_some());
    assert_eq!(request.num_opened_branches(), 1);
}

/// Wait-log membership replicated from a peer feeds the preceding-zone
/// computation of local waits.
#[test]
fn remote_wait_log_round_trip() {
    let replica_b = helpers::replicated_standalone("us");

    replica_b
        .replica
        .register_branch(ReplicaRegisterBranch {
            rid: "R".into(),
            async_zone: "root:eu0".into(),
            core_bid: "rv_eu_0".into(),
            service: "notifier".into(),
            ..Default::default()
        })
        .unwrap();

    let message = rendezvous_types::ReplicaWaitLog {
        rid: "R".into(),
        async_zone: "root:eu0".into(),
        target_service: String::new(),
    };
    replica_b.replica.add_wait_log(message.clone()).unwrap();
    replica_b.replica.remove_wait_log(message).unwrap();

    // unknown zone is rejected
    let bad = rendezvous_types::ReplicaWaitLog {
        rid: "R".into(),
        async_zone: "root:zz9".into(),
        target_service: String::new(),
    };
    assert!(replica_b.replica.add_wait_log(bad).is_err());
}
