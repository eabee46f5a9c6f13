//! Pipeline lifecycle end to end: graceful close, terminal-forward
//! monotonicity, degraded conditions, and destruction.

mod common;

use carton::common::timestamp_now_millis;
use carton::detector::{HealthEvent, HealthEventKind};
use carton::pipeline::PipelineState;
use carton::rlog::ReplicationLevel;
use common::{client_config, fast_config, MiniCluster};
use carton::client::BlockOutputStream;

#[tokio::test]
async fn test_admin_close_drains_then_closes() {
    let cluster = MiniCluster::new(3, fast_config());
    let pipeline = cluster.create_pipeline(3);

    cluster.manager.close_pipeline(pipeline.id).unwrap();
    assert_eq!(
        cluster.manager.pipeline(pipeline.id).unwrap().state,
        PipelineState::Closing
    );

    // Closing again is a no-op, not an error
    cluster.manager.close_pipeline(pipeline.id).unwrap();

    // Commands flow out on reports; drained members complete the close
    cluster.deliver_reports().await;
    cluster.deliver_reports().await;
    assert_eq!(
        cluster.manager.pipeline(pipeline.id).unwrap().state,
        PipelineState::Closed
    );
}

#[tokio::test]
async fn test_closed_is_terminal_for_every_later_event() {
    let cluster = MiniCluster::new(3, fast_config());
    let pipeline = cluster.create_pipeline(3);
    cluster.manager.plm().close_now(pipeline.id);

    let leader = pipeline.leader.clone();
    let plm = cluster.manager.plm();

    // No later event reopens a closed pipeline
    for kind in [
        HealthEventKind::StaleNode,
        HealthEventKind::WatchTimeout,
        HealthEventKind::FollowerSlow,
        HealthEventKind::ReadFailure { container: 1 },
        HealthEventKind::ApplyFailure { container: 1 },
    ] {
        plm.handle_event(HealthEvent::new(
            leader.clone(),
            pipeline.id,
            kind,
            Some(leader.clone()),
        ));
        assert_eq!(
            cluster.manager.pipeline(pipeline.id).unwrap().state,
            PipelineState::Closed
        );
    }
}

#[tokio::test]
async fn test_watch_timeout_degrades_without_closing() {
    let cluster = MiniCluster::new(3, fast_config());
    let pipeline = cluster.create_pipeline(3);
    let client = cluster.client();

    // One follower down: quorum commits still work
    let follower = pipeline.followers().next().unwrap().clone();
    cluster.stop_node(&follower);

    let mut stream = BlockOutputStream::open(&client, client_config())
        .await
        .unwrap();
    stream.write(b"commits at quorum").await.unwrap();
    let locators = stream.close().await.unwrap();

    // A watch for full replication cannot resolve while the member is
    // away; the timeout is a health signal, not a failure of the write
    let group = cluster.group(pipeline.id);
    let err = group
        .watch(
            group.commit_index(),
            ReplicationLevel::AllReplicated,
            std::time::Duration::from_millis(100),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, carton::Error::WatchTimeout { .. }));

    cluster
        .manager
        .detector()
        .watch_timed_out("write-path", pipeline.id, group.leader());
    cluster.pump_events();

    let p = cluster.manager.pipeline(pipeline.id).unwrap();
    assert_eq!(p.state, PipelineState::Open);
    assert!(p.degraded);

    // Reads keep working on the degraded pipeline
    let read = carton::client::read_block(&client, &locators[0]).await.unwrap();
    assert_eq!(&read[..], b"commits at quorum");
}

#[tokio::test]
async fn test_follower_catchup_after_reconnect() {
    let cluster = MiniCluster::new(3, fast_config());
    let pipeline = cluster.create_pipeline(3);
    let client = cluster.client();

    let follower = pipeline.followers().next().unwrap().clone();
    cluster.stop_node(&follower);

    let mut stream = BlockOutputStream::open(&client, client_config())
        .await
        .unwrap();
    stream.write(b"written while follower away").await.unwrap();
    let locators = stream.close().await.unwrap();

    // Healthy leader: catch-up succeeds and the follower converges
    cluster.restart_node(&follower).unwrap();
    let group = cluster.group(pipeline.id);
    assert_eq!(group.lag(&follower), 0);

    // The caught-up follower can serve the block locally
    let read = cluster.node(&follower).read_block(&locators[0]).unwrap();
    assert_eq!(&read[..], b"written while follower away");

    // And the pipeline never left OPEN
    cluster.pump_events();
    assert_eq!(
        cluster.manager.pipeline(pipeline.id).unwrap().state,
        PipelineState::Open
    );
}

#[tokio::test]
async fn test_destroy_timeline_respects_traffic() {
    let cluster = MiniCluster::new(3, fast_config());
    let pipeline = cluster.create_pipeline(3);
    cluster.manager.plm().close_now(pipeline.id);

    let plm = cluster.manager.plm();
    let t0 = timestamp_now_millis();

    // Inside the destroy timeout: still CLOSED
    plm.sweep(t0 + 100);
    assert_eq!(
        cluster.manager.pipeline(pipeline.id).unwrap().state,
        PipelineState::Closed
    );

    // Past it with no traffic: DESTROYED, then gone after grace
    let last = cluster.manager.pipeline(pipeline.id).unwrap().last_activity_ms;
    plm.sweep(last + 5_000);
    let last = match cluster.manager.pipeline(pipeline.id) {
        Some(p) => {
            assert_eq!(p.state, PipelineState::Destroyed);
            p.last_activity_ms
        }
        None => panic!("record should survive its grace period"),
    };
    plm.sweep(last + 5_000);
    assert!(cluster.manager.pipeline(pipeline.id).is_none());
}

#[tokio::test]
async fn test_leadership_move_is_observed() {
    let cluster = MiniCluster::new(3, fast_config());
    let pipeline = cluster.create_pipeline(3);
    let group = cluster.group(pipeline.id);

    let new_leader = pipeline.followers().next().unwrap().clone();
    group.set_leader(&new_leader);

    // The registry records what the primitive reports
    cluster
        .manager
        .registry()
        .observe_leader(pipeline.id, &new_leader);
    assert_eq!(
        cluster.manager.pipeline(pipeline.id).unwrap().leader,
        new_leader
    );

    // Writes through the old leader bounce with a pointer to the new one
    let data = bytes::Bytes::from_static(b"x");
    let op = carton::container::ContainerOp::WriteChunk {
        block: 1,
        offset: 0,
        len: 1,
        crc: carton::common::crc32(&data),
        data,
    };
    let err = cluster
        .node(&pipeline.leader)
        .submit(
            pipeline.id,
            1,
            op,
            std::time::Duration::from_millis(200),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, carton::Error::NotLeader(l) if l == new_leader));
}
