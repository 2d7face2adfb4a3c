//! Checkpoint publication, release and fragment serving on a single
//! replica.

use bulwark_core::FragmentResponse;
use bulwark_production::{ReplicaConfig, ReplicaError};
use bulwark_simulation::{NetworkConfig, SimulationRunner, Workload};
use bulwark_types::{CheckpointManifest, ReplicaId, SeqNo, StateToken, TokenKind};
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(10);
const NODE: ReplicaId = ReplicaId(0);

fn config() -> ReplicaConfig {
    let mut config = ReplicaConfig::default();
    config.execution.checkpoint_interval = 10;
    config.checkpoint.snapshot_chunk_size = 16;
    config.checkpoint.retained_checkpoints = 2;
    config
}

async fn single_node(batches: usize, log_every: u64, checkpoint: u64) -> SimulationRunner {
    let mut runner = SimulationRunner::new(NetworkConfig::default(), 0);
    runner.add_node(NODE, config()).unwrap();
    runner
        .submit(NODE, Workload::new(3, 3, log_every).take(batches))
        .unwrap();
    let last = SeqNo(batches as u64);
    runner
        .run_until("workload executed", TIMEOUT, move |r| {
            let node = r.node(NODE).unwrap();
            node.shared.highest_executed() == last
                && node.shared.manifest().checkpoint_seq() == SeqNo(checkpoint)
        })
        .await
        .unwrap();
    runner
}

fn snapshot_name(seq: u64) -> String {
    TokenKind::Snapshot.file_name(SeqNo(seq))
}

/// Manifests announced when a snapshot checkpoint was published.
fn published(runner: &SimulationRunner) -> Vec<CheckpointManifest> {
    runner
        .node(NODE)
        .unwrap()
        .ordering
        .announced()
        .into_iter()
        .filter_map(|(seq, bytes)| {
            CheckpointManifest::decode(&bytes)
                .ok()
                .filter(|m| m.checkpoint_seq() == seq)
        })
        .collect()
}

#[tokio::test]
async fn test_checkpoints_published_at_interval() {
    let runner = single_node(25, 3, 20).await;
    let node = runner.node(NODE).unwrap();

    let seqs: Vec<SeqNo> = published(&runner).iter().map(|m| m.checkpoint_seq()).collect();
    assert_eq!(seqs, vec![SeqNo(10), SeqNo(20)]);
    assert_eq!(node.app.syncs(), vec![SeqNo(10), SeqNo(20)]);
    assert!(node.storage.contains(TokenKind::Snapshot, &snapshot_name(10)));
    assert!(node.storage.contains(TokenKind::Snapshot, &snapshot_name(20)));

    // Log checkpoints are announced too, each with its own segment.
    let log_names = node.storage.file_names(TokenKind::LogSegment);
    assert_eq!(log_names.len(), 8);
    assert_eq!(
        node.ordering.latest_checkpoint().map(|m| m.checkpoint_seq()),
        Some(SeqNo(20))
    );

    runner.shutdown().await;
}

#[tokio::test]
async fn test_released_checkpoints_collected_beyond_retention() {
    // Log checkpoints every 7 batches never land on a snapshot boundary.
    let runner = single_node(45, 7, 40).await;
    let manifests = published(&runner);
    assert_eq!(manifests.len(), 4);

    let node = runner.node(NODE).unwrap();
    for manifest in &manifests[..2] {
        node.handle.release_checkpoint(manifest.encode()).unwrap();
    }
    node.handle.release_checkpoint(manifests[2].encode()).unwrap();

    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while node.storage.contains(TokenKind::Snapshot, &snapshot_name(10)) {
        assert!(tokio::time::Instant::now() < deadline, "snapshot_10 never collected");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    for seq in [20, 30, 40] {
        assert!(node.storage.contains(TokenKind::Snapshot, &snapshot_name(seq)));
    }

    // An undecodable release is ignored.
    node.handle.release_checkpoint(vec![0xde, 0xad]).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!node.is_stopped());

    runner.shutdown().await;
}

#[tokio::test]
async fn test_peer_requests_served_from_storage() {
    let runner = single_node(12, 3, 10).await;
    let node = runner.node(NODE).unwrap();
    let manifest = node.shared.manifest();
    let token = manifest.snapshot_tokens()[1].clone();
    let missing = StateToken::for_data(TokenKind::LogSegment, SeqNo(999), 0, b"nope");

    node.handle
        .fragment_requested(ReplicaId(7), token.encode())
        .unwrap();
    node.handle
        .fragment_requested(ReplicaId(8), missing.encode())
        .unwrap();

    let mut replies = Vec::new();
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while replies.len() < 2 {
        assert!(tokio::time::Instant::now() < deadline, "fetch service never answered");
        replies.extend(node.transport.take_replies());
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    replies.sort_by_key(|(to, _, _)| *to);

    let (to, bytes, response) = &replies[0];
    assert_eq!(*to, ReplicaId(7));
    assert_eq!(*bytes, token.encode());
    match response {
        FragmentResponse::Data(data) => assert!(token.validate(data)),
        other => panic!("expected data, got {other:?}"),
    }
    assert_eq!(
        replies[1],
        (ReplicaId(8), missing.encode(), FragmentResponse::NotAvailable)
    );

    runner.shutdown().await;
}

#[tokio::test]
async fn test_storage_failure_stops_replica() {
    let mut runner = single_node(3, 3, 0).await;
    runner.node(NODE).unwrap().storage.set_fail_writes(true);

    let batches = Workload::new(3, 3, 3).take(6);
    runner.submit(NODE, batches.into_iter().skip(3)).unwrap();
    runner
        .run_until("replica stopped", TIMEOUT, |r| r.node(NODE).unwrap().is_stopped())
        .await
        .unwrap();

    let result = runner.stop_node(NODE).await.unwrap();
    assert!(matches!(result, Err(ReplicaError::Fatal(_))));
}
