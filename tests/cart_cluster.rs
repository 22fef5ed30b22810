//! End-to-end scenarios: shopping carts on an in-process cluster.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use cluster_es::cart::{CartCommand, CartError, ItemPopularity, ShoppingCart, cart_tags};
use cluster_es::{
    Cluster, EntitySettings, EventLog, ExecuteError, FeedConfig, FileEventLog, LogError,
    MemberId, MemoryEventLog, Node, NodeBuilder, PersistedEvent, ProjectionSettings,
    ProposedEvent, ShardId, ShardingError, SnapshotPolicy, SnapshotRecord, StreamId,
    TaggedEvent, decode_domain_event, recover, replay,
};
use tokio::sync::Semaphore;

fn node(id: &str, roles: &[&str], log: Arc<dyn EventLog>, dir: &Path, shards: u32) -> Node {
    let mut builder = NodeBuilder::new(id, log)
        .base_dir(dir.join(id))
        .feed_config(FeedConfig {
            poll_interval: Duration::from_millis(5),
            checkpoint_interval: Duration::from_millis(50),
            ..FeedConfig::default()
        })
        .entity::<ShoppingCart>(
            EntitySettings::default()
                .with_role("host")
                .with_shard_count(shards)
                .with_tags(cart_tags()),
        )
        .projection::<ItemPopularity>(
            ProjectionSettings::new(cart_tags()).with_role("projectA"),
        );
    for role in roles {
        builder = builder.role(*role);
    }
    builder.build()
}

async fn single_member(log: Arc<dyn EventLog>, dir: &Path) -> Cluster {
    let m1 = node("m1", &["host", "projectA"], log, dir, 4);
    let cluster = Cluster::new(m1.workloads());
    cluster.join(m1).await;
    cluster
}

fn add(item: &str, quantity: i32) -> CartCommand {
    CartCommand::AddItem {
        item_id: item.into(),
        quantity,
    }
}

async fn popularity(cluster: &Cluster, item: &str) -> i64 {
    let mut total = 0;
    for tag in cart_tags().tags() {
        if let Some(p) = cluster.projection_state::<ItemPopularity>(&tag).await {
            total += p.count(item);
        }
    }
    total
}

async fn wait_for_popularity(cluster: &Cluster, item: &str, expected: i64) {
    for _ in 0..400 {
        if popularity(cluster, item).await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!(
        "popularity of {item} stuck at {}, expected {expected}",
        popularity(cluster, item).await
    );
}

#[tokio::test]
async fn add_reject_duplicate_and_zero_quantity() {
    let tmp = tempfile::tempdir().expect("failed to create tmpdir");
    let log = MemoryEventLog::new();
    let cluster = single_member(Arc::new(log.clone()), tmp.path()).await;
    let c1 = cluster.entity_ref::<ShoppingCart>("C1");
    let stream = StreamId::of::<ShoppingCart>("C1");

    let summary = c1.ask(add("socks", 3)).await.expect("first add succeeds");
    assert_eq!(summary.items["socks"], 3);
    assert!(!summary.checked_out);

    let events = log.events(&stream);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].sequence, 1);
    assert_eq!(events[0].event_type, "ItemAdded");
    assert_eq!(events[0].payload["cart_id"], "C1");
    assert_eq!(events[0].tags, vec![cart_tags().tag_for("C1")]);

    let err = c1.ask(add("socks", 5)).await.unwrap_err();
    assert!(matches!(err, ExecuteError::Domain(CartError::AlreadyAdded(_))));
    assert!(err.to_string().contains("already added"));
    assert_eq!(log.events(&stream).len(), 1, "rejection appends nothing");

    let err = c1.ask(add("t-shirt", 0)).await.unwrap_err();
    assert_eq!(err.to_string(), "Quantity must be greater than zero");
    assert!(!err.is_retryable());
    assert_eq!(log.events(&stream).len(), 1);

    cluster.shutdown().await;
}

#[tokio::test]
async fn state_survives_process_restart() {
    let tmp = tempfile::tempdir().expect("failed to create tmpdir");
    let data = tmp.path().join("data");

    let before = {
        let log: Arc<dyn EventLog> = Arc::new(FileEventLog::open(&data).expect("open log"));
        let cluster = single_member(log, tmp.path()).await;
        let c1 = cluster.entity_ref::<ShoppingCart>("C1");
        c1.ask(add("socks", 3)).await.unwrap();
        let state = c1.state().await.unwrap();
        cluster.shutdown().await;
        state
    };

    let log: Arc<dyn EventLog> = Arc::new(FileEventLog::open(&data).expect("reopen log"));
    let cluster = single_member(log, tmp.path()).await;
    let after = cluster
        .entity_ref::<ShoppingCart>("C1")
        .state()
        .await
        .expect("recovers from the journal");
    assert_eq!(after, before);
    assert_eq!(after.items["socks"], 3);
    cluster.shutdown().await;
}

#[tokio::test]
async fn snapshot_recovery_matches_full_replay() {
    let tmp = tempfile::tempdir().expect("failed to create tmpdir");
    let log = MemoryEventLog::new();
    let m1 = NodeBuilder::new("m1", Arc::new(log.clone()))
        .role("host")
        .base_dir(tmp.path())
        .snapshots(SnapshotPolicy { every: 3, keep: 2 })
        .entity::<ShoppingCart>(EntitySettings::default().with_shard_count(1))
        .build();
    let cluster = Cluster::new(m1.workloads());
    cluster.join(m1).await;

    let cart = cluster.entity_ref::<ShoppingCart>("C2");
    for (i, item) in ["a", "b", "c", "d", "e", "f", "g"].iter().enumerate() {
        cart.ask(add(item, i as i32 + 1)).await.unwrap();
    }
    cart.ask(CartCommand::AdjustItemQuantity {
        item_id: "a".into(),
        quantity: 9,
    })
    .await
    .unwrap();

    let stream = StreamId::of::<ShoppingCart>("C2");
    assert_eq!(log.snapshots(&stream).len(), 2, "only the newest two are kept");

    let recovered = recover::<ShoppingCart>(&log, &stream).await.unwrap();
    assert_eq!(recovered.from_snapshot, Some(6));
    let events: Vec<_> = log
        .events(&stream)
        .iter()
        .map(|e| decode_domain_event::<ShoppingCart>(e).unwrap())
        .collect();
    assert_eq!(recovered.state, replay::<ShoppingCart, _>(&events));
    assert_eq!(recovered.state, cart.state().await.unwrap());
    cluster.shutdown().await;
}

#[tokio::test]
async fn concurrent_commands_never_share_a_sequence() {
    let tmp = tempfile::tempdir().expect("failed to create tmpdir");
    let log = MemoryEventLog::new();
    let cluster = single_member(Arc::new(log.clone()), tmp.path()).await;

    let asks = (0..20).map(|i| {
        let cart = cluster.entity_ref::<ShoppingCart>("busy");
        async move { cart.ask(add(&format!("item-{i}"), 1)).await }
    });
    for result in futures::future::join_all(asks).await {
        result.expect("every distinct item is accepted");
    }

    let sequences: Vec<u64> = log
        .events(&StreamId::of::<ShoppingCart>("busy"))
        .iter()
        .map(|e| e.sequence)
        .collect();
    assert_eq!(sequences, (1..=20).collect::<Vec<_>>());
    cluster.shutdown().await;
}

#[tokio::test]
async fn roles_restrict_placement_and_removal_moves_only_lost_shards() {
    let tmp = tempfile::tempdir().expect("failed to create tmpdir");
    let log: Arc<dyn EventLog> = Arc::new(MemoryEventLog::new());
    let m1 = node("m1", &["host"], Arc::clone(&log), tmp.path(), 2);
    let m2 = node("m2", &["host", "projectA"], Arc::clone(&log), tmp.path(), 2);
    let cluster = Cluster::new(m1.workloads());
    cluster.join(m1).await;
    cluster.join(m2).await;

    let carts = cluster.coordinator().assignment("shopping-cart").unwrap();
    assert!(carts.is_complete());
    let m1_id = MemberId::from("m1");
    let m2_id = MemberId::from("m2");
    assert_eq!(carts.shards_of(&m1_id).len(), 1);
    assert_eq!(carts.shards_of(&m2_id).len(), 1);

    let tags = cluster.coordinator().assignment("item-popularity").unwrap();
    assert_eq!(tags.shards_of(&m2_id).len(), 5, "only m2 carries projectA");

    let kept = carts.shards_of(&m1_id)[0];
    cluster.leave(&m2_id).await.expect("m2 was a member");
    let carts = cluster.coordinator().assignment("shopping-cart").unwrap();
    assert_eq!(carts.owner(kept), Some(&m1_id), "m1's shard did not move");
    assert_eq!(carts.shards_of(&m1_id).len(), 2);

    assert!(matches!(
        cluster.coordinator().locate_shard("item-popularity", ShardId(0)),
        Err(ShardingError::NoEligibleMember { .. })
    ));
    cluster.shutdown().await;
}

#[tokio::test]
async fn projection_follows_its_tags_across_restart() {
    let tmp = tempfile::tempdir().expect("failed to create tmpdir");
    let log = MemoryEventLog::new();

    let cluster = single_member(Arc::new(log.clone()), tmp.path()).await;
    for i in 0..5 {
        cluster
            .entity_ref::<ShoppingCart>(format!("cart-{i}"))
            .ask(add("socks", 2))
            .await
            .unwrap();
    }
    wait_for_popularity(&cluster, "socks", 10).await;
    cluster.shutdown().await;

    let cluster = single_member(Arc::new(log.clone()), tmp.path()).await;
    cluster
        .entity_ref::<ShoppingCart>("cart-0")
        .ask(CartCommand::RemoveItem {
            item_id: "socks".into(),
        })
        .await
        .unwrap();
    wait_for_popularity(&cluster, "socks", 8).await;

    // Let a few more polls pass; nothing below the checkpoint is re-applied.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(popularity(&cluster, "socks").await, 8);
    cluster.shutdown().await;
}

#[tokio::test]
async fn failed_append_is_not_rejected_as_a_duplicate() {
    let tmp = tempfile::tempdir().expect("failed to create tmpdir");
    let log = MemoryEventLog::new();
    let cluster = single_member(Arc::new(log.clone()), tmp.path()).await;
    let cart = cluster.entity_ref::<ShoppingCart>("C3");

    log.fail_next_appends(1);
    let summary = cart
        .ask(add("socks", 1))
        .await
        .expect("the restarted instance decides the add again and accepts it");
    assert_eq!(summary.items["socks"], 1);
    assert_eq!(log.events(&StreamId::of::<ShoppingCart>("C3")).len(), 1);
    cluster.shutdown().await;
}

/// Holds appends while armed, until permits are added to `gate`.
#[derive(Clone)]
struct GatedLog {
    log: MemoryEventLog,
    armed: Arc<AtomicBool>,
    gate: Arc<Semaphore>,
    held: Arc<AtomicUsize>,
}

impl GatedLog {
    fn new() -> Self {
        Self {
            log: MemoryEventLog::new(),
            armed: Arc::new(AtomicBool::new(false)),
            gate: Arc::new(Semaphore::new(0)),
            held: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl EventLog for GatedLog {
    async fn append(
        &self,
        stream: &StreamId,
        expected_sequence: u64,
        events: Vec<ProposedEvent>,
    ) -> Result<u64, LogError> {
        if self.armed.load(Ordering::SeqCst) {
            self.held.fetch_add(1, Ordering::SeqCst);
            self.gate.acquire().await.expect("gate is never closed").forget();
        }
        self.log.append(stream, expected_sequence, events).await
    }

    async fn read_from(
        &self,
        stream: &StreamId,
        after_sequence: u64,
    ) -> Result<Vec<PersistedEvent>, LogError> {
        self.log.read_from(stream, after_sequence).await
    }

    async fn head(&self, stream: &StreamId) -> Result<u64, LogError> {
        self.log.head(stream).await
    }

    async fn write_snapshot(&self, stream: &StreamId, snapshot: SnapshotRecord) -> Result<(), LogError> {
        self.log.write_snapshot(stream, snapshot).await
    }

    async fn read_latest_snapshot(&self, stream: &StreamId) -> Result<Option<SnapshotRecord>, LogError> {
        self.log.read_latest_snapshot(stream).await
    }

    async fn prune_snapshots(&self, stream: &StreamId, keep: usize) -> Result<usize, LogError> {
        self.log.prune_snapshots(stream, keep).await
    }

    async fn read_tag(
        &self,
        tag: &str,
        after_offset: u64,
        max: usize,
    ) -> Result<Vec<TaggedEvent>, LogError> {
        self.log.read_tag(tag, after_offset, max).await
    }
}

async fn eventually(mut check: impl FnMut() -> bool, what: &str) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn handoff_drains_queued_commands_before_the_new_owner_takes_over() {
    let tmp = tempfile::tempdir().expect("failed to create tmpdir");
    let log = GatedLog::new();
    let shared: Arc<dyn EventLog> = Arc::new(log.clone());
    let m1 = node("m1", &["host", "projectA"], Arc::clone(&shared), tmp.path(), 2);
    let m2 = node("m2", &["host"], Arc::clone(&shared), tmp.path(), 2);
    let cluster = Cluster::new(m1.workloads());
    cluster.join(m1).await;

    // One cart per shard, both owned by m1 for now.
    let coordinator = cluster.coordinator().clone();
    let mut carts = Vec::new();
    for shard in 0..2 {
        let id = (0..)
            .map(|i| format!("cart-{i}"))
            .find(|id| coordinator.shard_for("shopping-cart", id) == Ok(ShardId(shard)))
            .expect("some identity hashes into every shard");
        carts.push(id);
    }

    log.armed.store(true, Ordering::SeqCst);
    let mut in_flight = Vec::new();
    for id in &carts {
        for item in ["a", "b", "c"] {
            let cart = cluster.entity_ref::<ShoppingCart>(id.clone());
            in_flight.push(tokio::spawn(async move { cart.ask(add(item, 1)).await }));
        }
    }
    eventually(|| log.held.load(Ordering::SeqCst) == 2, "one held append per cart").await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let joining = {
        let cluster = cluster.clone();
        tokio::spawn(async move { cluster.join(m2).await })
    };
    let mut moving = None;
    eventually(
        || {
            moving = (0..2).map(ShardId).find(|&s| {
                matches!(
                    coordinator.locate_shard("shopping-cart", s),
                    Err(ShardingError::HandoffInProgress { .. })
                )
            });
            moving.is_some()
        },
        "a shard to start handing off",
    )
    .await;
    let moving = moving.expect("checked above");
    let moving_cart = carts[moving.0 as usize].clone();

    let err = cluster
        .entity_ref::<ShoppingCart>(moving_cart.clone())
        .ask(add("d", 1))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ExecuteError::Unavailable(ShardingError::HandoffInProgress { .. })
    ));
    assert!(err.is_retryable());
    assert!(!joining.is_finished(), "the old host is still draining");

    log.armed.store(false, Ordering::SeqCst);
    log.gate.add_permits(16);
    for result in futures::future::join_all(in_flight).await {
        result
            .expect("ask task panicked")
            .expect("commands queued before the handoff complete");
    }
    joining.await.expect("join task panicked");

    let m2_id = MemberId::from("m2");
    assert_eq!(coordinator.locate_shard("shopping-cart", moving), Ok(m2_id.clone()));
    let m1_region = cluster
        .node(&MemberId::from("m1"))
        .and_then(|n| n.region::<ShoppingCart>())
        .expect("m1 hosts carts");
    assert!(!m1_region.active_instances().await.contains(&moving_cart));

    let sequences: Vec<u64> = log
        .log
        .events(&StreamId::of::<ShoppingCart>(moving_cart.clone()))
        .iter()
        .map(|e| e.sequence)
        .collect();
    assert_eq!(sequences, vec![1, 2, 3]);

    let summary = cluster
        .entity_ref::<ShoppingCart>(moving_cart)
        .ask(add("d", 1))
        .await
        .expect("the new owner recovers the drained history");
    assert_eq!(summary.items.len(), 4);
    cluster.shutdown().await;
}
