//! Two-member cluster running shopping carts and an item-popularity
//! projection over a file-backed event log.
//!
//! Run with: `RUST_LOG=info cargo run --example cart_cluster`

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use cluster_es::cart::{CartCommand, ItemPopularity, ShoppingCart, cart_tags};
use cluster_es::{
    Cluster, CommandContext, EntitySettings, EventLog, FeedConfig, FileEventLog, MemberId, Node,
    NodeBuilder, ProjectionSettings,
};
use tracing_subscriber::EnvFilter;

fn node(id: &str, roles: &[&str], log: Arc<dyn EventLog>, dir: &Path) -> Node {
    let mut builder = NodeBuilder::new(id, log)
        .base_dir(dir.join(id))
        .feed_config(FeedConfig {
            poll_interval: Duration::from_millis(20),
            ..FeedConfig::default()
        })
        .entity::<ShoppingCart>(
            EntitySettings::default()
                .with_role("host")
                .with_shard_count(10)
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

async fn total_popularity(cluster: &Cluster, item: &str) -> i64 {
    let mut total = 0;
    for tag in cart_tags().tags() {
        if let Some(p) = cluster.projection_state::<ItemPopularity>(&tag).await {
            total += p.count(item);
        }
    }
    total
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let tmp = tempfile::tempdir()?;
    let log: Arc<dyn EventLog> = Arc::new(FileEventLog::open(tmp.path().join("data"))?);

    let m1 = node("m1", &["host"], Arc::clone(&log), tmp.path());
    let m2 = node("m2", &["host", "projectA"], Arc::clone(&log), tmp.path());
    let cluster = Cluster::new(m1.workloads());
    cluster.join(m1).await;
    cluster.join(m2).await;

    let ctx = CommandContext::default().with_actor("demo");
    for i in 0..6 {
        let cart = cluster.entity_ref::<ShoppingCart>(format!("cart-{i}"));
        cart.ask_with(
            CartCommand::AddItem {
                item_id: "socks".into(),
                quantity: 2,
            },
            ctx.clone(),
        )
        .await?;
    }

    let c1 = cluster.entity_ref::<ShoppingCart>("cart-0");
    match c1
        .ask(CartCommand::AddItem {
            item_id: "socks".into(),
            quantity: 5,
        })
        .await
    {
        Ok(_) => println!("unexpected: duplicate add accepted"),
        Err(e) => println!("cart-0 rejected duplicate add: {e}"),
    }

    let summary = c1.ask(CartCommand::Checkout { at: 1_700_000_000_000 }).await?;
    println!("cart-0 checked out: {summary:?}");

    for (workload, assignment) in ["shopping-cart", "item-popularity"]
        .into_iter()
        .filter_map(|w| Some((w, cluster.coordinator().assignment(w)?)))
    {
        println!("{workload}: {:?}", assignment.load());
    }

    tokio::time::sleep(Duration::from_millis(300)).await;
    println!("socks in carts: {}", total_popularity(&cluster, "socks").await);

    cluster.leave(&MemberId::from("m1")).await;
    let after = cluster
        .entity_ref::<ShoppingCart>("cart-3")
        .ask(CartCommand::Get)
        .await?;
    println!("cart-3 after m1 left: {after:?}");

    cluster.shutdown().await;
    Ok(())
}
