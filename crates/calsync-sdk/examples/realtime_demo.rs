//! Realtime sync demo
//!
//! Connects to a realtime server, follows one project and pushes a couple of edits.
//!
//! ```text
//! CALSYNC_URL=ws://localhost:9000/realtime CALSYNC_TOKEN=dev cargo run --example realtime_demo
//! ```

use calsync_sdk::{CalsyncConfig, RealtimeManager, UpdateAction};
use serde_json::json;
use std::time::Duration;
use tokio::time::sleep;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let server_url = std::env::var("CALSYNC_URL").unwrap_or_else(|_| "ws://localhost:9000/realtime".to_string());
    let token = std::env::var("CALSYNC_TOKEN").unwrap_or_else(|_| "dev-token".to_string());

    let config = CalsyncConfig::builder()
        .server_url(server_url.as_str())
        .auth_token(token.as_str())
        .user_id("demo-user")
        .debug_mode(true)
        .build();
    calsync_sdk::init_tracing(config.debug_mode);

    println!("\n🚀 Calsync realtime demo\n");
    println!("====================================\n");

    let manager = RealtimeManager::with_websocket(config);

    let _status = manager.on_connection_status_change(|old, new| {
        println!("🔌 {} -> {}", old, new);
    });
    let _errors = manager.on_error(|error| {
        println!("❌ [{}] {}", error.kind(), error);
    });
    let _queue = manager.on_sync_queue_update(|items| {
        println!("📤 queue: {} item(s)", items.len());
    });
    let _conflicts = manager.on_conflict(|conflict| {
        println!(
            "⚠️  {:?} on {} (local v{}, server v{})",
            conflict.conflict_type, conflict.resource_id, conflict.local_version, conflict.server_version
        );
    });
    let _projects = manager.on_project_update(|update| {
        println!("📡 project {} {} {}", update.project_id, update.action, update.data);
    });
    let _schedules = manager.on_calendar_update(|update| {
        println!("📅 schedule {} {} in {}", update.schedule_id, update.action, update.project_id);
    });

    println!("📦 connecting...");
    manager.initialize().await?;
    println!("✅ connected\n");

    manager.subscribe_to_project("demo-project");
    manager.subscribe_to_calendar("demo-project");

    let item = manager
        .send_project_update("demo-project", UpdateAction::Update, json!({"name": "Demo roadmap"}))
        .await?;
    println!("✅ project update {} acknowledged after {} retries", item.id, item.retry_count);

    let item = manager
        .send_calendar_update(
            "demo-schedule",
            "demo-project",
            UpdateAction::Create,
            json!({"title": "Kickoff", "start": "2026-10-20T09:00:00Z"}),
        )
        .await?;
    println!("✅ schedule update {} acknowledged\n", item.id);

    println!("⏳ listening for 10s...");
    sleep(Duration::from_secs(10)).await;

    let metrics = manager.get_connection_metrics();
    println!("\n📊 metrics:");
    println!("   latency: {:?}ms", metrics.latency);
    println!("   reconnects: {}", metrics.reconnection_count);
    println!("   packets lost: {}", metrics.packets_lost);
    let stats = manager.queue_stats();
    println!("   completed: {} failed: {}", stats.completed_items, stats.failed_items);

    manager.shutdown().await;
    println!("\n👋 done");
    Ok(())
}
