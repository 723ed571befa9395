//! 离线同步演示
//!
//! 连接 `FIELDCHECK_API_URL`（默认 http://localhost:8000），缓存任务列表、提交检查单，
//! 并打印同步与连接事件。服务端不可达时检查单留在 outbox，下次启动时继续同步。

use std::time::Duration;

use fieldcheck_sdk::{AppEvent, EntityKind, FieldcheckConfig, FieldcheckSdk, ALL_EVENTS};
use serde_json::json;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("========================================");
    println!("Fieldcheck 离线同步演示");
    println!("========================================\n");

    // === 1. 初始化 SDK ===
    let api_url = std::env::var("FIELDCHECK_API_URL").unwrap_or_else(|_| "http://localhost:8000".to_string());
    let config = FieldcheckConfig::builder()
        .data_dir("/tmp/data/fieldcheck_demo")
        .api_base_url(api_url)
        .csrf_token(std::env::var("FIELDCHECK_CSRF").unwrap_or_default())
        .debug_mode(true)
        .build();
    let sdk = FieldcheckSdk::initialize(config).await?;

    let _sub = sdk.subscribe(ALL_EVENTS, |event| match event {
        AppEvent::SyncCompleted { report } => println!(
            "✅ 同步完成: replayed={}, failed={}, remaining={}",
            report.replayed, report.failed, report.remaining
        ),
        AppEvent::SyncConflict { conflict } => println!(
            "⚠️ 冲突: op={}, server_version={}",
            conflict.operation.id, conflict.server.version
        ),
        AppEvent::ConnectivityChanged { old_state, new_state } => {
            println!("🌐 {:?} → {:?}", old_state, new_state)
        }
        other => println!("📣 {}", other.name()),
    });

    sdk.start().await?;

    // === 2. 缓存任务列表 ===
    sdk.cache_entities(
        EntityKind::Mission,
        vec![
            json!({"id": 1, "address": "12 Harbour Road", "status": "planned"}),
            json!({"id": 2, "address": "4 Mill Lane", "status": "in_progress"}),
        ],
    )
    .await?;
    println!("离线可用任务: {}", sdk.cached(EntityKind::Mission).await.len());

    // === 3. 提交检查单 ===
    let outcome = sdk
        .submit_checklist(json!({
            "mission_id": 2,
            "items": [{"room": "kitchen", "check": "smoke detector", "ok": true}]
        }))
        .await?;
    println!("提交结果: {:?}", outcome);
    println!("待同步操作: {}", sdk.pending_count().await?);

    tokio::time::sleep(Duration::from_secs(5)).await;
    println!("通知: {} 条未读", sdk.poller().unread_count());

    sdk.shutdown().await?;
    Ok(())
}
