use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use rusqlite::Connection;
use serde_json::Value;
use sluice_common::config::{AppConfig, StrategySettings};
use sluice_common::{Dialect, SourceConfig};
use sluice_engine::scheduler::StaticUsageSampler;
use sluice_engine::{Orchestrator, Priority, QueryParams};
use sluice_server::{build_executor, build_router, AppState, ServerMetrics};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

struct Harness {
    _dir: TempDir,
    orchestrator: Arc<Orchestrator>,
    app: Router,
}

fn harness() -> anyhow::Result<Harness> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("shop.db");
    let conn = Connection::open(&path)?;
    conn.execute_batch(
        "CREATE TABLE customers (id INTEGER PRIMARY KEY, email TEXT NOT NULL);
         CREATE TABLE orders (id INTEGER PRIMARY KEY, customer_id INTEGER, total REAL);
         INSERT INTO customers (email) VALUES ('a@example.com'), ('b@example.com');",
    )?;

    let mut config = AppConfig::default();
    config.sources.push(SourceConfig::new(
        "shop",
        Dialect::Sqlite,
        format!("sqlite://{}", path.display()),
    ));
    for profile in [
        &mut config.discovery.conservative,
        &mut config.discovery.balanced,
        &mut config.discovery.aggressive,
    ] {
        *profile = StrategySettings {
            batch_delay_ms: 0,
            ..*profile
        };
    }

    let orchestrator = Arc::new(Orchestrator::with_sampler(
        &config,
        build_executor(&config)?,
        Arc::new(StaticUsageSampler::new(0.1, 0.1)),
    ));
    orchestrator.start();

    let app = build_router(AppState {
        orchestrator: Arc::clone(&orchestrator),
        metrics: Arc::new(ServerMetrics::new()?),
    });
    Ok(Harness {
        _dir: dir,
        orchestrator,
        app,
    })
}

async fn get(app: &Router, uri: &str) -> anyhow::Result<(StatusCode, Vec<u8>)> {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty())?)
        .await?;
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await?;
    Ok((status, body.to_vec()))
}

async fn get_json(app: &Router, uri: &str) -> anyhow::Result<(StatusCode, Value)> {
    let (status, body) = get(app, uri).await?;
    Ok((status, serde_json::from_slice(&body)?))
}

#[tokio::test]
async fn health_reports_ok() -> anyhow::Result<()> {
    let h = harness()?;
    let (status, body) = get_json(&h.app, "/health").await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    h.orchestrator.stop().await;
    Ok(())
}

#[tokio::test]
async fn status_combines_scheduler_monitor_and_cache() -> anyhow::Result<()> {
    let h = harness()?;
    let (status, body) = get_json(&h.app, "/api/v1/status").await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["scheduler"]["running"], true);
    assert_eq!(body["scheduler"]["queued_total"], 0);
    assert_eq!(body["monitor"]["level"], "low");
    assert_eq!(body["cache"]["size"], 0);
    h.orchestrator.stop().await;
    Ok(())
}

#[tokio::test]
async fn discover_returns_catalog_and_uses_cache() -> anyhow::Result<()> {
    let h = harness()?;

    let (status, body) = get_json(&h.app, "/api/v1/discover/shop").await?;
    assert_eq!(status, StatusCode::OK);
    let tables = &body["databases"][0]["schemas"][0]["tables"];
    assert_eq!(tables.as_array().map(Vec::len), Some(2));
    assert_eq!(tables[0]["name"], "customers");
    assert_eq!(body["discoveryMetrics"]["cache_misses"], 1);

    let (_, cached) = get_json(&h.app, "/api/v1/discover/shop").await?;
    assert_eq!(cached["discoveryMetrics"]["cache_hits"], 1);

    let (_, refreshed) = get_json(&h.app, "/api/v1/discover/shop?refresh=true").await?;
    assert_eq!(refreshed["discoveryMetrics"]["cache_misses"], 1);
    assert_eq!(refreshed["discoveryMetrics"]["cache_hits"], 0);
    h.orchestrator.stop().await;
    Ok(())
}

#[tokio::test]
async fn unknown_source_is_not_found() -> anyhow::Result<()> {
    let h = harness()?;
    let (status, body) = get_json(&h.app, "/api/v1/discover/nope").await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "SLUICE-1001");
    assert_eq!(body["context"]["available_sources"][0], "shop");
    h.orchestrator.stop().await;
    Ok(())
}

#[tokio::test]
async fn metrics_expose_scheduler_and_discovery_counters() -> anyhow::Result<()> {
    let h = harness()?;
    get(&h.app, "/api/v1/discover/nope").await?;
    h.orchestrator
        .schedule("SELECT 1 AS one", QueryParams::new(), Priority::Normal, None)
        .await?;

    let (status, body) = get(&h.app, "/metrics").await?;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body)?;
    assert!(text.contains("sluice_discovery_failures_total 1"));
    assert!(text.contains("sluice_queries_executed_total 1"));
    assert!(text.contains("# TYPE sluice_active_queries gauge"));
    h.orchestrator.stop().await;
    Ok(())
}

#[tokio::test]
async fn scheduled_queries_run_against_default_source() -> anyhow::Result<()> {
    let h = harness()?;
    let rows = h
        .orchestrator
        .schedule(
            "SELECT COUNT(*) AS n FROM customers",
            QueryParams::new(),
            Priority::High,
            None,
        )
        .await?;
    assert_eq!(rows.value(0, "n"), Some(&serde_json::json!(2)));
    h.orchestrator.stop().await;
    Ok(())
}
