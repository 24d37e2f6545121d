//! Full engine lifecycle: loops run on their periods, shutdown drains and
//! persists the index.

mod common;

use common::*;
use intent_mediator::{EventSink, MediationEngine};
use std::time::Duration;
use tempfile::TempDir;
use wiremock::MockServer;

#[tokio::test]
async fn run_ticks_loops_and_persists_on_shutdown() {
    let chain = MockServer::start().await;
    let llm = MockServer::start().await;
    let embed = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    mount_chain_defaults(&chain).await;
    mount_pending(&chain, vec![]).await;

    let mut config = test_config(&chain.uri(), &llm.uri(), &embed.uri(), &dir);
    config.mediation.ingest_period_ms = 40;
    config.mediation.cycle_period_ms = 50;
    config.mediation.monitor_period_ms = 60;
    config.mediation.shutdown_deadline_ms = 2_000;

    let engine = MediationEngine::new(config, EventSink::disabled()).unwrap();
    let runner = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run().await })
    };

    // Let every loop tick at least once.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let health = engine.health();
    assert!(health.last_ingest_ms.is_some());
    assert!(health.last_cycle_ms.is_some());

    engine.shutdown();
    tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .expect("engine did not stop in time")
        .unwrap()
        .unwrap();

    // Shutdown persisted the index files.
    assert!(dir.path().join("vectors").join("index.bin").exists());
    assert!(dir.path().join("vectors").join("intent-map.json").exists());
}

#[tokio::test]
async fn events_are_emitted_to_a_subscriber() {
    let chain = MockServer::start().await;
    let llm = MockServer::start().await;
    let embed = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    mount_chain_defaults(&chain).await;
    mount_pending(&chain, vec![]).await;

    let (sink, mut rx) = EventSink::subscribed(16);
    let engine = MediationEngine::new(
        test_config(&chain.uri(), &llm.uri(), &embed.uri(), &dir),
        sink,
    )
    .unwrap();

    engine.run_ingest_once().await.unwrap();
    engine.run_cycle_once().await.unwrap();

    match rx.try_recv().expect("expected a cycle event") {
        intent_mediator::EngineEvent::CycleCompleted { submitted, intents, .. } => {
            assert_eq!(submitted, 0);
            assert_eq!(intents, 0);
        }
        other => panic!("unexpected event {other:?}"),
    }
}
