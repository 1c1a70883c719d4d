// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fleet to ingestion, in process and over TCP loop-back.

use drone_telemetry::{
    CancellationToken, ChannelTransport, ConnectionPool, Fleet, FleetConfig, FlightMode,
    IngestServer, IngestionProcessor, JsonlDeadLetterSink, MemoryDeadLetterSink, MemoryStore,
    ServerSettings, SqliteStore, StateStore, TcpTransport, TelemetryGenerator, TransportError,
};
use std::sync::Arc;
use std::time::Duration;

fn bounded_fleet_config(devices: usize, messages: u64) -> FleetConfig {
    FleetConfig::builder()
        .devices(devices)
        .max_messages(messages)
        .message_delay_ms(0)
        .start_delay_ms(0)
        .key_frame_gap(4)
        .pool_size(3)
        .seed(2024)
        .build()
}

#[tokio::test]
async fn fleet_over_channel_populates_store() {
    let config = bounded_fleet_config(4, 12);
    let (transport, mut rx) = ChannelTransport::channel(1024);
    let pool = ConnectionPool::new(config.pool_size, |_| {
        Ok::<_, TransportError>(transport.clone())
    })
    .unwrap();

    let report = Fleet::new(config.devices, config.pipeline_config(), pool)
        .with_generator(Arc::new(TelemetryGenerator::with_seed(config.seed.unwrap())))
        .run(CancellationToken::new())
        .await
        .unwrap();
    assert!(report.is_success());
    assert_eq!(report.totals.sent, 48);

    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(MemoryDeadLetterSink::new());
    let processor = IngestionProcessor::new(store.clone(), sink.clone());

    let mut payloads = Vec::new();
    while let Ok(payload) = rx.try_recv() {
        payloads.push(payload);
    }
    let batch = processor.process_batch(&payloads);
    assert_eq!(batch.stored, 48);
    assert_eq!(batch.dead_lettered, 0);
    assert!(sink.is_empty());

    assert_eq!(
        store.list_device_ids().unwrap(),
        vec!["drone-0", "drone-1", "drone-2", "drone-3"]
    );
    for id in store.list_device_ids().unwrap() {
        let state = store.get(&id).unwrap().unwrap();
        assert!(state.battery.is_some());
        assert!(state.latitude.is_some());
        assert!(state.flight_mode().is_some());
        assert_ne!(state.flight_mode(), Some(FlightMode::Unknown));
    }
}

#[tokio::test]
async fn fleet_over_tcp_into_ingest_server() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = Arc::new(SqliteStore::open(dir.path().join("state.db")).unwrap());
    let sink = Arc::new(JsonlDeadLetterSink::open(dir.path().join("dead.jsonl")).unwrap());
    let processor = Arc::new(IngestionProcessor::new(store.clone(), sink));

    let server = IngestServer::bind(
        "127.0.0.1:0",
        Arc::clone(&processor),
        ServerSettings::default(),
    )
    .await
    .unwrap();
    let addr = server.local_addr().unwrap();
    let server_token = CancellationToken::new();
    let server_task = tokio::spawn(server.run(server_token.clone()));

    let config = bounded_fleet_config(3, 10);
    let pool = ConnectionPool::connect(config.pool_size, |_| {
        TcpTransport::connect(addr, config.max_frame_size)
    })
    .await
    .unwrap();
    let report = Fleet::new(config.devices, config.pipeline_config(), pool)
        .run(CancellationToken::new())
        .await
        .unwrap();
    assert!(report.is_success());
    assert_eq!(report.totals.sent, 30);

    for _ in 0..400 {
        if processor.stats().received >= 30 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    server_token.cancel();
    let stats = server_task.await.unwrap().unwrap();

    assert_eq!(stats.received, 30);
    assert_eq!(stats.stored, 30);
    assert_eq!(stats.created, 3);
    assert_eq!(store.count().unwrap(), 3);
}
