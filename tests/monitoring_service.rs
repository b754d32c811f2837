//! Monitoring query service observing a pipeline fed by simulated sources.

use rust_ingest::config::IngestConfig;
use rust_ingest::ingest::{MetadataChannel, StreamMerger, VisibilityChannel};
use rust_ingest::mock::{SimulationParams, Simulator};
use rust_ingest::monitoring::{server, MonitorValue, MonitoringStore, PointStatus};
use rust_ingest::pipeline::{LoggingSink, StageContext, StageRegistry, TaskPipeline};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_test::{assert_err, assert_ok};

const CONFIG: &str = r#"
    [application]
    name = "monitoring"

    [pipeline]
    max_integrations = 4
    poll_timeout_ms = 50

    [metadata]
    topic = "tos.metadata"

    [visibility]
    ranks = [{ channels = 8 }]

    [array]
    name = "test-array"
    polarisations = ["XX", "YY"]
    antennas = [
        { name = "ak01", position = [-2556084.669, 5097398.337, -2848424.133] },
        { name = "ak02", position = [-2556118.109, 5097384.719, -2848417.874] },
    ]

    [[stages]]
    type = "geometry"

    [[stages]]
    type = "hardware_delay"
    step_ns = 1.0
"#;

#[tokio::test]
async fn pipeline_points_are_served_to_clients() {
    let config = IngestConfig::from_toml_str(CONFIG).unwrap();
    let store = Arc::new(MonitoringStore::new());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel::<()>();
    let service = tokio::spawn(server::serve(listener, Arc::clone(&store), async move {
        let _ = rx.await;
    }));

    let metadata = Arc::new(MetadataChannel::new(config.metadata.buffer_size));
    let visibility = Arc::new(VisibilityChannel::from_config(&config.visibility));
    let producer = Simulator::new(&config, SimulationParams::default())
        .unwrap()
        .spawn(
            4,
            Arc::clone(&metadata),
            Arc::clone(&visibility),
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();

    let ctx = StageContext::new(config.array.clone(), Arc::clone(&store)).unwrap();
    let merger = StreamMerger::new(&config, metadata, visibility).unwrap();
    let mut pipeline = TaskPipeline::from_config(
        &config,
        &StageRegistry::new(),
        &ctx,
        merger,
        Box::new(LoggingSink::default()),
    )
    .unwrap();

    let stats = tokio::task::spawn_blocking(move || pipeline.run())
        .await
        .unwrap();
    let stats = assert_ok!(stats);
    assert_eq!(stats.cycles, 4);
    assert_eq!(producer.join().unwrap().unwrap(), 4);

    let points = assert_ok!(
        server::query(
            addr,
            &[
                "ingest.cycles",
                "ingest.last_timestamp_us",
                "ak01.delay_ns",
                "ak02.hw_delay_steps",
                "ak03.delay_ns",
            ],
        )
        .await
    );
    assert_eq!(points.len(), 4);

    let cycles = points.iter().find(|p| p.name == "ingest.cycles").unwrap();
    assert_eq!(cycles.value, MonitorValue::Int64(4));
    let steps = points.iter().find(|p| p.name == "ak02.hw_delay_steps").unwrap();
    assert!(matches!(steps.value, MonitorValue::Int32(_)));
    assert_eq!(steps.status, PointStatus::Ok);

    tx.send(()).unwrap();
    assert_ok!(service.await.unwrap());
    assert_err!(server::query(addr, &["ingest.cycles"]).await);
}
