//! Configuration files on disk, environment overrides and stage construction.

use rust_ingest::config::IngestConfig;
use rust_ingest::error::IngestError;
use rust_ingest::monitoring::MonitoringStore;
use rust_ingest::pipeline::{StageContext, StageRegistry};
use std::path::Path;
use std::sync::Arc;

fn sample_path() -> &'static Path {
    Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/config/ingest.toml"))
}

#[test]
fn sample_configuration_builds_every_stage() {
    let config = IngestConfig::load_from(sample_path()).unwrap();
    config.validate().unwrap();
    assert_eq!(config.array.antennas.len(), 6);
    assert_eq!(config.visibility.total_channels(), 432);
    assert_eq!(config.monitoring.address.as_deref(), Some("127.0.0.1:4062"));

    let ctx = StageContext::new(config.array.clone(), Arc::new(MonitoringStore::new())).unwrap();
    let stages = StageRegistry::new().build(&config.stages, &ctx).unwrap();
    let names: Vec<&str> = stages.iter().map(|s| s.name()).collect();
    assert_eq!(
        names,
        vec!["geometry", "fringe_rotation", "calibration", "channel_averaging"]
    );
}

#[test]
fn gain_table_file_is_resolved_from_stage_parameters() {
    let dir = tempfile::tempdir().unwrap();
    let gains = dir.path().join("gains.toml");
    std::fs::write(
        &gains,
        r#"
        [[gains]]
        antenna = "ak01"
        pol = "X"
        value = [0.5, 0.0]
        "#,
    )
    .unwrap();

    let text = std::fs::read_to_string(sample_path()).unwrap();
    let start = text.find("[[stages]]\ntype = \"calibration\"").unwrap();
    let end = text.find("[[stages]]\ntype = \"channel_averaging\"").unwrap();
    let document = format!(
        "{}[[stages]]\ntype = \"calibration\"\ngain_table = {:?}\n\n{}",
        &text[..start],
        gains.display().to_string(),
        &text[end..]
    );
    let path = dir.path().join("ingest.toml");
    std::fs::write(&path, document).unwrap();

    let config = IngestConfig::load_from(&path).unwrap();
    let ctx = StageContext::new(config.array.clone(), Arc::new(MonitoringStore::new())).unwrap();
    assert!(StageRegistry::new().build(&config.stages, &ctx).is_ok());

    std::fs::remove_file(&gains).unwrap();
    assert!(matches!(
        StageRegistry::new().build(&config.stages, &ctx),
        Err(IngestError::Configuration(_))
    ));
}

#[test]
fn invalid_stage_parameters_name_the_stage() {
    let text = std::fs::read_to_string(sample_path())
        .unwrap()
        .replace("factor = 54", "factor = 54\nwindow = \"hann\"");
    let config = IngestConfig::from_toml_str(&text).unwrap();
    let ctx = StageContext::new(config.array.clone(), Arc::new(MonitoringStore::new())).unwrap();
    match StageRegistry::new().build(&config.stages, &ctx) {
        Err(IngestError::Configuration(msg)) => assert!(msg.contains("channel_averaging"), "{}", msg),
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("unknown parameter accepted"),
    }
}

#[test]
fn validation_rejects_duplicate_antennas() {
    let text = std::fs::read_to_string(sample_path())
        .unwrap()
        .replace("name = \"ak12\"", "name = \"ak01\"");
    let config = IngestConfig::from_toml_str(&text).unwrap();
    assert!(matches!(
        config.validate(),
        Err(IngestError::Configuration(_))
    ));
}
