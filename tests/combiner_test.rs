use enricher::config::EnrichmentSettings;
use enricher::enricher::{
    Combiner, CombinerConfig, ConfigError, Enricher, EnricherKind, Enrichers, QuorumCheck,
};
use enricher::{EntityId, LocalManagement, Management, Sensor};
use serde_json::{json, Value};
use std::sync::Arc;

fn cpu() -> Sensor {
    Sensor::new("cpu")
}

fn memory() -> Sensor {
    Sensor::new("memory")
}

fn total() -> Sensor {
    Sensor::new("usage.total")
}

fn config(transformation: &str) -> CombinerConfig {
    CombinerConfig {
        source_sensors: vec![cpu(), memory()],
        target_sensor: Some(total()),
        transformation_name: Some(transformation.to_string()),
        ..Default::default()
    }
}

fn attach(mgmt: &Arc<LocalManagement>, owner: &EntityId, config: CombinerConfig) -> Arc<Combiner> {
    Combiner::attach(config, owner, mgmt.clone(), &EnrichmentSettings::default())
        .map_err(|e| e.to_string())
        .unwrap()
}

#[test]
fn test_sum_tracks_each_source() {
    let mgmt = Arc::new(LocalManagement::new());
    let owner = mgmt.create_entity(None).unwrap();
    mgmt.set_attribute(&owner, &cpu(), json!(2)).unwrap();

    let combiner = attach(&mgmt, &owner, config("sum"));
    assert_eq!(combiner.tag(), "combiner:usage.total");
    assert_eq!(combiner.kind(), EnricherKind::Combiner);
    assert_eq!(mgmt.current_value(&owner, &total()), Some(json!(2)));

    mgmt.set_attribute(&owner, &memory(), json!(5)).unwrap();
    assert_eq!(mgmt.current_value(&owner, &total()), Some(json!(7)));

    mgmt.set_attribute(&owner, &cpu(), json!(1)).unwrap();
    assert_eq!(mgmt.current_value(&owner, &total()), Some(json!(6)));
}

#[test]
fn test_nothing_published_until_a_source_reports() {
    let mgmt = Arc::new(LocalManagement::new());
    let owner = mgmt.create_entity(None).unwrap();

    let combiner = attach(&mgmt, &owner, config("sum"));
    assert!(combiner.is_live());
    assert_eq!(mgmt.current_value(&owner, &total()), None);
}

#[test]
fn test_average_over_another_producer() {
    let mgmt = Arc::new(LocalManagement::new());
    let owner = mgmt.create_entity(None).unwrap();
    let node = mgmt.create_entity(Some(&owner)).unwrap();
    mgmt.set_attribute(&node, &cpu(), json!(2)).unwrap();
    mgmt.set_attribute(&node, &memory(), json!(4)).unwrap();

    let mut config = config("average");
    config.producer = Some(node.clone());
    let combiner = attach(&mgmt, &owner, config);

    assert_eq!(combiner.compute().unwrap(), Some(json!(3.0)));
    assert_eq!(mgmt.current_value(&owner, &total()), Some(json!(3.0)));
    assert_eq!(mgmt.current_value(&node, &total()), None);
}

#[test]
fn test_default_value_stands_in_for_unreported() {
    let mgmt = Arc::new(LocalManagement::new());
    let owner = mgmt.create_entity(None).unwrap();
    mgmt.set_attribute(&owner, &cpu(), json!(3)).unwrap();

    let mut config = config("list");
    config.default_value_for_unreported = Some(json!(0));
    let combiner = attach(&mgmt, &owner, config);

    // Source order is kept
    assert_eq!(combiner.compute().unwrap(), Some(json!([3, 0])));
}

#[test]
fn test_value_filter_drops_inputs() {
    let mgmt = Arc::new(LocalManagement::new());
    let owner = mgmt.create_entity(None).unwrap();
    mgmt.set_attribute(&owner, &cpu(), json!(-1)).unwrap();
    mgmt.set_attribute(&owner, &memory(), json!(4)).unwrap();

    let spec = Enrichers::builder()
        .combining([cpu(), memory()])
        .publishing(total())
        .value_filter(|v: &Value| v.as_i64().map_or(false, |n| n >= 0))
        .computing_sum()
        .build();
    spec.attach(&owner, mgmt.clone(), &EnrichmentSettings::default())
        .unwrap();

    assert_eq!(mgmt.current_value(&owner, &total()), Some(json!(4)));
}

#[test]
fn test_quorum_over_health_sensors() {
    let mgmt = Arc::new(LocalManagement::new());
    let owner = mgmt.create_entity(None).unwrap();
    let up = Sensor::new("service.up");
    let checks = [Sensor::new("db.up"), Sensor::new("web.up"), Sensor::new("cache.up")];
    mgmt.set_attribute(&owner, &checks[0], json!(true)).unwrap();

    Enrichers::builder()
        .combining(checks.clone())
        .publishing(up.clone())
        .computing_quorate(QuorumCheck::AtLeast(2), None)
        .build()
        .attach(&owner, mgmt.clone(), &EnrichmentSettings::default())
        .unwrap();
    assert_eq!(mgmt.current_value(&owner, &up), Some(json!(false)));

    mgmt.set_attribute(&owner, &checks[2], json!(true)).unwrap();
    assert_eq!(mgmt.current_value(&owner, &up), Some(json!(true)));

    mgmt.set_attribute(&owner, &checks[0], json!(false)).unwrap();
    assert_eq!(mgmt.current_value(&owner, &up), Some(json!(false)));
}

#[test]
fn test_publishing_onto_a_source_is_refused() {
    let mgmt = Arc::new(LocalManagement::new());
    let owner = mgmt.create_entity(None).unwrap();

    let mut config = config("sum");
    config.target_sensor = Some(cpu());
    let combiner = attach(&mgmt, &owner, config);

    assert!(!combiner.is_live());
    assert_eq!(mgmt.subscription_count(), 0);
}

#[test]
fn test_config_errors() {
    let mgmt = Arc::new(LocalManagement::new());
    let owner = mgmt.create_entity(None).unwrap();
    let settings = EnrichmentSettings::default();

    let mut no_sources = config("sum");
    no_sources.source_sensors.clear();
    let err = Combiner::attach(no_sources, &owner, mgmt.clone(), &settings)
        .err()
        .unwrap();
    assert_eq!(err.config(), Some(&ConfigError::EmptySourceSensors));

    let mut no_target = config("sum");
    no_target.target_sensor = None;
    let err = Combiner::attach(no_target, &owner, mgmt.clone(), &settings)
        .err()
        .unwrap();
    assert_eq!(err.config(), Some(&ConfigError::MissingTargetSensor));
}

#[test]
fn test_duplicate_sources_are_subscribed_once() {
    let mgmt = Arc::new(LocalManagement::new());
    let owner = mgmt.create_entity(None).unwrap();
    mgmt.set_attribute(&owner, &cpu(), json!(2)).unwrap();

    let mut config = config("sum");
    config.source_sensors = vec![cpu(), cpu()];
    let combiner = attach(&mgmt, &owner, config);

    assert_eq!(combiner.source_sensors(), &[cpu()]);
    assert_eq!(mgmt.current_value(&owner, &total()), Some(json!(2)));
}
