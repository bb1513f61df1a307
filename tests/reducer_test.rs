use enricher::config::EnrichmentSettings;
use enricher::enricher::{ConfigError, Reducer, ReducerConfig, SensorSource};
use enricher::management::Expression;
use enricher::{Enricher, Enrichers, EntityId, LocalManagement, Management, Sensor};
use serde_json::{json, Value};
use std::sync::Arc;

fn setup() -> (Arc<LocalManagement>, EntityId) {
    let mgmt = Arc::new(LocalManagement::new());
    let owner = mgmt.create_entity(None).unwrap();
    (mgmt, owner)
}

fn sum_config(sources: Vec<SensorSource>) -> ReducerConfig {
    ReducerConfig {
        source_sensors: sources,
        target_sensor: Some(Sensor::new("total")),
        function_name: Some("sum".to_string()),
        ..Default::default()
    }
}

#[test]
fn test_reducer_rereads_all_sources() {
    let (mgmt, owner) = setup();
    let s1 = Sensor::new("s1");
    let s2 = Sensor::new("s2");
    mgmt.set_attribute(&owner, &s1, json!(1)).unwrap();
    mgmt.set_attribute(&owner, &s2, json!(2)).unwrap();

    let reducer = Reducer::attach(
        sum_config(vec![s1.clone().into(), s2.clone().into()]),
        &owner,
        mgmt.clone(),
        &EnrichmentSettings::default(),
    )
    .map_err(|e| e.to_string())
    .unwrap();

    // Nothing is computed until an event arrives
    assert_eq!(mgmt.current_value(&owner, &Sensor::new("total")), None);
    assert_eq!(reducer.tag(), "reducer:[s1,s2]");

    mgmt.set_attribute(&owner, &s1, json!(5)).unwrap();
    assert_eq!(mgmt.current_value(&owner, &Sensor::new("total")), Some(json!(7)));
}

#[test]
fn test_reducer_on_other_producer() {
    let (mgmt, owner) = setup();
    let producer = mgmt.create_entity(None).unwrap();

    let _reducer = Enrichers::builder()
        .reducing([Sensor::new("host"), Sensor::new("port")])
        .from(producer.clone())
        .publishing(Sensor::new("endpoint"))
        .parameter("format", json!("{}:{}"))
        .build()
        .attach(&owner, mgmt.clone(), &EnrichmentSettings::default())
        .map_err(|e| e.to_string())
        .unwrap();

    mgmt.set_attribute(&producer, &Sensor::new("host"), json!("db")).unwrap();
    assert_eq!(mgmt.current_value(&owner, &Sensor::new("endpoint")), Some(json!("db:")));

    mgmt.set_attribute(&producer, &Sensor::new("port"), json!(5432)).unwrap();
    assert_eq!(mgmt.current_value(&owner, &Sensor::new("endpoint")), Some(json!("db:5432")));
}

#[test]
fn test_custom_reduction() {
    let (mgmt, owner) = setup();

    let _reducer = Enrichers::builder()
        .reducing([Sensor::new("up"), Sensor::new("ready")])
        .publishing(Sensor::new("healthy"))
        .computing(|values: &[Value]| -> anyhow::Result<Option<Value>> {
            Ok(Some(json!(values.iter().all(|v| v == &json!(true)))))
        })
        .build()
        .attach(&owner, mgmt.clone(), &EnrichmentSettings::default())
        .map_err(|e| e.to_string())
        .unwrap();

    mgmt.set_attribute(&owner, &Sensor::new("up"), json!(true)).unwrap();
    assert_eq!(mgmt.current_value(&owner, &Sensor::new("healthy")), Some(json!(false)));
    mgmt.set_attribute(&owner, &Sensor::new("ready"), json!(true)).unwrap();
    assert_eq!(mgmt.current_value(&owner, &Sensor::new("healthy")), Some(json!(true)));
}

#[test]
fn test_duplicate_sources_collapse() {
    let (mgmt, owner) = setup();
    let s1 = Sensor::new("s1");

    let reducer = Reducer::attach(
        sum_config(vec![s1.clone().into(), s1.clone().into()]),
        &owner,
        mgmt.clone(),
        &EnrichmentSettings::default(),
    )
    .map_err(|e| e.to_string())
    .unwrap();

    assert_eq!(reducer.source_sensors(), &[s1.clone()]);
    mgmt.set_attribute(&owner, &s1, json!(4)).unwrap();
    assert_eq!(mgmt.current_value(&owner, &Sensor::new("total")), Some(json!(4)));
}

#[test]
fn test_expression_sources_resolve_at_attach() {
    let (mgmt, owner) = setup();
    mgmt.set_attribute(&owner, &Sensor::new("watched.sensor"), json!("s2")).unwrap();

    let reducer = Reducer::attach(
        sum_config(vec![
            Sensor::new("s1").into(),
            Expression::owner_attribute(Sensor::new("watched.sensor")).into(),
        ]),
        &owner,
        mgmt.clone(),
        &EnrichmentSettings::default(),
    )
    .map_err(|e| e.to_string())
    .unwrap();

    assert_eq!(reducer.source_sensors(), &[Sensor::new("s1"), Sensor::new("s2")]);
}

#[test]
fn test_unresolved_expression_source_fails() {
    let (mgmt, owner) = setup();
    let settings = EnrichmentSettings {
        sensor_resolve_timeout_ms: 10,
        ..Default::default()
    };

    let err = Reducer::attach(
        sum_config(vec![Expression::owner_attribute(Sensor::new("never.set")).into()]),
        &owner,
        mgmt.clone(),
        &settings,
    )
    .err()
    .unwrap();
    assert!(matches!(err.config(), Some(ConfigError::UnresolvedSourceSensor(_))));

    let err = Reducer::attach(
        sum_config(vec![Expression::Value(json!("Not A Sensor")).into()]),
        &owner,
        mgmt.clone(),
        &settings,
    )
    .err()
    .unwrap();
    assert!(matches!(err.config(), Some(ConfigError::UnresolvedSourceSensor(_))));
}

#[test]
fn test_configuration_errors() {
    let (mgmt, owner) = setup();
    let settings = EnrichmentSettings::default();

    let err = Reducer::attach(sum_config(vec![]), &owner, mgmt.clone(), &settings)
        .err()
        .unwrap();
    assert_eq!(err.config(), Some(&ConfigError::EmptySourceSensors));

    let mut unknown = sum_config(vec![Sensor::new("s1").into()]);
    unknown.function_name = Some("median".to_string());
    let err = Reducer::attach(unknown, &owner, mgmt.clone(), &settings)
        .err()
        .unwrap();
    assert_eq!(
        err.config(),
        Some(&ConfigError::UnknownTransformation("median".to_string()))
    );

    let mut both = sum_config(vec![Sensor::new("s1").into()]);
    both.function = Some(Arc::new(|_: &[Value]| -> anyhow::Result<Option<Value>> { Ok(None) }));
    let err = Reducer::attach(both, &owner, mgmt.clone(), &settings)
        .err()
        .unwrap();
    assert_eq!(
        err.config(),
        Some(&ConfigError::ConflictingTransformation("sum".to_string()))
    );
}

#[test]
fn test_failure_does_not_stop_later_events() {
    let (mgmt, owner) = setup();
    let s1 = Sensor::new("s1");
    let _reducer = Reducer::attach(
        sum_config(vec![s1.clone().into()]),
        &owner,
        mgmt.clone(),
        &EnrichmentSettings::default(),
    )
    .map_err(|e| e.to_string())
    .unwrap();

    let report = mgmt.set_attribute(&owner, &s1, json!({"not": "numeric"})).unwrap();
    assert_eq!(report.failures.len(), 1);

    mgmt.set_attribute(&owner, &s1, json!(9)).unwrap();
    assert_eq!(mgmt.current_value(&owner, &Sensor::new("total")), Some(json!(9)));
}
