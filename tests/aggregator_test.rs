use enricher::config::EnrichmentSettings;
use enricher::enricher::{Aggregator, AggregatorConfig, ProducerSelection, ValueFilter};
use enricher::management::{Expression, Listener, ResolveContext, SubscriptionHandle};
use enricher::{EntityId, LocalManagement, Management, Sensor};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn load() -> Sensor {
    Sensor::new("load")
}

fn config(transformation: &str) -> AggregatorConfig {
    AggregatorConfig {
        source_sensor: Some(load()),
        target_sensor: Some(Sensor::new("load.aggregate")),
        transformation_name: Some(transformation.to_string()),
        ..Default::default()
    }
}

fn attach(mgmt: &Arc<LocalManagement>, owner: &EntityId, config: AggregatorConfig) -> Arc<Aggregator> {
    Aggregator::attach(config, owner, mgmt.clone(), &EnrichmentSettings::default())
        .map_err(|e| e.to_string())
        .unwrap()
}

fn group_with_members(mgmt: &LocalManagement, n: usize) -> (EntityId, Vec<EntityId>) {
    let group = mgmt.create_group(None).unwrap();
    let members = (0..n)
        .map(|_| {
            let member = mgmt.create_entity(None).unwrap();
            mgmt.add_member(&group, &member).unwrap();
            member
        })
        .collect();
    (group, members)
}

fn sorted_numbers(value: Option<Value>) -> Vec<i64> {
    let mut numbers: Vec<i64> = value
        .and_then(|v| v.as_array().cloned())
        .unwrap_or_default()
        .iter()
        .filter_map(Value::as_i64)
        .collect();
    numbers.sort();
    numbers
}

#[test]
fn test_list_aggregation_uses_default_for_unreported() {
    let mgmt = Arc::new(LocalManagement::new());
    let (group, members) = group_with_members(&mgmt, 3);
    mgmt.set_attribute(&members[0], &load(), json!(2)).unwrap();
    mgmt.set_attribute(&members[1], &load(), json!(3)).unwrap();

    let mut config = config("list");
    config.default_member_value = Some(json!(0));
    let aggregator = attach(&mgmt, &group, config);

    let computed = aggregator.compute().unwrap();
    assert_eq!(sorted_numbers(computed), vec![0, 2, 3]);

    let published = mgmt.current_value(&group, &Sensor::new("load.aggregate"));
    assert_eq!(sorted_numbers(published), vec![0, 2, 3]);
}

#[test]
fn test_exclude_blank_filter() {
    let mgmt = Arc::new(LocalManagement::new());
    let (group, members) = group_with_members(&mgmt, 2);
    let label = Sensor::new("label");

    let aggregator = attach(
        &mgmt,
        &group,
        AggregatorConfig {
            source_sensor: Some(label.clone()),
            target_sensor: Some(Sensor::new("labels")),
            value_filter: ValueFilter::ExcludeBlank,
            transformation_name: Some("list".to_string()),
            ..Default::default()
        },
    );

    mgmt.set_attribute(&members[0], &label, json!("")).unwrap();
    mgmt.set_attribute(&members[1], &label, json!("x")).unwrap();

    assert_eq!(aggregator.compute().unwrap(), Some(json!(["x"])));
    assert_eq!(mgmt.current_value(&group, &Sensor::new("labels")), Some(json!(["x"])));
}

#[test]
fn test_removal_triggers_recompute() {
    let mgmt = Arc::new(LocalManagement::new());
    let (group, members) = group_with_members(&mgmt, 2);
    mgmt.set_attribute(&members[0], &load(), json!(2)).unwrap();
    mgmt.set_attribute(&members[1], &load(), json!(3)).unwrap();

    let aggregator = attach(&mgmt, &group, config("sum"));
    assert_eq!(aggregator.compute().unwrap(), Some(json!(5)));

    mgmt.remove_member(&group, &members[1]).unwrap();

    assert_eq!(aggregator.compute().unwrap(), Some(json!(2)));
    assert_eq!(mgmt.current_value(&group, &Sensor::new("load.aggregate")), Some(json!(2)));
    assert_eq!(aggregator.tracked_producers(), vec![members[0].clone()]);

    // Events from the removed member are no longer delivered
    mgmt.set_attribute(&members[1], &load(), json!(100)).unwrap();
    assert_eq!(aggregator.compute().unwrap(), Some(json!(2)));
}

#[test]
fn test_member_added_later_is_seeded_from_current_value() {
    let mgmt = Arc::new(LocalManagement::new());
    let (group, members) = group_with_members(&mgmt, 1);
    mgmt.set_attribute(&members[0], &load(), json!(1)).unwrap();
    let aggregator = attach(&mgmt, &group, config("sum"));

    let late = mgmt.create_entity(None).unwrap();
    mgmt.set_attribute(&late, &load(), json!(10)).unwrap();
    mgmt.add_member(&group, &late).unwrap();

    assert_eq!(aggregator.compute().unwrap(), Some(json!(11)));
    assert_eq!(mgmt.current_value(&group, &Sensor::new("load.aggregate")), Some(json!(11)));
}

#[test]
fn test_duplicate_hardcoded_producer_is_tracked_once() {
    let mgmt = Arc::new(LocalManagement::new());
    let owner = mgmt.create_entity(None).unwrap();
    let producer = mgmt.create_entity(None).unwrap();
    mgmt.set_attribute(&producer, &load(), json!(2)).unwrap();

    let mut config = config("list");
    config.producers = ProducerSelection {
        hardcoded: Some(vec![producer.clone(), producer.clone()]),
        ..Default::default()
    };
    let aggregator = attach(&mgmt, &owner, config);

    assert_eq!(aggregator.tracked_producers(), vec![producer]);
    assert_eq!(aggregator.compute().unwrap(), Some(json!([2])));
}

#[test]
fn test_sum_and_average_differ() {
    let mgmt = Arc::new(LocalManagement::new());
    let (group, members) = group_with_members(&mgmt, 2);
    mgmt.set_attribute(&members[0], &load(), json!(4)).unwrap();
    mgmt.set_attribute(&members[1], &load(), json!(6)).unwrap();

    let sum = attach(&mgmt, &group, config("sum"));
    let mut average_config = config("average");
    average_config.target_sensor = Some(Sensor::new("load.average"));
    let average = attach(&mgmt, &group, average_config);

    assert_eq!(sum.compute().unwrap(), Some(json!(10)));
    assert_eq!(average.compute().unwrap(), Some(json!(5.0)));
}

#[test]
fn test_value_to_report_if_no_sensors() {
    let mgmt = Arc::new(LocalManagement::new());
    let (group, members) = group_with_members(&mgmt, 1);
    mgmt.set_attribute(&members[0], &load(), json!(7)).unwrap();

    let mut config = config("sum");
    config.value_to_report_if_no_sensors = Some(json!(0));
    let aggregator = attach(&mgmt, &group, config);
    assert_eq!(aggregator.compute().unwrap(), Some(json!(7)));

    mgmt.remove_member(&group, &members[0]).unwrap();
    assert_eq!(mgmt.current_value(&group, &Sensor::new("load.aggregate")), Some(json!(0)));
}

#[test]
fn test_computation_failure_does_not_stop_later_events() {
    let mgmt = Arc::new(LocalManagement::new());
    let (group, members) = group_with_members(&mgmt, 1);
    let aggregator = attach(&mgmt, &group, config("sum"));

    let report = mgmt.set_attribute(&members[0], &load(), json!("not a number")).unwrap();
    assert_eq!(report.failures.len(), 1);
    assert!(aggregator.compute().is_err());

    let report = mgmt.set_attribute(&members[0], &load(), json!(3)).unwrap();
    assert!(report.is_clean());
    assert_eq!(mgmt.current_value(&group, &Sensor::new("load.aggregate")), Some(json!(3)));
}

#[test]
fn test_children_of_explicit_producer() {
    let mgmt = Arc::new(LocalManagement::new());
    let owner = mgmt.create_entity(None).unwrap();
    let cluster = mgmt.create_entity(None).unwrap();
    let child = mgmt.create_entity(Some(&cluster)).unwrap();
    mgmt.set_attribute(&child, &load(), json!(4)).unwrap();

    let mut config = config("sum");
    config.producers = ProducerSelection {
        producer: Some(cluster.clone()),
        from_children: Some(true),
        ..Default::default()
    };
    let _aggregator = attach(&mgmt, &owner, config);

    assert_eq!(mgmt.current_value(&owner, &Sensor::new("load.aggregate")), Some(json!(4)));
    assert_eq!(mgmt.current_value(&cluster, &Sensor::new("load.aggregate")), None);
}

#[test]
fn test_consistency_under_concurrent_updates_and_membership_changes() {
    let mgmt = Arc::new(LocalManagement::new());
    let group = mgmt.create_group(None).unwrap();
    let aggregator = attach(&mgmt, &group, config("sum"));

    let handles: Vec<_> = (0..4)
        .map(|worker| {
            let mgmt = Arc::clone(&mgmt);
            let group = group.clone();
            thread::spawn(move || {
                let members: Vec<EntityId> = (0..3).map(|_| mgmt.create_entity(None).unwrap()).collect();
                for round in 0..50i64 {
                    for (i, member) in members.iter().enumerate() {
                        match (round + i as i64) % 5 {
                            0 => {
                                mgmt.add_member(&group, member).unwrap();
                            }
                            3 => {
                                mgmt.remove_member(&group, member).unwrap();
                            }
                            _ => {}
                        }
                        mgmt.set_attribute(member, &load(), json!(worker * 1000 + round)).unwrap();
                    }
                }
                members
            })
        })
        .collect();

    let mut all_members = Vec::new();
    for handle in handles {
        all_members.extend(handle.join().unwrap());
    }

    let current: HashSet<EntityId> = mgmt.members(&group).into_iter().collect();
    let tracked: HashSet<EntityId> = aggregator.tracked_producers().into_iter().collect();
    assert_eq!(tracked, current);

    let expected: i64 = current
        .iter()
        .map(|m| mgmt.current_value(m, &load()).and_then(|v| v.as_i64()).unwrap_or(0))
        .sum();
    let computed = aggregator.compute().unwrap().and_then(|v| v.as_i64()).unwrap_or(0);
    assert_eq!(computed, expected);
    assert_eq!(all_members.len(), 12);
}

/// Removes `member` from `group` right after the first subscription to its load
/// is made, as a removal delivered on another thread would
struct RemoveWhileSubscribing {
    inner: Arc<LocalManagement>,
    group: EntityId,
    member: EntityId,
    fired: AtomicBool,
}

impl Management for RemoveWhileSubscribing {
    fn subscribe(&self, producer: &EntityId, sensor: &Sensor, listener: Listener) -> SubscriptionHandle {
        let handle = self.inner.subscribe(producer, sensor, listener);
        if producer == &self.member && sensor == &load() && !self.fired.swap(true, Ordering::SeqCst) {
            self.inner.remove_member(&self.group, &self.member).unwrap();
        }
        handle
    }

    fn subscribe_to_children(&self, parent: &EntityId, sensor: &Sensor, listener: Listener) -> SubscriptionHandle {
        self.inner.subscribe_to_children(parent, sensor, listener)
    }

    fn subscribe_to_all(&self, producer: &EntityId, listener: Listener) -> SubscriptionHandle {
        self.inner.subscribe_to_all(producer, listener)
    }

    fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        self.inner.unsubscribe(handle)
    }

    fn current_value(&self, entity: &EntityId, sensor: &Sensor) -> Option<Value> {
        self.inner.current_value(entity, sensor)
    }

    fn current_values(&self, entity: &EntityId) -> Vec<(Sensor, Value)> {
        self.inner.current_values(entity)
    }

    fn emit(&self, owner: &EntityId, sensor: &Sensor, value: Value) -> anyhow::Result<()> {
        self.inner.emit(owner, sensor, value)
    }

    fn modify(
        &self,
        owner: &EntityId,
        sensor: &Sensor,
        update: &mut dyn FnMut(Option<&Value>) -> anyhow::Result<Option<Value>>,
    ) -> anyhow::Result<bool> {
        self.inner.modify(owner, sensor, update)
    }

    fn resolve_with_timeout(
        &self,
        expression: &Expression,
        context: &ResolveContext,
        timeout: Duration,
    ) -> Option<Value> {
        self.inner.resolve_with_timeout(expression, context, timeout)
    }

    fn is_group(&self, entity: &EntityId) -> bool {
        self.inner.is_group(entity)
    }

    fn members(&self, group: &EntityId) -> Vec<EntityId> {
        self.inner.members(group)
    }

    fn children(&self, parent: &EntityId) -> Vec<EntityId> {
        self.inner.children(parent)
    }
}

#[test]
fn test_member_removed_while_subscribing_is_not_tracked() {
    let mgmt = Arc::new(LocalManagement::new());
    let (group, members) = group_with_members(&mgmt, 1);
    let member = members[0].clone();
    mgmt.set_attribute(&member, &load(), json!(7)).unwrap();

    let interleaving = Arc::new(RemoveWhileSubscribing {
        inner: mgmt.clone(),
        group: group.clone(),
        member: member.clone(),
        fired: AtomicBool::new(false),
    });
    let mut config = config("sum");
    config.value_to_report_if_no_sensors = Some(json!(0));
    let aggregator = Aggregator::attach(config, &group, interleaving, &EnrichmentSettings::default())
        .map_err(|e| e.to_string())
        .unwrap();

    assert!(mgmt.members(&group).is_empty());
    assert!(aggregator.tracked_producers().is_empty());
    // Only the two membership subscriptions on the group remain
    assert_eq!(mgmt.subscription_count(), 2);
    assert_eq!(aggregator.compute().unwrap(), Some(json!(0)));

    mgmt.set_attribute(&member, &load(), json!(9)).unwrap();
    assert_eq!(aggregator.compute().unwrap(), Some(json!(0)));
    assert_eq!(mgmt.current_value(&group, &Sensor::new("load.aggregate")), Some(json!(0)));
}
