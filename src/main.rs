use anyhow::{anyhow, Result};
use enricher::config::{load_config, EnricherConfig, SimulationConfig};
use enricher::{Enricher, Enrichers, EntityId, LocalManagement, Management, Sensor};
use rand::Rng;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

const LOAD: Sensor = Sensor::from_static("cpu.load");
const LOAD_AVERAGE: Sensor = Sensor::from_static("cpu.load.average");
const LOAD_TOTAL: Sensor = Sensor::from_static("cpu.load.total");
const OVERLOADED: Sensor = Sensor::from_static("cpu.overloaded");
const SUMMARY: Sensor = Sensor::from_static("cpu.summary");

#[tokio::main]
async fn main() -> Result<()> {
    let config = match std::env::var("ENRICHER_CONFIG") {
        Ok(path) => load_config(&path)
            .map_err(|e| anyhow!("failed to load {}: {}", path, e))?
            .with_env_overrides(),
        Err(_) => EnricherConfig::from_env(),
    };

    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.filter.as_str().into()),
        )
        .init();

    info!("Enricher simulation starting...");

    let management = Arc::new(LocalManagement::new());
    let cluster = management.create_group(None)?;
    let mut members = Vec::with_capacity(config.simulation.members);
    for _ in 0..config.simulation.members {
        let member = management.create_entity(Some(&cluster))?;
        management.add_member(&cluster, &member)?;
        members.push(member);
    }

    let enrichers = attach_enrichers(&cluster, &management, &config)?;
    for enricher in &enrichers {
        info!(tag = %enricher.tag(), kind = %enricher.kind(), "Enricher ready");
    }

    run_simulation(&management, &cluster, &mut members, &config.simulation).await?;

    let metrics = management.metrics();
    info!(
        published = metrics.published,
        deliveries = metrics.deliveries,
        failures = metrics.failures,
        subscriptions = metrics.active_subscriptions,
        "Simulation finished"
    );

    for enricher in &enrichers {
        enricher.destroy();
    }
    Ok(())
}

fn attach_enrichers(
    cluster: &EntityId,
    management: &Arc<LocalManagement>,
    config: &EnricherConfig,
) -> Result<Vec<Arc<dyn Enricher>>> {
    let settings = &config.enrichment;
    let threshold = config.simulation.max_load * 0.75;

    let specs = vec![
        Enrichers::builder()
            .aggregating(LOAD)
            .publishing(LOAD_AVERAGE)
            .computing_average()
            .build(),
        Enrichers::builder()
            .aggregating(LOAD)
            .publishing(LOAD_TOTAL)
            .computing_sum()
            .value_to_report_if_no_sensors(json!(0))
            .build(),
        Enrichers::builder()
            .transforming(LOAD_AVERAGE)
            .publishing(OVERLOADED)
            .computing(move |value: &Value| -> Result<Option<Value>> {
                Ok(value.as_f64().map(|avg| json!(avg > threshold)))
            })
            .suppress_duplicates(true)
            .build(),
        Enrichers::builder()
            .reducing([LOAD_AVERAGE, LOAD_TOTAL, OVERLOADED])
            .publishing(SUMMARY)
            .function("joiner")
            .parameter("format", json!("avg={} total={} overloaded={}"))
            .build(),
    ];

    let mut attached = Vec::with_capacity(specs.len());
    for spec in specs {
        let management: Arc<dyn Management> = management.clone();
        attached.push(spec.attach(cluster, management, settings)?);
    }
    Ok(attached)
}

async fn run_simulation(
    management: &Arc<LocalManagement>,
    cluster: &EntityId,
    members: &mut Vec<EntityId>,
    simulation: &SimulationConfig,
) -> Result<()> {
    let mut ticker = interval(simulation.tick_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let midway = simulation.ticks / 2;
    for tick in 0..simulation.ticks {
        ticker.tick().await;

        if tick == midway {
            let joining = management.create_entity(Some(cluster))?;
            management.add_member(cluster, &joining)?;
            info!(member = %joining, "Member joined");
            members.push(joining);
        }
        if tick == midway + 1 && members.len() > 1 {
            let leaving = members.remove(0);
            management.remove_entity(&leaving);
            info!(member = %leaving, "Member left");
        }

        for member in members.iter() {
            let load = if simulation.max_load > 0.0 {
                rand::thread_rng().gen_range(0.0..simulation.max_load)
            } else {
                0.0
            };
            if let Err(e) = management.set_attribute(member, &LOAD, json!(load)) {
                warn!(member = %member, error = %e, "Failed to publish load");
            }
        }

        info!(
            tick = tick,
            average = %render(management.current_value(cluster, &LOAD_AVERAGE)),
            total = %render(management.current_value(cluster, &LOAD_TOTAL)),
            overloaded = %render(management.current_value(cluster, &OVERLOADED)),
            "Tick"
        );
        if let Some(summary) = management.current_value(cluster, &SUMMARY) {
            info!(summary = %summary, "Summary");
        }
    }
    Ok(())
}

fn render(value: Option<Value>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_missing_and_present_values() {
        assert_eq!(render(None), "-");
        assert_eq!(render(Some(json!(2.5))), "2.5");
        assert_eq!(render(Some(json!("busy"))), "\"busy\"");
    }
}
