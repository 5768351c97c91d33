// packages/engine/src/main.rs
//! Replica Engine
//!
//! Loads an instance pool, obtains a replicated model (from a package when
//! one is configured, otherwise built in place) and fans concurrent calls
//! out across the instances.

use anyhow::{Context, Result};
use replica_engine::interpreter::{Library, LocalRuntime, ModuleDef, Value};
use replica_engine::observability::{init_metrics, init_tracing};
use replica_engine::utils::config::EngineConfig;
use replica_engine::{HostValue, InstancePool, ReplicatedObj};
use tracing::{error, info};

/// Native definitions available inside every instance
fn demo_library() -> Library {
    Library::new()
        .with_module(ModuleDef::new("demo").function("scaler", |_, args| {
            Ok(Value::Object {
                class: "demo.Scaler".to_string(),
                state: Box::new(Value::Int(args.int(0)?)),
            })
        }))
        .with_module(ModuleDef::new("demo.Scaler").function("__call__", |scope, args| {
            let factor = args.receiver_state()?.as_int().unwrap_or(1);
            let x = args.int(0)?;
            // results carry the instance that computed them
            Ok(Value::List(vec![
                Value::Int(factor * x),
                Value::Int(scope.ordinal() as i64),
            ]))
        }))
}

/// Replicated model from the configured package, or a scaler built in place
fn load_model(pool: &InstancePool, config: &EngineConfig) -> Result<ReplicatedObj> {
    if let Some(uri) = &config.demo.package {
        let package = pool
            .load_package(uri)
            .with_context(|| format!("loading package {uri}"))?;
        let model = package
            .load_pickle(&config.demo.module, &config.demo.file)
            .with_context(|| format!("loading {}/{}", config.demo.module, config.demo.file))?;
        return Ok(model);
    }

    let mut session = pool.acquire_one()?;
    let make = session.global("demo", "scaler")?;
    let factor = session.from_ivalue(HostValue::Int(3))?;
    let scaler = session.call(make, &[factor])?;
    Ok(session.create_movable(scaler)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = EngineConfig::load()?;

    // Initialize observability (tracing, metrics)
    init_tracing(&config.logging)?;
    init_metrics(&config.metrics)?;

    info!("Starting Replica Engine v{}", replica_engine::VERSION);
    info!("Configuration loaded: {:?}", config);

    let loader = LocalRuntime::new(demo_library());
    let pool = InstancePool::with_config(config.pool.clone(), &loader)?;
    let model = load_model(&pool, &config)?;
    info!("Model ready as replicated object {}", model.object_id());

    let mut handles = Vec::with_capacity(config.demo.calls);
    for i in 0..config.demo.calls {
        let model = model.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            model.call(vec![HostValue::Int(i as i64)])
        }));
    }

    let mut failures = 0;
    for (i, handle) in handles.into_iter().enumerate() {
        match handle.await? {
            Ok(output) => info!("Call {} -> {:?}", i, output),
            Err(e) => {
                failures += 1;
                error!("Call {} failed: {}", i, e);
            }
        }
    }

    let stats = pool.stats();
    info!(
        "Pool stats: {} instances, active limit {}, usage {:?}",
        stats.total_instances, stats.active_limit, stats.usage
    );

    if failures > 0 {
        anyhow::bail!("{failures} of {} calls failed", config.demo.calls);
    }
    Ok(())
}
