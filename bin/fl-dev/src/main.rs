//! FaultLine Development Monolith
//!
//! All-in-one binary for local experimentation: wires the in-memory broker
//! and drives each resilience engine through a short failure-and-recovery
//! scenario. The HTTP layer that normally fronts these engines is out of
//! scope; this binary is the calling surface.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `FL_SCENARIO` | `all` | Scenario: `breaker`, `dlq`, `outbox`, `backpressure`, `saga`, `all` |
//! | `RUST_LOG` | `info` | Log level |

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use fl_backpressure::{BackpressureController, DropPolicy, FlowConfig, OverflowStrategy};
use fl_breaker::{BreakerConfig, CircuitBreaker};
use fl_dlq::{FailureMode, PipelineConfig, RetryPipeline};
use fl_outbox::{CreateOrder, InMemoryOutboxStore, OutboxService};
use fl_saga::{SagaOptions, SagaOrchestrator};
use fl_transport::InMemoryBroker;

/// FaultLine Development Server
#[derive(Parser, Debug)]
#[command(name = "fl-dev")]
#[command(about = "FaultLine Development Monolith - drive the resilience engines locally")]
struct Args {
    /// Scenario to run: breaker, dlq, outbox, backpressure, saga, all
    #[arg(long, env = "FL_SCENARIO", default_value = "all")]
    scenario: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args = Args::parse();
    info!("Starting FaultLine Dev Monolith");

    match args.scenario.as_str() {
        "breaker" => run_breaker_scenario().await?,
        "dlq" => run_dlq_scenario().await?,
        "outbox" => run_outbox_scenario().await?,
        "backpressure" => run_backpressure_scenario().await?,
        "saga" => run_saga_scenario().await?,
        "all" => {
            run_breaker_scenario().await?;
            run_dlq_scenario().await?;
            run_outbox_scenario().await?;
            run_backpressure_scenario().await?;
            run_saga_scenario().await?;
        }
        other => {
            return Err(anyhow::anyhow!(
                "Unknown scenario: {}. Use breaker, dlq, outbox, backpressure, saga, or all",
                other
            ));
        }
    }

    info!("FaultLine Dev Monolith finished");
    Ok(())
}

/// Trip the breaker with a failure burst, watch it reject, then recover
/// through a half-open trial.
async fn run_breaker_scenario() -> Result<()> {
    info!("--- circuit breaker scenario ---");
    let breaker = CircuitBreaker::new(BreakerConfig {
        failure_threshold: 3,
        window_ms: 10_000,
        timeout_ms: 2_000,
        service_latency_ms: 50,
        fallback_enabled: false,
    })?;

    breaker.set_service_down(true);
    for _ in 0..3 {
        breaker.call("list-projects").await;
    }
    let rejected = breaker.call("list-projects").await;
    info!(outcome = ?rejected.outcome, "Call against a tripped circuit");

    info!("Waiting out the open-state cooldown...");
    tokio::time::sleep(Duration::from_millis(2_100)).await;
    breaker.set_service_down(false);
    let trial = breaker.call("list-projects").await;
    info!(outcome = ?trial.outcome, "Recovery trial");

    println!("{}", serde_json::to_string_pretty(&breaker.status())?);
    Ok(())
}

/// Push one always-failing message through the retry chain until it parks.
async fn run_dlq_scenario() -> Result<()> {
    info!("--- retry / dead-letter scenario ---");
    let broker = InMemoryBroker::new();
    let pipeline = RetryPipeline::new(Arc::new(broker.clone()));
    pipeline
        .start_consuming(PipelineConfig {
            failure_mode: FailureMode::Always,
            max_retries: 2,
            processing_delay_ms: 50,
            retry_base_delay_ms: 300,
        })
        .await?;

    pipeline
        .send_message(serde_json::json!({ "job": "send-invoice" }))
        .await?;

    while pipeline.stats().dead_lettered == 0 {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    pipeline.stop_consuming().await;

    println!("{}", serde_json::to_string_pretty(&pipeline.stats())?);
    println!("{}", serde_json::to_string_pretty(&pipeline.messages())?);
    broker.close();
    Ok(())
}

/// Accumulate outbox entries through an outage, then watch the backlog
/// flush in creation order.
async fn run_outbox_scenario() -> Result<()> {
    info!("--- transactional outbox scenario ---");
    let broker = InMemoryBroker::new();
    let service = OutboxService::new(
        Arc::new(InMemoryOutboxStore::new()),
        Arc::new(broker.clone()),
        Arc::new(broker.clone()),
        Duration::from_millis(300),
    );

    service.set_broker_down(true);
    service.start_relay();
    service.create_order_batch(5, CreateOrder::default()).await?;

    tokio::time::sleep(Duration::from_millis(700)).await;
    let stats = service.relay_stats().await;
    info!(pending = stats.pending, failed_attempts = stats.failed_attempts, "Backlog while down");

    service.set_broker_down(false);
    while service.relay_stats().await.pending > 0 {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    service.stop_relay();

    println!("{}", serde_json::to_string_pretty(&service.relay_stats().await)?);
    broker.close();
    Ok(())
}

/// Overdrive the producer against a small buffer and report drop/wait
/// statistics.
async fn run_backpressure_scenario() -> Result<()> {
    info!("--- backpressure scenario ---");
    let controller = BackpressureController::new();
    controller.start(FlowConfig {
        producer_rate_per_sec: 50,
        consumer_rate_per_sec: 10,
        max_queue_depth: 5,
        strategy: OverflowStrategy::Drop {
            policy: DropPolicy::Oldest,
        },
        prefetch_count: 2,
    })?;

    tokio::time::sleep(Duration::from_secs(2)).await;
    controller.stop();

    println!("{}", serde_json::to_string_pretty(&controller.stats())?);
    Ok(())
}

/// One clean run, then a forced failure at the payment step.
async fn run_saga_scenario() -> Result<()> {
    info!("--- saga scenario ---");
    let orchestrator = SagaOrchestrator::new();
    let options = SagaOptions {
        fail_at_step: None,
        step_delay_ms: 50,
        compensation_delay_ms: 25,
    };

    let ok = orchestrator
        .run_order_saga(serde_json::json!({ "orderId": "o-100" }), options.clone())
        .await;
    info!(saga_id = %ok.saga_id, outcome = ?ok.outcome, "Clean run");

    let unwound = orchestrator
        .run_order_saga(
            serde_json::json!({ "orderId": "o-101" }),
            SagaOptions {
                fail_at_step: Some(1),
                ..options
            },
        )
        .await;
    info!(
        saga_id = %unwound.saga_id,
        outcome = ?unwound.outcome,
        compensations = ?unwound.compensations_run,
        "Unwound run"
    );

    println!("{}", serde_json::to_string_pretty(&orchestrator.saga_logs())?);
    Ok(())
}
