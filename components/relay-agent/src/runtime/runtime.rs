// Local crates
use crate::buffer::buffer::EventBuffer;
use crate::checkpoint::store::CheckpointStore;
use crate::helpers::health::Health;
use crate::helpers::load_config::Config;
use crate::helpers::log_processing::{EventProcessor, LAT_HISTOGRAM};
use crate::helpers::shutdown::Shutdown;
use crate::helpers::supervision::supervised;
use crate::buffer::buffer::BufferError;
use crate::input::Input;
use crate::input::http::HttpInput;
use crate::input::syslog::SyslogInput;
use crate::metrics::http::start_metrics_server;
use crate::metrics::metrics::{
    BUFFER_EVENTS, CPU_PERCENT, EVENTS_DROPPED_TOTAL, EVENTS_PROCESSED_THIS_SECOND,
    LINES_INGESTED_TOTAL, MEMORY_BYTES, P99_JOB_LATENCY_MS, STARTUP_DURATION_SECONDS,
    THROUGHPUT_EVENTS_PER_SEC,
};
use crate::model::event::LogEvent;
use crate::pool::models::{JobFn, PoolError};
use crate::pool::pool::WorkerPool;
use crate::tailer::manager::FileTailer;
use crate::tailer::models::TailerConfig;

// External crates
use anyhow::Result;
use futures::FutureExt;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::System;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const MULTILINE_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Agent runtime: wire the pipeline together, run it until a shutdown
/// signal, then unwind it within the configured grace period.
pub async fn run(config: Config) -> Result<()> {
    let startup = Instant::now();
    let shutdown = Shutdown::new();
    shutdown.listen_for_signals();

    let health = Arc::new(Health::default());
    let mut background: Vec<JoinHandle<()>> = Vec::new();

    // Metrics exposition and gauge refreshers.
    if let Some(metrics) = config.metrics.clone() {
        let cancel = shutdown.subscribe();
        let metrics_health = Arc::clone(&health);
        background.push(tokio::spawn(async move {
            let component_cancel = cancel.clone();
            supervised("metrics", cancel, metrics_health, move || {
                let addr = metrics.addr.clone();
                let cancel = component_cancel.clone();
                async move { start_metrics_server(&addr, cancel).await }
            })
            .await;
        }));
    }
    background.push(spawn_throughput_refresher(shutdown.subscribe()));
    background.push(spawn_latency_refresher(shutdown.subscribe()));
    background.push(spawn_node_metrics_refresher(shutdown.subscribe()));

    // Shared pipeline stages.
    let processor = Arc::new(EventProcessor::from_config(&config.parser, &config.transforms)?);
    let buffer = Arc::new(EventBuffer::new(config.buffer.capacity, config.buffer.strategy));
    health.set("buffer", true);

    let pool = Arc::new(WorkerPool::new(config.pool.clone(), delivery_job()));
    pool.start().await;
    health.set("pool", true);

    // Consumer: drain the buffer into the worker pool.
    let consumer = spawn_consumer(Arc::clone(&buffer), Arc::clone(&pool));

    // Checkpoints and the file tailer.
    let mut tailer_state = match &config.tailer {
        Some(tailer_config) => Some(
            start_tailer(
                tailer_config.clone(),
                Arc::clone(&processor),
                Arc::clone(&buffer),
                &config,
                &shutdown,
                &health,
            )
            .await?,
        ),
        None => None,
    };

    // Periodic multiline expiry flush.
    {
        let processor = Arc::clone(&processor);
        let buffer = Arc::clone(&buffer);
        let cancel = shutdown.subscribe();
        background.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MULTILINE_FLUSH_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        for event in processor.flush_expired() {
                            if buffer.send(event).await.is_err() {
                                return;
                            }
                        }
                        BUFFER_EVENTS.set(buffer.len() as i64);
                    }
                }
            }
        }));
    }

    // Network inputs.
    let mut inputs: Vec<Arc<dyn Input>> = Vec::new();
    if let Some(syslog_config) = config.syslog.clone() {
        inputs.push(Arc::new(SyslogInput::new(
            syslog_config,
            Arc::clone(&buffer),
            Arc::clone(&processor),
            shutdown.subscribe(),
        )));
    }
    if let Some(http_config) = config.http.clone() {
        inputs.push(Arc::new(HttpInput::new(
            http_config,
            Arc::clone(&buffer),
            Arc::clone(&processor),
            Arc::clone(&health),
            shutdown.subscribe(),
        )));
    }
    for input in &inputs {
        input
            .start()
            .await
            .map_err(|e| e.context(format!("starting {} input", input.name())))?;
        health.set(input.name(), true);
    }

    STARTUP_DURATION_SECONDS.set(startup.elapsed().as_secs_f64());
    tracing::info!(
        startup_ms = startup.elapsed().as_millis() as u64,
        inputs = inputs.len(),
        "Agent started"
    );

    // Run until told otherwise.
    shutdown.wait().await;
    tracing::info!("Shutdown triggered, unwinding pipeline");

    let grace = Duration::from_secs(config.general.grace_period_secs);
    let unwind = async {
        // Stop producing: inputs first, then the tailer (which flushes its
        // positions), then pending multiline records, then close the buffer
        // so the consumer drains and the pool finishes the tail.
        for input in &inputs {
            input.stop().await;
        }
        if let Some((mut tailer, pump)) = tailer_state.take() {
            tailer.stop().await;
            let _ = pump.await;
        }
        for event in processor.flush_all() {
            let _ = buffer.send(event).await;
        }
        buffer.close();
        let _ = consumer.await;
        pool.stop().await;
    };
    if tokio::time::timeout(grace, unwind).await.is_err() {
        tracing::error!(
            grace_secs = grace.as_secs(),
            "Graceful shutdown overran its grace period, aborting remaining tasks"
        );
    }

    for task in background {
        task.abort();
    }

    let metrics = pool.metrics().await;
    tracing::info!(
        jobs_processed = metrics.jobs_processed,
        dropped = buffer.dropped(),
        sampled_out = buffer.sampled_out(),
        "Agent stopped"
    );
    Ok(())
}

/// The delivery job handed to the worker pool: serialize the event as one
/// JSON line on stdout. Real deployments swap this for a sink client; the
/// pool treats it as opaque either way.
fn delivery_job() -> JobFn {
    Arc::new(|_ctx, event: LogEvent| {
        async move {
            let started = Instant::now();
            let line = event.to_json().to_string();
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(line.as_bytes())?;
            stdout.write_all(b"\n")?;
            drop(stdout);

            if let Ok(mut histogram) = LAT_HISTOGRAM.lock() {
                let _ = histogram.record(started.elapsed().as_micros() as u64);
            }
            EVENTS_PROCESSED_THIS_SECOND.inc();
            Ok(())
        }
        .boxed()
    })
}

async fn start_tailer(
    tailer_config: TailerConfig,
    processor: Arc<EventProcessor>,
    buffer: Arc<EventBuffer>,
    config: &Config,
    shutdown: &Shutdown,
    health: &Arc<Health>,
) -> Result<(FileTailer, JoinHandle<()>)> {
    let checkpoint = Arc::new(CheckpointStore::new(
        &tailer_config.checkpoint_dir,
        Duration::from_secs(tailer_config.checkpoint_interval_secs),
    ));
    checkpoint.load().await?;
    checkpoint.start().await;

    let mut tailer = FileTailer::new(tailer_config, Arc::clone(&checkpoint), shutdown.subscribe());
    tailer.start().await?;
    health.set("tailer", true);

    let mut events = tailer
        .events()
        .ok_or_else(|| anyhow::anyhow!("tailer event stream already taken"))?;

    // Pump raw tailed lines through parsing and into the buffer.
    let send_deadline = config.buffer.send_timeout_ms.map(Duration::from_millis);
    let pump = tokio::spawn(async move {
        while let Some(raw) = events.recv().await {
            LINES_INGESTED_TOTAL.inc();
            for event in processor.process_line(&raw.source, &raw.message) {
                match buffer.send_with_deadline(event, send_deadline).await {
                    Ok(()) => {}
                    Err(BufferError::Timeout) => {
                        EVENTS_DROPPED_TOTAL.inc();
                    }
                    Err(BufferError::Closed) => return,
                }
            }
        }
        // Tailer stopped; flush positions one last time.
        checkpoint.stop().await;
    });

    Ok((tailer, pump))
}

fn spawn_consumer(buffer: Arc<EventBuffer>, pool: Arc<WorkerPool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = buffer.recv().await {
            match pool.submit_async(event) {
                Ok(()) => {}
                Err(PoolError::QueueFull) => {
                    // Backpressure at the pool edge is counted, not fatal.
                    EVENTS_DROPPED_TOTAL.inc();
                }
                Err(e) => {
                    tracing::error!(error = %e, "Job submission failed, stopping consumer");
                    break;
                }
            }
        }
        tracing::debug!("Buffer drained, consumer exiting");
    })
}

fn spawn_throughput_refresher(cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs(1)) => {
                    THROUGHPUT_EVENTS_PER_SEC.set(EVENTS_PROCESSED_THIS_SECOND.get());
                    EVENTS_PROCESSED_THIS_SECOND.set(0);
                }
            }
        }
    })
}

fn spawn_latency_refresher(cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs(1)) => {
                    if let Ok(mut histogram) = LAT_HISTOGRAM.lock() {
                        if histogram.len() > 0 {
                            let p99_ms = histogram.value_at_quantile(0.99) as f64 / 1000.0;
                            P99_JOB_LATENCY_MS.set(p99_ms);
                            histogram.reset();
                        }
                    }
                }
            }
        }
    })
}

fn spawn_node_metrics_refresher(cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut sys = System::new_all();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs(5)) => {
                    sys.refresh_all();
                    MEMORY_BYTES.set(sys.used_memory() as f64);
                    let cpus = sys.cpus();
                    if !cpus.is_empty() {
                        let avg = cpus.iter().map(|cpu| cpu.cpu_usage() as f64).sum::<f64>()
                            / cpus.len() as f64;
                        CPU_PERCENT.set(avg);
                    }
                }
            }
        }
    })
}
