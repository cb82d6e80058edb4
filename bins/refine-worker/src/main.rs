use chrono::Utc;
use refine_common::config::SolverConfig;
use refine_common::redis;
use refine_common::types::{JobResult, SolveJob};
use refine_engine::Solver;
use std::future::Future;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Refine worker booting...");

    let config = SolverConfig::load_default().map_err(|e| {
        error!("Failed to load solver configuration: {}", e);
        error!("Make sure config/solver.json exists or set REFINE_CONFIG");
        e
    })?;

    info!(
        models = ?config.model.models,
        language = %config.executor.runtime.language,
        sandbox = config.executor.sandbox,
        iterations = config.pipeline.num_iterations,
        "Loaded solver configuration"
    );

    // All fatal setup problems surface here, before any job is taken
    let solver = Arc::new(Solver::new(config).await?);

    let concurrency: usize = std::env::var("WORKER_CONCURRENCY")
        .ok()
        .and_then(|v| v.parse().ok())
        .filter(|&n| n > 0)
        .unwrap_or(1);

    let redis_url =
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    let client = ::redis::Client::open(redis_url.as_str())?;
    let redis_conn = ::redis::aio::ConnectionManager::new(client).await?;

    info!(queue = redis::QUEUE_KEY, concurrency, "Connected to Redis: {}", redis_url);

    worker_loop(redis_conn, solver, concurrency).await;

    info!("Worker shutdown complete");
    Ok(())
}

#[instrument(skip(redis_conn, solver))]
async fn worker_loop(
    mut redis_conn: ::redis::aio::ConnectionManager,
    solver: Arc<Solver>,
    concurrency: usize,
) {
    let slots = Arc::new(Semaphore::new(concurrency));
    let mut in_flight = JoinSet::new();

    let (stop_tx, mut stop) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
            // Dropping the sender would read as a shutdown
            std::future::pending::<()>().await;
        }
        warn!("Received shutdown signal, finishing running jobs...");
        let _ = stop_tx.send(true);
    });

    loop {
        // Waiting for a slot is safe to abandon, nothing has been taken yet
        let permit = tokio::select! {
            _ = stop.wait_for(|stopping| *stopping) => break,
            permit = Arc::clone(&slots).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        // BLPOP with 5 second timeout so shutdown is observed promptly
        let Some(popped) = next_job(&stop, redis::pop_job(&mut redis_conn, 5.0)).await else {
            break;
        };

        match popped {
            Ok(Some(job)) => {
                info!(
                    job_id = %job.id,
                    problem = %job.problem.name,
                    public_tests = job.problem.public_tests.len(),
                    "Received job"
                );
                let solver = Arc::clone(&solver);
                let conn = redis_conn.clone();
                in_flight.spawn(async move {
                    process_job(job, &solver, conn).await;
                    drop(permit);
                });
            }
            Ok(None) => continue,
            Err(e) => {
                error!(error = %e, "Redis error");
                tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
            }
        }

        while let Some(finished) = in_flight.try_join_next() {
            if let Err(e) = finished {
                error!(error = %e, "Job task panicked");
            }
        }
    }

    info!(in_flight = in_flight.len(), "Draining running jobs");
    while let Some(finished) = in_flight.join_next().await {
        if let Err(e) = finished {
            error!(error = %e, "Job task panicked");
        }
    }
}

/// Run `pop` to completion unless shutdown was already requested.
///
/// A pop that has started is never abandoned: once Redis answers, the job
/// has left the queue and must be processed.
async fn next_job<F: Future>(stop: &watch::Receiver<bool>, pop: F) -> Option<F::Output> {
    if *stop.borrow() {
        return None;
    }
    Some(pop.await)
}

#[instrument(skip_all, fields(job_id = %job.id))]
async fn process_job(
    job: SolveJob,
    solver: &Solver,
    mut redis_conn: ::redis::aio::ConnectionManager,
) {
    let start = std::time::Instant::now();
    let outcome = solver.solve(&job.problem).await;

    info!(
        solved = outcome.solved,
        iterations = outcome.iterations_used,
        attempts = outcome.generation_attempts,
        elapsed_ms = start.elapsed().as_millis(),
        "Solve completed"
    );
    for (stage, usage) in &outcome.stage_usage {
        debug!(stage = %stage, calls = usage.calls, fixes = usage.fixes, "Stage usage");
    }

    let result = JobResult {
        job_id: job.id,
        outcome,
        completed_at: Utc::now(),
    };
    match redis::store_result(&mut redis_conn, &result).await {
        Ok(()) => info!("Result persisted to Redis"),
        // Non-fatal, the worker keeps going
        Err(e) => error!(error = %e, "Failed to persist result"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_pop_keeps_the_job() {
        let (stop_tx, stop) = watch::channel(false);
        let pop = async {
            tokio::time::sleep(Duration::from_secs(3)).await;
            let _ = stop_tx.send(true);
            tokio::time::sleep(Duration::from_secs(1)).await;
            "job-1"
        };

        assert_eq!(next_job(&stop, pop).await, Some("job-1"));
        assert!(*stop.borrow());
    }

    #[tokio::test]
    async fn test_no_pop_after_shutdown() {
        let (stop_tx, stop) = watch::channel(false);
        stop_tx.send(true).unwrap();

        let mut polled = false;
        let result = next_job(&stop, async { polled = true }).await;

        assert!(result.is_none());
        assert!(!polled);
    }
}
