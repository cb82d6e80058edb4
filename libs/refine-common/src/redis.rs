use crate::types::{JobResult, SolveJob};
use redis::{AsyncCommands, RedisResult};

/// Redis key layout shared by the CLI and the worker.
/// Keys are deterministic so both sides agree without coordination.

pub const QUEUE_KEY: &str = "refine:queue";
pub const RESULT_PREFIX: &str = "refine:result";
pub const SOLVED_PREFIX: &str = "refine:solved";

/// Results expire after 24 hours
pub const RESULT_TTL_SECONDS: u64 = 86400;

/// Generate result key for a job
pub fn result_key(job_id: &uuid::Uuid) -> String {
    format!("{}:{}", RESULT_PREFIX, job_id)
}

/// Generate solved-flag key for a job
pub fn solved_key(job_id: &uuid::Uuid) -> String {
    format!("{}:{}", SOLVED_PREFIX, job_id)
}

fn serialization_error(e: serde_json::Error) -> redis::RedisError {
    redis::RedisError::from((redis::ErrorKind::TypeError, "serialization error", e.to_string()))
}

/// Push a job onto the queue (RPUSH, FIFO with BLPOP)
pub async fn push_job(
    conn: &mut redis::aio::ConnectionManager,
    job: &SolveJob,
) -> RedisResult<()> {
    let payload = serde_json::to_string(job).map_err(serialization_error)?;
    conn.rpush(QUEUE_KEY, payload).await
}

/// Pop a job, blocking up to `timeout_seconds` so callers can observe shutdown
pub async fn pop_job(
    conn: &mut redis::aio::ConnectionManager,
    timeout_seconds: f64,
) -> RedisResult<Option<SolveJob>> {
    let result: Option<(String, String)> = conn.blpop(QUEUE_KEY, timeout_seconds).await?;

    match result {
        Some((_key, payload)) => {
            let job: SolveJob = serde_json::from_str(&payload).map_err(serialization_error)?;
            Ok(Some(job))
        }
        None => Ok(None),
    }
}

/// Store a finished job with TTL, plus the solved flag for quick lookup
pub async fn store_result(
    conn: &mut redis::aio::ConnectionManager,
    result: &JobResult,
) -> RedisResult<()> {
    let key = result_key(&result.job_id);
    let payload = serde_json::to_string(result).map_err(serialization_error)?;
    let _: () = conn.set_ex(&key, payload, RESULT_TTL_SECONDS).await?;

    let flag = if result.outcome.solved { "1" } else { "0" };
    let _: () = conn
        .set_ex(solved_key(&result.job_id), flag, RESULT_TTL_SECONDS)
        .await?;

    Ok(())
}

/// Retrieve a stored result
pub async fn get_result(
    conn: &mut redis::aio::ConnectionManager,
    job_id: &uuid::Uuid,
) -> RedisResult<Option<JobResult>> {
    let payload: Option<String> = conn.get(result_key(job_id)).await?;

    match payload {
        Some(data) => {
            let result: JobResult = serde_json::from_str(&data).map_err(serialization_error)?;
            Ok(Some(result))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_result_key_deterministic() {
        let id = Uuid::new_v4();
        let key1 = result_key(&id);
        let key2 = result_key(&id);
        assert_eq!(key1, key2);
        assert!(key1.starts_with("refine:result:"));
    }

    #[test]
    fn test_solved_key_format() {
        let id = Uuid::new_v4();
        let key = solved_key(&id);
        assert!(key.starts_with("refine:solved:"));
        assert!(key.contains(&id.to_string()));
    }
}
