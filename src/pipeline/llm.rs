//! One generation call per chunk, with a deadline and retries.
//!
//! Transient failures (HTTP 429/5xx, network errors, deadline hits) are
//! retried with exponential backoff (`retry_backoff_ms * 2^(attempt-1)`).
//! With 500 ms base and 2 retries the wait sequence is 500 ms → 1 s.
//! Content-filter blocks and other API rejections are not retried: the same
//! prompt would be rejected again.
//!
//! A chunk failure is returned as a [`ChunkError`] value; the caller records
//! it and carries on with the remaining chunks.

use crate::config::PipelineConfig;
use crate::error::{ChunkError, GenerateError};
use crate::provider::{Generation, TextGenerator};
use std::time::Instant;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, warn};

/// Generate the reply for chunk `chunk` (1-based).
pub async fn generate_chunk(
    generator: &dyn TextGenerator,
    chunk: usize,
    prompt: &str,
    config: &PipelineConfig,
) -> Result<Generation, ChunkError> {
    let start = Instant::now();
    let deadline = Duration::from_secs(config.api_timeout_secs);
    let mut last_err: Option<GenerateError> = None;
    let mut attempts = 0u32;

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            let backoff = config.retry_backoff_ms * 2u64.pow(attempt - 1);
            warn!(
                "Chunk {}: retry {}/{} after {}ms",
                chunk, attempt, config.max_retries, backoff
            );
            sleep(Duration::from_millis(backoff)).await;
        }
        attempts += 1;

        let outcome = match timeout(deadline, generator.generate(prompt, &config.generation)).await
        {
            Ok(result) => result,
            Err(_) => Err(GenerateError::Timeout {
                secs: config.api_timeout_secs,
            }),
        };

        match outcome {
            Ok(generation) => {
                debug!(
                    "Chunk {}: {:?} input tokens, {:?} output tokens, {:?}",
                    chunk,
                    generation.input_tokens,
                    generation.output_tokens,
                    start.elapsed()
                );
                return Ok(generation);
            }
            Err(e) => {
                warn!("Chunk {}: attempt {} failed: {}", chunk, attempt + 1, e);
                let retry = e.is_retryable();
                last_err = Some(e);
                if !retry {
                    break;
                }
            }
        }
    }

    Err(match last_err {
        Some(GenerateError::ContentFiltered { detail, .. }) => {
            ChunkError::ContentFiltered { chunk, detail }
        }
        Some(GenerateError::Timeout { secs }) => ChunkError::Timeout { chunk, secs },
        Some(other) => ChunkError::GenerationFailed {
            chunk,
            attempts,
            detail: other.to_string(),
        },
        None => ChunkError::GenerationFailed {
            chunk,
            attempts,
            detail: "Unknown error".to_string(),
        },
    })
}
