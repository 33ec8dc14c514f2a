//! Start / end / error events around long-running operations.

use std::fmt::Display;
use std::future::Future;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Start,
    End,
    Error,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::End => "end",
            Self::Error => "error",
        }
    }
}

/// Run `operation`, emitting `<event>` start/end/error records around it.
pub async fn tracked<T, E, F>(event: &str, operation: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: Display,
{
    let started = Instant::now();
    tracing::info!(event, phase = Phase::Start.as_str(), "{} started", event);

    let result = operation.await;
    let elapsed_ms = started.elapsed().as_millis() as u64;
    match &result {
        Ok(_) => tracing::info!(
            event,
            phase = Phase::End.as_str(),
            elapsed_ms,
            "{} finished in {} ms",
            event,
            elapsed_ms
        ),
        Err(e) => tracing::error!(
            event,
            phase = Phase::Error.as_str(),
            elapsed_ms,
            "{} failed after {} ms: {}",
            event,
            elapsed_ms,
            e
        ),
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tracked_passes_value_through() {
        let v: Result<u32, String> = tracked("unit", async { Ok(7) }).await;
        assert_eq!(v, Ok(7));
    }

    #[tokio::test]
    async fn test_tracked_passes_error_through() {
        let v: Result<u32, String> = tracked("unit", async { Err("boom".to_string()) }).await;
        assert_eq!(v, Err("boom".to_string()));
    }
}
