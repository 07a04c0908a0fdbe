use std::future::Future;
use tokio::time::{sleep, timeout, Duration};

use crate::utils::error::compact_error_message;

const RPC_ERR_MAX_LEN: usize = 260;
const BACKOFF_BASE_MS: u64 = 100;
const BACKOFF_CAP_MS: u64 = 1_800;
const RATE_LIMIT_CAP_MS: u64 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: usize,
    pub timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            timeout_ms: 5_000,
        }
    }
}

/// Why a retried operation gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryFailure {
    /// The node answered with a deterministic error (revert, unknown method, bad params).
    Rejected(String),
    /// Every attempt failed with a transient error or timed out.
    Exhausted(String),
}

pub fn is_retryable_rpc_error(message: &str) -> bool {
    let msg = message.to_ascii_lowercase();
    let non_retryable = [
        "method not found",
        "-32601",
        "invalid params",
        "-32602",
        "execution reverted",
        "revert",
        "invalid opcode",
        "parse error",
        "-32700",
    ];
    !non_retryable.iter().any(|needle| msg.contains(needle))
}

pub fn is_rate_limited_rpc_error(message: &str) -> bool {
    let msg = message.to_ascii_lowercase();
    msg.contains("429")
        || msg.contains("rate limit")
        || msg.contains("too many requests")
        || msg.contains("compute units per second")
}

pub fn bounded_exponential_backoff_ms(base_ms: u64, streak: u32, cap_ms: u64) -> u64 {
    if base_ms == 0 {
        return 0;
    }
    base_ms
        .saturating_mul(1u64 << streak.min(8))
        .min(cap_ms.max(base_ms))
}

/// Extract a `Retry-After` hint from a provider error. Seconds unless `ms` follows.
pub fn parse_retry_after_ms(message: &str) -> Option<u64> {
    let msg = message.to_ascii_lowercase();
    let start = msg
        .find("retry-after")
        .or_else(|| msg.find("retry after"))?;
    let tail = &msg[start..];
    let digits_start = tail.find(|ch: char| ch.is_ascii_digit())?;
    let digits: String = tail[digits_start..]
        .chars()
        .take_while(|ch| ch.is_ascii_digit())
        .collect();
    let value: u64 = digits.parse().ok()?;
    let suffix = tail[digits_start + digits.len()..].trim_start();
    if suffix.starts_with("ms") || suffix.starts_with("millis") {
        Some(value)
    } else {
        Some(value.saturating_mul(1_000))
    }
}

fn backoff_after_failure_ms(attempt: usize, message: &str) -> u64 {
    let base = bounded_exponential_backoff_ms(
        BACKOFF_BASE_MS,
        attempt.saturating_sub(1) as u32,
        BACKOFF_CAP_MS,
    );
    if is_rate_limited_rpc_error(message) {
        parse_retry_after_ms(message)
            .unwrap_or(base)
            .clamp(base, RATE_LIMIT_CAP_MS)
    } else {
        base
    }
}

/// Run `op` under a per-attempt timeout, retrying transient failures with bounded backoff.
pub async fn run_with_retry<T, Op, Fut>(
    policy: RetryPolicy,
    context: &str,
    mut op: Op,
) -> Result<T, RetryFailure>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, String>>,
{
    let attempts = policy.attempts.max(1);
    let mut last_message = String::new();

    for attempt in 1..=attempts {
        match timeout(Duration::from_millis(policy.timeout_ms), op()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(raw)) => {
                let message = compact_error_message(&raw, RPC_ERR_MAX_LEN);
                if !is_retryable_rpc_error(&message) {
                    return Err(RetryFailure::Rejected(format!("{context}: {message}")));
                }
                last_message = message;
            }
            Err(_) => {
                last_message = format!("timed out after {}ms", policy.timeout_ms);
            }
        }
        if attempt < attempts {
            let wait_ms = backoff_after_failure_ms(attempt, &last_message);
            tracing::debug!(
                "[RPC] {} attempt {}/{} failed ({}); retrying in {}ms",
                context,
                attempt,
                attempts,
                last_message,
                wait_ms
            );
            sleep(Duration::from_millis(wait_ms)).await;
        }
    }

    Err(RetryFailure::Exhausted(format!(
        "{context} failed after {attempts} attempt(s): {last_message}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_retry_classifier_non_retryable_patterns() {
        assert!(!is_retryable_rpc_error(
            "execution reverted: Ownable: caller is not owner"
        ));
        assert!(!is_retryable_rpc_error("RPC error -32601: method not found"));
        assert!(is_retryable_rpc_error("connection reset by peer"));
        assert!(is_retryable_rpc_error("429 Too Many Requests"));
    }

    #[test]
    fn test_retry_backoff_is_bounded() {
        assert_eq!(bounded_exponential_backoff_ms(100, 0, 1_800), 100);
        assert_eq!(bounded_exponential_backoff_ms(100, 12, 1_800), 1_800);
        assert_eq!(bounded_exponential_backoff_ms(0, 3, 1_800), 0);
    }

    #[test]
    fn test_parse_retry_after_ms_prefers_seconds_by_default() {
        assert_eq!(parse_retry_after_ms("HTTP 429 Retry-After: 2"), Some(2_000));
        assert_eq!(parse_retry_after_ms("retry-after: 1200ms"), Some(1_200));
        assert_eq!(parse_retry_after_ms("no hint"), None);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_transient_failure_is_retried_until_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let policy = RetryPolicy {
            attempts: 3,
            timeout_ms: 1_000,
        };
        let result = run_with_retry(policy, "eth_call", || {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err("connection reset by peer".to_string())
                } else {
                    Ok(42u64)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_revert_is_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let result: Result<u64, _> = run_with_retry(RetryPolicy::default(), "eth_call", || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("execution reverted".to_string())
            }
        })
        .await;
        assert!(matches!(result, Err(RetryFailure::Rejected(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
