//! Retry with exponential backoff, then optional model fallback.
//!
//! Every model call in the runtime (agent runs, delegation hops and
//! compaction summaries) goes through [`with_resilience`].

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::error::LlmError;

/// What a fallback handler is told when retries are exhausted.
#[derive(Debug, Clone)]
pub struct FallbackContext {
    /// Model the failing attempts targeted, if the caller named one.
    pub current_model: Option<String>,
    /// Number of retries made after the first attempt.
    pub retry_count: u32,
    /// The last error observed.
    pub error: LlmError,
}

/// Picks a replacement model after retries are exhausted, or `None` to give up.
pub type FallbackHandler = Arc<dyn Fn(&FallbackContext) -> Option<String> + Send + Sync>;

/// Retry and fallback policy.
#[derive(Clone)]
pub struct ResilienceConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Relative jitter applied to each delay, in `0.0..=1.0`.
    pub jitter: f64,
    pub on_fallback: Option<FallbackHandler>,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            jitter: 0.2,
            on_fallback: None,
        }
    }
}

impl fmt::Debug for ResilienceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilienceConfig")
            .field("max_retries", &self.max_retries)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("jitter", &self.jitter)
            .field("on_fallback", &self.on_fallback.is_some())
            .finish()
    }
}

/// A fallback handler that always switches to `model`.
pub fn static_fallback(model: String) -> FallbackHandler {
    Arc::new(move |ctx: &FallbackContext| {
        if ctx.current_model.as_deref() == Some(model.as_str()) {
            None
        } else {
            Some(model.clone())
        }
    })
}

/// Returns `true` if the error is transient and worth retrying.
///
/// HTTP errors are classified by status alone (429 and 5xx). Other errors
/// are retried when their message mentions a timeout or an overloaded
/// upstream. Cancellation is never retried.
pub fn is_retryable(err: &LlmError) -> bool {
    if matches!(err, LlmError::Cancelled) {
        return false;
    }
    if let Some(status) = err.status() {
        return status == 429 || status >= 500;
    }
    let message = err.to_string().to_lowercase();
    message.contains("timeout") || message.contains("overloaded")
}

/// Delay before retry number `attempt` (0-based).
///
/// `min(max_delay, base_delay * 2^attempt)`, scaled by a random factor in
/// `1 ± jitter`.
pub fn backoff_delay(config: &ResilienceConfig, attempt: u32) -> Duration {
    let base_ms = config.base_delay.as_millis() as u64;
    let exp_ms = base_ms.saturating_mul(2u64.saturating_pow(attempt));
    let capped_ms = exp_ms.min(config.max_delay.as_millis() as u64);

    let jitter = config.jitter.clamp(0.0, 1.0);
    let factor = if jitter > 0.0 {
        1.0 + rand::thread_rng().gen_range(-jitter..=jitter)
    } else {
        1.0
    };
    Duration::from_millis((capped_ms as f64 * factor).round() as u64)
}

/// Run `f` with retries and optional fallback.
///
/// `f` receives `None` on normal attempts and `Some(model)` on the single
/// fallback attempt. Non-retryable errors propagate immediately without
/// consulting the fallback handler.
pub async fn with_resilience<T, F, Fut>(
    config: &ResilienceConfig,
    model_id: Option<&str>,
    f: F,
) -> Result<T, LlmError>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
{
    with_resilience_until(config, model_id, &CancellationToken::new(), f).await
}

/// [`with_resilience`] that stops as soon as `cancel` fires.
///
/// A cancelled token interrupts the backoff sleep and prevents any further
/// attempt, including the fallback. The result is then
/// [`LlmError::Cancelled`], whatever the last upstream error was.
pub async fn with_resilience_until<T, F, Fut>(
    config: &ResilienceConfig,
    model_id: Option<&str>,
    cancel: &CancellationToken,
    mut f: F,
) -> Result<T, LlmError>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
{
    let mut attempt: u32 = 0;
    let last_error = loop {
        if cancel.is_cancelled() {
            return Err(LlmError::Cancelled);
        }
        match f(None).await {
            Ok(value) => return Ok(value),
            Err(_) if cancel.is_cancelled() => return Err(LlmError::Cancelled),
            Err(err) if !is_retryable(&err) => return Err(err),
            Err(err) => {
                if attempt >= config.max_retries {
                    break err;
                }
                let delay = backoff_delay(config, attempt);
                tracing::warn!(
                    model = model_id.unwrap_or("default"),
                    attempt = attempt + 1,
                    max_retries = config.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Model call failed, retrying after backoff"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(LlmError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
        }
    };

    let Some(handler) = &config.on_fallback else {
        return Err(last_error);
    };

    let ctx = FallbackContext {
        current_model: model_id.map(String::from),
        retry_count: attempt,
        error: last_error,
    };
    match handler(&ctx) {
        Some(fallback) => {
            tracing::warn!(
                from = model_id.unwrap_or("default"),
                to = %fallback,
                retries = attempt,
                "Retries exhausted, switching to fallback model"
            );
            match f(Some(fallback)).await {
                Err(_) if cancel.is_cancelled() => Err(LlmError::Cancelled),
                result => result,
            }
        }
        None => Err(ctx.error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_jitter() -> ResilienceConfig {
        ResilienceConfig {
            jitter: 0.0,
            ..ResilienceConfig::default()
        }
    }

    fn http(status: u16) -> LlmError {
        LlmError::Http {
            status,
            message: "upstream".to_string(),
        }
    }

    #[test]
    fn test_is_retryable_classification() {
        assert!(is_retryable(&http(429)));
        assert!(is_retryable(&http(500)));
        assert!(is_retryable(&http(503)));
        assert!(!is_retryable(&http(400)));
        assert!(!is_retryable(&http(401)));
        assert!(!is_retryable(&http(404)));

        assert!(is_retryable(&LlmError::Timeout {
            reason: "30s elapsed".to_string()
        }));
        assert!(is_retryable(&LlmError::RequestFailed {
            reason: "Model is Overloaded".to_string()
        }));
        assert!(!is_retryable(&LlmError::RequestFailed {
            reason: "connection refused".to_string()
        }));
        assert!(!is_retryable(&LlmError::Cancelled));
    }

    #[test]
    fn test_backoff_delay_exponential_and_capped() {
        let config = no_jitter();
        assert_eq!(backoff_delay(&config, 0), Duration::from_millis(1000));
        assert_eq!(backoff_delay(&config, 1), Duration::from_millis(2000));
        assert_eq!(backoff_delay(&config, 2), Duration::from_millis(4000));
        assert_eq!(backoff_delay(&config, 10), Duration::from_millis(30_000));
        assert_eq!(backoff_delay(&config, 64), Duration::from_millis(30_000));
    }

    #[test]
    fn test_backoff_delay_jitter_range() {
        let config = ResilienceConfig::default();
        for _ in 0..50 {
            let d = backoff_delay(&config, 1).as_millis();
            assert!((1600..=2400).contains(&d), "delay out of range: {d}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_rate_limits_then_success() {
        let fallback_calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&fallback_calls);
        let config = ResilienceConfig {
            on_fallback: Some(Arc::new(move |_: &FallbackContext| {
                counter.fetch_add(1, Ordering::SeqCst);
                Some("backup".to_string())
            })),
            ..no_jitter()
        };

        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();
        let result = with_resilience(&config, Some("primary"), |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { if n < 2 { Err(http(429)) } else { Ok("ok") } }
        })
        .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Two delays: 1000ms then 2000ms.
        assert_eq!(started.elapsed(), Duration::from_millis(3000));
        assert_eq!(fallback_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_propagates_immediately() {
        let config = ResilienceConfig {
            on_fallback: Some(static_fallback("backup".to_string())),
            ..no_jitter()
        };
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_resilience(&config, None, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(http(401)) }
        })
        .await;

        assert!(matches!(result, Err(LlmError::Http { status: 401, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_after_exhaustion() {
        let seen = Arc::new(Mutex::new(None));
        let seen_clone = Arc::clone(&seen);
        let config = ResilienceConfig {
            max_retries: 2,
            on_fallback: Some(Arc::new(move |ctx: &FallbackContext| {
                *seen_clone.lock().unwrap() = Some((ctx.current_model.clone(), ctx.retry_count));
                Some("backup".to_string())
            })),
            ..no_jitter()
        };

        let models = Mutex::new(Vec::new());
        let result = with_resilience(&config, Some("primary"), |model| {
            models.lock().unwrap().push(model.clone());
            async move {
                match model {
                    Some(m) => Ok(m),
                    None => Err(http(503)),
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "backup");
        assert_eq!(
            *models.lock().unwrap(),
            vec![None, None, None, Some("backup".to_string())]
        );
        assert_eq!(
            *seen.lock().unwrap(),
            Some((Some("primary".to_string()), 2))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_without_fallback_returns_original_error() {
        let config = ResilienceConfig {
            max_retries: 1,
            on_fallback: Some(Arc::new(|_: &FallbackContext| None)),
            ..no_jitter()
        };
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_resilience(&config, None, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(LlmError::Timeout {
                    reason: "slow".to_string(),
                })
            }
        })
        .await;

        assert!(matches!(result, Err(LlmError::Timeout { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_attempt_is_not_retried() {
        let config = ResilienceConfig {
            on_fallback: Some(static_fallback("backup".to_string())),
            ..no_jitter()
        };
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();
        let result: Result<(), _> = with_resilience_until(&config, None, &cancel, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            cancel.cancel();
            async { Err(http(503)) }
        })
        .await;

        assert!(matches!(result, Err(LlmError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_backoff() {
        let config = no_jitter();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();
        let result: Result<(), _> = with_resilience_until(&config, None, &cancel, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(http(503)) }
        })
        .await;

        assert!(matches!(result, Err(LlmError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(started.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_already_cancelled_makes_no_call() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_resilience_until(&no_jitter(), None, &cancel, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await;

        assert!(matches!(result, Err(LlmError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_static_fallback_does_not_loop_to_same_model() {
        let handler = static_fallback("backup".to_string());
        let ctx = |model: Option<&str>| FallbackContext {
            current_model: model.map(String::from),
            retry_count: 3,
            error: http(500),
        };
        assert_eq!(handler(&ctx(Some("primary"))), Some("backup".to_string()));
        assert_eq!(handler(&ctx(None)), Some("backup".to_string()));
        assert_eq!(handler(&ctx(Some("backup"))), None);
    }
}
