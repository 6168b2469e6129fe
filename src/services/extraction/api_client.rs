use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

use crate::core::config::ExtractionConfig;
use crate::core::errors::{ExtractionError, ExtractionResult, StartupError};
use crate::middleware::circuit_breaker::CircuitBreaker;
use crate::utils::Metrics;

/// A chat-completion style text-understanding service
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Send one system + user exchange and return the reply text
    async fn complete(&self, system: &str, prompt: &str) -> ExtractionResult<String>;

    fn name(&self) -> &str;
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    content: Option<String>,
}

/// Client for an OpenAI-compatible `/chat/completions` endpoint
///
/// Every call, retries included, is bounded by one hard deadline. Transient failures (transport
/// errors, 429, 5xx, timeouts) are retried with exponential backoff and
/// jitter; the circuit breaker fails calls fast while the service is down.
pub struct OpenAiChatClient {
    http_client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    timeout: Duration,
    max_retries: u32,
    backoff_base: Duration,
    circuit_breaker: CircuitBreaker,
    metrics: Option<Metrics>,
}

impl OpenAiChatClient {
    pub fn new(
        config: &ExtractionConfig,
        circuit_breaker: Option<CircuitBreaker>,
        metrics: Option<Metrics>,
    ) -> Result<Self, StartupError> {
        let timeout = Duration::from_secs(config.timeout_secs);

        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        if config.api_key.is_empty() {
            warn!("No LLM API key configured; every extraction will fail");
        }

        Ok(Self {
            http_client,
            endpoint: format!("{}/chat/completions", config.api_base),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            timeout,
            max_retries: config.max_retries,
            backoff_base: Duration::from_secs(1),
            circuit_breaker: circuit_breaker.unwrap_or_default(),
            metrics,
        })
    }

    /// Override the backoff unit (rate-limit waits are ten units)
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.circuit_breaker
    }

    fn backoff_delay(&self, attempt: u32, error: &ExtractionError) -> Duration {
        let base_ms = self.backoff_base.as_millis() as u64;
        match error {
            // Rate limited or overloaded: wait it out
            ExtractionError::ServiceStatus { status: 429 | 503, .. } => {
                Duration::from_millis(base_ms * 10)
            }
            _ => {
                let exponential = base_ms.saturating_mul(1u64 << attempt.min(10));
                let jitter = rand::random::<u64>() % base_ms.max(1);
                Duration::from_millis(exponential + jitter)
            }
        }
    }

    async fn send_once(&self, system: &str, prompt: &str) -> ExtractionResult<String> {
        let request = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: 0.0,
        };

        let response = self
            .http_client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExtractionError::ServiceStatus {
                status: status.as_u16(),
                body: body.chars().take(500).collect(),
            });
        }

        let parsed: ChatResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or(ExtractionError::EmptyResponse)
    }

    /// Retry loop; the caller bounds it with the overall deadline
    async fn send_with_retries(&self, system: &str, prompt: &str) -> ExtractionResult<String> {
        let mut attempt = 0;
        let error = loop {
            let start = Instant::now();
            let result = self.send_once(system, prompt).await;

            if let Some(ref m) = self.metrics {
                m.record_llm_call(result.is_ok(), start.elapsed());
            }

            match result {
                Ok(content) => {
                    debug!("Completion received ({} chars, attempt {})", content.len(), attempt + 1);
                    return Ok(content);
                }
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    let delay = self.backoff_delay(attempt, &e);
                    warn!(
                        "Completion attempt {}/{} failed: {}; retrying in {}ms",
                        attempt + 1,
                        self.max_retries + 1,
                        e,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => break e,
            }
        };

        if attempt > 0 {
            Err(ExtractionError::RetriesExhausted {
                attempts: attempt + 1,
                last_error: error.to_string(),
            })
        } else {
            Err(error)
        }
    }
}

#[async_trait]
impl CompletionBackend for OpenAiChatClient {
    #[instrument(skip(self, system, prompt), fields(model = %self.model))]
    async fn complete(&self, system: &str, prompt: &str) -> ExtractionResult<String> {
        if self.api_key.is_empty() {
            return Err(ExtractionError::MissingApiKey);
        }

        let Some(permit) = self.circuit_breaker.allow_request() else {
            warn!("Circuit breaker is open, failing fast");
            return Err(ExtractionError::CircuitOpen);
        };

        // One deadline covers every attempt and backoff
        let error = match tokio::time::timeout(self.timeout, self.send_with_retries(system, prompt)).await {
            Ok(Ok(content)) => {
                permit.success();
                return Ok(content);
            }
            Ok(Err(e)) => e,
            Err(_) => {
                warn!("Completion exceeded the {}s deadline", self.timeout.as_secs());
                if let Some(ref m) = self.metrics {
                    m.record_llm_call(false, self.timeout);
                }
                ExtractionError::Timeout(self.timeout.as_secs())
            }
        };

        if permit.failure() {
            warn!("Circuit breaker opened after repeated completion failures");
            if let Some(ref m) = self.metrics {
                m.record_circuit_breaker_trip();
            }
        }
        Err(error)
    }

    fn name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::circuit_breaker::{CircuitBreakerConfig, CircuitState};
    use axum::{http::StatusCode, routing::post, Json, Router};
    use std::future::Future;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::Poll;

    fn config(api_base: String) -> ExtractionConfig {
        ExtractionConfig {
            api_base,
            api_key: "test-key".to_string(),
            model: "test-model".to_string(),
            timeout_secs: 5,
            max_retries: 2,
            cache_capacity: 16,
        }
    }

    /// Local chat endpoint that fails with `status` for the first `failures` calls
    async fn serve(failures: usize, status: StatusCode) -> (String, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let app = Router::new().route(
            "/chat/completions",
            post(move |Json(body): Json<serde_json::Value>| {
                let counter = Arc::clone(&counter);
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n < failures {
                        return Err(status);
                    }
                    let user = body["messages"][1]["content"].as_str().unwrap_or_default().to_string();
                    Ok(Json(serde_json::json!({
                        "choices": [{ "message": { "role": "assistant", "content": format!(" echo:{} ", user) } }]
                    })))
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), calls)
    }

    #[tokio::test]
    async fn test_successful_completion() {
        let (base, calls) = serve(0, StatusCode::OK).await;
        let client = OpenAiChatClient::new(&config(base), None, None).unwrap();

        let reply = client.complete("system", "hello").await.unwrap();
        assert_eq!(reply, "echo:hello");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let (base, calls) = serve(2, StatusCode::INTERNAL_SERVER_ERROR).await;
        let metrics = Metrics::new();
        let client = OpenAiChatClient::new(&config(base), None, Some(metrics.clone()))
            .unwrap()
            .with_backoff_base(Duration::from_millis(5));

        let reply = client.complete("system", "retry me").await.unwrap();
        assert_eq!(reply, "echo:retry me");
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.llm_calls_failed, 2);
        assert_eq!(snapshot.llm_calls_success, 1);
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let (base, calls) = serve(10, StatusCode::BAD_REQUEST).await;
        let client = OpenAiChatClient::new(&config(base), None, None)
            .unwrap()
            .with_backoff_base(Duration::from_millis(5));

        let result = client.complete("system", "bad").await;
        assert!(matches!(
            result,
            Err(ExtractionError::ServiceStatus { status: 400, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let (base, calls) = serve(10, StatusCode::BAD_GATEWAY).await;
        let client = OpenAiChatClient::new(&config(base), None, None)
            .unwrap()
            .with_backoff_base(Duration::from_millis(5));

        let result = client.complete("system", "down").await;
        assert!(matches!(
            result,
            Err(ExtractionError::RetriesExhausted { attempts: 3, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_open_circuit_fails_fast() {
        let (base, calls) = serve(10, StatusCode::SERVICE_UNAVAILABLE).await;
        let breaker = CircuitBreaker::with_config(CircuitBreakerConfig {
            failure_threshold: 1,
            cooldown: Duration::from_secs(60),
            success_threshold: 1,
        });
        let metrics = Metrics::new();
        let mut cfg = config(base);
        cfg.max_retries = 0;
        let client = OpenAiChatClient::new(&cfg, Some(breaker), Some(metrics.clone())).unwrap();

        assert!(client.complete("system", "first").await.is_err());
        let second = client.complete("system", "second").await;
        assert!(matches!(second, Err(ExtractionError::CircuitOpen)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.snapshot().circuit_breaker_trips, 1);
    }

    #[tokio::test]
    async fn test_deadline_covers_all_attempts() {
        let app = Router::new().route(
            "/chat/completions",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                StatusCode::OK
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let mut cfg = config(format!("http://{}", addr));
        cfg.timeout_secs = 1;
        cfg.max_retries = 5;
        let client = OpenAiChatClient::new(&cfg, None, None)
            .unwrap()
            .with_backoff_base(Duration::from_millis(5));

        let start = Instant::now();
        let result = client.complete("system", "slow").await;
        assert!(matches!(result, Err(ExtractionError::Timeout(1))));
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_cancelled_trial_does_not_lock_out() {
        let (base, calls) = serve(1, StatusCode::BAD_REQUEST).await;
        let breaker = CircuitBreaker::with_config(CircuitBreakerConfig {
            failure_threshold: 1,
            cooldown: Duration::from_millis(0),
            success_threshold: 1,
        });
        let mut cfg = config(base);
        cfg.max_retries = 0;
        let client = OpenAiChatClient::new(&cfg, Some(breaker.clone()), None).unwrap();

        assert!(client.complete("system", "trip").await.is_err());
        assert_eq!(breaker.state(), CircuitState::Open);

        // Start the half-open trial, then abandon it mid-request
        let mut trial = client.complete("system", "abandoned");
        std::future::poll_fn(|cx| {
            assert!(trial.as_mut().poll(cx).is_pending());
            Poll::Ready(())
        })
        .await;
        assert!(breaker.allow_request().is_none());
        drop(trial);

        let reply = client.complete("system", "after").await.unwrap();
        assert_eq!(reply, "echo:after");
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(calls.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_missing_key_never_calls_out() {
        let (base, calls) = serve(0, StatusCode::OK).await;
        let mut cfg = config(base);
        cfg.api_key = String::new();
        let client = OpenAiChatClient::new(&cfg, None, None).unwrap();

        let result = client.complete("system", "hello").await;
        assert!(matches!(result, Err(ExtractionError::MissingApiKey)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
