use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Delay before each retry within a single delivery.
const RETRY_BACKOFF: [Duration; 2] = [Duration::from_millis(500), Duration::from_secs(2)];

/// Completion payload POSTed to the client's webhook URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub job_id: Uuid,
    pub status: String,
    pub result_urls: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of one delivery attempt batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The endpoint acknowledged with a 2xx.
    Delivered,
    /// The breaker was open; no request was made.
    Skipped,
    /// All attempts failed.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed { failures: u32 },
    Open { opened_at: Instant },
    HalfOpen,
}

impl BreakerState {
    fn name(&self) -> &'static str {
        match self {
            BreakerState::Closed { .. } => "closed",
            BreakerState::Open { .. } => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

/// Three-state circuit breaker, tracked per destination host within this
/// process. Worker processes make independent breaker decisions; no
/// cross-process coordination.
pub struct CircuitBreaker {
    fail_threshold: u32,
    reset_timeout: Duration,
    hosts: Mutex<HashMap<String, BreakerState>>,
}

impl CircuitBreaker {
    pub fn new(fail_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            fail_threshold,
            reset_timeout,
            hosts: Mutex::new(HashMap::new()),
        }
    }

    fn transition(host: &str, from: BreakerState, to: BreakerState) {
        metrics::counter!(
            "webhook_breaker_transitions_total",
            "host" => host.to_string(),
            "from" => from.name(),
            "to" => to.name(),
        )
        .increment(1);
        tracing::info!(host, from = from.name(), to = to.name(), "Breaker transition");
    }

    /// May a delivery to this host proceed? An open breaker whose reset
    /// timeout elapsed moves to half-open and admits exactly one probe.
    pub fn acquire(&self, host: &str) -> bool {
        let mut hosts = self.hosts.lock().unwrap();
        let state = hosts
            .entry(host.to_string())
            .or_insert(BreakerState::Closed { failures: 0 });

        match *state {
            BreakerState::Closed { .. } => true,
            BreakerState::Open { opened_at } => {
                if opened_at.elapsed() >= self.reset_timeout {
                    Self::transition(host, *state, BreakerState::HalfOpen);
                    *state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => false,
        }
    }

    pub fn on_success(&self, host: &str) {
        let mut hosts = self.hosts.lock().unwrap();
        if let Some(state) = hosts.get_mut(host) {
            let closed = BreakerState::Closed { failures: 0 };
            if matches!(*state, BreakerState::HalfOpen) {
                Self::transition(host, *state, closed);
            }
            *state = closed;
        }
    }

    pub fn on_failure(&self, host: &str) {
        let mut hosts = self.hosts.lock().unwrap();
        let state = hosts
            .entry(host.to_string())
            .or_insert(BreakerState::Closed { failures: 0 });

        match *state {
            BreakerState::Closed { failures } => {
                let failures = failures + 1;
                if failures >= self.fail_threshold {
                    let open = BreakerState::Open {
                        opened_at: Instant::now(),
                    };
                    Self::transition(host, *state, open);
                    *state = open;
                } else {
                    *state = BreakerState::Closed { failures };
                }
            }
            BreakerState::HalfOpen => {
                let open = BreakerState::Open {
                    opened_at: Instant::now(),
                };
                Self::transition(host, *state, open);
                *state = open;
            }
            BreakerState::Open { .. } => {}
        }
    }
}

/// Webhook delivery layer: POSTs the completion payload with a short
/// timeout and a bounded retry budget, guarded by the circuit breaker.
pub struct WebhookDelivery {
    http: reqwest::Client,
    breaker: CircuitBreaker,
}

impl WebhookDelivery {
    pub fn new(
        fail_threshold: u32,
        reset_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, WebhookError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(WebhookError::Client)?;
        Ok(Self {
            http,
            breaker: CircuitBreaker::new(fail_threshold, reset_timeout),
        })
    }

    /// Deliver the payload. A batch that exhausts its retries counts as a
    /// single failure against the breaker.
    pub async fn deliver(&self, webhook_url: &str, payload: &WebhookPayload) -> DeliveryOutcome {
        let host = match url::Url::parse(webhook_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
        {
            Some(host) => host,
            None => {
                tracing::error!(webhook_url, "Refusing delivery to unparseable URL");
                return DeliveryOutcome::Failed;
            }
        };

        if !self.breaker.acquire(&host) {
            tracing::warn!(
                job_id = %payload.job_id,
                host,
                "Breaker open, skipping webhook delivery"
            );
            return DeliveryOutcome::Skipped;
        }

        let attempts = RETRY_BACKOFF.len() + 1;
        for (i, backoff) in std::iter::once(None)
            .chain(RETRY_BACKOFF.iter().map(Some))
            .enumerate()
        {
            if let Some(delay) = backoff {
                tokio::time::sleep(*delay).await;
            }

            match self.post_once(webhook_url, payload).await {
                Ok(()) => {
                    self.breaker.on_success(&host);
                    tracing::info!(job_id = %payload.job_id, host, "Webhook delivered");
                    return DeliveryOutcome::Delivered;
                }
                Err(e) => {
                    tracing::warn!(
                        job_id = %payload.job_id,
                        host,
                        attempt = i + 1,
                        attempts,
                        error = %e,
                        "Webhook attempt failed"
                    );
                }
            }
        }

        self.breaker.on_failure(&host);
        DeliveryOutcome::Failed
    }

    async fn post_once(&self, url: &str, payload: &WebhookPayload) -> Result<(), WebhookError> {
        self.http
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(WebhookError::Client)?
            .error_for_status()
            .map_err(WebhookError::Client)?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST: &str = "hooks.example.com";

    fn breaker(threshold: u32, reset: Duration) -> CircuitBreaker {
        CircuitBreaker::new(threshold, reset)
    }

    #[test]
    fn closed_breaker_admits_deliveries() {
        let cb = breaker(5, Duration::from_secs(60));
        assert!(cb.acquire(HOST));
        cb.on_failure(HOST);
        assert!(cb.acquire(HOST), "below threshold stays closed");
    }

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let cb = breaker(5, Duration::from_secs(60));
        for _ in 0..4 {
            cb.on_failure(HOST);
            assert!(cb.acquire(HOST));
        }
        cb.on_failure(HOST);
        assert!(!cb.acquire(HOST), "fifth failure opens the breaker");
    }

    #[test]
    fn success_resets_the_failure_count() {
        let cb = breaker(3, Duration::from_secs(60));
        cb.on_failure(HOST);
        cb.on_failure(HOST);
        cb.on_success(HOST);
        cb.on_failure(HOST);
        cb.on_failure(HOST);
        assert!(cb.acquire(HOST), "count restarted after success");
    }

    #[test]
    fn open_breaker_admits_one_probe_after_reset() {
        let cb = breaker(1, Duration::from_millis(20));
        cb.on_failure(HOST);
        assert!(!cb.acquire(HOST));

        std::thread::sleep(Duration::from_millis(30));
        assert!(cb.acquire(HOST), "reset elapsed, probe admitted");
        assert!(!cb.acquire(HOST), "only one probe while half-open");
    }

    #[test]
    fn half_open_probe_outcome_decides_next_state() {
        let cb = breaker(1, Duration::from_millis(10));

        cb.on_failure(HOST);
        std::thread::sleep(Duration::from_millis(15));
        assert!(cb.acquire(HOST));
        cb.on_failure(HOST);
        assert!(!cb.acquire(HOST), "failed probe reopens");

        std::thread::sleep(Duration::from_millis(15));
        assert!(cb.acquire(HOST));
        cb.on_success(HOST);
        assert!(cb.acquire(HOST), "successful probe closes");
    }

    #[test]
    fn hosts_are_tracked_independently() {
        let cb = breaker(1, Duration::from_secs(60));
        cb.on_failure("a.example.com");
        assert!(!cb.acquire("a.example.com"));
        assert!(cb.acquire("b.example.com"));
    }
}
