//! Post-publish health polling.
//!
//! A deployment that never answers within the attempt budget is only flagged
//! unverified; hosting propagation is outside the controller's control.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyPolicy {
    pub max_attempts: u32,
    pub inter_delay: Duration,
    pub initial_wait: Duration,
    /// Per-request HTTP timeout
    pub request_timeout: Duration,
}

impl Default for VerifyPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            inter_delay: Duration::from_secs(10),
            initial_wait: Duration::from_secs(30),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// One bounded GET against a deployed URL.
#[async_trait]
pub trait Probe: Send + Sync {
    /// HTTP status on response, or a description of the transport failure.
    async fn probe(&self, url: &Url) -> Result<u16, String>;
}

#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(request_timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("preview/", env!("CARGO_PKG_VERSION")))
            .timeout(request_timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn probe(&self, url: &Url) -> Result<u16, String> {
        self.client
            .get(url.clone())
            .send()
            .await
            .map(|response| response.status().as_u16())
            .map_err(|err| err.to_string())
    }
}

/// Result of a polling run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyReport {
    pub verified: bool,
    pub attempts: u32,
}

#[derive(Clone)]
pub struct Verifier {
    probe: Arc<dyn Probe>,
}

impl std::fmt::Debug for Verifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Verifier").finish_non_exhaustive()
    }
}

impl Verifier {
    pub fn new(probe: Arc<dyn Probe>) -> Self {
        Self { probe }
    }

    /// Poll `url` until it answers 2xx or `max_attempts` GETs have been made.
    pub async fn verify(
        &self,
        url: &Url,
        max_attempts: u32,
        inter_delay: Duration,
        initial_wait: Duration,
    ) -> bool {
        self.poll(url, max_attempts, inter_delay, initial_wait)
            .await
            .verified
    }

    pub async fn verify_with(&self, url: &Url, policy: &VerifyPolicy) -> VerifyReport {
        self.poll(
            url,
            policy.max_attempts,
            policy.inter_delay,
            policy.initial_wait,
        )
        .await
    }

    async fn poll(
        &self,
        url: &Url,
        max_attempts: u32,
        inter_delay: Duration,
        initial_wait: Duration,
    ) -> VerifyReport {
        if !initial_wait.is_zero() {
            tracing::debug!(%url, wait_secs = initial_wait.as_secs(), "waiting for propagation");
            tokio::time::sleep(initial_wait).await;
        }

        for attempt in 1..=max_attempts {
            match self.probe.probe(url).await {
                Ok(status) if (200..300).contains(&status) => {
                    tracing::info!(%url, attempt, status, "deployment verified");
                    return VerifyReport {
                        verified: true,
                        attempts: attempt,
                    };
                }
                Ok(status) => {
                    tracing::debug!(%url, attempt, status, "deployment not live yet");
                }
                Err(err) => {
                    tracing::debug!(%url, attempt, error = %err, "probe failed");
                }
            }
            if attempt < max_attempts {
                tokio::time::sleep(inter_delay).await;
            }
        }

        tracing::warn!(%url, attempts = max_attempts, "deployment not verified; leaving it in place");
        VerifyReport {
            verified: false,
            attempts: max_attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Answers from a script, repeating the last entry.
    struct ScriptedProbe {
        script: Mutex<Vec<Result<u16, String>>>,
        calls: AtomicU32,
    }

    impl ScriptedProbe {
        fn new(script: Vec<Result<u16, String>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script),
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl Probe for ScriptedProbe {
        async fn probe(&self, _url: &Url) -> Result<u16, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                script.remove(0)
            } else {
                script[0].clone()
            }
        }
    }

    fn url() -> Url {
        Url::parse("https://acme.github.io/docs/pr-preview/42/").unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn never_live_url_is_polled_exactly_max_attempts() {
        let probe = ScriptedProbe::new(vec![Ok(404)]);
        let verifier = Verifier::new(probe.clone());
        let started = tokio::time::Instant::now();

        let verified = verifier
            .verify(&url(), 10, Duration::from_secs(10), Duration::from_secs(30))
            .await;

        assert!(!verified);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 10);
        // initial wait plus nine gaps between ten attempts
        assert_eq!(started.elapsed(), Duration::from_secs(30 + 9 * 10));
    }

    #[tokio::test(start_paused = true)]
    async fn first_success_stops_polling() {
        let probe = ScriptedProbe::new(vec![
            Err("connection refused".into()),
            Ok(404),
            Ok(200),
        ]);
        let verifier = Verifier::new(probe.clone());
        let policy = VerifyPolicy {
            max_attempts: 10,
            inter_delay: Duration::from_secs(10),
            initial_wait: Duration::ZERO,
            request_timeout: Duration::from_secs(5),
        };

        let report = verifier.verify_with(&url(), &policy).await;
        assert_eq!(
            report,
            VerifyReport {
                verified: true,
                attempts: 3
            }
        );
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn redirects_and_server_errors_do_not_verify() {
        let probe = ScriptedProbe::new(vec![Ok(301), Ok(500)]);
        let verifier = Verifier::new(probe.clone());
        let verified = verifier
            .verify(&url(), 2, Duration::from_secs(1), Duration::ZERO)
            .await;
        assert!(!verified);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
    }
}
