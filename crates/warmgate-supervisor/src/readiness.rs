use std::{fmt, time::Duration};

use anyhow::Context;
use reqwest::Url;
use tokio::time::Instant;

use crate::error::ProbeError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeTarget {
    Http {
        url: Url,
        /// Exact status to accept; any 2xx when unset.
        expect_status: Option<u16>,
        /// Substring the response body must contain.
        expect_body: Option<String>,
    },
    Tcp {
        addr: String,
    },
}

impl ProbeTarget {
    /// Accepts `http://`, `https://` and `tcp://host:port`.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let url = Url::parse(raw.trim()).map_err(|e| format!("{raw}: {e}"))?;
        match url.scheme() {
            "http" | "https" => Ok(ProbeTarget::Http {
                url,
                expect_status: None,
                expect_body: None,
            }),
            "tcp" => {
                let host = url
                    .host_str()
                    .ok_or_else(|| format!("{raw}: missing host"))?;
                let port = url.port().ok_or_else(|| format!("{raw}: missing port"))?;
                Ok(ProbeTarget::Tcp {
                    addr: format!("{host}:{port}"),
                })
            }
            other => Err(format!("{raw}: unsupported scheme {other:?}")),
        }
    }
}

impl fmt::Display for ProbeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeTarget::Http { url, .. } => write!(f, "GET {url}"),
            ProbeTarget::Tcp { addr } => write!(f, "tcp://{addr}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReadinessCheck {
    pub target: ProbeTarget,
    pub attempt_timeout: Duration,
    pub interval: Duration,
    /// Enables exponential backoff from `interval` up to this cap.
    pub max_interval: Option<Duration>,
    pub deadline: Duration,
}

impl ReadinessCheck {
    /// Delay after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let Some(max) = self.max_interval else {
            return self.interval;
        };
        let pow = attempt.saturating_sub(1).min(30);
        let mult = 1u32.checked_shl(pow).unwrap_or(u32::MAX);
        self.interval.saturating_mul(mult).min(max)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready {
        attempts: u32,
        elapsed: Duration,
    },
    TimedOut {
        attempts: u32,
        elapsed: Duration,
        last_error: Option<String>,
    },
}

fn classify(err: reqwest::Error) -> ProbeError {
    if err.is_connect() {
        ProbeError::Connect(err.to_string())
    } else {
        ProbeError::Request(err.to_string())
    }
}

async fn probe_tcp(addr: &str, timeout: Duration) -> Result<(), ProbeError> {
    match tokio::time::timeout(timeout, tokio::net::TcpStream::connect(addr)).await {
        Ok(Ok(s)) => {
            drop(s);
            Ok(())
        }
        Ok(Err(e)) => Err(ProbeError::Connect(e.to_string())),
        Err(_) => Err(ProbeError::Timeout(timeout.as_millis())),
    }
}

#[derive(Debug, Clone)]
pub struct ReadinessProber {
    client: reqwest::Client,
}

impl ReadinessProber {
    pub fn new() -> anyhow::Result<Self> {
        // Probes always target local endpoints; never route them through a proxy.
        let client = reqwest::Client::builder()
            .no_proxy()
            .build()
            .context("build readiness http client")?;
        Ok(Self { client })
    }

    /// A single attempt, bounded by `timeout` end to end.
    pub async fn probe_once(
        &self,
        target: &ProbeTarget,
        timeout: Duration,
    ) -> Result<(), ProbeError> {
        match target {
            ProbeTarget::Http {
                url,
                expect_status,
                expect_body,
            } => {
                let attempt = self.probe_http(url, *expect_status, expect_body.as_deref());
                tokio::time::timeout(timeout, attempt)
                    .await
                    .map_err(|_| ProbeError::Timeout(timeout.as_millis()))?
            }
            ProbeTarget::Tcp { addr } => probe_tcp(addr, timeout).await,
        }
    }

    async fn probe_http(
        &self,
        url: &Url,
        expect_status: Option<u16>,
        expect_body: Option<&str>,
    ) -> Result<(), ProbeError> {
        let resp = self.client.get(url.clone()).send().await.map_err(classify)?;
        let status = resp.status();
        let status_ok = match expect_status {
            Some(code) => status.as_u16() == code,
            None => status.is_success(),
        };
        if !status_ok {
            return Err(ProbeError::Status(status.as_u16()));
        }
        if let Some(needle) = expect_body {
            let body = resp.text().await.map_err(classify)?;
            if !body.contains(needle) {
                return Err(ProbeError::Body(needle.to_string()));
            }
        }
        Ok(())
    }

    /// Polls `check.target` until it answers or `check.deadline` elapses.
    pub async fn wait_until_ready(&self, check: &ReadinessCheck) -> Readiness {
        let started = Instant::now();
        let deadline = started + check.deadline;
        let mut attempts: u32 = 0;
        let mut last_error: Option<String> = None;

        tracing::info!(
            target_endpoint = %check.target,
            deadline_ms = check.deadline.as_millis() as u64,
            "waiting for readiness"
        );

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Readiness::TimedOut {
                    attempts,
                    elapsed: started.elapsed(),
                    last_error,
                };
            }

            attempts = attempts.saturating_add(1);
            match self
                .probe_once(&check.target, check.attempt_timeout.min(remaining))
                .await
            {
                Ok(()) => {
                    let elapsed = started.elapsed();
                    tracing::info!(
                        target_endpoint = %check.target,
                        attempts,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "endpoint is ready"
                    );
                    return Readiness::Ready { attempts, elapsed };
                }
                Err(err) => {
                    tracing::debug!(
                        target_endpoint = %check.target,
                        attempt = attempts,
                        error = %err,
                        "not ready yet"
                    );
                    last_error = Some(err.to_string());
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(check.delay_after(attempts).min(remaining)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::test_support::{serve_http, unused_port};

    fn check(target: ProbeTarget, interval_ms: u64, deadline_ms: u64) -> ReadinessCheck {
        ReadinessCheck {
            target,
            attempt_timeout: Duration::from_millis(500),
            interval: Duration::from_millis(interval_ms),
            max_interval: None,
            deadline: Duration::from_millis(deadline_ms),
        }
    }

    fn http(addr: std::net::SocketAddr) -> ProbeTarget {
        ProbeTarget::parse(&format!("http://{addr}/")).unwrap()
    }

    #[test]
    fn parse_accepts_http_and_tcp() {
        assert!(matches!(
            ProbeTarget::parse("http://127.0.0.1:11434/").unwrap(),
            ProbeTarget::Http { .. }
        ));
        assert_eq!(
            ProbeTarget::parse("tcp://127.0.0.1:8000").unwrap(),
            ProbeTarget::Tcp {
                addr: "127.0.0.1:8000".to_string()
            }
        );
    }

    #[test]
    fn parse_rejects_unsupported_targets() {
        assert!(ProbeTarget::parse("ftp://127.0.0.1/").is_err());
        assert!(ProbeTarget::parse("tcp://127.0.0.1").is_err());
        assert!(ProbeTarget::parse("not a url").is_err());
    }

    #[test]
    fn fixed_interval_without_cap() {
        let c = check(ProbeTarget::parse("tcp://127.0.0.1:1").unwrap(), 250, 1000);
        assert_eq!(c.delay_after(1), Duration::from_millis(250));
        assert_eq!(c.delay_after(9), Duration::from_millis(250));
    }

    #[test]
    fn exponential_interval_is_capped() {
        let mut c = check(ProbeTarget::parse("tcp://127.0.0.1:1").unwrap(), 100, 1000);
        c.max_interval = Some(Duration::from_millis(500));
        assert_eq!(c.delay_after(1), Duration::from_millis(100));
        assert_eq!(c.delay_after(2), Duration::from_millis(200));
        assert_eq!(c.delay_after(3), Duration::from_millis(400));
        assert_eq!(c.delay_after(4), Duration::from_millis(500));
        assert_eq!(c.delay_after(40), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn ready_on_third_attempt_returns_early() {
        let (addr, hits) = serve_http(3, "Ollama is running").await;
        let prober = ReadinessProber::new().unwrap();

        let res = prober
            .wait_until_ready(&check(http(addr), 100, 10_000))
            .await;
        let Readiness::Ready { attempts, elapsed } = res else {
            panic!("expected ready, got {res:?}");
        };
        assert_eq!(attempts, 3);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn never_ready_times_out_at_deadline() {
        let target = http(([127, 0, 0, 1], unused_port()).into());
        let prober = ReadinessProber::new().unwrap();

        let started = std::time::Instant::now();
        let res = prober.wait_until_ready(&check(target, 100, 600)).await;
        let waited = started.elapsed();

        match res {
            Readiness::TimedOut {
                attempts,
                last_error,
                ..
            } => {
                assert!(attempts >= 3);
                assert!(last_error.is_some());
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(waited >= Duration::from_millis(600));
        assert!(waited < Duration::from_millis(1200));
    }

    #[tokio::test]
    async fn hung_backend_does_not_stall_the_loop() {
        // Accepts connections at the kernel level but never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = http(listener.local_addr().unwrap());
        let prober = ReadinessProber::new().unwrap();

        let mut c = check(target, 50, 500);
        c.attempt_timeout = Duration::from_millis(100);

        let started = std::time::Instant::now();
        let res = prober.wait_until_ready(&c).await;
        assert!(started.elapsed() < Duration::from_millis(1200));
        match res {
            Readiness::TimedOut {
                attempts,
                last_error,
                ..
            } => {
                assert!(attempts >= 2);
                assert!(last_error.unwrap().contains("timed out"));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        drop(listener);
    }

    #[tokio::test]
    async fn body_mismatch_is_not_ready() {
        let (addr, _hits) = serve_http(1, "starting up").await;
        let target = ProbeTarget::Http {
            url: Url::parse(&format!("http://{addr}/")).unwrap(),
            expect_status: None,
            expect_body: Some("Ollama is running".to_string()),
        };
        let prober = ReadinessProber::new().unwrap();
        let err = prober
            .probe_once(&target, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Body(_)));
    }

    #[tokio::test]
    async fn unexpected_status_is_reported() {
        let (addr, _hits) = serve_http(u32::MAX, "unused").await;
        let prober = ReadinessProber::new().unwrap();
        let err = prober
            .probe_once(&http(addr), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Status(503)));

        let target = ProbeTarget::Http {
            url: Url::parse(&format!("http://{addr}/")).unwrap(),
            expect_status: Some(503),
            expect_body: None,
        };
        assert!(prober.probe_once(&target, Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn tcp_target_is_ready_once_listening() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = ProbeTarget::Tcp {
            addr: listener.local_addr().unwrap().to_string(),
        };
        let prober = ReadinessProber::new().unwrap();
        assert!(prober.probe_once(&target, Duration::from_secs(1)).await.is_ok());

        let closed = ProbeTarget::Tcp {
            addr: format!("127.0.0.1:{}", unused_port()),
        };
        let err = prober
            .probe_once(&closed, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::Connect(_)));
    }
}
