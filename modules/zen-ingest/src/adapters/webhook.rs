//! Webhook adapter: an authenticated, rate-limited HTTP route that turns
//! JSON posts into raw events.
//!
//! The adapter owns no socket. It registers a handler with the process-wide
//! route registrar; the HTTP server dispatches requests to it.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use tokio::sync::mpsc;
use tracing::{info, warn};

use zen_cluster::SecretStore;
use zen_common::{RawEvent, SourceConfig, WebhookAuthType, ZenError};

use crate::adapters::{offer, SourceAdapter, CHANNEL_CAPACITY};
use crate::metrics::Metrics;

/// Route table contract. The HTTP server implements it; adapters register
/// and unregister their paths through it. Registering an occupied path is
/// an error, which fails adapter start.
pub trait RouteRegistrar: Send + Sync {
    fn register(&self, path: &str, handler: Arc<WebhookHandler>) -> Result<(), ZenError>;
    fn unregister(&self, path: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookResponse {
    Accepted,
    Unauthorized,
    RateLimited,
    BadRequest,
}

impl WebhookResponse {
    pub fn status(&self) -> u16 {
        match self {
            WebhookResponse::Accepted => 202,
            WebhookResponse::Unauthorized => 401,
            WebhookResponse::RateLimited => 429,
            WebhookResponse::BadRequest => 400,
        }
    }
}

enum ResolvedAuth {
    Bearer(String),
    Basic { username: String, password: String },
}

/// Sliding one-minute window, one per source.
struct RateLimiter {
    requests_per_minute: u32,
    hits: Mutex<Vec<Instant>>,
}

impl RateLimiter {
    fn new(requests_per_minute: u32) -> Self {
        Self {
            requests_per_minute,
            hits: Mutex::new(Vec::new()),
        }
    }

    fn allow(&self, now: Instant) -> bool {
        let mut hits = self.hits.lock().expect("rate limiter lock");
        hits.retain(|t| now.duration_since(*t) < Duration::from_secs(60));
        if hits.len() >= self.requests_per_minute as usize {
            return false;
        }
        hits.push(now);
        true
    }
}

/// One registered webhook endpoint: auth, rate limit, body conversion, and
/// the hand-off into the pipeline channel.
pub struct WebhookHandler {
    source: String,
    path: String,
    auth: Option<ResolvedAuth>,
    rate: Option<RateLimiter>,
    tx: mpsc::Sender<RawEvent>,
    metrics: Metrics,
}

impl WebhookHandler {
    /// Bare handler with no auth or rate limit, feeding a fresh bounded
    /// channel. For wiring tests and local tooling.
    pub fn unauthenticated(
        source: &str,
        path: &str,
        metrics: Metrics,
    ) -> (Arc<Self>, mpsc::Receiver<RawEvent>) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        (
            Arc::new(Self {
                source: source.to_string(),
                path: path.to_string(),
                auth: None,
                rate: None,
                tx,
                metrics,
            }),
            rx,
        )
    }

    /// Process one request. The server passes the raw `Authorization`
    /// header value and the body bytes.
    pub fn handle(&self, auth_header: Option<&str>, body: &[u8]) -> WebhookResponse {
        let started = Instant::now();
        let response = self.handle_inner(auth_header, body);
        self.metrics.load.record_response(started.elapsed());
        self.metrics
            .webhook_requests_total
            .with_label_values(&[&self.path, &response.status().to_string()])
            .inc();
        response
    }

    fn handle_inner(&self, auth_header: Option<&str>, body: &[u8]) -> WebhookResponse {
        if let Some(auth) = &self.auth {
            if !check_auth(auth, auth_header) {
                return WebhookResponse::Unauthorized;
            }
        }
        if let Some(rate) = &self.rate {
            if !rate.allow(Instant::now()) {
                return WebhookResponse::RateLimited;
            }
        }

        let payload: serde_json::Value = match serde_json::from_slice(body) {
            Ok(v) => v,
            Err(_) => return WebhookResponse::BadRequest,
        };
        let raw_data = match payload {
            serde_json::Value::Object(map) => map,
            _ => return WebhookResponse::BadRequest,
        };

        let event = RawEvent::new(&self.source, raw_data).with_metadata("endpoint", &self.path);
        if !offer(&self.tx, event, &self.metrics, &self.source) {
            self.metrics
                .webhook_dropped_total
                .with_label_values(&["backpressure"])
                .inc();
        }
        // Accepted means accepted for processing, not delivered; a drop on
        // a saturated pipeline is still a 202.
        WebhookResponse::Accepted
    }
}

fn check_auth(auth: &ResolvedAuth, header: Option<&str>) -> bool {
    let Some(header) = header else { return false };
    match auth {
        ResolvedAuth::Bearer(token) => header
            .strip_prefix("Bearer ")
            .map(|presented| constant_time_eq(presented.as_bytes(), token.as_bytes()))
            .unwrap_or(false),
        ResolvedAuth::Basic { username, password } => {
            let Some(encoded) = header.strip_prefix("Basic ") else {
                return false;
            };
            let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
                return false;
            };
            let Ok(decoded) = String::from_utf8(decoded) else {
                return false;
            };
            let Some((user, pass)) = decoded.split_once(':') else {
                return false;
            };
            if user != username {
                return false;
            }
            if password.starts_with("$2a$")
                || password.starts_with("$2b$")
                || password.starts_with("$2y$")
            {
                bcrypt::verify(pass, password).unwrap_or(false)
            } else {
                constant_time_eq(pass.as_bytes(), password.as_bytes())
            }
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

pub struct WebhookAdapter {
    registrar: Arc<dyn RouteRegistrar>,
    secrets: Arc<dyn SecretStore>,
    metrics: Metrics,
    registered_path: Option<String>,
}

impl WebhookAdapter {
    pub fn new(
        registrar: Arc<dyn RouteRegistrar>,
        secrets: Arc<dyn SecretStore>,
        metrics: Metrics,
    ) -> Self {
        Self {
            registrar,
            secrets,
            metrics,
            registered_path: None,
        }
    }

    async fn resolve_auth(
        &self,
        config: &SourceConfig,
    ) -> Result<Option<ResolvedAuth>, ZenError> {
        let Some(auth) = config.webhook.as_ref().and_then(|w| w.auth.as_ref()) else {
            return Ok(None);
        };
        match auth.auth_type {
            WebhookAuthType::Bearer => {
                let token = self.secrets.read_key(&auth.secret_ref, "token").await?;
                Ok(Some(ResolvedAuth::Bearer(token)))
            }
            WebhookAuthType::Basic => {
                // The secret key holds `username:password`; the password may
                // be a bcrypt hash.
                let material = self.secrets.read_key(&auth.secret_ref, "auth").await?;
                let (username, password) = material.split_once(':').ok_or_else(|| {
                    ZenError::Validation(format!(
                        "basic auth secret '{}' is not username:password",
                        auth.secret_ref.name
                    ))
                })?;
                Ok(Some(ResolvedAuth::Basic {
                    username: username.to_string(),
                    password: password.to_string(),
                }))
            }
        }
    }
}

#[async_trait]
impl SourceAdapter for WebhookAdapter {
    async fn start(&mut self, config: &SourceConfig) -> Result<mpsc::Receiver<RawEvent>, ZenError> {
        let params = config.webhook.clone().ok_or_else(|| {
            ZenError::Validation(format!("source '{}' has no webhook block", config.name))
        })?;
        let auth = self.resolve_auth(config).await?;
        if auth.is_none() {
            warn!(source = %config.name, path = %params.path, "Webhook endpoint has no auth configured");
        }

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let handler = Arc::new(WebhookHandler {
            source: config.name.clone(),
            path: params.path.clone(),
            auth,
            rate: params
                .rate_limit
                .as_ref()
                .map(|r| RateLimiter::new(r.requests_per_minute)),
            tx,
            metrics: self.metrics.clone(),
        });

        self.registrar.register(&params.path, handler)?;
        self.registered_path = Some(params.path.clone());
        info!(source = %config.name, path = %params.path, "Webhook adapter started");
        Ok(rx)
    }

    async fn stop(&mut self) {
        if let Some(path) = self.registered_path.take() {
            // Unregistering drops the handler and with it the only sender:
            // the channel closes exactly once.
            self.registrar.unregister(&path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler(auth: Option<ResolvedAuth>, rate: Option<u32>) -> (WebhookHandler, mpsc::Receiver<RawEvent>) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        (
            WebhookHandler {
                source: "test".to_string(),
                path: "/hooks/test".to_string(),
                auth,
                rate: rate.map(RateLimiter::new),
                tx,
                metrics: Metrics::unregistered().unwrap(),
            },
            rx,
        )
    }

    #[test]
    fn missing_and_wrong_bearer_are_unauthorized() {
        let (h, _rx) = handler(Some(ResolvedAuth::Bearer("sekrit".to_string())), None);
        assert_eq!(h.handle(None, b"{}"), WebhookResponse::Unauthorized);
        assert_eq!(
            h.handle(Some("Bearer wrong"), b"{}"),
            WebhookResponse::Unauthorized
        );
        assert_eq!(
            h.handle(Some("Bearer sekrit"), b"{}"),
            WebhookResponse::Accepted
        );
    }

    #[test]
    fn basic_auth_with_bcrypt_hash_verifies() {
        let hash = bcrypt::hash("hunter2", 4).unwrap();
        let (h, _rx) = handler(
            Some(ResolvedAuth::Basic {
                username: "falco".to_string(),
                password: hash,
            }),
            None,
        );
        let good = base64::engine::general_purpose::STANDARD.encode("falco:hunter2");
        let bad = base64::engine::general_purpose::STANDARD.encode("falco:wrong");
        assert_eq!(
            h.handle(Some(&format!("Basic {good}")), b"{}"),
            WebhookResponse::Accepted
        );
        assert_eq!(
            h.handle(Some(&format!("Basic {bad}")), b"{}"),
            WebhookResponse::Unauthorized
        );
    }

    #[test]
    fn rate_limit_returns_429_on_excess() {
        let (h, _rx) = handler(None, Some(3));
        for _ in 0..3 {
            assert_eq!(h.handle(None, b"{}"), WebhookResponse::Accepted);
        }
        assert_eq!(h.handle(None, b"{}"), WebhookResponse::RateLimited);
    }

    #[test]
    fn malformed_body_is_bad_request() {
        let (h, _rx) = handler(None, None);
        assert_eq!(h.handle(None, b"not json"), WebhookResponse::BadRequest);
        assert_eq!(h.handle(None, b"[1,2,3]"), WebhookResponse::BadRequest);
    }

    #[tokio::test]
    async fn accepted_body_lands_in_channel() {
        let (h, mut rx) = handler(None, None);
        let body = br#"{"severity": "HIGH", "rule": "shell-in-container"}"#;
        assert_eq!(h.handle(None, body), WebhookResponse::Accepted);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.source, "test");
        assert_eq!(event.raw_data["rule"], "shell-in-container");
    }
}
