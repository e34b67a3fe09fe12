//! HTTPS delivery client: transport-security validation, typed request
//! bodies, and a bounded retry loop with exponential backoff and jitter.

use reqwest::header::CONTENT_TYPE;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::net::IpAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::config::Config;
use crate::error::ClientError;
use crate::retry::{self, AttemptOutcome, RetryState};
use crate::types::{BatchResponse, EnrollResponse, IngestResponse, Snapshot};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_RESPONSE_BYTES: usize = 1 << 20;

/// One HTTP attempt. The seam lets tests script status sequences without a
/// network.
pub trait HttpPost {
    async fn post(
        &self,
        url: &str,
        body: &[u8],
        bearer: Option<&str>,
    ) -> Result<HttpResponse, TransportError>;
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

/// Transport failures, split by whether another attempt makes sense.
#[derive(Debug, Clone)]
pub enum TransportError {
    Retryable(String),
    Fatal(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_body() {
            TransportError::Retryable(err.to_string())
        } else {
            TransportError::Fatal(err.to_string())
        }
    }
}

pub struct ReqwestHttp {
    inner: reqwest::Client,
}

impl ReqwestHttp {
    fn new() -> Self {
        let inner = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to build HTTP client");
        Self { inner }
    }
}

impl HttpPost for ReqwestHttp {
    async fn post(
        &self,
        url: &str,
        body: &[u8],
        bearer: Option<&str>,
    ) -> Result<HttpResponse, TransportError> {
        let mut request = self
            .inner
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_vec());
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(TransportError::from)?;
        let status = response.status().as_u16();
        let bytes = response.bytes().await.map_err(TransportError::from)?;
        let capped = &bytes[..bytes.len().min(MAX_RESPONSE_BYTES)];
        Ok(HttpResponse {
            status,
            body: String::from_utf8_lossy(capped).trim().to_string(),
        })
    }
}

#[derive(Serialize)]
struct BatchRequest<'a> {
    snapshots: &'a [Snapshot],
}

#[derive(Serialize)]
struct EnrollRequest<'a> {
    token: &'a str,
    hostname: &'a str,
}

pub struct Client<T = ReqwestHttp> {
    transport: T,
    server_url: String,
    host_token: String,
    allow_insecure_localhost: bool,
    max_retries: u32,
    backoff_base: Duration,
}

impl Client<ReqwestHttp> {
    pub fn new(cfg: &Config, allow_insecure_localhost: bool) -> Self {
        Self::with_transport(ReqwestHttp::new(), cfg, allow_insecure_localhost)
    }
}

impl<T: HttpPost> Client<T> {
    pub fn with_transport(transport: T, cfg: &Config, allow_insecure_localhost: bool) -> Self {
        Self {
            transport,
            server_url: cfg.server_url.trim_end_matches('/').to_string(),
            host_token: cfg.host_token.clone(),
            allow_insecure_localhost,
            max_retries: retry::MAX_RETRIES,
            backoff_base: retry::DEFAULT_BACKOFF_BASE,
        }
    }

    pub async fn send_snapshot(
        &self,
        snapshot: &Snapshot,
        cancel: &CancellationToken,
    ) -> Result<IngestResponse, ClientError> {
        self.validate_server_url()?;
        self.post_json("/v1/ingest", snapshot, true, cancel).await
    }

    pub async fn send_batch(
        &self,
        snapshots: &[Snapshot],
        cancel: &CancellationToken,
    ) -> Result<BatchResponse, ClientError> {
        self.validate_server_url()?;
        let request = BatchRequest { snapshots };
        self.post_json("/v1/ingest/batch", &request, true, cancel)
            .await
    }

    /// Unauthenticated one-shot handshake trading an enrollment token for a
    /// host identity.
    pub async fn enroll(
        &self,
        token: &str,
        hostname: &str,
        cancel: &CancellationToken,
    ) -> Result<EnrollResponse, ClientError> {
        self.validate_server_url()?;
        let request = EnrollRequest { token, hostname };
        self.post_json("/v1/enroll", &request, false, cancel).await
    }

    /// `https` passes; `http` passes only towards loopback with the explicit
    /// opt-in. Anything else fails before any network I/O.
    fn validate_server_url(&self) -> Result<(), ClientError> {
        let parsed = Url::parse(&self.server_url)?;
        match parsed.scheme() {
            "https" => Ok(()),
            "http" if self.allow_insecure_localhost && is_loopback_host(&parsed) => Ok(()),
            _ => Err(ClientError::InsecureTransport(self.server_url.clone())),
        }
    }

    async fn post_json<B: Serialize, R: DeserializeOwned + Default>(
        &self,
        path: &str,
        request: &B,
        with_auth: bool,
        cancel: &CancellationToken,
    ) -> Result<R, ClientError> {
        let encoded = serde_json::to_vec(request)?;
        let url = format!("{}{}", self.server_url, path);
        let bearer = with_auth.then_some(self.host_token.as_str());

        let mut state = RetryState::Attempting(0);
        loop {
            match state {
                RetryState::Attempting(attempt) => {
                    let result = tokio::select! {
                        _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                        result = self.transport.post(&url, &encoded, bearer) => result,
                    };

                    match result {
                        Ok(response) => {
                            let outcome = retry::classify_status(response.status);
                            state = state.on_outcome(outcome, self.max_retries);
                            match state {
                                RetryState::Succeeded => return decode_body(&response.body),
                                RetryState::FailedRetryable | RetryState::FailedFatal => {
                                    return Err(ClientError::Http {
                                        status: response.status,
                                        body: response.body,
                                    });
                                }
                                _ => {
                                    debug!(attempt, path, status = response.status, "backing off");
                                }
                            }
                        }
                        Err(TransportError::Fatal(message)) => {
                            return Err(ClientError::Transport(message));
                        }
                        Err(TransportError::Retryable(message)) => {
                            state =
                                state.on_outcome(AttemptOutcome::RetryableTransport, self.max_retries);
                            if state == RetryState::FailedRetryable {
                                return Err(ClientError::Transport(message));
                            }
                            debug!(attempt, path, error = %message, "backing off");
                        }
                    }
                }
                RetryState::Backoff(attempt) => {
                    let delay = retry::backoff_delay(self.backoff_base, attempt);
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    state = state.next_attempt();
                }
                RetryState::Succeeded
                | RetryState::FailedRetryable
                | RetryState::FailedFatal
                | RetryState::Cancelled => {
                    unreachable!("terminal outcomes return from the attempt arm")
                }
            }
        }
    }
}

fn decode_body<R: DeserializeOwned + Default>(body: &str) -> Result<R, ClientError> {
    if body.trim().is_empty() {
        return Ok(R::default());
    }
    Ok(serde_json::from_str(body)?)
}

fn is_loopback_host(url: &Url) -> bool {
    match url.host() {
        Some(url::Host::Domain(host)) => {
            host.eq_ignore_ascii_case("localhost")
                || host
                    .parse::<IpAddr>()
                    .map(|ip| ip.is_loopback())
                    .unwrap_or(false)
        }
        Some(url::Host::Ipv4(ip)) => ip.is_loopback(),
        Some(url::Host::Ipv6(ip)) => ip.is_loopback(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::test_snapshot;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    struct ScriptedHttp {
        script: Mutex<VecDeque<Result<HttpResponse, TransportError>>>,
        calls: Arc<AtomicUsize>,
        bearers: Arc<Mutex<Vec<Option<String>>>>,
    }

    impl HttpPost for ScriptedHttp {
        async fn post(
            &self,
            _url: &str,
            _body: &[u8],
            bearer: Option<&str>,
        ) -> Result<HttpResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.bearers
                .lock()
                .unwrap()
                .push(bearer.map(str::to_string));
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(TransportError::Fatal("script exhausted".into())))
        }
    }

    struct Probe {
        calls: Arc<AtomicUsize>,
        bearers: Arc<Mutex<Vec<Option<String>>>>,
    }

    fn scripted_client(
        script: Vec<Result<HttpResponse, TransportError>>,
        server_url: &str,
        allow_insecure: bool,
    ) -> (Client<ScriptedHttp>, Probe) {
        let calls = Arc::new(AtomicUsize::new(0));
        let bearers = Arc::new(Mutex::new(Vec::new()));
        let transport = ScriptedHttp {
            script: Mutex::new(script.into()),
            calls: calls.clone(),
            bearers: bearers.clone(),
        };
        let cfg = Config {
            host_token: "bearer-token".to_string(),
            server_url: server_url.to_string(),
            ..Config::default()
        };
        let mut client = Client::with_transport(transport, &cfg, allow_insecure);
        client.backoff_base = Duration::from_millis(1);
        (client, Probe { calls, bearers })
    }

    fn ok(status: u16, body: &str) -> Result<HttpResponse, TransportError> {
        Ok(HttpResponse {
            status,
            body: body.to_string(),
        })
    }

    #[tokio::test]
    async fn retries_through_retryable_statuses_and_returns_the_final_body() {
        let (client, probe) = scripted_client(
            vec![
                ok(503, "busy"),
                ok(503, "busy"),
                ok(503, "busy"),
                ok(200, "{\"status\":\"ok\",\"clockSkew\":true}"),
            ],
            "https://ingest.example.com",
            false,
        );

        let response = client
            .send_snapshot(&test_snapshot("h"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(response.clock_skew);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn fatal_status_fails_with_zero_additional_attempts() {
        let (client, probe) = scripted_client(
            vec![ok(400, "bad payload")],
            "https://ingest.example.com",
            false,
        );

        let err = client
            .send_snapshot(&test_snapshot("h"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Http { status: 400, .. }));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_the_last_retryable_outcome() {
        let (client, probe) = scripted_client(
            vec![
                ok(503, "a"),
                ok(502, "b"),
                ok(500, "c"),
                ok(503, "last words"),
            ],
            "https://ingest.example.com",
            false,
        );

        let err = client
            .send_snapshot(&test_snapshot("h"), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            ClientError::Http { status, body } => {
                assert_eq!(status, 503);
                assert_eq!(body, "last words");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(probe.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn retryable_transport_error_then_success() {
        let (client, probe) = scripted_client(
            vec![
                Err(TransportError::Retryable("connection refused".into())),
                ok(200, ""),
            ],
            "https://ingest.example.com",
            false,
        );

        let response = client
            .send_snapshot(&test_snapshot("h"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!response.clock_skew);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn plain_http_to_a_public_address_fails_before_any_request() {
        // the allow flag must not rescue a non-loopback http endpoint
        let (client, probe) =
            scripted_client(vec![ok(200, "")], "http://203.0.113.5/ingest", true);

        let err = client
            .send_snapshot(&test_snapshot("h"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::InsecureTransport(_)));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn loopback_http_requires_the_explicit_opt_in() {
        for host in ["http://127.0.0.1:9000", "http://localhost:9000", "http://[::1]:9000"] {
            let (client, probe) = scripted_client(vec![ok(200, "")], host, true);
            client
                .send_snapshot(&test_snapshot("h"), &CancellationToken::new())
                .await
                .unwrap();
            assert_eq!(probe.calls.load(Ordering::SeqCst), 1);

            let (client, probe) = scripted_client(vec![ok(200, "")], host, false);
            let err = client
                .send_snapshot(&test_snapshot("h"), &CancellationToken::new())
                .await
                .unwrap_err();
            assert!(matches!(err, ClientError::InsecureTransport(_)));
            assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
        }
    }

    #[tokio::test]
    async fn undecodable_success_body_is_a_codec_error_without_retry() {
        let (client, probe) = scripted_client(
            vec![ok(200, "definitely not json")],
            "https://ingest.example.com",
            false,
        );

        let err = client
            .send_snapshot(&test_snapshot("h"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Codec(_)));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_success_body_decodes_to_the_default_response() {
        let (client, _probe) =
            scripted_client(vec![ok(204, "")], "https://ingest.example.com", false);
        let response = client
            .send_snapshot(&test_snapshot("h"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(response.status.is_empty());
        assert!(!response.clock_skew);
    }

    #[tokio::test]
    async fn cancellation_stops_the_loop_with_a_distinguished_error() {
        let (client, _probe) = scripted_client(
            vec![
                Err(TransportError::Retryable("slow".into())),
                Err(TransportError::Retryable("slow".into())),
            ],
            "https://ingest.example.com",
            false,
        );
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = client
            .send_snapshot(&test_snapshot("h"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Cancelled));
    }

    #[tokio::test]
    async fn ingest_carries_the_bearer_token_and_enroll_does_not() {
        let (client, probe) = scripted_client(
            vec![
                ok(200, "{\"status\":\"ok\"}"),
                ok(200, "{\"hostId\":\"h-9\",\"hostToken\":\"t-9\"}"),
            ],
            "https://ingest.example.com",
            false,
        );
        let cancel = CancellationToken::new();

        client
            .send_snapshot(&test_snapshot("h"), &cancel)
            .await
            .unwrap();
        let enrolled = client.enroll("one-time", "web-01", &cancel).await.unwrap();
        assert_eq!(enrolled.host_id, "h-9");

        let bearers = probe.bearers.lock().unwrap();
        assert_eq!(bearers[0].as_deref(), Some("bearer-token"));
        assert_eq!(bearers[1], None);
    }

    #[tokio::test]
    async fn batch_send_wraps_snapshots_in_the_batch_request_shape() {
        let (client, _probe) = scripted_client(
            vec![ok(
                200,
                "{\"status\":\"ok\",\"accepted\":2,\"rejected\":0,\"errors\":[]}",
            )],
            "https://ingest.example.com",
            false,
        );

        let snapshots = vec![test_snapshot("a"), test_snapshot("b")];
        let response = client
            .send_batch(&snapshots, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.accepted, 2);
        assert_eq!(response.rejected, 0);
    }

    #[test]
    fn batch_request_serializes_under_the_snapshots_key() {
        let snapshots = vec![test_snapshot("a")];
        let body = serde_json::to_value(BatchRequest {
            snapshots: &snapshots,
        })
        .unwrap();
        assert!(body["snapshots"].is_array());
        assert_eq!(body["snapshots"][0]["hostname"], "a");
    }

    #[test]
    fn trailing_slashes_are_trimmed_from_the_server_url() {
        let cfg = Config {
            server_url: "https://ingest.example.com///".to_string(),
            ..Config::default()
        };
        let calls = Arc::new(AtomicUsize::new(0));
        let client = Client::with_transport(
            ScriptedHttp {
                script: Mutex::new(VecDeque::new()),
                calls: calls.clone(),
                bearers: Arc::new(Mutex::new(Vec::new())),
            },
            &cfg,
            false,
        );
        assert_eq!(client.server_url, "https://ingest.example.com");
    }
}
