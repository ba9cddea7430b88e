//! The RFC 6962 client: `get-sth`, `get-entries`, `get-sth-consistency`.
//!
//! Transport failures are classified at a single seam: 4xx responses are
//! fatal and surface immediately, while 5xx, connection failures, empty
//! bodies, and malformed JSON are retried with capped exponential backoff
//! until the attempt budget runs out. Each log descriptor yields an
//! independent client; there is no shared mutable state.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use tokio::time::sleep;
use tracing::warn;

use crate::error::MirrorError;
use crate::logs::LogDescriptor;
use crate::sth::SignedTreeHead;
use crate::Hash;

/// One entry as returned by `get-entries`, still undecoded.
#[derive(Debug, Clone)]
pub struct RawEntry {
    pub leaf_input: Vec<u8>,
    pub extra_data: Vec<u8>,
}

/// The three log operations the mirror consumes. The HTTP implementation
/// lives below; tests drive the sync machinery through in-memory fakes.
#[async_trait]
pub trait LogTransport: Send + Sync {
    async fn get_sth(&self) -> Result<SignedTreeHead, MirrorError>;

    /// Fetch entries `start..=end`. Servers may return any non-empty prefix
    /// of the requested range; callers own re-requesting the tail.
    async fn get_entries(&self, start: u64, end: u64) -> Result<Vec<RawEntry>, MirrorError>;

    async fn get_sth_consistency(
        &self,
        first: u64,
        second: u64,
    ) -> Result<Vec<Hash>, MirrorError>;
}

#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub request_timeout: Duration,
    /// Total attempts per request, transient failures included.
    pub max_attempts: u32,
    pub backoff_cap: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(60),
            max_attempts: 5,
            backoff_cap: Duration::from_secs(60),
        }
    }
}

/// Outcome of a single request attempt.
enum Attempt<T> {
    Done(T),
    Transient(String),
    Fatal(MirrorError),
}

/// Drive `attempt_fn` until it succeeds, fails fatally, or exhausts the
/// budget. Backoff starts at one second and doubles up to the cap.
async fn retry<T, F, Fut>(
    url: String,
    options: &TransportOptions,
    mut attempt_fn: F,
) -> Result<T, MirrorError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Attempt<T>>,
{
    let mut backoff = Duration::from_secs(1);
    let mut last = String::from("no attempts made");
    for attempt in 1..=options.max_attempts {
        match attempt_fn().await {
            Attempt::Done(value) => return Ok(value),
            Attempt::Fatal(err) => return Err(err),
            Attempt::Transient(reason) => last = reason,
        }
        if attempt < options.max_attempts {
            warn!(url = %url, attempt, error = %last, "transient failure, backing off");
            sleep(backoff).await;
            backoff = (backoff * 2).min(options.backoff_cap);
        }
    }
    Err(MirrorError::TransientNetwork {
        url,
        attempts: options.max_attempts,
        reason: last,
    })
}

/// HTTPS client for one log.
pub struct HttpLogClient {
    base_url: String,
    http: reqwest::Client,
    options: TransportOptions,
}

impl HttpLogClient {
    pub fn new(log: &LogDescriptor, options: TransportOptions) -> Result<Self, MirrorError> {
        let http = reqwest::Client::builder()
            .timeout(options.request_timeout)
            .build()
            .map_err(|e| MirrorError::Config(format!("building HTTP client: {e}")))?;
        Ok(Self {
            base_url: log.base_url.clone(),
            http,
            options,
        })
    }

    fn endpoint(&self, op: &str) -> String {
        format!("{}/ct/v1/{op}", self.base_url)
    }

    /// One GET attempt: 4xx is fatal, everything else that is not a parsed
    /// 200 body is transient.
    async fn get_once<T>(
        &self,
        url: &str,
        parse: impl Fn(&[u8]) -> Result<T, String>,
    ) -> Attempt<T> {
        let response = match self.http.get(url).send().await {
            Ok(response) => response,
            Err(e) => return Attempt::Transient(format!("request failed: {e}")),
        };
        let status = response.status();
        if status.is_client_error() {
            return Attempt::Fatal(MirrorError::HttpClient {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        if !status.is_success() {
            return Attempt::Transient(format!("status {status}"));
        }
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => return Attempt::Transient(format!("reading body: {e}")),
        };
        if body.is_empty() {
            return Attempt::Transient("empty response body".into());
        }
        match parse(&body) {
            Ok(value) => Attempt::Done(value),
            Err(reason) => Attempt::Transient(reason),
        }
    }
}

#[derive(Deserialize)]
struct GetEntriesResponse {
    entries: Vec<WireEntry>,
}

#[derive(Deserialize)]
struct WireEntry {
    #[serde(with = "crate::b64bytes")]
    leaf_input: Vec<u8>,
    #[serde(default, with = "crate::b64bytes")]
    extra_data: Vec<u8>,
}

#[derive(Deserialize)]
struct GetConsistencyResponse {
    consistency: Vec<String>,
}

#[async_trait]
impl LogTransport for HttpLogClient {
    async fn get_sth(&self) -> Result<SignedTreeHead, MirrorError> {
        let url = self.endpoint("get-sth");
        retry(url.clone(), &self.options, || {
            self.get_once(&url, |body| {
                serde_json::from_slice(body).map_err(|e| format!("malformed STH: {e}"))
            })
        })
        .await
    }

    async fn get_entries(&self, start: u64, end: u64) -> Result<Vec<RawEntry>, MirrorError> {
        let url = format!("{}?start={start}&end={end}", self.endpoint("get-entries"));
        retry(url.clone(), &self.options, || {
            self.get_once(&url, |body| {
                let parsed: GetEntriesResponse =
                    serde_json::from_slice(body).map_err(|e| format!("malformed entries: {e}"))?;
                if parsed.entries.is_empty() {
                    return Err("log returned no entries".into());
                }
                Ok(parsed
                    .entries
                    .into_iter()
                    .map(|e| RawEntry {
                        leaf_input: e.leaf_input,
                        extra_data: e.extra_data,
                    })
                    .collect())
            })
        })
        .await
    }

    async fn get_sth_consistency(
        &self,
        first: u64,
        second: u64,
    ) -> Result<Vec<Hash>, MirrorError> {
        let url = format!(
            "{}?first={first}&second={second}",
            self.endpoint("get-sth-consistency")
        );
        retry(url.clone(), &self.options, || {
            self.get_once(&url, |body| {
                let parsed: GetConsistencyResponse =
                    serde_json::from_slice(body).map_err(|e| format!("malformed proof: {e}"))?;
                parsed
                    .consistency
                    .iter()
                    .map(|node| {
                        let bytes = BASE64
                            .decode(node.as_bytes())
                            .map_err(|e| format!("proof node is not base64: {e}"))?;
                        Hash::try_from(bytes.as_slice())
                            .map_err(|_| "proof node is not 32 bytes".to_string())
                    })
                    .collect()
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn options(max_attempts: u32) -> TransportOptions {
        TransportOptions {
            request_timeout: Duration::from_secs(1),
            max_attempts,
            backoff_cap: Duration::from_secs(4),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retry_recovers_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = retry("u".into(), &options(5), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Attempt::Transient(format!("503 on attempt {n}"))
                } else {
                    Attempt::Done(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_gives_up_after_the_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry("u".into(), &options(3), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Attempt::Transient("still down".into()) }
        })
        .await;
        assert!(matches!(
            result,
            Err(MirrorError::TransientNetwork { attempts: 3, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_stops_on_fatal_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry("u".into(), &options(5), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Attempt::Fatal(MirrorError::HttpClient {
                    status: 404,
                    url: "u".into(),
                })
            }
        })
        .await;
        assert!(matches!(
            result,
            Err(MirrorError::HttpClient { status: 404, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn entries_wire_format_decodes() {
        let body = format!(
            r#"{{"entries":[{{"leaf_input":"{}","extra_data":"{}"}}]}}"#,
            BASE64.encode(b"leaf"),
            BASE64.encode(b"extra"),
        );
        let parsed: GetEntriesResponse = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed.entries.len(), 1);
        assert_eq!(parsed.entries[0].leaf_input, b"leaf");
        assert_eq!(parsed.entries[0].extra_data, b"extra");
    }
}
