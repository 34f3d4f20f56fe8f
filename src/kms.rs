//! Remote KMS-style signing backend.
//!
//! Talks to a key-management signing service over HTTPS: the private key
//! never reaches this process. Carries retry with jittered backoff and a
//! circuit breaker so a flapping backend fails fast instead of piling up
//! request latency.
//!
//! Env: `RELAYER_SIGNER_MODE=kms`, plus `signer.kms_url` / `signer.kms_key_id`
//! in configuration.

use alloy::primitives::{Address, Signature, B256};
use rand::Rng;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{info, warn};

use crate::error::Error;

const KMS_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const KMS_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const KMS_MAX_RETRIES: u32 = 3;
const KMS_RETRY_BASE_MS: u64 = 100;
const KMS_CIRCUIT_THRESHOLD: u64 = 15;
const KMS_CIRCUIT_RECOVERY_SECS: u64 = 30;

#[derive(Deserialize)]
struct KeyInfoResponse {
    address: Address,
}

#[derive(Deserialize)]
struct SignResponse {
    signature: String,
}

/// Transient HTTP errors worth retrying.
fn is_retryable(status: reqwest::StatusCode) -> bool {
    matches!(status.as_u16(), 408 | 429 | 500 | 502 | 503 | 504)
}

/// Remote signer client with circuit breaker and retry logic.
pub struct KmsSigner {
    http: reqwest::Client,
    base_url: String,
    key_id: String,
    address: Address,
    cb_failures: AtomicU64,
    cb_last_failure: AtomicU64,
}

impl KmsSigner {
    /// Connect to the signing service and resolve the key's address. The
    /// address fetch is mandatory at startup; afterwards it is served from
    /// this cached copy.
    pub async fn connect(base_url: &str, key_id: &str) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(KMS_REQUEST_TIMEOUT)
            .connect_timeout(KMS_CONNECT_TIMEOUT)
            .pool_max_idle_per_host(4)
            .build()
            .map_err(|e| Error::Config(format!("HTTP client build failed: {e}")))?;

        let url = format!("{}/keys/{}", base_url.trim_end_matches('/'), key_id);
        let mut last_err = None;
        for attempt in 0..KMS_MAX_RETRIES {
            if attempt > 0 {
                tokio::time::sleep(retry_delay(attempt)).await;
            }
            match http.get(&url).send().await {
                Ok(response) if response.status().is_success() => {
                    let info: KeyInfoResponse = response.json().await.map_err(|e| {
                        Error::Config(format!("KMS key info malformed: {e}"))
                    })?;
                    info!(key_id, address = %info.address, "KMS signer connected");
                    return Ok(Self {
                        http,
                        base_url: base_url.trim_end_matches('/').to_string(),
                        key_id: key_id.to_string(),
                        address: info.address,
                        cb_failures: AtomicU64::new(0),
                        cb_last_failure: AtomicU64::new(0),
                    });
                }
                Ok(response) => {
                    last_err = Some(Error::Config(format!(
                        "KMS key info: HTTP {}",
                        response.status()
                    )));
                }
                Err(e) => {
                    warn!(attempt, error = %e, "KMS key info request failed (retrying)");
                    last_err = Some(Error::SignerUnavailable(format!("KMS key info: {e}")));
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Config("KMS unreachable".into())))
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn is_circuit_open(&self) -> bool {
        let failures = self.cb_failures.load(Ordering::Relaxed);
        if failures < KMS_CIRCUIT_THRESHOLD {
            return false;
        }
        let last = self.cb_last_failure.load(Ordering::Relaxed);
        if now_secs() - last > KMS_CIRCUIT_RECOVERY_SECS {
            return false; // half-open: retry after recovery window
        }
        true
    }

    fn record_success(&self) {
        let prev = self.cb_failures.swap(0, Ordering::Relaxed);
        if prev >= KMS_CIRCUIT_THRESHOLD {
            info!("KMS circuit breaker recovered");
        }
    }

    fn record_failure(&self) {
        let failures = self.cb_failures.fetch_add(1, Ordering::Relaxed) + 1;
        self.cb_last_failure.store(now_secs(), Ordering::Relaxed);
        if failures == KMS_CIRCUIT_THRESHOLD {
            warn!(
                failures,
                "KMS circuit breaker OPEN, signing will fail fast for {}s",
                KMS_CIRCUIT_RECOVERY_SECS
            );
        }
    }

    /// Check backend connectivity. Used by /health and /ready.
    pub async fn health_check(&self) -> Result<(), Error> {
        if self.is_circuit_open() {
            return Err(Error::SignerUnavailable("KMS circuit breaker is open".into()));
        }
        let url = format!("{}/keys/{}", self.base_url, self.key_id);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::SignerUnavailable(format!("KMS health: {e}")))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Error::SignerUnavailable(format!(
                "KMS health: HTTP {}",
                response.status()
            )))
        }
    }

    /// Sign a 32-byte digest. Retries transient failures with jittered
    /// backoff; a denial (401/403) is fatal for the request and is not
    /// retried.
    pub async fn sign_digest(&self, digest: B256) -> Result<Signature, Error> {
        if self.is_circuit_open() {
            return Err(Error::SignerUnavailable("KMS circuit breaker is open".into()));
        }

        let url = format!("{}/keys/{}/sign", self.base_url, self.key_id);
        let body = serde_json::json!({ "digest": format!("{digest:#x}") });

        let mut last_err = None;
        for attempt in 0..KMS_MAX_RETRIES {
            if attempt > 0 {
                tokio::time::sleep(retry_delay(attempt)).await;
            }

            let response = match self.http.post(&url).json(&body).send().await {
                Ok(r) => r,
                Err(e) => {
                    warn!(attempt, error = %e, "KMS sign request failed (retrying)");
                    self.record_failure();
                    last_err = Some(Error::SignerUnavailable(format!("KMS sign: {e}")));
                    continue;
                }
            };

            let status = response.status();
            if status == reqwest::StatusCode::UNAUTHORIZED
                || status == reqwest::StatusCode::FORBIDDEN
            {
                self.record_failure();
                return Err(Error::Internal("signing denied by KMS backend".into()));
            }
            if !status.is_success() {
                self.record_failure();
                let err = Error::SignerUnavailable(format!("KMS sign: HTTP {status}"));
                if is_retryable(status) {
                    last_err = Some(err);
                    continue;
                }
                return Err(err);
            }

            let signed: SignResponse = match response.json().await {
                Ok(s) => s,
                Err(e) => {
                    self.record_failure();
                    last_err = Some(Error::SignerUnavailable(format!("KMS sign body: {e}")));
                    continue;
                }
            };
            let bytes = signed
                .signature
                .strip_prefix("0x")
                .and_then(|h| alloy::hex::decode(h).ok())
                .ok_or_else(|| Error::Internal("KMS returned malformed signature hex".into()))?;
            let signature = Signature::from_raw(&bytes)
                .map_err(|e| Error::Internal(format!("KMS returned bad signature: {e}")))?;
            self.record_success();
            return Ok(signature);
        }

        Err(last_err.unwrap_or_else(|| Error::SignerUnavailable("KMS sign exhausted".into())))
    }
}

fn retry_delay(attempt: u32) -> Duration {
    let base = KMS_RETRY_BASE_MS * 2u64.pow(attempt);
    let jitter = rand::thread_rng().gen_range(0..=base / 2);
    Duration::from_millis(base + jitter)
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
