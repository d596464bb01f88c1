//! Per-domain certificate renewal.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rcgen::KeyPair;
use time::OffsetDateTime;
use tokio::time::sleep;
use tracing::{debug, error, info};

use crate::acme_client::{read_pem, IssueApi};
use crate::cache::{self, CertCache};

/// Renew when the certificate has less than this long to live.
const RENEW_BEFORE: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Floor between two renewal checks for an active certificate.
const MIN_CHECK_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// First retry delay after a failed exchange.
const BACKOFF_INITIAL: Duration = Duration::from_secs(60);

/// Retry delay ceiling.
const BACKOFF_MAX: Duration = Duration::from_secs(60 * 60);

/// Bound on one full ACME exchange.
const ISSUE_TIMEOUT: Duration = Duration::from_secs(120);

/// Where a domain's renewal loop currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RenewalState {
    /// Inspect the cache and decide what to do next.
    Check { attempt: u32 },
    /// No usable bundle; issue with a fresh key.
    Requesting { attempt: u32 },
    /// Bundle expiring soon; reissue with the cached key.
    Renewing { attempt: u32 },
    /// Bundle valid until `not_after`; sleep until the renewal window opens.
    Active { not_after: OffsetDateTime },
    /// Last exchange failed; wait before trying again.
    Backoff { attempt: u32 },
}

/// One domain's renewal task, the sole writer of that domain's bundle.
pub(crate) struct RenewalTask<I> {
    domain: String,
    cache: CertCache,
    issuer: Arc<I>,
}

impl<I: IssueApi> RenewalTask<I> {
    pub fn new(domain: String, cache: CertCache, issuer: Arc<I>) -> Self {
        Self {
            domain,
            cache,
            issuer,
        }
    }

    /// Drive the state machine indefinitely.
    pub async fn run(self) {
        info!("started renewal task for: {}", self.domain);
        let mut state = RenewalState::Check { attempt: 0 };
        loop {
            state = self.step(state).await;
        }
    }

    /// Advance the state machine by one transition.
    async fn step(&self, state: RenewalState) -> RenewalState {
        match state {
            RenewalState::Check { attempt } => self.check(attempt),
            RenewalState::Requesting { attempt } => match self.issue(false).await {
                Ok(not_after) => RenewalState::Active { not_after },
                Err(err) => {
                    error!("failed to issue certificate for {}: {err:#}", self.domain);
                    RenewalState::Backoff { attempt }
                }
            },
            RenewalState::Renewing { attempt } => match self.issue(true).await {
                Ok(not_after) => RenewalState::Active { not_after },
                Err(err) => {
                    error!("failed to renew certificate for {}: {err:#}", self.domain);
                    RenewalState::Backoff { attempt }
                }
            },
            RenewalState::Active { not_after } => {
                sleep(next_check_delay(not_after, OffsetDateTime::now_utc())).await;
                RenewalState::Check { attempt: 0 }
            }
            RenewalState::Backoff { attempt } => {
                sleep(backoff_delay(attempt)).await;
                RenewalState::Check {
                    attempt: attempt.saturating_add(1),
                }
            }
        }
    }

    fn check(&self, attempt: u32) -> RenewalState {
        if !self.cache.exists(&cache::key_name(&self.domain))
            || !self.cache.exists(&cache::cert_name(&self.domain))
        {
            return RenewalState::Requesting { attempt };
        }
        match self
            .cache
            .read(&cache::cert_name(&self.domain))
            .and_then(|pem| cert_not_after(&pem))
        {
            Ok(not_after) if !renewal_due(not_after, OffsetDateTime::now_utc()) => {
                debug!("certificate for {} is up to date", self.domain);
                RenewalState::Active { not_after }
            }
            Ok(_) => RenewalState::Renewing { attempt },
            Err(err) => {
                debug!("unreadable certificate for {}: {err:#}", self.domain);
                RenewalState::Renewing { attempt }
            }
        }
    }

    /// Run one bounded ACME exchange and install the resulting bundle.
    async fn issue(&self, reuse_key: bool) -> Result<OffsetDateTime> {
        let key_pem = match reuse_key {
            true => match self.cache.read(&cache::key_name(&self.domain)) {
                Ok(key_pem) => key_pem,
                Err(err) => {
                    debug!("unreadable key for {}, generating anew: {err:#}", self.domain);
                    fresh_key()?
                }
            },
            false => fresh_key()?,
        };
        let cert_pem = tokio::time::timeout(
            ISSUE_TIMEOUT,
            self.issuer.issue_certificate(&key_pem, &self.domain),
        )
        .await
        .context("requesting cert timeout")??;
        let not_after = cert_not_after(&cert_pem)?;
        self.cache.write_bundle(&self.domain, &key_pem, &cert_pem)?;
        info!(
            "installed certificate for {}, expires {not_after}",
            self.domain
        );
        Ok(not_after)
    }
}

fn fresh_key() -> Result<String> {
    Ok(KeyPair::generate()
        .context("failed to generate key")?
        .serialize_pem())
}

/// Expiry of the first certificate in `cert_pem`.
fn cert_not_after(cert_pem: &str) -> Result<OffsetDateTime> {
    let pem = read_pem(cert_pem)?;
    let cert = pem.parse_x509().context("Invalid x509 certificate")?;
    Ok(cert.validity().not_after.to_datetime())
}

/// Whether a certificate expiring at `not_after` is inside the renewal window.
fn renewal_due(not_after: OffsetDateTime, now: OffsetDateTime) -> bool {
    not_after < now + RENEW_BEFORE
}

/// How long an active task sleeps before its next check.
fn next_check_delay(not_after: OffsetDateTime, now: OffsetDateTime) -> Duration {
    let until_window = not_after - RENEW_BEFORE - now;
    Duration::try_from(until_window)
        .unwrap_or(Duration::ZERO)
        .max(MIN_CHECK_INTERVAL)
}

/// Retry delay for the given failure count.
fn backoff_delay(attempt: u32) -> Duration {
    BACKOFF_INITIAL
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(BACKOFF_MAX)
}
