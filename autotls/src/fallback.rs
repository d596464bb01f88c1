//! Fallback certificate provisioning.

use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use tracing::info;

use crate::cache::{cert_name, key_name, CertCache};

/// Subject and issuer common name of the fallback certificate.
pub(crate) const DEFAULT_SUBJECT: &str = "default";

/// Validity window of the fallback certificate.
const DEFAULT_VALIDITY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Ensure `default.key`/`default.cert` exist, generating a self-signed pair
/// if either is missing. Does nothing when both are present.
pub(crate) fn ensure_default_bundle(cache: &CertCache) -> Result<()> {
    if cache.exists(&key_name(DEFAULT_SUBJECT)) && cache.exists(&cert_name(DEFAULT_SUBJECT)) {
        return Ok(());
    }
    let key = KeyPair::generate().context("failed to generate default key")?;
    let mut params =
        CertificateParams::new(vec![]).context("failed to create certificate params")?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DEFAULT_SUBJECT);
    params.distinguished_name = dn;
    let now = SystemTime::now();
    params.not_before = now.into();
    params.not_after = (now + DEFAULT_VALIDITY).into();
    let cert = params
        .self_signed(&key)
        .context("failed to self-sign default certificate")?;
    cache.write_bundle(DEFAULT_SUBJECT, &key.serialize_pem(), &cert.pem())?;
    info!("generated default certificate bundle");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme_client::read_pem;
    use tempfile::TempDir;

    fn setup() -> (TempDir, CertCache) {
        let dir = TempDir::new().unwrap();
        let cache = CertCache::new(dir.path()).unwrap();
        (dir, cache)
    }

    #[test]
    fn generates_bundle_when_absent() {
        let (_dir, cache) = setup();
        ensure_default_bundle(&cache).unwrap();
        assert!(cache.exists("default.key"));
        assert!(cache.exists("default.cert"));
    }

    #[test]
    fn is_idempotent() {
        let (_dir, cache) = setup();
        ensure_default_bundle(&cache).unwrap();
        let key = cache.read("default.key").unwrap();
        let cert = cache.read("default.cert").unwrap();
        ensure_default_bundle(&cache).unwrap();
        assert_eq!(cache.read("default.key").unwrap(), key);
        assert_eq!(cache.read("default.cert").unwrap(), cert);
    }

    #[test]
    fn validity_window_is_strictly_positive() {
        let (_dir, cache) = setup();
        ensure_default_bundle(&cache).unwrap();
        let pem = cache.read("default.cert").unwrap();
        let pem = read_pem(&pem).unwrap();
        let cert = pem.parse_x509().unwrap();
        let validity = cert.validity();
        assert!(validity.not_after.to_datetime() > validity.not_before.to_datetime());
    }

    #[test]
    fn subject_is_default() {
        let (_dir, cache) = setup();
        ensure_default_bundle(&cache).unwrap();
        let pem = cache.read("default.cert").unwrap();
        let pem = read_pem(&pem).unwrap();
        let cert = pem.parse_x509().unwrap();
        assert!(cert.subject().to_string().contains("CN=default"));
    }

    #[test]
    fn key_matches_certificate() {
        let (_dir, cache) = setup();
        ensure_default_bundle(&cache).unwrap();
        let key_pem = cache.read("default.key").unwrap();
        let cert_pem = cache.read("default.cert").unwrap();
        assert!(crate::resolver::pubkeys_match(&key_pem, &cert_pem).unwrap());
    }
}
