//! Per-handshake certificate selection.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tracing::debug;

use crate::acme_client::read_pem;
use crate::cache::{self, CertCache};
use crate::fallback::DEFAULT_SUBJECT;

/// ALPN protocol identifier of the TLS-ALPN-01 validation handshake.
pub const ACME_TLS_ALPN_NAME: &[u8] = b"acme-tls/1";

/// What one handshake asked for.
///
/// Built from the `ClientHello` when certificate selection starts and dropped
/// when it returns; never shared between connections.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ChallengeContext<'a> {
    pub server_name: Option<&'a str>,
    pub is_challenge: bool,
}

/// True when the offered ALPN protocols include `acme-tls/1`.
fn offers_challenge_alpn<'a>(mut protocols: impl Iterator<Item = &'a [u8]>) -> bool {
    protocols.any(|proto| proto == ACME_TLS_ALPN_NAME)
}

/// Selects the chain to present for each incoming handshake.
///
/// Reads bundles from the cache by the requested server name and falls back
/// to the default chain whenever no complete bundle exists. Lookups are
/// read-only; nothing here mutates shared state.
pub(crate) struct CertResolver {
    cache: CertCache,
    default_chain: Arc<CertifiedKey>,
}

impl CertResolver {
    /// Build a resolver with the default bundle loaded as its base identity.
    pub fn new(cache: CertCache) -> Result<Self> {
        let default_chain = load_certified_key(
            &cache,
            &cache::key_name(DEFAULT_SUBJECT),
            &cache::cert_name(DEFAULT_SUBJECT),
        )
        .context("failed to load default certificate bundle")?;
        Ok(Self {
            cache,
            default_chain: Arc::new(default_chain),
        })
    }

    /// Select the chain for one handshake.
    ///
    /// Missing or inconsistent bundles degrade to the default chain; for
    /// unknown names this is the normal path, not a fault.
    fn select(&self, ctx: ChallengeContext<'_>) -> Arc<CertifiedKey> {
        let Some(name) = ctx.server_name else {
            debug!("no server name in hello");
            return self.default_chain.clone();
        };
        let (key_name, cert_name) = if ctx.is_challenge {
            debug!("acme-tls/1 validation request for: {name}");
            (
                cache::challenge_key_name(name),
                cache::challenge_cert_name(name),
            )
        } else {
            (cache::key_name(name), cache::cert_name(name))
        };
        if !self.cache.exists(&key_name) || !self.cache.exists(&cert_name) {
            debug!("no cached chain for {name}, serving default");
            return self.default_chain.clone();
        }
        match load_certified_key(&self.cache, &key_name, &cert_name) {
            Ok(chain) => Arc::new(chain),
            Err(err) => {
                debug!("failed to load chain for {name}, serving default: {err:#}");
                self.default_chain.clone()
            }
        }
    }
}

impl ResolvesServerCert for CertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let ctx = ChallengeContext {
            server_name: client_hello.server_name(),
            is_challenge: offers_challenge_alpn(client_hello.alpn().into_iter().flatten()),
        };
        Some(self.select(ctx))
    }
}

impl std::fmt::Debug for CertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertResolver").finish()
    }
}

/// Load a key/cert pair from the cache and cross-check it.
fn load_certified_key(cache: &CertCache, key_name: &str, cert_name: &str) -> Result<CertifiedKey> {
    let key_pem = cache.read(key_name)?;
    let cert_pem = cache.read(cert_name)?;
    if !pubkeys_match(&key_pem, &cert_pem)? {
        bail!("certificate does not match private key");
    }
    let certs = CertificateDer::pem_slice_iter(cert_pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .context("failed to parse certificate")?;
    let key =
        PrivateKeyDer::from_pem_slice(key_pem.as_bytes()).context("failed to parse private key")?;
    let signing_key =
        rustls::crypto::ring::sign::any_ecdsa_type(&key).context("unsupported private key")?;
    Ok(CertifiedKey::new(certs, signing_key))
}

/// Whether the leaf certificate's public key equals the private key's.
pub(crate) fn pubkeys_match(key_pem: &str, cert_pem: &str) -> Result<bool> {
    let key = rcgen::KeyPair::from_pem(key_pem).context("failed to parse private key")?;
    let pem = read_pem(cert_pem)?;
    let cert = pem.parse_x509().context("failed to parse x509 cert")?;
    Ok(cert.tbs_certificate.public_key().raw == key.public_key_der().as_slice())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, KeyPair};
    use tempfile::TempDir;

    fn setup() -> (TempDir, CertResolver) {
        let dir = TempDir::new().unwrap();
        let cache = CertCache::new(dir.path()).unwrap();
        crate::fallback::ensure_default_bundle(&cache).unwrap();
        let resolver = CertResolver::new(cache).unwrap();
        (dir, resolver)
    }

    fn gen_bundle(domain: &str) -> (String, String) {
        let key = KeyPair::generate().unwrap();
        let cert = CertificateParams::new(vec![domain.to_string()])
            .unwrap()
            .self_signed(&key)
            .unwrap();
        (key.serialize_pem(), cert.pem())
    }

    fn leaf_der(cert_pem: &str) -> Vec<u8> {
        CertificateDer::pem_slice_iter(cert_pem.as_bytes())
            .next()
            .unwrap()
            .unwrap()
            .to_vec()
    }

    fn ctx<'a>(server_name: Option<&'a str>, is_challenge: bool) -> ChallengeContext<'a> {
        ChallengeContext {
            server_name,
            is_challenge,
        }
    }

    #[test]
    fn detects_challenge_alpn_offer() {
        assert!(offers_challenge_alpn([b"acme-tls/1".as_slice()].into_iter()));
        assert!(offers_challenge_alpn(
            [b"http/1.1".as_slice(), b"acme-tls/1".as_slice()].into_iter()
        ));
        assert!(!offers_challenge_alpn(
            [b"http/1.1".as_slice(), b"h2".as_slice()].into_iter()
        ));
        assert!(!offers_challenge_alpn(std::iter::empty()));
    }

    #[test]
    fn no_server_name_keeps_default_chain() {
        let (_dir, resolver) = setup();
        let selected = resolver.select(ctx(None, false));
        assert!(Arc::ptr_eq(&selected, &resolver.default_chain));
    }

    #[test]
    fn unknown_name_falls_back_to_default() {
        let (_dir, resolver) = setup();
        let selected = resolver.select(ctx(Some("unknown.example"), false));
        assert!(Arc::ptr_eq(&selected, &resolver.default_chain));
    }

    #[test]
    fn complete_bundle_is_installed() {
        let (_dir, resolver) = setup();
        let (key_pem, cert_pem) = gen_bundle("example.com");
        resolver
            .cache
            .write_bundle("example.com", &key_pem, &cert_pem)
            .unwrap();
        let selected = resolver.select(ctx(Some("example.com"), false));
        assert_eq!(selected.cert[0].as_ref(), leaf_der(&cert_pem));
    }

    #[test]
    fn incomplete_bundle_falls_back_to_default() {
        let (_dir, resolver) = setup();
        let (key_pem, _) = gen_bundle("example.com");
        resolver
            .cache
            .write("example.com.key", &key_pem)
            .unwrap();
        let selected = resolver.select(ctx(Some("example.com"), false));
        assert!(Arc::ptr_eq(&selected, &resolver.default_chain));
    }

    #[test]
    fn mismatched_pair_falls_back_to_default() {
        let (_dir, resolver) = setup();
        let (key_pem, _) = gen_bundle("example.com");
        let (_, other_cert) = gen_bundle("example.com");
        resolver
            .cache
            .write_bundle("example.com", &key_pem, &other_cert)
            .unwrap();
        let selected = resolver.select(ctx(Some("example.com"), false));
        assert!(Arc::ptr_eq(&selected, &resolver.default_chain));
    }

    #[test]
    fn challenge_handshake_gets_the_challenge_chain() {
        let (_dir, resolver) = setup();
        let (key_pem, cert_pem) = gen_bundle("example.com");
        resolver
            .cache
            .write("example.com.challenge.key", &key_pem)
            .unwrap();
        resolver
            .cache
            .write("example.com.challenge.cert", &cert_pem)
            .unwrap();
        let selected = resolver.select(ctx(Some("example.com"), true));
        assert_eq!(selected.cert[0].as_ref(), leaf_der(&cert_pem));
    }

    #[test]
    fn challenge_selection_does_not_leak_between_handshakes() {
        let (_dir, resolver) = setup();
        let (ch_key, ch_cert) = gen_bundle("example.com");
        resolver
            .cache
            .write("example.com.challenge.key", &ch_key)
            .unwrap();
        resolver
            .cache
            .write("example.com.challenge.cert", &ch_cert)
            .unwrap();
        let (key_pem, cert_pem) = gen_bundle("example.com");
        resolver
            .cache
            .write_bundle("example.com", &key_pem, &cert_pem)
            .unwrap();

        // A validation handshake and an ordinary one for the same name each
        // get their own chain; the challenge flag is scoped to its handshake.
        let challenge = resolver.select(ctx(Some("example.com"), true));
        let ordinary = resolver.select(ctx(Some("example.com"), false));
        assert_eq!(challenge.cert[0].as_ref(), leaf_der(&ch_cert));
        assert_eq!(ordinary.cert[0].as_ref(), leaf_der(&cert_pem));
    }

    #[test]
    fn challenge_without_entry_falls_back_to_default() {
        let (_dir, resolver) = setup();
        let selected = resolver.select(ctx(Some("example.com"), true));
        assert!(Arc::ptr_eq(&selected, &resolver.default_chain));
    }
}
