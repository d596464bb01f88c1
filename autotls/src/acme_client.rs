//! ACME protocol client for the TLS-ALPN-01 challenge.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, Order, OrderStatus,
};
use rcgen::{CertificateParams, CustomExtension, DistinguishedName, KeyPair};
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tokio::time::sleep;
use tracing::{debug, error, info};
use x509_parser::prelude::Pem;

use crate::cache::{self, CertCache};

/// Cache name of the ACME account credentials.
const ACCOUNT_CREDENTIALS: &str = "account.json";

/// Certificate issuance interface the renewal tasks drive.
pub(crate) trait IssueApi: Send + Sync + 'static {
    /// Run a full ACME exchange for `domain` with the given private key,
    /// returning the issued chain in PEM format.
    async fn issue_certificate(&self, key_pem: &str, domain: &str) -> Result<String>;
}

/// An AcmeClient instance.
pub struct AcmeClient {
    account: Account,
    credentials: Credentials,
    cache: CertCache,
}

/// A TLS-ALPN-01 challenge whose validation certificate is in the cache.
#[derive(Debug, Clone)]
struct Challenge {
    domain: String,
    url: String,
}

#[derive(Serialize, Deserialize)]
pub(crate) struct Credentials {
    pub(crate) account_id: String,
    credentials: AccountCredentials,
}

impl AcmeClient {
    pub async fn load(cache: CertCache, encoded_credentials: &str) -> Result<Self> {
        let credentials: Credentials = serde_json::from_str(encoded_credentials)?;
        let account = Account::from_credentials(credentials.credentials).await?;
        let credentials: Credentials = serde_json::from_str(encoded_credentials)?;
        Ok(Self {
            account,
            credentials,
            cache,
        })
    }

    /// Create a new account.
    pub async fn new_account(
        acme_url: &str,
        contact: Option<&str>,
        cache: CertCache,
    ) -> Result<Self> {
        let contact = contact.into_iter().collect::<Vec<_>>();
        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &contact,
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            acme_url,
            None,
        )
        .await
        .context("failed to create new account")?;
        let credentials = Credentials {
            account_id: account.id().to_string(),
            credentials,
        };
        Ok(Self {
            account,
            credentials,
            cache,
        })
    }

    /// Dump the account credentials to a JSON string.
    pub fn dump_credentials(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.credentials)?)
    }

    /// Get the ACME account ID.
    pub fn account_id(&self) -> &str {
        &self.credentials.account_id
    }

    /// Request a new certificate for the given domain.
    ///
    /// Returns the issued chain encoded in PEM format.
    pub async fn request_certificate(&self, key: &str, domain: &str) -> Result<String> {
        info!("requesting new certificate for {domain}");
        let mut challenges = Vec::new();
        let result = self
            .request_certificate_inner(key, domain, &mut challenges)
            .await;
        for challenge in &challenges {
            debug!("removing challenge entry for {}", challenge.domain);
            if let Err(err) = self.remove_challenge_entry(&challenge.domain) {
                error!(
                    "failed to remove challenge entry for {}: {err}",
                    challenge.domain
                );
            }
        }
        result
    }
}

impl AcmeClient {
    /// Make the validation certificate for a challenge discoverable by the
    /// SNI dispatcher.
    fn publish_challenge_entry(&self, domain: &str, key_auth_digest: &[u8]) -> Result<()> {
        let key = KeyPair::generate().context("failed to generate challenge key")?;
        let mut params = CertificateParams::new(vec![domain.to_string()])
            .context("failed to create certificate params")?;
        params.distinguished_name = DistinguishedName::new();
        params
            .custom_extensions
            .push(CustomExtension::new_acme_identifier(key_auth_digest));
        let cert = params
            .self_signed(&key)
            .context("failed to self-sign challenge certificate")?;
        self.cache
            .write(&cache::challenge_key_name(domain), key.serialize_pem())?;
        self.cache
            .write(&cache::challenge_cert_name(domain), cert.pem())?;
        Ok(())
    }

    fn remove_challenge_entry(&self, domain: &str) -> Result<()> {
        self.cache.remove(&cache::challenge_cert_name(domain))?;
        self.cache.remove(&cache::challenge_key_name(domain))?;
        Ok(())
    }

    async fn authorize(&self, order: &mut Order, challenges: &mut Vec<Challenge>) -> Result<()> {
        let authorizations = order
            .authorizations()
            .await
            .context("failed to get authorizations")?;
        for authz in &authorizations {
            match authz.status {
                AuthorizationStatus::Pending => {}
                AuthorizationStatus::Valid => continue,
                _ => bail!("unsupported authorization status: {:?}", authz.status),
            }

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::TlsAlpn01)
                .context("no tls-alpn-01 challenge found")?;

            let Identifier::Dns(identifier) = &authz.identifier;

            let digest = order.key_authorization(challenge).digest();
            debug!("publishing validation certificate for {identifier}");
            self.publish_challenge_entry(identifier, digest.as_ref())
                .context("failed to publish validation certificate")?;
            challenges.push(Challenge {
                domain: identifier.clone(),
                url: challenge.url.clone(),
            });
        }
        Ok(())
    }

    async fn request_certificate_inner(
        &self,
        key: &str,
        domain: &str,
        challenges: &mut Vec<Challenge>,
    ) -> Result<String> {
        debug!("creating new order for {domain}");
        let names = vec![domain.to_string()];
        let identifiers = names
            .iter()
            .map(|name| Identifier::Dns(name.clone()))
            .collect::<Vec<_>>();
        let mut order = self
            .account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .context("failed to create new order")?;
        let mut challenges_ready = false;
        loop {
            order.refresh().await.context("failed to refresh order")?;
            match order.state().status {
                // Need to accept the challenge
                OrderStatus::Pending => {
                    if challenges_ready {
                        debug!("challenges are ready, waiting for order to be ready");
                        sleep(Duration::from_secs(2)).await;
                        continue;
                    }
                    debug!("order is pending, waiting for authorization");
                    self.authorize(&mut order, challenges)
                        .await
                        .context("failed to authorize")?;
                    if challenges.is_empty() {
                        bail!("no challenges found");
                    }
                    for challenge in &*challenges {
                        debug!("setting challenge ready for {}", challenge.url);
                        order
                            .set_challenge_ready(&challenge.url)
                            .await
                            .context("failed to set challenge ready")?;
                    }
                    challenges_ready = true;
                    continue;
                }
                // To upload CSR
                OrderStatus::Ready => {
                    debug!("order is ready, uploading CSR");
                    let csr = make_csr(key, &names)?;
                    order
                        .finalize(csr.as_ref())
                        .await
                        .context("failed to finalize order")?;
                    continue;
                }
                // Need to wait for the challenge to be accepted
                OrderStatus::Processing => {
                    debug!("order is processing, waiting for the CSR to be accepted");
                    sleep(Duration::from_secs(2)).await;
                    continue;
                }
                // Certificate is ready
                OrderStatus::Valid => {
                    debug!("order is valid, getting certificate");
                    return extract_certificate(order).await;
                }
                // Something went wrong
                OrderStatus::Invalid => bail!("order is invalid"),
            }
        }
    }
}

/// Lazily-initialized handle to the shared ACME account.
///
/// The account is loaded from the cache or registered with the CA on first
/// use, so an unreachable CA at startup surfaces as a renewal failure rather
/// than a construction failure.
pub(crate) struct AcmeAccount {
    cache: CertCache,
    acme_url: String,
    contact: Option<String>,
    client: OnceCell<AcmeClient>,
}

impl AcmeAccount {
    pub fn new(cache: CertCache, acme_url: String, contact: Option<String>) -> Self {
        Self {
            cache,
            acme_url,
            contact,
            client: OnceCell::new(),
        }
    }

    /// Load or register the account now.
    pub async fn ensure(&self) -> Result<()> {
        self.client().await.map(|_| ())
    }

    async fn client(&self) -> Result<&AcmeClient> {
        self.client
            .get_or_try_init(|| async {
                if self.cache.exists(ACCOUNT_CREDENTIALS) {
                    let encoded = self.cache.read(ACCOUNT_CREDENTIALS)?;
                    let client = AcmeClient::load(self.cache.clone(), &encoded).await?;
                    info!("loaded ACME account: {}", client.account_id());
                    return Ok(client);
                }
                info!("creating new ACME account");
                let client = AcmeClient::new_account(
                    &self.acme_url,
                    self.contact.as_deref(),
                    self.cache.clone(),
                )
                .await
                .context("failed to create new account")?;
                let credentials = client
                    .dump_credentials()
                    .context("failed to dump credentials")?;
                self.cache
                    .write(ACCOUNT_CREDENTIALS, credentials)
                    .context("failed to write credentials")?;
                info!("created new ACME account: {}", client.account_id());
                Ok(client)
            })
            .await
    }
}

impl IssueApi for AcmeAccount {
    async fn issue_certificate(&self, key_pem: &str, domain: &str) -> Result<String> {
        self.client()
            .await?
            .request_certificate(key_pem, domain)
            .await
    }
}

fn make_csr(key: &str, names: &[String]) -> Result<Vec<u8>> {
    let mut params =
        CertificateParams::new(names).context("failed to create certificate params")?;
    params.distinguished_name = DistinguishedName::new();
    let key = KeyPair::from_pem(key).context("failed to parse private key")?;
    let csr = params
        .serialize_request(&key)
        .context("failed to serialize certificate request")?;
    Ok(csr.der().as_ref().to_vec())
}

async fn extract_certificate(mut order: Order) -> Result<String> {
    let mut tries = 0;
    let cert_chain_pem = loop {
        tries += 1;
        if tries > 5 {
            bail!("failed to get certificate");
        }
        match order
            .certificate()
            .await
            .context("failed to get certificate")?
        {
            Some(cert_chain_pem) => break cert_chain_pem,
            None => sleep(Duration::from_secs(1)).await,
        }
    };
    Ok(cert_chain_pem)
}

pub(crate) fn read_pem(cert_pem: &str) -> Result<Pem> {
    Pem::iter_from_buffer(cert_pem.as_bytes())
        .next()
        .transpose()
        .context("Invalid pem")?
        .context("no certificate in pem")
}
