//! Interposition certificate material.
//!
//! The CA key and certificate persist under the configured directory; the
//! public certificate is published there for the guest image to pre-trust.
//! Leaves are minted per SNI, signed by the CA, and cached in memory — a
//! leaf never serves a name it was not minted for.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use lru::LruCache;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose,
};
use rustls::pki_types::PrivateKeyDer;
use rustls::ServerConfig;
use time::{Duration, OffsetDateTime};

const CA_KEY_FILE: &str = "ca.key.pem";
const CA_CERT_FILE: &str = "ca.cert.pem";
const CA_COMMON_NAME: &str = "sandnet interposition CA";

/// Leaf validity: centered on now, ± 90 days.
const LEAF_VALIDITY_DAYS: i64 = 90;
const CA_VALIDITY_DAYS: i64 = 3650;

pub struct CertStore {
    ca_cert: rcgen::Certificate,
    ca_key: KeyPair,
    ca_cert_pem: String,
    leaves: Mutex<LruCache<String, Arc<ServerConfig>>>,
}

impl CertStore {
    /// Load the CA from `dir`, creating and persisting one on first use.
    pub fn open(dir: &Path, leaf_cache_size: usize) -> anyhow::Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create mitm dir {}", dir.display()))?;
        let key_path = dir.join(CA_KEY_FILE);
        let cert_path = dir.join(CA_CERT_FILE);

        let (ca_cert, ca_key, ca_cert_pem) = if key_path.exists() && cert_path.exists() {
            load_ca(&key_path, &cert_path)?
        } else {
            create_ca(&key_path, &cert_path)?
        };

        let capacity = NonZeroUsize::new(leaf_cache_size.max(1)).expect("nonzero");
        Ok(Self {
            ca_cert,
            ca_key,
            ca_cert_pem,
            leaves: Mutex::new(LruCache::new(capacity)),
        })
    }

    /// The published CA certificate (also written next to the key).
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// DER form of the CA certificate, for trust-store injection.
    pub fn ca_cert_der(&self) -> rustls::pki_types::CertificateDer<'static> {
        self.ca_cert.der().clone()
    }

    /// rustls server config carrying a leaf for `sni`, from cache or freshly
    /// minted.
    pub fn server_config_for(&self, sni: &str) -> anyhow::Result<Arc<ServerConfig>> {
        let sni = sni.to_ascii_lowercase();
        if let Some(config) = self.leaves.lock().expect("leaf cache lock").get(&sni) {
            return Ok(config.clone());
        }

        let config = Arc::new(self.mint_leaf_config(&sni)?);
        self.leaves
            .lock()
            .expect("leaf cache lock")
            .put(sni, config.clone());
        Ok(config)
    }

    fn mint_leaf_config(&self, sni: &str) -> anyhow::Result<ServerConfig> {
        let key = KeyPair::generate().context("generate leaf key")?;

        let mut sans = vec![sni.to_string()];
        if let Some(apex) = apex_of(sni) {
            sans.push(apex);
        }
        let mut params = CertificateParams::new(sans).context("leaf params")?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, sni);
        params.distinguished_name = dn;
        params.use_authority_key_identifier_extension = true;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::days(LEAF_VALIDITY_DAYS);
        params.not_after = now + Duration::days(LEAF_VALIDITY_DAYS);

        let leaf = params
            .signed_by(&key, &self.ca_cert, &self.ca_key)
            .context("sign leaf")?;

        let chain = vec![leaf.der().clone(), self.ca_cert.der().clone()];
        let key_der = PrivateKeyDer::Pkcs8(key.serialize_der().into());
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, key_der)
            .context("leaf server config")?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(config)
    }
}

/// Apex domain for a subdomain SNI (`api.github.com` → `github.com`).
fn apex_of(sni: &str) -> Option<String> {
    let labels: Vec<&str> = sni.split('.').collect();
    if labels.len() > 2 {
        Some(labels[1..].join("."))
    } else {
        None
    }
}

fn load_ca(
    key_path: &PathBuf,
    cert_path: &PathBuf,
) -> anyhow::Result<(rcgen::Certificate, KeyPair, String)> {
    let key_pem = std::fs::read_to_string(key_path)
        .with_context(|| format!("read {}", key_path.display()))?;
    let cert_pem = std::fs::read_to_string(cert_path)
        .with_context(|| format!("read {}", cert_path.display()))?;
    let key = KeyPair::from_pem(&key_pem).context("parse CA key")?;
    let params = CertificateParams::from_ca_cert_pem(&cert_pem).context("parse CA cert")?;
    let cert = params.self_signed(&key).context("rehydrate CA cert")?;
    Ok((cert, key, cert_pem))
}

fn create_ca(
    key_path: &PathBuf,
    cert_path: &PathBuf,
) -> anyhow::Result<(rcgen::Certificate, KeyPair, String)> {
    let key = KeyPair::generate().context("generate CA key")?;

    let mut params = CertificateParams::new(Vec::new()).context("CA params")?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, CA_COMMON_NAME);
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::days(1);
    params.not_after = now + Duration::days(CA_VALIDITY_DAYS);

    let cert = params.self_signed(&key).context("self-sign CA")?;
    let cert_pem = cert.pem();

    std::fs::write(key_path, key.serialize_pem())
        .with_context(|| format!("write {}", key_path.display()))?;
    restrict_permissions(key_path);
    std::fs::write(cert_path, &cert_pem)
        .with_context(|| format!("write {}", cert_path.display()))?;

    tracing::info!(cert = %cert_path.display(), "generated interposition CA");
    Ok((cert, key, cert_pem))
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) {}
