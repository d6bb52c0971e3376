//! Per-hostname TLS identities and their resolution at handshake time.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_rustls::rustls::crypto::ring::sign::any_supported_type;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::server::{ClientHello, ResolvesServerCert};
use tokio_rustls::rustls::sign::CertifiedKey;
use tokio_rustls::rustls::ServerConfig;

use crate::component::Component;
use crate::config::{HostConfig, Protocol};
use crate::routing::{HostMap, HostnameKey};
use crate::Error;

const ALPN_H2: &[u8] = b"h2";
const ALPN_HTTP11: &[u8] = b"http/1.1";

/// The host-parameters provider: maps hostname patterns (exact, `*.foo`,
/// bare `*`) to TLS identities, and exposes the rustls server config an
/// endpoint needs for its protocol.
///
/// Resolution follows the routing rules: exact beats wildcard, the deepest
/// wildcard wins, bare `*` is the fallback. Built once from configuration
/// and immutable from then on, so handshake-time lookups take no locks.
pub struct HostManager {
    name: String,
    hosts: Arc<SniResolver>,
    host_count: usize,
}

impl HostManager {
    /// Builds the manager from the `hosts` config section. PEM decode or
    /// key errors are configuration errors.
    pub fn from_configs(name: impl Into<String>, configs: &[HostConfig]) -> Result<Self, Error> {
        let mut hosts = HostMap::new();
        let mut host_count = 0;
        for config in configs {
            let identity = Arc::new(load_identity(config)?);
            for pattern in &config.hostnames {
                let key = HostnameKey::parse(pattern)?;
                let slot = hosts.slot_mut(&key);
                if slot.is_some() {
                    return Err(Error::config(format!(
                        "hostname {pattern:?} configured by more than one host"
                    )));
                }
                *slot = Some(Arc::clone(&identity));
                host_count += 1;
            }
        }
        Ok(Self {
            name: name.into(),
            hosts: Arc::new(SniResolver { hosts }),
            host_count,
        })
    }

    /// Whether any hostname is configured.
    pub fn has_hosts(&self) -> bool {
        self.host_count > 0
    }

    /// The identity that would be served for a concrete hostname.
    pub fn identity_for(&self, hostname: &str) -> Option<Arc<CertifiedKey>> {
        self.hosts.hosts.find_name(hostname).cloned()
    }

    /// A rustls server config resolving certificates by SNI, with ALPN set
    /// for the endpoint's protocol.
    pub fn server_config(&self, protocol: Protocol) -> Arc<ServerConfig> {
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(self.hosts.clone());
        config.alpn_protocols = match protocol {
            Protocol::Http2 => vec![ALPN_H2.to_vec()],
            Protocol::Https => vec![ALPN_HTTP11.to_vec()],
            Protocol::Http => Vec::new(),
        };
        Arc::new(config)
    }
}

fn load_identity(config: &HostConfig) -> Result<CertifiedKey, Error> {
    let certs = rustls_pemfile::certs(&mut config.certificate.as_bytes())
        .collect::<Result<Vec<CertificateDer<'static>>, _>>()
        .map_err(|error| {
            Error::config(format!("bad certificate for {:?}", config.hostnames)).with(error)
        })?;
    if certs.is_empty() {
        return Err(Error::config(format!(
            "no certificate in PEM for {:?}",
            config.hostnames
        )));
    }
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut config.private_key.as_bytes())
        .map_err(|error| {
            Error::config(format!("bad private key for {:?}", config.hostnames)).with(error)
        })?
        .ok_or_else(|| {
            Error::config(format!("no private key in PEM for {:?}", config.hostnames))
        })?;
    let signing_key = any_supported_type(&key).map_err(|error| {
        Error::config(format!("unusable private key for {:?}", config.hostnames)).with(error)
    })?;
    Ok(CertifiedKey::new(certs, signing_key))
}

#[async_trait]
impl Component for HostManager {
    fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for HostManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostManager")
            .field("name", &self.name)
            .field("hosts", &self.host_count)
            .finish()
    }
}

struct SniResolver {
    hosts: HostMap<Arc<CertifiedKey>>,
}

impl fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SniResolver").finish()
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let name = client_hello.server_name()?;
        self.hosts.find_name(name).cloned()
    }
}
