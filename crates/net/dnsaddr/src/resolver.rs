//! TXT lookup abstraction over hickory.

use std::net::SocketAddr;

use async_trait::async_trait;
use hickory_resolver::TokioResolver;
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use tracing::debug;

use crate::error::DnsDiscoveryError;

/// Raw TXT lookup. The discovery layer injects a scripted implementation
/// in tests; production uses [`HickoryTxtResolver`].
#[async_trait]
pub trait TxtResolver: Send + Sync {
    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>, DnsDiscoveryError>;

    /// Drop any internal lookup cache. Default: nothing to drop.
    fn clear_cache(&self) {}
}

/// TXT resolution through hickory's tokio resolver.
pub struct HickoryTxtResolver {
    resolver: TokioResolver,
}

impl HickoryTxtResolver {
    /// Resolver with the system (or default) configuration.
    pub fn system() -> Self {
        Self {
            resolver: TokioResolver::builder_with_config(
                ResolverConfig::default(),
                hickory_resolver::name_server::TokioConnectionProvider::default(),
            )
            .with_options(ResolverOpts::default())
            .build(),
        }
    }

    /// Resolver pinned to a single custom `host:port` name server.
    pub fn custom(addr: SocketAddr) -> Self {
        let servers = NameServerConfigGroup::from_ips_clear(&[addr.ip()], addr.port(), true);
        let config = ResolverConfig::from_parts(None, Vec::new(), servers);
        Self {
            resolver: TokioResolver::builder_with_config(
                config,
                hickory_resolver::name_server::TokioConnectionProvider::default(),
            )
            .with_options(ResolverOpts::default())
            .build(),
        }
    }
}

#[async_trait]
impl TxtResolver for HickoryTxtResolver {
    async fn lookup_txt(&self, name: &str) -> Result<Vec<String>, DnsDiscoveryError> {
        debug!(%name, "querying TXT records");
        let response = self
            .resolver
            .txt_lookup(name)
            .await
            .map_err(|e| DnsDiscoveryError::Lookup(e.to_string()))?;

        Ok(response
            .iter()
            .flat_map(|record| {
                record
                    .txt_data()
                    .iter()
                    .map(|data| String::from_utf8_lossy(data).into_owned())
            })
            .collect())
    }

    fn clear_cache(&self) {
        self.resolver.clear_cache();
    }
}
