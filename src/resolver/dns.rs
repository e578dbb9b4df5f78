//! DNS TXT lookups behind a trait seam.

use super::error::{ResolverError, ResolverResult};
use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use std::time::Duration;
use tracing::{trace, warn};

/// Source of TXT records.
#[async_trait]
pub trait TxtResolver: Send + Sync {
    /// First character-string of the first TXT record at `name`.
    ///
    /// `Ok(None)` when the name or record does not exist.
    async fn first_txt(&self, name: &str) -> ResolverResult<Option<String>>;
}

/// [`TxtResolver`] backed by the system resolver configuration.
pub struct SystemTxtResolver {
    resolver: TokioAsyncResolver,
}

impl SystemTxtResolver {
    /// Build from `/etc/resolv.conf`, falling back to hickory's defaults.
    pub fn new(timeout: Duration, attempts: usize) -> Self {
        let (config, mut opts) = match hickory_resolver::system_conf::read_system_conf() {
            Ok(conf) => conf,
            Err(e) => {
                warn!(error = %e, "Failed to read system resolver configuration, using defaults");
                (ResolverConfig::default(), ResolverOpts::default())
            }
        };
        opts.timeout = timeout;
        opts.attempts = attempts;

        Self {
            resolver: TokioAsyncResolver::tokio(config, opts),
        }
    }
}

#[async_trait]
impl TxtResolver for SystemTxtResolver {
    async fn first_txt(&self, name: &str) -> ResolverResult<Option<String>> {
        match self.resolver.txt_lookup(name).await {
            Ok(lookup) => {
                let value = lookup.iter().next().and_then(|txt| {
                    txt.txt_data()
                        .first()
                        .map(|data| String::from_utf8_lossy(data).into_owned())
                });
                trace!(name = %name, value = ?value, "TXT lookup answered");
                Ok(value)
            }
            Err(e) if matches!(e.kind(), ResolveErrorKind::NoRecordsFound { .. }) => Ok(None),
            Err(e) => Err(ResolverError::Dns {
                name: name.to_string(),
                message: e.to_string(),
            }),
        }
    }
}
