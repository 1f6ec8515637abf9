//! Sequential failover across interchangeable destination hosts.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::core::share::{ShareAddress, ShareConnector, ShareCredentials, ShareError, ShareSession};

/// A session plus the host it landed on.
pub struct Connected {
    pub session: Box<dyn ShareSession>,
    pub selected_host: String,
}

impl std::fmt::Debug for Connected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connected")
            .field("selected_host", &self.selected_host)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct FailoverConnector {
    connector: Arc<dyn ShareConnector>,
    timeout: Duration,
}

impl FailoverConnector {
    pub fn new(connector: Arc<dyn ShareConnector>, timeout: Duration) -> Self {
        Self { connector, timeout }
    }

    /// Open a single address with the per-attempt timeout and no failover.
    pub async fn open(&self, address: &ShareAddress) -> Result<Box<dyn ShareSession>, ShareError> {
        match tokio::time::timeout(self.timeout, self.connector.open(address)).await {
            Ok(result) => result,
            Err(_) => Err(ShareError::Timeout {
                host: address.host.clone(),
                timeout: self.timeout,
            }),
        }
    }

    /// Try `hosts` in order and return the first session that opens.
    ///
    /// Hosts are never raced in parallel; a host after the first success is not contacted.
    pub async fn connect(
        &self,
        hosts: &[String],
        share: &str,
        credentials: &ShareCredentials,
    ) -> Result<Connected, ShareError> {
        let mut attempted = Vec::with_capacity(hosts.len());
        let mut last_error = None;

        for host in hosts {
            let address = ShareAddress::new(host, share, credentials.clone());
            attempted.push(host.clone());

            match self.open(&address).await {
                Ok(session) => {
                    info!(share = %address, attempts = attempted.len(), "Connected to destination");
                    return Ok(Connected {
                        session,
                        selected_host: host.clone(),
                    });
                }
                Err(e) => {
                    warn!(share = %address, error = %e, "Destination unavailable, trying next host");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(last) => Err(ShareError::Exhausted {
                attempted,
                last: Box::new(last),
            }),
            None => Err(ShareError::NoCandidates),
        }
    }
}

/// Put `preferred` first, keeping the remaining hosts in configured order.
pub fn prefer_host(hosts: &[String], preferred: &str) -> Vec<String> {
    let mut ordered = Vec::with_capacity(hosts.len());
    if hosts.iter().any(|h| h == preferred) {
        ordered.push(preferred.to_string());
    }
    ordered.extend(hosts.iter().filter(|h| h.as_str() != preferred).cloned());
    ordered
}
