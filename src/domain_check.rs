use crate::cache::ScanCache;
use crate::config::Configuration;
use crate::dns_client::{DnsClient, DnsLookup};
use crate::hostname_check::{HostnameProbe, SmtpProber};
use crate::http_client::{HttpsClient, PolicyFetch};
use crate::mta_sts::check_mta_sts;
use crate::results::{DomainResult, DomainStatus, ExtraResult};
use crate::smtp_client::host_without_port;
use crate::tls::default_roots;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

// RFC 8461 callers must not read more than this much policy
const POLICY_MAX_SIZE: usize = 64 * 1024;

/// Checks whole domains. The network collaborators are injected, with
/// production defaults built from the configuration.
pub struct Checker {
    pub timeout: Duration,
    pub dns: Arc<dyn DnsLookup>,
    pub policy_fetch: Arc<dyn PolicyFetch>,
    pub prober: Arc<dyn HostnameProbe>,
}

impl Checker {
    pub fn new(
        check_timeout: Duration,
        dns: Arc<dyn DnsLookup>,
        policy_fetch: Arc<dyn PolicyFetch>,
        prober: Arc<dyn HostnameProbe>,
    ) -> Self {
        Self {
            timeout: check_timeout,
            dns,
            policy_fetch,
            prober,
        }
    }

    pub fn from_config(config: &Configuration) -> Self {
        let check_timeout = config.timeout();
        let roots = default_roots();
        Self::new(
            check_timeout,
            Arc::new(DnsClient::new(config.dns_server, check_timeout)),
            Arc::new(HttpsClient::new(roots.clone(), check_timeout, POLICY_MAX_SIZE)),
            Arc::new(SmtpProber::new(
                config.helo_name.clone(),
                check_timeout,
                roots,
                config.check_ciphers,
            )),
        )
    }

    /// Resolves the MX set of a domain, probes every MX host through
    /// the cache, aggregates the verdict and attaches the MTA-STS
    /// result. With `expected_hostnames` given, reachable MX hosts
    /// outside that set fail the domain.
    pub async fn check_domain(
        &self,
        domain: &str,
        expected_hostnames: Option<&[String]>,
        cache: &ScanCache,
    ) -> DomainResult {
        debug!("Checking domain {domain}");
        let mut result = DomainResult::new(domain);

        let ascii = match idna::domain_to_ascii(domain) {
            Ok(ascii) => ascii,
            Err(_) => {
                result.status = DomainStatus::CouldNotConnect;
                result.message = format!("Could not convert {domain} to an ASCII domain name.");
                return result;
            }
        };

        let mxs = match timeout(self.timeout, self.dns.lookup_mx(&ascii)).await {
            Ok(Ok(mxs)) => mxs,
            Ok(Err(_)) | Err(_) => {
                result.status = DomainStatus::CouldNotConnect;
                result.message = "No MX records found for domain.".to_string();
                return result;
            }
        };
        if mxs.is_empty() {
            result.status = DomainStatus::CouldNotConnect;
            result.message = "No MX records found for domain.".to_string();
            return result;
        }

        // Lowercase the MX hostnames, keep the priority order and drop
        // duplicates
        for mx in &mxs {
            let hostname = mx.hostname.to_lowercase();
            if !result.mx_hostnames.contains(&hostname) {
                result.mx_hostnames.push(hostname);
            }
        }

        // Probe each MX host, going through the scan cache so domains
        // sharing an MX are not probed twice
        for hostname in &result.mx_hostnames {
            let scan = match cache.get(hostname).await {
                Some(scan) => scan,
                None => {
                    let scan = self.prober.probe(&ascii, hostname).await;
                    cache.put(scan.clone()).await;
                    scan
                }
            };
            result.hostname_results.insert(hostname.clone(), scan);
        }

        // Only hostnames we could reach determine the verdict
        result.preferred_hostnames = result
            .mx_hostnames
            .iter()
            .filter(|hostname| {
                result
                    .hostname_results
                    .get(*hostname)
                    .is_some_and(|scan| scan.could_connect())
            })
            .cloned()
            .collect();
        if result.preferred_hostnames.is_empty() {
            result.status = DomainStatus::CouldNotConnect;
            result.message = "Could not connect to any mail server for domain.".to_string();
            return result;
        }

        for hostname in &result.preferred_hostnames {
            let scan = &result.hostname_results[hostname];
            if !scan.could_starttls() {
                result.status = DomainStatus::NoStartTlsFailure;
                result.message = format!("{hostname} does not support STARTTLS.");
                return result;
            }
            if let Some(expected) = expected_hostnames
                && !policy_matches(hostname, expected)
            {
                result.status = DomainStatus::BadHostnameFailure;
                result.message = format!("{hostname} is not a permitted MX hostname.");
                return result;
            }
            result.status = result.status.merge_check(scan.result.status);
        }

        // MTA-STS is recorded but never changes the domain verdict,
        // most domains legitimately have no policy yet
        let sts = check_mta_sts(
            self.dns.as_ref(),
            self.policy_fetch.as_ref(),
            &ascii,
            &result.hostname_results,
        )
        .await;
        result
            .extra_results
            .insert("mta-sts".to_string(), ExtraResult::MtaSts(sts));

        result
    }
}

/// Whether an MX hostname is covered by a list of policy patterns.
/// Matching is case-insensitive and ignores a trailing dot and an
/// explicit port. Patterns starting with `.` or `*.` match exactly one
/// additional leading label.
pub fn policy_matches(mx: &str, patterns: &[String]) -> bool {
    let mx = host_without_port(mx).to_lowercase();
    for pattern in patterns {
        let pattern = pattern.trim().to_lowercase();
        let suffix = pattern
            .strip_prefix("*.")
            .or_else(|| pattern.strip_prefix('.'));
        match suffix {
            Some(suffix) => {
                if let Some(prefix) = mx.strip_suffix(suffix)
                    && let Some(label) = prefix.strip_suffix('.')
                    && !label.is_empty()
                    && !label.contains('.')
                {
                    return true;
                }
            }
            None => {
                if mx == pattern {
                    return true;
                }
            }
        }
    }
    false
}
