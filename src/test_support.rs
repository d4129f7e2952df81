//! Scripted collaborators for tests: DNS answers, policy files,
//! hostname scans and policy stores without any network or database.

use crate::dns_client::{DnsLookup, MxRecord};
use crate::domain_check::Checker;
use crate::hostname_check::HostnameProbe;
use crate::http_client::{HttpResponse, PolicyFetch};
use crate::policy::{PolicyStore, PolicySubmission};
use crate::results::{CheckResult, CheckStatus, HostnameResult};
use anyhow::{Result, bail};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
pub struct FakeDns {
    mx: HashMap<String, Vec<MxRecord>>,
    txt: HashMap<String, Vec<String>>,
    fail: bool,
}

impl FakeDns {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn with_mx(domain: &str, records: Vec<(&str, u16)>) -> Self {
        Self::default().mx(domain, records)
    }

    pub fn with_txt(name: &str, records: Vec<&str>) -> Self {
        Self::default().txt(name, records)
    }

    pub fn mx(mut self, domain: &str, records: Vec<(&str, u16)>) -> Self {
        let records = records
            .into_iter()
            .map(|(hostname, priority)| MxRecord {
                hostname: hostname.to_string(),
                priority,
            })
            .collect();
        self.mx.insert(domain.to_string(), records);
        self
    }

    pub fn txt(mut self, name: &str, records: Vec<&str>) -> Self {
        let records = records.into_iter().map(str::to_string).collect();
        self.txt.insert(name.to_string(), records);
        self
    }
}

impl DnsLookup for FakeDns {
    fn lookup_mx<'a>(&'a self, domain: &'a str) -> BoxFuture<'a, Result<Vec<MxRecord>>> {
        Box::pin(async move {
            if self.fail {
                bail!("scripted DNS outage");
            }
            Ok(self.mx.get(domain).cloned().unwrap_or_default())
        })
    }

    fn lookup_txt<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Vec<String>>> {
        Box::pin(async move {
            if self.fail {
                bail!("scripted DNS outage");
            }
            Ok(self.txt.get(name).cloned().unwrap_or_default())
        })
    }
}

pub struct FakePolicyFetch {
    status: u16,
    content_type: String,
    body: Vec<u8>,
    fail: bool,
}

impl FakePolicyFetch {
    pub fn serving(policy: &str) -> Self {
        Self {
            status: 200,
            content_type: "text/plain".to_string(),
            body: policy.as_bytes().to_vec(),
            fail: false,
        }
    }

    pub fn with_status(status: u16) -> Self {
        Self {
            status,
            content_type: "text/plain".to_string(),
            body: Vec::new(),
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            status: 0,
            content_type: String::new(),
            body: Vec::new(),
            fail: true,
        }
    }

    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = content_type.to_string();
        self
    }
}

impl PolicyFetch for FakePolicyFetch {
    fn fetch<'a>(&'a self, _url: &'a str) -> BoxFuture<'a, Result<HttpResponse>> {
        Box::pin(async move {
            if self.fail {
                bail!("scripted HTTPS outage");
            }
            Ok(HttpResponse {
                status: self.status,
                content_type: self.content_type.clone(),
                body: self.body.clone(),
            })
        })
    }
}

/// Builds the scan the production prober would produce for a host with
/// the given connectivity and STARTTLS outcomes.
pub fn scripted_scan(
    domain: &str,
    hostname: &str,
    could_connect: bool,
    could_starttls: bool,
) -> HostnameResult {
    let mut scan = HostnameResult::new(domain, hostname);
    let mut connectivity = CheckResult::new("connectivity");
    if could_connect {
        connectivity.record_success();
    } else {
        connectivity.record_error("Could not establish connection: scripted refusal");
    }
    scan.result.add_subcheck(connectivity);
    if could_connect {
        let mut starttls = CheckResult::new("starttls");
        if could_starttls {
            starttls.record_success();
        } else {
            starttls.record_failure("Server does not advertise support for STARTTLS.");
        }
        scan.result.add_subcheck(starttls);
    }
    scan
}

#[derive(Default)]
pub struct FakeProber {
    hosts: Mutex<HashMap<String, (bool, bool, CheckStatus)>>,
    calls: Arc<AtomicUsize>,
}

impl FakeProber {
    pub fn hostname(self, hostname: &str, could_connect: bool, could_starttls: bool) -> Self {
        self.hosts.lock().unwrap().insert(
            hostname.to_string(),
            (could_connect, could_starttls, CheckStatus::Success),
        );
        self
    }

    /// Raises the scripted scan to the given status via an extra
    /// certificate subcheck.
    pub fn set_extra_status(&self, hostname: &str, status: CheckStatus) {
        if let Some(entry) = self.hosts.lock().unwrap().get_mut(hostname) {
            entry.2 = status;
        }
    }

    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

impl HostnameProbe for FakeProber {
    fn probe<'a>(&'a self, domain: &'a str, hostname: &'a str) -> BoxFuture<'a, HostnameResult> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let scripted = self.hosts.lock().unwrap().get(hostname).copied();
            let (could_connect, could_starttls, extra) =
                scripted.unwrap_or((false, false, CheckStatus::Success));
            let mut scan = scripted_scan(domain, hostname, could_connect, could_starttls);
            if extra != CheckStatus::Success {
                let mut certificate = CheckResult::new("certificate");
                match extra {
                    CheckStatus::Warning => certificate.record_warning("scripted warning"),
                    CheckStatus::Failure => certificate.record_failure("scripted failure"),
                    _ => certificate.record_error("scripted error"),
                }
                scan.result.add_subcheck(certificate);
            }
            scan
        })
    }
}

/// A checker wired up from scripted collaborators with a short timeout.
pub fn checker_with(dns: FakeDns, fetch: FakePolicyFetch, prober: FakeProber) -> Checker {
    Checker::new(
        Duration::from_secs(2),
        Arc::new(dns),
        Arc::new(fetch),
        Arc::new(prober),
    )
}

#[derive(Default)]
pub struct FakePolicyStore {
    policies: Mutex<HashMap<String, PolicySubmission>>,
    updates: Mutex<Vec<PolicySubmission>>,
}

impl FakePolicyStore {
    pub fn with_policy(submission: PolicySubmission) -> Self {
        let store = Self::default();
        store
            .policies
            .lock()
            .unwrap()
            .insert(submission.domain.clone(), submission);
        store
    }

    pub fn updates(&self) -> Vec<PolicySubmission> {
        self.updates.lock().unwrap().clone()
    }
}

impl PolicyStore for FakePolicyStore {
    fn domains_to_validate(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        Box::pin(async move {
            let mut domains: Vec<String> = self.policies.lock().unwrap().keys().cloned().collect();
            domains.sort();
            Ok(domains)
        })
    }

    fn get_policy<'a>(&'a self, domain: &'a str) -> BoxFuture<'a, Result<Option<PolicySubmission>>> {
        Box::pin(async move { Ok(self.policies.lock().unwrap().get(domain).cloned()) })
    }

    fn update_policy(&self, submission: PolicySubmission) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.updates.lock().unwrap().push(submission.clone());
            self.policies
                .lock()
                .unwrap()
                .insert(submission.domain.clone(), submission);
            Ok(())
        })
    }
}
