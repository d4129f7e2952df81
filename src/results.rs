use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Severity of a single check outcome.
/// Merging two severities always keeps the worse one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CheckStatus {
    #[default]
    Success,
    Warning,
    Failure,
    Error,
}

impl CheckStatus {
    pub fn merge(self, other: CheckStatus) -> CheckStatus {
        self.max(other)
    }

    fn as_u8(self) -> u8 {
        match self {
            CheckStatus::Success => 0,
            CheckStatus::Warning => 1,
            CheckStatus::Failure => 2,
            CheckStatus::Error => 3,
        }
    }

    fn from_u8(value: u64) -> Option<CheckStatus> {
        match value {
            0 => Some(CheckStatus::Success),
            1 => Some(CheckStatus::Warning),
            2 => Some(CheckStatus::Failure),
            3 => Some(CheckStatus::Error),
            _ => None,
        }
    }
}

impl Serialize for CheckStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_u8())
    }
}

impl<'de> Deserialize<'de> for CheckStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = u64::deserialize(deserializer)?;
        CheckStatus::from_u8(value)
            .ok_or_else(|| de::Error::custom(format!("invalid check status {value}")))
    }
}

/// One node in the tree of check outcomes.
/// The status of a node is always at least as bad as the status
/// of any of its subchecks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub messages: Vec<String>,
    pub checks: BTreeMap<String, CheckResult>,
}

impl CheckResult {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn record_error(&mut self, message: impl AsRef<str>) {
        self.messages.push(format!("Error: {}", message.as_ref()));
        self.status = self.status.merge(CheckStatus::Error);
    }

    pub fn record_failure(&mut self, message: impl AsRef<str>) {
        self.messages.push(format!("Failure: {}", message.as_ref()));
        self.status = self.status.merge(CheckStatus::Failure);
    }

    pub fn record_warning(&mut self, message: impl AsRef<str>) {
        self.messages.push(format!("Warning: {}", message.as_ref()));
        self.status = self.status.merge(CheckStatus::Warning);
    }

    /// Marks the check as complete without raising the status.
    pub fn record_success(&mut self) {
        self.status = self.status.merge(CheckStatus::Success);
    }

    /// Attaches a finished subcheck and raises the parent status
    /// to at least the status of the child.
    pub fn add_subcheck(&mut self, child: CheckResult) {
        self.status = self.status.merge(child.status);
        self.checks.insert(child.name.clone(), child);
    }
}

impl Serialize for CheckResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("name", &self.name)?;
        map.serialize_entry("status", &self.status)?;
        map.serialize_entry("messages", &self.messages)?;
        if !self.checks.is_empty() {
            map.serialize_entry("checks", &self.checks)?;
        }
        // Derived display fields, resolved from the static tables below
        map.serialize_entry("status_text", status_text(&self.name, self.status))?;
        map.serialize_entry("description", description(&self.name))?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for CheckResult {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // The derived fields are ignored on the way back in
        #[derive(Deserialize)]
        struct Repr {
            name: String,
            #[serde(default)]
            status: CheckStatus,
            #[serde(default)]
            messages: Vec<String>,
            #[serde(default)]
            checks: BTreeMap<String, CheckResult>,
        }
        let repr = Repr::deserialize(deserializer)?;
        Ok(CheckResult {
            name: repr.name,
            status: repr.status,
            messages: repr.messages,
            checks: repr.checks,
        })
    }
}

/// Outcome of probing a single MX hostname.
/// This is the value type stored in the scan cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostnameResult {
    pub domain: String,
    pub hostname: String,
    #[serde(flatten)]
    pub result: CheckResult,
    pub timestamp: DateTime<Utc>,
}

impl HostnameResult {
    pub fn new(domain: &str, hostname: &str) -> Self {
        Self {
            domain: domain.to_string(),
            hostname: hostname.to_string(),
            result: CheckResult::new(hostname),
            timestamp: Utc::now(),
        }
    }

    pub fn could_connect(&self) -> bool {
        self.subcheck_succeeded("connectivity")
    }

    pub fn could_starttls(&self) -> bool {
        self.subcheck_succeeded("starttls")
    }

    fn subcheck_succeeded(&self, name: &str) -> bool {
        self.result
            .checks
            .get(name)
            .is_some_and(|c| c.status == CheckStatus::Success)
    }
}

/// Aggregate verdict for a whole domain.
/// The three specialized high codes are only ever set by their
/// dedicated early-return paths in the domain check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum DomainStatus {
    #[default]
    Success,
    Warning,
    Failure,
    Error,
    NoStartTlsFailure,
    CouldNotConnect,
    BadHostnameFailure,
}

impl DomainStatus {
    /// Folds the status of one preferred hostname into the domain verdict.
    pub fn merge_check(self, status: CheckStatus) -> DomainStatus {
        let lifted = match status {
            CheckStatus::Success => DomainStatus::Success,
            CheckStatus::Warning => DomainStatus::Warning,
            CheckStatus::Failure => DomainStatus::Failure,
            CheckStatus::Error => DomainStatus::Error,
        };
        self.max(lifted)
    }

    fn as_u8(self) -> u8 {
        match self {
            DomainStatus::Success => 0,
            DomainStatus::Warning => 1,
            DomainStatus::Failure => 2,
            DomainStatus::Error => 3,
            DomainStatus::NoStartTlsFailure => 4,
            DomainStatus::CouldNotConnect => 5,
            DomainStatus::BadHostnameFailure => 6,
        }
    }

    fn from_u8(value: u64) -> Option<DomainStatus> {
        match value {
            0 => Some(DomainStatus::Success),
            1 => Some(DomainStatus::Warning),
            2 => Some(DomainStatus::Failure),
            3 => Some(DomainStatus::Error),
            4 => Some(DomainStatus::NoStartTlsFailure),
            5 => Some(DomainStatus::CouldNotConnect),
            6 => Some(DomainStatus::BadHostnameFailure),
            _ => None,
        }
    }
}

impl Serialize for DomainStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_u8())
    }
}

impl<'de> Deserialize<'de> for DomainStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = u64::deserialize(deserializer)?;
        DomainStatus::from_u8(value)
            .ok_or_else(|| de::Error::custom(format!("invalid domain status {value}")))
    }
}

impl fmt::Display for DomainStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = match self {
            DomainStatus::Success => "success",
            DomainStatus::Warning => "warning",
            DomainStatus::Failure => "failure",
            DomainStatus::Error => "error",
            DomainStatus::NoStartTlsFailure => "no starttls",
            DomainStatus::CouldNotConnect => "could not connect",
            DomainStatus::BadHostnameFailure => "bad hostname",
        };
        f.write_str(text)
    }
}

/// Result of the MTA-STS probe. Mode and MX patterns are kept even
/// when the overall status is a failure, so callers can inspect a
/// partially valid policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MtaStsResult {
    #[serde(flatten)]
    pub result: CheckResult,
    pub policy: String,
    pub mode: String,
    pub mxs: Vec<String>,
}

impl MtaStsResult {
    pub fn new() -> Self {
        Self {
            result: CheckResult::new("mta-sts"),
            policy: String::new(),
            mode: String::new(),
            mxs: Vec::new(),
        }
    }
}

impl Default for MtaStsResult {
    fn default() -> Self {
        Self::new()
    }
}

/// Results attached to a domain beyond the per-hostname scans.
/// The `mta-sts` tag carries the extended MTA-STS result, anything
/// else (like `policylist`) is a plain check result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExtraResult {
    MtaSts(MtaStsResult),
    Check(CheckResult),
}

/// Aggregate outcome for one domain: the per-hostname scans, the
/// set of hostnames that determined the verdict and any extra results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainResult {
    pub domain: String,
    #[serde(rename = "domain_status")]
    pub status: DomainStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default)]
    pub mx_hostnames: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preferred_hostnames: Vec<String>,
    #[serde(default)]
    pub hostname_results: HashMap<String, HostnameResult>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_results: BTreeMap<String, ExtraResult>,
}

impl DomainResult {
    pub fn new(domain: &str) -> Self {
        Self {
            domain: domain.to_string(),
            status: DomainStatus::Success,
            message: String::new(),
            mx_hostnames: Vec::new(),
            preferred_hostnames: Vec::new(),
            hostname_results: HashMap::new(),
            extra_results: BTreeMap::new(),
        }
    }

    pub fn mta_sts(&self) -> Option<&MtaStsResult> {
        match self.extra_results.get("mta-sts") {
            Some(ExtraResult::MtaSts(result)) => Some(result),
            _ => None,
        }
    }
}

/// Operator-facing explanation of what a check verifies.
/// Unknown names map to an empty string.
pub fn description(name: &str) -> &'static str {
    match name {
        "connectivity" => "The mail server accepts connections on port 25.",
        "starttls" => "The mail server offers an upgrade to an encrypted connection via STARTTLS.",
        "certificate" => {
            "The mail server presents a valid certificate matching its hostname and chaining to a trusted root."
        }
        "version" => "The mail server negotiates a modern TLS version and rejects obsolete protocols.",
        "mta-sts" => {
            "The domain publishes an MTA-STS policy instructing senders to deliver mail only over authenticated, encrypted connections."
        }
        "mta-sts-text" => "The domain announces its MTA-STS policy with a DNS TXT record.",
        "mta-sts-policy-file" => "The domain serves a valid MTA-STS policy file over HTTPS.",
        "policylist" => {
            "The domain is on the curated list of domains that have attested to a secure mail configuration."
        }
        _ => "",
    }
}

/// Short status label per check, keyed by check name and severity.
/// Unknown names map to an empty string.
pub fn status_text(name: &str, status: CheckStatus) -> &'static str {
    use CheckStatus::{Error, Failure, Success, Warning};
    match name {
        "connectivity" => match status {
            Success => "Server is reachable",
            Warning => "Server is reachable, with warnings",
            Failure => "Could not connect to server",
            Error => "Could not connect to server",
        },
        "starttls" => match status {
            Success => "Supports STARTTLS",
            Warning => "Supports STARTTLS, with warnings",
            Failure => "Does not support STARTTLS",
            Error => "Could not check STARTTLS support",
        },
        "certificate" => match status {
            Success => "Presents a valid certificate",
            Warning => "Certificate has warnings",
            Failure => "Does not present a valid certificate",
            Error => "Could not check the certificate",
        },
        "version" => match status {
            Success => "Uses an up-to-date version of TLS",
            Warning => "Should support a newer version of TLS",
            Failure => "Supports an insecure version of TLS",
            Error => "Could not check the TLS version",
        },
        "mta-sts" => match status {
            Success => "Serves a valid MTA-STS policy",
            Warning => "Serves an MTA-STS policy, with warnings",
            Failure => "Does not serve a valid MTA-STS policy",
            Error => "Could not check for an MTA-STS policy",
        },
        "mta-sts-text" => match status {
            Success => "Publishes a valid MTA-STS TXT record",
            Warning => "Publishes an MTA-STS TXT record, with warnings",
            Failure => "Does not publish a valid MTA-STS TXT record",
            Error => "Could not look up the MTA-STS TXT record",
        },
        "mta-sts-policy-file" => match status {
            Success => "Serves a valid MTA-STS policy file",
            Warning => "Serves an MTA-STS policy file, with warnings",
            Failure => "Does not serve a valid MTA-STS policy file",
            Error => "Could not fetch the MTA-STS policy file",
        },
        "policylist" => match status {
            Success => "Is on the policy list",
            Warning => "Is on the policy list, with warnings",
            Failure => "Is not on the policy list",
            Error => "Could not check the policy list",
        },
        _ => "",
    }
}
