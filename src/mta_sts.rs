use crate::dns_client::DnsLookup;
use crate::domain_check::policy_matches;
use crate::http_client::PolicyFetch;
use crate::results::{CheckResult, HostnameResult, MtaStsResult};
use regex::Regex;
use std::collections::HashMap;

// RFC 8461: policy max_age is capped at about one year
const MAX_POLICY_AGE: u64 = 31_557_600;

/// Checks a domain's MTA-STS adoption: the `_mta-sts` TXT record and
/// the policy file served over HTTPS, plus the cross-check of the
/// policy against the hostname scans. The policy mode and MX patterns
/// are reported even when the checks fail.
pub async fn check_mta_sts(
    dns: &dyn DnsLookup,
    fetch: &dyn PolicyFetch,
    domain: &str,
    hostname_results: &HashMap<String, HostnameResult>,
) -> MtaStsResult {
    let mut result = MtaStsResult::new();
    let (text_check, file_probe) = tokio::join!(
        check_mta_sts_record(dns, domain),
        check_mta_sts_policy_file(fetch, domain, hostname_results),
    );
    result.result.add_subcheck(text_check);
    result.result.add_subcheck(file_probe.check);
    result.policy = file_probe.policy;
    result.mode = file_probe.mode;
    result.mxs = file_probe.mxs;
    result
}

/// Looks up and validates the `_mta-sts.<domain>` TXT record.
async fn check_mta_sts_record(dns: &dyn DnsLookup, domain: &str) -> CheckResult {
    let mut check = CheckResult::new("mta-sts-text");
    let name = format!("_mta-sts.{domain}");
    let records = match dns.lookup_txt(&name).await {
        Ok(records) => records,
        Err(err) => {
            check.record_error(format!("Could not look up the TXT record for {name}: {err:#}"));
            return check;
        }
    };

    let matching: Vec<&String> = records
        .iter()
        .filter(|record| record.starts_with("v=STSv1"))
        .collect();
    if matching.len() != 1 {
        check.record_failure(format!(
            "Exactly 1 MTA-STS TXT record is required, found {}.",
            matching.len()
        ));
        return check;
    }

    let fields = parse_key_value_pairs(matching[0], ';', '=');
    let id_pattern = Regex::new("^[A-Za-z0-9]+$").expect("Failed to parse Regex");
    match fields.get("id") {
        Some(id) if id_pattern.is_match(id) => check.record_success(),
        Some(id) => check.record_failure(format!("Invalid id {id:?} in the MTA-STS TXT record.")),
        None => check.record_failure("The MTA-STS TXT record has no id field."),
    }
    check
}

struct PolicyFileProbe {
    check: CheckResult,
    policy: String,
    mode: String,
    mxs: Vec<String>,
}

impl PolicyFileProbe {
    fn empty(check: CheckResult) -> Self {
        Self {
            check,
            policy: String::new(),
            mode: String::new(),
            mxs: Vec::new(),
        }
    }
}

/// Fetches and validates the policy file, then cross-checks its MX
/// patterns against the hostname scans.
async fn check_mta_sts_policy_file(
    fetch: &dyn PolicyFetch,
    domain: &str,
    hostname_results: &HashMap<String, HostnameResult>,
) -> PolicyFileProbe {
    let mut check = CheckResult::new("mta-sts-policy-file");
    let url = format!("https://mta-sts.{domain}/.well-known/mta-sts.txt");
    let response = match fetch.fetch(&url).await {
        Ok(response) => response,
        Err(err) => {
            check.record_error(format!("Could not fetch the policy file: {err:#}"));
            return PolicyFileProbe::empty(check);
        }
    };

    if response.status != 200 {
        check.record_failure(format!(
            "The policy file request returned status {}.",
            response.status
        ));
        return PolicyFileProbe::empty(check);
    }
    if !response.content_type.starts_with("text/plain") {
        check.record_warning(format!(
            "The policy file should be served as text/plain, got {:?}.",
            response.content_type
        ));
    }

    let policy = String::from_utf8_lossy(&response.body).to_string();
    let fields = parse_key_value_pairs(&policy, '\n', ':');
    let mode = fields.get("mode").cloned().unwrap_or_default();
    // Repeated mx lines were folded with spaces, split them back apart
    let mxs: Vec<String> = fields
        .get("mx")
        .map(|mx| mx.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default();

    match fields.get("version") {
        Some(version) if version == "STSv1" => {}
        Some(version) => {
            check.record_failure(format!("The policy version must be STSv1, got {version:?}."));
        }
        None => check.record_failure("The policy file has no version field."),
    }

    match mode.as_str() {
        "enforce" => {}
        "testing" => check.record_warning(
            "The policy is in testing mode, senders will not enforce it.",
        ),
        "none" => check.record_failure("The policy mode is none."),
        "" => check.record_failure("The policy file has no mode field."),
        other => check.record_failure(format!(
            "The policy mode must be enforce, testing or none, got {other:?}."
        )),
    }

    match fields.get("max_age").map(|value| value.parse::<u64>()) {
        Some(Ok(age)) if (1..=MAX_POLICY_AGE).contains(&age) => {}
        Some(Ok(age)) => check.record_failure(format!(
            "The policy max_age must be between 1 and {MAX_POLICY_AGE}, got {age}."
        )),
        Some(Err(_)) => check.record_failure("The policy max_age must be an integer."),
        None => check.record_failure("The policy file has no max_age field."),
    }

    // Every MX hostname we could reach must be covered by the policy
    // and must have negotiated STARTTLS. Unreachable hostnames are
    // ignored, they may be spam traps.
    let mut hostnames: Vec<&String> = hostname_results.keys().collect();
    hostnames.sort();
    for hostname in hostnames {
        let scan = &hostname_results[hostname];
        if !scan.could_connect() {
            continue;
        }
        if !policy_matches(hostname, &mxs) {
            check.record_failure(format!(
                "{hostname} appears in the DNS record but not the MTA-STS policy file."
            ));
        } else if !scan.could_starttls() {
            check.record_failure(format!(
                "{hostname} is listed in the MTA-STS policy file but did not negotiate STARTTLS."
            ));
        }
    }

    check.record_success();
    PolicyFileProbe {
        check,
        policy,
        mode,
        mxs,
    }
}

/// Splits `pair_separator`-delimited input into `key_separator`-split
/// pairs with trimmed keys and values. Values of duplicate keys are
/// folded by joining them with a space.
fn parse_key_value_pairs(
    input: &str,
    pair_separator: char,
    key_separator: char,
) -> HashMap<String, String> {
    let mut fields: HashMap<String, String> = HashMap::new();
    for pair in input.split(pair_separator) {
        let Some((key, value)) = pair.split_once(key_separator) else {
            continue;
        };
        let key = key.trim().to_string();
        let value = value.trim();
        fields
            .entry(key)
            .and_modify(|existing| {
                existing.push(' ');
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::CheckStatus;
    use crate::test_support::{FakeDns, FakePolicyFetch, scripted_scan};

    async fn run_policy_file(
        policy: &str,
        hostname_results: &HashMap<String, HostnameResult>,
    ) -> PolicyFileProbe {
        let fetch = FakePolicyFetch::serving(policy);
        check_mta_sts_policy_file(&fetch, "example.com", hostname_results).await
    }

    #[test]
    fn key_value_parsing_folds_duplicates() {
        let fields = parse_key_value_pairs("v=STSv1; id=20240101", ';', '=');
        assert_eq!(fields["v"], "STSv1");
        assert_eq!(fields["id"], "20240101");

        let fields = parse_key_value_pairs(
            "version: STSv1\nmx: a.example.com\nmx: b.example.com\njunk line\n",
            '\n',
            ':',
        );
        assert_eq!(fields["version"], "STSv1");
        assert_eq!(fields["mx"], "a.example.com b.example.com");
        assert!(!fields.contains_key("junk line"));
    }

    #[tokio::test]
    async fn valid_txt_record() {
        let dns = FakeDns::with_txt("_mta-sts.example.com", vec!["v=STSv1; id=20240101abc"]);
        let check = check_mta_sts_record(&dns, "example.com").await;
        assert_eq!(check.status, CheckStatus::Success);
    }

    #[tokio::test]
    async fn missing_txt_record_is_a_failure() {
        let dns = FakeDns::with_txt("_mta-sts.example.com", vec!["v=spf1 -all"]);
        let check = check_mta_sts_record(&dns, "example.com").await;
        assert_eq!(check.status, CheckStatus::Failure);
        assert_eq!(
            check.messages,
            vec!["Failure: Exactly 1 MTA-STS TXT record is required, found 0."]
        );
    }

    #[tokio::test]
    async fn multiple_txt_records_are_a_failure() {
        let dns = FakeDns::with_txt(
            "_mta-sts.example.com",
            vec!["v=STSv1; id=1", "v=STSv1; id=2"],
        );
        let check = check_mta_sts_record(&dns, "example.com").await;
        assert_eq!(check.status, CheckStatus::Failure);
    }

    #[tokio::test]
    async fn invalid_txt_id_is_a_failure() {
        for record in ["v=STSv1; id=2024-01-01", "v=STSv1; id=", "v=STSv1"] {
            let dns = FakeDns::with_txt("_mta-sts.example.com", vec![record]);
            let check = check_mta_sts_record(&dns, "example.com").await;
            assert_eq!(check.status, CheckStatus::Failure, "record {record:?}");
        }
    }

    #[tokio::test]
    async fn txt_lookup_error_is_an_error() {
        let dns = FakeDns::failing();
        let check = check_mta_sts_record(&dns, "example.com").await;
        assert_eq!(check.status, CheckStatus::Error);
    }

    #[tokio::test]
    async fn valid_policy_file() {
        let probe = run_policy_file(
            "version: STSv1\nmode: enforce\nmax_age:100000\nmx: foo.example.com\n",
            &HashMap::new(),
        )
        .await;
        assert_eq!(probe.check.status, CheckStatus::Success);
        assert_eq!(probe.mode, "enforce");
        assert_eq!(probe.mxs, vec!["foo.example.com"]);
    }

    #[tokio::test]
    async fn unknown_mode_is_a_failure() {
        let probe = run_policy_file(
            "version: STSv1\nmode: start_turtles\nmax_age:100000\n",
            &HashMap::new(),
        )
        .await;
        assert_eq!(probe.check.status, CheckStatus::Failure);
        // The partial policy is still reported
        assert_eq!(probe.mode, "start_turtles");
    }

    #[tokio::test]
    async fn testing_mode_is_a_warning() {
        let probe = run_policy_file(
            "version: STSv1\nmode: testing\nmax_age: 86400\nmx: mx.example.com\n",
            &HashMap::new(),
        )
        .await;
        assert_eq!(probe.check.status, CheckStatus::Warning);
    }

    #[tokio::test]
    async fn none_mode_is_a_failure() {
        let probe = run_policy_file(
            "version: STSv1\nmode: none\nmax_age: 86400\n",
            &HashMap::new(),
        )
        .await;
        assert_eq!(probe.check.status, CheckStatus::Failure);
    }

    #[tokio::test]
    async fn bad_max_age_is_a_failure() {
        for policy in [
            "version: STSv1\nmode: enforce\nmax_age: 0\n",
            "version: STSv1\nmode: enforce\nmax_age: 31557601\n",
            "version: STSv1\nmode: enforce\nmax_age: soon\n",
            "version: STSv1\nmode: enforce\n",
        ] {
            let probe = run_policy_file(policy, &HashMap::new()).await;
            assert_eq!(probe.check.status, CheckStatus::Failure, "policy {policy:?}");
        }
    }

    #[tokio::test]
    async fn non_200_status_is_a_failure() {
        let fetch = FakePolicyFetch::with_status(404);
        let probe = check_mta_sts_policy_file(&fetch, "example.com", &HashMap::new()).await;
        assert_eq!(probe.check.status, CheckStatus::Failure);
    }

    #[tokio::test]
    async fn fetch_error_is_an_error() {
        let fetch = FakePolicyFetch::failing();
        let probe = check_mta_sts_policy_file(&fetch, "example.com", &HashMap::new()).await;
        assert_eq!(probe.check.status, CheckStatus::Error);
    }

    #[tokio::test]
    async fn wrong_content_type_is_a_warning_only() {
        let fetch = FakePolicyFetch::serving(
            "version: STSv1\nmode: enforce\nmax_age: 86400\nmx: mx.example.com\n",
        )
        .content_type("text/html");
        let probe = check_mta_sts_policy_file(&fetch, "example.com", &HashMap::new()).await;
        assert_eq!(probe.check.status, CheckStatus::Warning);

        // A later failure overrides the warning
        let fetch = FakePolicyFetch::serving("version: STSv1\nmode: none\nmax_age: 86400\n")
            .content_type("text/html");
        let probe = check_mta_sts_policy_file(&fetch, "example.com", &HashMap::new()).await;
        assert_eq!(probe.check.status, CheckStatus::Failure);
    }

    #[tokio::test]
    async fn cross_check_flags_uncovered_hostnames() {
        let mut scans = HashMap::new();
        scans.insert(
            "mx.other.net".to_string(),
            scripted_scan("example.com", "mx.other.net", true, true),
        );
        let probe = run_policy_file(
            "version: STSv1\nmode: enforce\nmax_age: 86400\nmx: *.example.com\n",
            &scans,
        )
        .await;
        assert_eq!(probe.check.status, CheckStatus::Failure);
        assert!(
            probe.check.messages.iter().any(|m| m.contains(
                "mx.other.net appears in the DNS record but not the MTA-STS policy file"
            ))
        );
    }

    #[tokio::test]
    async fn cross_check_flags_covered_hostnames_without_starttls() {
        let mut scans = HashMap::new();
        scans.insert(
            "mx.example.com".to_string(),
            scripted_scan("example.com", "mx.example.com", true, false),
        );
        let probe = run_policy_file(
            "version: STSv1\nmode: enforce\nmax_age: 86400\nmx: mx.example.com\n",
            &scans,
        )
        .await;
        assert_eq!(probe.check.status, CheckStatus::Failure);
    }

    #[tokio::test]
    async fn cross_check_ignores_unreachable_hostnames() {
        let mut scans = HashMap::new();
        scans.insert(
            "trap.example.com".to_string(),
            scripted_scan("example.com", "trap.example.com", false, false),
        );
        let probe = run_policy_file(
            "version: STSv1\nmode: enforce\nmax_age: 86400\nmx: mx.example.com\n",
            &scans,
        )
        .await;
        assert_eq!(probe.check.status, CheckStatus::Success);
    }

    #[tokio::test]
    async fn parent_result_combines_both_probes() {
        let dns = FakeDns::with_txt("_mta-sts.example.com", vec!["v=STSv1; id=20240101"]);
        let fetch = FakePolicyFetch::serving(
            "version: STSv1\nmode: enforce\nmax_age: 86400\nmx: mx.example.com\n",
        );
        let result = check_mta_sts(&dns, &fetch, "example.com", &HashMap::new()).await;
        assert_eq!(result.result.status, CheckStatus::Success);
        assert_eq!(result.result.checks.len(), 2);
        assert_eq!(result.mode, "enforce");
        assert_eq!(result.mxs, vec!["mx.example.com"]);
        assert!(result.policy.contains("version: STSv1"));
    }
}
