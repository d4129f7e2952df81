use crate::results::CheckResult;
use anyhow::Result;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

/// A domain's attested mail policy: either derived from its MTA-STS
/// policy or a manually submitted list of MX patterns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySubmission {
    pub domain: String,
    /// Whether the MX patterns are derived from the domain's MTA-STS
    /// policy and should be refreshed from it before validation.
    pub mta_sts: bool,
    pub mxs: Vec<String>,
}

/// Read-only membership lookup against the curated policy list.
pub trait PolicyList: Send + Sync {
    fn has_domain<'a>(&'a self, domain: &'a str) -> BoxFuture<'a, bool>;
}

/// Source of attested domains and their policies for revalidation.
pub trait PolicyStore: Send + Sync {
    fn domains_to_validate(&self) -> BoxFuture<'_, Result<Vec<String>>>;

    fn get_policy<'a>(&'a self, domain: &'a str) -> BoxFuture<'a, Result<Option<PolicySubmission>>>;

    fn update_policy(&self, submission: PolicySubmission) -> BoxFuture<'_, Result<()>>;
}

/// Builds the `policylist` result for a domain. Callers attach it to a
/// domain result's extra results; the domain check itself never
/// consults the list.
pub async fn check_policy_list(list: &dyn PolicyList, domain: &str) -> CheckResult {
    let mut check = CheckResult::new("policylist");
    if list.has_domain(domain).await {
        check.record_success();
    } else {
        check.record_failure("Domain is not on the policy list.");
    }
    check
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::CheckStatus;
    use std::collections::HashSet;

    struct FixedList(HashSet<String>);

    impl PolicyList for FixedList {
        fn has_domain<'a>(&'a self, domain: &'a str) -> BoxFuture<'a, bool> {
            Box::pin(async move { self.0.contains(domain) })
        }
    }

    #[tokio::test]
    async fn membership_determines_the_status() {
        let list = FixedList(HashSet::from(["example.com".to_string()]));

        let listed = check_policy_list(&list, "example.com").await;
        assert_eq!(listed.status, CheckStatus::Success);
        assert!(listed.messages.is_empty());

        let unlisted = check_policy_list(&list, "other.org").await;
        assert_eq!(unlisted.status, CheckStatus::Failure);
        assert_eq!(unlisted.messages, vec!["Failure: Domain is not on the policy list."]);
    }

    #[test]
    fn submission_round_trip() {
        let submission = PolicySubmission {
            domain: "example.com".to_string(),
            mta_sts: true,
            mxs: vec!["*.example.com".to_string()],
        };
        let json = serde_json::to_string(&submission).unwrap();
        let back: PolicySubmission = serde_json::from_str(&json).unwrap();
        assert_eq!(back, submission);
    }
}
