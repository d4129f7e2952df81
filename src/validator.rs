use crate::cache::ScanCache;
use crate::domain_check::Checker;
use crate::mta_sts::check_mta_sts;
use crate::policy::{PolicyStore, PolicySubmission};
use crate::results::{CheckStatus, DomainResult, DomainStatus};
use chrono::Utc;
use cron::Schedule;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::Receiver;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

// Hostname scans stay valid this long between validated domains
const VALIDATION_CACHE_EXPIRY: Duration = Duration::from_secs(3600);

pub type DomainCallback = Box<dyn Fn(&str, &str, &DomainResult) + Send + Sync>;

/// Periodic revalidation of already-attested domains, to catch
/// configurations that regressed after attestation.
pub struct Validator {
    pub name: String,
    pub interval: Duration,
    /// Optional cron schedule taking precedence over the interval
    pub schedule: Option<Schedule>,
    pub on_success: Option<DomainCallback>,
    pub on_failure: Option<DomainCallback>,
}

impl Validator {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            interval: Duration::from_secs(24 * 60 * 60),
            schedule: None,
            on_success: None,
            on_failure: None,
        }
    }
}

/// Runs the validator until the stop signal fires. Cancellation is
/// honored between runs only, a run in progress completes.
pub fn start_validator(
    validator: Validator,
    store: Arc<dyn PolicyStore>,
    checker: Arc<Checker>,
    mut stop_signal: Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            "Started validator {} with check interval of {} secs",
            validator.name,
            validator.interval.as_secs()
        );
        let cache = ScanCache::in_memory(VALIDATION_CACHE_EXPIRY);
        loop {
            // Check how long we need to sleep
            let mut duration = validator.interval;
            if let Some(schedule) = &validator.schedule {
                if let Some(next_run) = schedule.upcoming(Utc).next() {
                    let delta = next_run - Utc::now();
                    duration = Duration::from_millis(delta.num_milliseconds().max(0) as u64);
                } else {
                    warn!("Unable to find next scheduled run, falling back to interval...");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(duration) => {},
                _ = stop_signal.recv() => { break; },
            }

            let start = Instant::now();
            info!("Starting validation run for {}...", validator.name);
            validate_all(&validator, store.as_ref(), &checker, &cache).await;
            info!(
                "Finished validation run after {:.3}s",
                start.elapsed().as_secs_f64()
            );
        }
    })
}

/// One validation run over every domain the store knows.
pub async fn validate_all(
    validator: &Validator,
    store: &dyn PolicyStore,
    checker: &Checker,
    cache: &ScanCache,
) {
    let domains = match store.domains_to_validate().await {
        Ok(domains) => domains,
        Err(err) => {
            error!("Failed to list domains for {}: {err:#}", validator.name);
            return;
        }
    };
    for domain in domains {
        let policy = match store.get_policy(&domain).await {
            Ok(Some(policy)) => policy,
            Ok(None) => {
                warn!("No stored policy for {domain}, skipping");
                continue;
            }
            Err(err) => {
                error!("Failed to load the policy for {domain}: {err:#}");
                continue;
            }
        };
        let policy = if policy.mta_sts {
            refresh_mta_sts_policy(store, checker, policy).await
        } else {
            policy
        };

        let result = checker.check_domain(&domain, Some(&policy.mxs), cache).await;
        if result.status != DomainStatus::Success {
            if let Some(callback) = &validator.on_failure {
                callback(&validator.name, &domain, &result);
            }
            report_failure(&validator.name, &domain, &result);
        } else if let Some(callback) = &validator.on_success {
            callback(&validator.name, &domain, &result);
        }
    }
}

/// MTA-STS backed policies are re-derived before validation, so the
/// check runs against what the domain currently publishes. The store
/// is updated when the published MX patterns changed.
async fn refresh_mta_sts_policy(
    store: &dyn PolicyStore,
    checker: &Checker,
    stored: PolicySubmission,
) -> PolicySubmission {
    let Ok(ascii) = idna::domain_to_ascii(&stored.domain) else {
        warn!(
            "Could not convert {} to an ASCII domain name, keeping the stored policy",
            stored.domain
        );
        return stored;
    };
    let fresh = check_mta_sts(
        checker.dns.as_ref(),
        checker.policy_fetch.as_ref(),
        &ascii,
        &HashMap::new(),
    )
    .await;
    if fresh.result.status != CheckStatus::Success || fresh.mxs.is_empty() || fresh.mxs == stored.mxs
    {
        return stored;
    }
    let updated = PolicySubmission {
        mxs: fresh.mxs,
        ..stored.clone()
    };
    match store.update_policy(updated.clone()).await {
        Ok(()) => updated,
        Err(err) => {
            warn!("Failed to store the refreshed policy for {}: {err:#}", stored.domain);
            stored
        }
    }
}

/// The default report for a failed validation, emitted after any user
/// callback.
fn report_failure(name: &str, domain: &str, result: &DomainResult) {
    error!(
        "{name}: validation failed for {domain} with status \"{}\": {}",
        result.status, result.message
    );
}
