#![forbid(unsafe_code)]

use anyhow::{Context, Result, ensure};
use starttls_audit::batch::{DomainStatsHandler, JsonResultHandler, check_csv};
use starttls_audit::cache::ScanCache;
use starttls_audit::config::Configuration;
use starttls_audit::domain_check::Checker;
use starttls_audit::http_client::HttpsClient;
use starttls_audit::tls::default_roots;
use std::io::Cursor;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncBufRead, BufReader};
use tracing::info;

// Domain lists fetched over HTTPS can be large
const MAX_CSV_SIZE: usize = 64 * 1024 * 1024;

#[tokio::main]
async fn main() -> Result<()> {
    // Create config from args and ENV variables.
    // Will exit early in case of error or help and version command.
    let config = Configuration::new();

    // Set up basic logging to stdout
    let subscriber = tracing_subscriber::fmt()
        .compact()
        .with_max_level(config.log_level)
        .with_target(false)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set up default tracing subscriber");

    // Log app name and version
    let version = env!("CARGO_PKG_VERSION");
    info!("STARTTLS Audit {version}");

    // Make configuration visible in logs
    config.log();

    let checker = Arc::new(Checker::from_config(&config));
    let cache = Arc::new(ScanCache::in_memory(config.cache_expiry()));

    if let Some(domain) = &config.domain {
        let result = checker.check_domain(domain, None, &cache).await;
        let json =
            serde_json::to_string_pretty(&result).context("Failed to serialize result")?;
        println!("{json}");
    } else if let Some(path) = &config.file {
        let file = File::open(path)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;
        run_batch(BufReader::new(file), &config, checker, cache).await?;
    } else if let Some(url) = &config.url {
        let client = HttpsClient::new(default_roots(), config.timeout(), MAX_CSV_SIZE);
        let response = client
            .get(url)
            .await
            .with_context(|| format!("Failed to fetch {url}"))?;
        ensure!(
            response.status == 200,
            "Fetching {url} returned status {}",
            response.status
        );
        let reader = BufReader::new(Cursor::new(response.body));
        run_batch(reader, &config, checker, cache).await?;
    }

    Ok(())
}

async fn run_batch<R>(
    reader: R,
    config: &Configuration,
    checker: Arc<Checker>,
    cache: Arc<ScanCache>,
) -> Result<()>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    if config.aggregate {
        let mut handler = DomainStatsHandler::default();
        check_csv(
            reader,
            config.column,
            config.pool_size,
            checker,
            cache,
            &mut handler,
        )
        .await?;
        let json =
            serde_json::to_string_pretty(&handler).context("Failed to serialize statistics")?;
        println!("{json}");
    } else {
        let mut handler = JsonResultHandler::new(std::io::stdout());
        check_csv(
            reader,
            config.column,
            config.pool_size,
            checker,
            cache,
            &mut handler,
        )
        .await?;
    }
    Ok(())
}
