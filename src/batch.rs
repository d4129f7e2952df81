use crate::cache::ScanCache;
use crate::domain_check::Checker;
use crate::results::DomainResult;
use anyhow::{Context, Result};
use serde::Serialize;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::Mutex;
use tokio::sync::mpsc::channel;
use tracing::{error, info};

/// Receives every finished domain check. Called from a single task,
/// so implementations need no locking.
pub trait DomainHandler {
    fn handle_domain(&mut self, result: DomainResult);
}

/// Streams domain names from CSV-like input through a bounded pool of
/// checker workers and feeds the results to the handler. The order of
/// handler calls is unrelated to the input order. Errors reading the
/// input are fatal, everything else ends up in the results.
pub async fn check_csv<R>(
    reader: R,
    column: usize,
    pool_size: usize,
    checker: Arc<Checker>,
    cache: Arc<ScanCache>,
    handler: &mut dyn DomainHandler,
) -> Result<()>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    let pool_size = pool_size.max(1);
    let (work_sender, work_receiver) = channel::<String>(pool_size);
    let work_receiver = Arc::new(Mutex::new(work_receiver));
    let (result_sender, mut result_receiver) = channel::<DomainResult>(pool_size);

    // One producer reads the input and publishes domains. Dropping the
    // sender on EOF lets the workers drain and exit.
    let producer = tokio::spawn(async move {
        let mut lines = reader.lines();
        loop {
            let line = lines
                .next_line()
                .await
                .context("Failed to read input line")?;
            let Some(line) = line else {
                break;
            };
            let Some(domain) = extract_column(&line, column) else {
                continue;
            };
            if work_sender.send(domain).await.is_err() {
                break;
            }
        }
        Ok::<(), anyhow::Error>(())
    });

    // The worker pool pulls domains and publishes results
    let mut workers = Vec::new();
    for _ in 0..pool_size {
        let work_receiver = work_receiver.clone();
        let result_sender = result_sender.clone();
        let checker = checker.clone();
        let cache = cache.clone();
        workers.push(tokio::spawn(async move {
            loop {
                let domain = { work_receiver.lock().await.recv().await };
                let Some(domain) = domain else {
                    break;
                };
                let result = checker.check_domain(&domain, None, &cache).await;
                if result_sender.send(result).await.is_err() {
                    break;
                }
            }
        }));
    }
    // The workers hold the remaining senders, the channel closes when
    // the last one exits
    drop(result_sender);

    // Drain the results in this task
    while let Some(result) = result_receiver.recv().await {
        handler.handle_domain(result);
    }

    for worker in workers {
        worker.await.context("Worker task failed")?;
    }
    producer.await.context("Producer task failed")??;
    Ok(())
}

fn extract_column(line: &str, column: usize) -> Option<String> {
    let field = line.split(',').nth(column)?;
    let domain = field.trim().trim_matches('"').trim();
    if domain.is_empty() {
        None
    } else {
        Some(domain.to_string())
    }
}

/// Writes every result as one line of JSON as it arrives.
pub struct JsonResultHandler<W: Write> {
    writer: W,
}

impl<W: Write> JsonResultHandler<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl<W: Write> DomainHandler for JsonResultHandler<W> {
    fn handle_domain(&mut self, result: DomainResult) {
        match serde_json::to_string(&result) {
            Ok(json) => {
                if let Err(err) = writeln!(self.writer, "{json}") {
                    error!("Failed to write result for {}: {err}", result.domain);
                }
            }
            Err(err) => error!("Failed to serialize result for {}: {err}", result.domain),
        }
    }
}

/// Counts checked domains and partitions them by MTA-STS mode.
#[derive(Default, Serialize)]
pub struct DomainStatsHandler {
    pub attempted: usize,
    pub with_mxs: usize,
    pub mta_sts_testing: Vec<String>,
    pub mta_sts_enforce: Vec<String>,
}

impl DomainHandler for DomainStatsHandler {
    fn handle_domain(&mut self, result: DomainResult) {
        self.attempted += 1;
        if self.attempted % 1000 == 0 {
            info!("Processed {} domains...", self.attempted);
        }
        if result.mx_hostnames.is_empty() {
            return;
        }
        self.with_mxs += 1;
        if let Some(sts) = result.mta_sts() {
            match sts.mode.as_str() {
                "enforce" => self.mta_sts_enforce.push(result.domain.clone()),
                "testing" => self.mta_sts_testing.push(result.domain.clone()),
                _ => {}
            }
        }
    }
}
