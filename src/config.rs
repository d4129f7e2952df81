use clap::error::ErrorKind;
use clap::{ArgGroup, Parser};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{Level, info};

#[derive(Parser, Clone)]
#[command(version, about, long_about = None)]
#[command(group(ArgGroup::new("input").required(true).args(["domain", "file", "url"])))]
pub struct Configuration {
    /// Check a single mail domain and print its result as JSON
    #[arg(long)]
    pub domain: Option<String>,

    /// Check every domain from a CSV file
    #[arg(long)]
    pub file: Option<PathBuf>,

    /// Check every domain from a CSV fetched over HTTPS
    #[arg(long)]
    pub url: Option<String>,

    /// Aggregate results into adoption statistics instead of printing
    /// every result
    #[arg(long)]
    pub aggregate: bool,

    /// Zero-based CSV column holding the domain names
    #[arg(long, default_value_t = 0)]
    pub column: usize,

    /// Timeout in seconds for each network operation of a probe
    #[arg(long, env = "CHECK_TIMEOUT", default_value_t = 10)]
    pub timeout: u64,

    /// Number of domains checked in parallel in CSV mode
    #[arg(long, env = "CONNECTION_POOL_SIZE", default_value_t = 16)]
    pub pool_size: usize,

    /// Name presented to mail servers in the EHLO command
    #[arg(long, env = "HOSTNAME", default_value = "localhost")]
    pub helo_name: String,

    /// DNS server used for the MX and TXT lookups
    #[arg(long, env = "DNS_SERVER", default_value = "1.1.1.1:53")]
    pub dns_server: SocketAddr,

    /// Seconds a cached hostname scan stays valid
    #[arg(long, env = "CACHE_EXPIRY", default_value_t = 600)]
    pub cache_expiry: u64,

    /// Also probe whether servers accept RC4 cipher suites
    #[arg(long, env = "CHECK_CIPHERS")]
    pub check_ciphers: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env, default_value_t = Level::INFO)]
    pub log_level: Level,
}

impl Configuration {
    /// Create config from args and ENV variables. Exits with the usage
    /// message when no input source or more than one is selected.
    pub fn new() -> Self {
        match Configuration::try_parse() {
            Ok(config) => config,
            Err(err) if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
                let _ = err.print();
                std::process::exit(0);
            }
            Err(err) => {
                let _ = err.print();
                std::process::exit(1);
            }
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn cache_expiry(&self) -> Duration {
        Duration::from_secs(self.cache_expiry)
    }

    pub fn log(&self) {
        info!("Log Level: {}", self.log_level);

        info!("Domain: {:?}", self.domain);
        info!("File: {:?}", self.file);
        info!("URL: {:?}", self.url);
        info!("Aggregate: {}", self.aggregate);
        info!("CSV Column: {}", self.column);

        info!("Check Timeout: {} seconds", self.timeout);
        info!("Connection Pool Size: {}", self.pool_size);
        info!("EHLO Name: {}", self.helo_name);
        info!("DNS Server: {}", self.dns_server);
        info!("Cache Expiry: {} seconds", self.cache_expiry);
        info!("Cipher Check: {}", self.check_ciphers);
    }
}
