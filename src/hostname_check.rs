use crate::results::{CheckResult, HostnameResult};
use crate::smtp_client::{SmtpConnection, SmtpReply, address_with_default_port, host_without_port};
use crate::tls::{
    insecure_client_config, offer_client_hello, rc4_client_hello, ssl3_client_hello,
    verify_certificate_chain, verify_certificate_name,
};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::rustls::{ClientConfig, ProtocolVersion, RootCertStore};
use tokio_rustls::rustls::pki_types::ServerName;
use tracing::debug;

/// Probes one MX hostname. Injected into the domain check so tests can
/// script per-hostname outcomes.
pub trait HostnameProbe: Send + Sync {
    fn probe<'a>(&'a self, domain: &'a str, hostname: &'a str) -> BoxFuture<'a, HostnameResult>;
}

/// The production prober: one SMTP conversation per call, driving
/// connectivity, STARTTLS, certificate and TLS version checks.
pub struct SmtpProber {
    helo_name: String,
    timeout: Duration,
    roots: Arc<RootCertStore>,
    check_ciphers: bool,
    insecure: Arc<ClientConfig>,
}

impl SmtpProber {
    pub fn new(
        helo_name: String,
        timeout: Duration,
        roots: Arc<RootCertStore>,
        check_ciphers: bool,
    ) -> Self {
        Self {
            helo_name,
            timeout,
            roots,
            check_ciphers,
            insecure: insecure_client_config(),
        }
    }

    pub async fn check_hostname(&self, domain: &str, hostname: &str) -> HostnameResult {
        debug!("Checking hostname {hostname} for domain {domain}");
        let mut scan = HostnameResult::new(domain, hostname);
        let address = address_with_default_port(hostname);

        // Dial and greet. A server that cannot complete the SMTP
        // greeting is treated as unreachable.
        let mut connectivity = CheckResult::new("connectivity");
        let (conn, ehlo) = match self.connect_and_ehlo(&address).await {
            Ok(opened) => opened,
            Err(err) => {
                connectivity.record_error(format!("Could not establish connection: {err:#}"));
                scan.result.add_subcheck(connectivity);
                return scan;
            }
        };
        connectivity.record_success();
        scan.result.add_subcheck(connectivity);

        // STARTTLS support and handshake
        let mut starttls = CheckResult::new("starttls");
        if !ehlo.has_extension("STARTTLS") {
            conn.quit().await;
            starttls.record_failure("Server does not advertise support for STARTTLS.");
            scan.result.add_subcheck(starttls);
            return scan;
        }
        let host = host_without_port(hostname).to_string();
        let Ok(server_name) = ServerName::try_from(host.clone()) else {
            starttls.record_error(format!("{host} is not a valid server name."));
            scan.result.add_subcheck(starttls);
            return scan;
        };
        // Verification happens explicitly below, the handshake itself
        // accepts any certificate
        let tls = match conn.starttls(self.insecure.clone(), server_name).await {
            Ok(tls) => tls,
            Err(_) => {
                starttls.record_failure("Could not complete a TLS handshake.");
                scan.result.add_subcheck(starttls);
                return scan;
            }
        };
        starttls.record_success();
        scan.result.add_subcheck(starttls);

        // Certificate name and chain, reported independently
        let (_, tls_state) = tls.get_ref();
        let mut certificate = CheckResult::new("certificate");
        match tls_state.peer_certificates() {
            Some(chain) if !chain.is_empty() => {
                if let Err(err) = verify_certificate_name(&chain[0], &host) {
                    certificate
                        .record_failure(format!("Certificate is not valid for {host}: {err}"));
                }
                if let Err(err) = verify_certificate_chain(self.roots.clone(), chain, &host) {
                    certificate.record_failure(format!("Certificate chain is not valid: {err}"));
                }
                certificate.record_success();
            }
            _ => certificate.record_error("Server presented no certificate after the handshake."),
        }
        scan.result.add_subcheck(certificate);

        // TLS version: warn about pre-1.2, fail on accepted SSLv3
        let mut version = CheckResult::new("version");
        match tls_state.protocol_version() {
            Some(ProtocolVersion::TLSv1_2 | ProtocolVersion::TLSv1_3) => {}
            Some(_) => version.record_warning("Server should support TLSv1.2, but doesn't."),
            None => version.record_error("No TLS version negotiated."),
        }
        drop(tls);
        if self.attempt_legacy_handshake(&address, &ssl3_client_hello()).await {
            version.record_failure("Server should NOT support SSLv2/3, but does.");
        } else {
            version.record_success();
        }
        scan.result.add_subcheck(version);

        // Opt-in stage, never run by default
        if self.check_ciphers {
            scan.result.add_subcheck(self.check_tls_cipher(&address).await);
        }

        scan
    }

    /// Probes whether the server accepts any RC4-based cipher suite.
    async fn check_tls_cipher(&self, address: &str) -> CheckResult {
        let mut cipher = CheckResult::new("cipher");
        if self.attempt_legacy_handshake(address, &rc4_client_hello()).await {
            cipher.record_failure("Server should NOT support RC4 cipher suites, but does.");
        } else {
            cipher.record_success();
        }
        cipher
    }

    async fn connect_and_ehlo(
        &self,
        address: &str,
    ) -> anyhow::Result<(SmtpConnection<TcpStream>, SmtpReply)> {
        let mut conn = SmtpConnection::open(address, self.timeout).await?;
        let ehlo = conn.ehlo(&self.helo_name).await?;
        Ok((conn, ehlo))
    }

    /// Opens a fresh conversation up to STARTTLS and offers a hand-built
    /// ClientHello. Servers that cannot be reached again count as not
    /// accepting the offer.
    async fn attempt_legacy_handshake(&self, address: &str, hello: &[u8]) -> bool {
        let Ok((conn, ehlo)) = self.connect_and_ehlo(address).await else {
            return false;
        };
        if !ehlo.has_extension("STARTTLS") {
            conn.quit().await;
            return false;
        }
        let Ok(stream) = conn.starttls_raw().await else {
            return false;
        };
        offer_client_hello(stream, hello, self.timeout).await
    }
}

impl HostnameProbe for SmtpProber {
    fn probe<'a>(&'a self, domain: &'a str, hostname: &'a str) -> BoxFuture<'a, HostnameResult> {
        Box::pin(self.check_hostname(domain, hostname))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::CheckStatus;
    use crate::tls::default_roots;
    use rcgen::{CertifiedKey, generate_simple_self_signed};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_rustls::TlsAcceptor;
    use tokio_rustls::rustls::ServerConfig;
    use tokio_rustls::rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};

    fn prober() -> SmtpProber {
        prober_with(default_roots(), false)
    }

    fn prober_with(roots: Arc<RootCertStore>, check_ciphers: bool) -> SmtpProber {
        SmtpProber::new("localhost".to_string(), Duration::from_secs(2), roots, check_ciphers)
    }

    /// A self-signed server certificate for the given names, plus a
    /// trust store that contains exactly that certificate.
    fn tls_server_parts(subject_alt_names: &[&str]) -> (TlsAcceptor, Arc<RootCertStore>) {
        let names: Vec<String> = subject_alt_names.iter().map(|s| s.to_string()).collect();
        let CertifiedKey { cert, key_pair } = generate_simple_self_signed(names).unwrap();
        let cert_der = cert.der().clone();
        let key = PrivatePkcs8KeyDer::from(key_pair.serialize_der());
        let config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der.clone()], PrivateKeyDer::Pkcs8(key))
            .unwrap();
        let mut roots = RootCertStore::empty();
        roots.add(cert_der).unwrap();
        (TlsAcceptor::from(Arc::new(config)), Arc::new(roots))
    }

    struct ServerBehavior {
        advertise_starttls: bool,
        accept_starttls: bool,
        /// Negotiate real TLS after STARTTLS. Without it the server
        /// hangs up after the 220 reply.
        tls: Option<TlsAcceptor>,
        /// Pretend to accept hand-built legacy hellos on every
        /// connection after the first one.
        accept_legacy_hellos: bool,
    }

    fn plain_server(advertise_starttls: bool, accept_starttls: bool) -> ServerBehavior {
        ServerBehavior {
            advertise_starttls,
            accept_starttls,
            tls: None,
            accept_legacy_hellos: false,
        }
    }

    fn tls_server(acceptor: TlsAcceptor, accept_legacy_hellos: bool) -> ServerBehavior {
        ServerBehavior {
            advertise_starttls: true,
            accept_starttls: true,
            tls: Some(acceptor),
            accept_legacy_hellos,
        }
    }

    /// Minimal scripted SMTP server. Accepts connections until the
    /// listener is dropped with the test.
    async fn spawn_server(behavior: ServerBehavior) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());
        tokio::spawn(async move {
            let mut connections = 0usize;
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                connections += 1;
                let first = connections == 1;
                let tls = behavior.tls.clone();
                let advertise = behavior.advertise_starttls;
                let accept = behavior.accept_starttls;
                let legacy = behavior.accept_legacy_hellos;
                tokio::spawn(async move {
                    serve_connection(socket, advertise, accept, tls, first, legacy).await;
                });
            }
        });
        address
    }

    async fn serve_connection(
        mut socket: TcpStream,
        advertise_starttls: bool,
        accept_starttls: bool,
        tls: Option<TlsAcceptor>,
        first: bool,
        accept_legacy_hellos: bool,
    ) {
        if socket.write_all(b"220 test server ESMTP\r\n").await.is_err() {
            return;
        }
        let mut buffered = Vec::new();
        while let Some(line) = read_line(&mut socket, &mut buffered).await {
            let command = line.to_uppercase();
            let reply: &[u8] = if command.starts_with("EHLO") {
                if advertise_starttls {
                    b"250-test greets you\r\n250-SIZE 1000\r\n250 STARTTLS\r\n"
                } else {
                    b"250-test greets you\r\n250 SIZE 1000\r\n"
                }
            } else if command.starts_with("STARTTLS") {
                if !accept_starttls {
                    let _ = socket.write_all(b"454 not today\r\n").await;
                    return;
                }
                if socket.write_all(b"220 ready\r\n").await.is_err() {
                    return;
                }
                if let Some(acceptor) = tls
                    && (first || !accept_legacy_hellos)
                {
                    // Real handshake. Legacy hellos arriving here are
                    // rejected by rustls, which is the point.
                    if let Ok(mut stream) = acceptor.accept(socket).await {
                        let mut sink = [0u8; 256];
                        while matches!(stream.read(&mut sink).await, Ok(n) if n > 0) {}
                    }
                } else if accept_legacy_hellos {
                    // Answer whatever hello arrives with a ServerHello
                    // record, like a server stuck in the past would
                    let mut sink = [0u8; 512];
                    if matches!(socket.read(&mut sink).await, Ok(n) if n > 0) {
                        let _ = socket
                            .write_all(&[0x16, 0x03, 0x00, 0x00, 0x30, 0x02])
                            .await;
                    }
                }
                return;
            } else if command.starts_with("QUIT") {
                let _ = socket.write_all(b"221 bye\r\n").await;
                return;
            } else {
                b"502 command not implemented\r\n"
            };
            if socket.write_all(reply).await.is_err() {
                return;
            }
        }
    }

    async fn read_line(socket: &mut TcpStream, buffered: &mut Vec<u8>) -> Option<String> {
        loop {
            if let Some(pos) = buffered.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buffered.drain(..=pos).collect();
                return Some(String::from_utf8_lossy(&line).trim().to_string());
            }
            let mut chunk = [0u8; 256];
            match socket.read(&mut chunk).await {
                Ok(0) | Err(_) => return None,
                Ok(read) => buffered.extend_from_slice(&chunk[..read]),
            }
        }
    }

    #[tokio::test]
    async fn unreachable_host_is_a_connectivity_error() {
        // Bind a port and drop the listener so connections are refused
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());
        drop(listener);

        let scan = prober().check_hostname("example.com", &address).await;
        assert!(!scan.could_connect());
        assert!(!scan.could_starttls());
        let connectivity = scan.result.checks.get("connectivity").unwrap();
        assert_eq!(connectivity.status, CheckStatus::Error);
        assert!(connectivity.messages[0].starts_with("Error: Could not establish connection"));
        assert!(!scan.result.checks.contains_key("starttls"));
    }

    #[tokio::test]
    async fn missing_starttls_is_a_failure() {
        let address = spawn_server(plain_server(false, false)).await;
        let scan = prober().check_hostname("example.com", &address).await;

        assert!(scan.could_connect());
        assert!(!scan.could_starttls());
        let starttls = scan.result.checks.get("starttls").unwrap();
        assert_eq!(starttls.status, CheckStatus::Failure);
        assert_eq!(
            starttls.messages,
            vec!["Failure: Server does not advertise support for STARTTLS."]
        );
        // The probe stops before the certificate and version stages
        assert!(!scan.result.checks.contains_key("certificate"));
        assert!(!scan.result.checks.contains_key("version"));
    }

    #[tokio::test]
    async fn rejected_starttls_command_is_a_failure() {
        let address = spawn_server(plain_server(true, false)).await;
        let scan = prober().check_hostname("example.com", &address).await;

        assert!(scan.could_connect());
        assert!(!scan.could_starttls());
        let starttls = scan.result.checks.get("starttls").unwrap();
        assert_eq!(starttls.status, CheckStatus::Failure);
    }

    #[tokio::test]
    async fn broken_handshake_is_a_failure() {
        let address = spawn_server(plain_server(true, true)).await;
        let scan = prober().check_hostname("example.com", &address).await;

        assert!(scan.could_connect());
        assert!(!scan.could_starttls());
        let starttls = scan.result.checks.get("starttls").unwrap();
        assert_eq!(
            starttls.messages,
            vec!["Failure: Could not complete a TLS handshake."]
        );
    }

    #[tokio::test]
    async fn trusted_certificate_passes_all_checks() {
        let (acceptor, roots) = tls_server_parts(&["127.0.0.1"]);
        let address = spawn_server(tls_server(acceptor, false)).await;
        let scan = prober_with(roots, false)
            .check_hostname("example.com", &address)
            .await;

        assert!(scan.could_connect());
        assert!(scan.could_starttls());
        let certificate = scan.result.checks.get("certificate").unwrap();
        assert_eq!(certificate.status, CheckStatus::Success);
        assert!(certificate.messages.is_empty());
        // The SSLv3 offer was rejected by the real TLS stack
        let version = scan.result.checks.get("version").unwrap();
        assert_eq!(version.status, CheckStatus::Success);
        assert!(!scan.result.checks.contains_key("cipher"));
        assert_eq!(scan.result.status, CheckStatus::Success);
    }

    #[tokio::test]
    async fn certificate_name_mismatch_is_a_failure() {
        // Valid chain, but the certificate only covers "localhost"
        // while the probe addresses the server as 127.0.0.1
        let (acceptor, roots) = tls_server_parts(&["localhost"]);
        let address = spawn_server(tls_server(acceptor, false)).await;
        let scan = prober_with(roots, false)
            .check_hostname("example.com", &address)
            .await;

        assert!(scan.could_starttls());
        let certificate = scan.result.checks.get("certificate").unwrap();
        assert_eq!(certificate.status, CheckStatus::Failure);
        assert_eq!(certificate.messages.len(), 1);
        assert!(certificate.messages[0].contains("Certificate is not valid for 127.0.0.1"));
        assert_eq!(scan.result.status, CheckStatus::Failure);
    }

    #[tokio::test]
    async fn untrusted_chain_is_a_failure() {
        // The name matches but the self-signed chain does not lead to
        // any of the default trust roots
        let (acceptor, _roots) = tls_server_parts(&["127.0.0.1"]);
        let address = spawn_server(tls_server(acceptor, false)).await;
        let scan = prober_with(default_roots(), false)
            .check_hostname("example.com", &address)
            .await;

        assert!(scan.could_starttls());
        let certificate = scan.result.checks.get("certificate").unwrap();
        assert_eq!(certificate.status, CheckStatus::Failure);
        assert_eq!(certificate.messages.len(), 1);
        assert!(certificate.messages[0].contains("Certificate chain is not valid"));
    }

    #[tokio::test]
    async fn accepted_legacy_hellos_fail_version_and_cipher() {
        // First connection negotiates real TLS, later connections get
        // their SSLv3 and RC4 offers "accepted"
        let (acceptor, roots) = tls_server_parts(&["127.0.0.1"]);
        let address = spawn_server(tls_server(acceptor, true)).await;
        let scan = prober_with(roots, true)
            .check_hostname("example.com", &address)
            .await;

        assert!(scan.could_starttls());
        let certificate = scan.result.checks.get("certificate").unwrap();
        assert_eq!(certificate.status, CheckStatus::Success);
        let version = scan.result.checks.get("version").unwrap();
        assert_eq!(version.status, CheckStatus::Failure);
        assert_eq!(
            version.messages,
            vec!["Failure: Server should NOT support SSLv2/3, but does."]
        );
        let cipher = scan.result.checks.get("cipher").unwrap();
        assert_eq!(cipher.status, CheckStatus::Failure);
        assert_eq!(
            cipher.messages,
            vec!["Failure: Server should NOT support RC4 cipher suites, but does."]
        );
        assert_eq!(scan.result.status, CheckStatus::Failure);
    }

    #[tokio::test]
    async fn scan_carries_domain_hostname_and_timestamp() {
        let address = spawn_server(plain_server(false, false)).await;
        let before = chrono::Utc::now();
        let scan = prober().check_hostname("example.com", &address).await;
        assert_eq!(scan.domain, "example.com");
        assert_eq!(scan.hostname, address);
        assert!(scan.timestamp >= before);
    }
}
