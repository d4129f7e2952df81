use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::client::{WebPkiServerVerifier, verify_server_name};
use tokio_rustls::rustls::server::ParsedCertificate;
use tokio_rustls::rustls::crypto::{self, CryptoProvider, aws_lc_rs};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, Error, RootCertStore, SignatureScheme,
};

/// The compiled-in copy of the root certificates trusted by Mozilla.
pub fn default_roots() -> Arc<RootCertStore> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    Arc::new(roots)
}

/// Client config for the STARTTLS upgrade. The handshake accepts any
/// certificate, verification happens explicitly afterwards so that
/// name and chain problems can be reported independently.
pub fn insecure_client_config() -> Arc<ClientConfig> {
    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(InsecureVerifier::new()))
        .with_no_client_auth();
    Arc::new(config)
}

/// Client config with full verification against the given roots.
pub fn verified_client_config(roots: Arc<RootCertStore>) -> Arc<ClientConfig> {
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Arc::new(config)
}

/// Verifies that the leaf certificate is valid for the given hostname.
pub fn verify_certificate_name(end_entity: &CertificateDer<'_>, hostname: &str) -> Result<(), Error> {
    let parsed = ParsedCertificate::try_from(end_entity)?;
    let name = ServerName::try_from(hostname.to_string())
        .map_err(|_| Error::InvalidCertificate(CertificateError::NotValidForName))?;
    verify_server_name(&parsed, &name)
}

/// Verifies the presented chain against the trust roots. Name mismatches
/// are deliberately not reported here, they are checked separately.
pub fn verify_certificate_chain(
    roots: Arc<RootCertStore>,
    chain: &[CertificateDer<'_>],
    hostname: &str,
) -> Result<(), Error> {
    let Some((end_entity, intermediates)) = chain.split_first() else {
        return Err(Error::NoCertificatesPresented);
    };
    let verifier = WebPkiServerVerifier::builder_with_provider(
        roots,
        Arc::new(aws_lc_rs::default_provider()),
    )
    .build()
    .map_err(|err| Error::General(format!("failed to build verifier: {err}")))?;
    let name = ServerName::try_from(hostname.to_string())
        .map_err(|_| Error::General(format!("invalid server name {hostname}")))?;
    match verifier.verify_server_cert(end_entity, intermediates, &name, &[], UnixTime::now()) {
        Ok(_) => Ok(()),
        Err(Error::InvalidCertificate(
            CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. },
        )) => Ok(()),
        Err(err) => Err(err),
    }
}

/// Certificate verifier that accepts everything. Only used for the
/// STARTTLS upgrade, where verification is performed explicitly on the
/// captured chain.
#[derive(Debug)]
pub struct InsecureVerifier {
    provider: Arc<CryptoProvider>,
}

impl InsecureVerifier {
    pub fn new() -> Self {
        Self {
            provider: Arc::new(aws_lc_rs::default_provider()),
        }
    }
}

impl Default for InsecureVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

const SSL3_VERSION: [u8; 2] = [0x03, 0x00];
const TLS10_VERSION: [u8; 2] = [0x03, 0x01];

// Cipher suites an SSLv3-era server would pick from
const SSL3_SUITES: [u16; 5] = [0x0004, 0x0005, 0x000A, 0x002F, 0x0035];

// RC4-based suites only, for the opt-in cipher check
const RC4_SUITES: [u16; 4] = [0x0004, 0x0005, 0xC007, 0xC011];

/// ClientHello offering only SSLv3. rustls cannot be configured below
/// TLS 1.2, so the record is built by hand; a server that still speaks
/// SSLv3 answers it with a ServerHello.
pub fn ssl3_client_hello() -> Vec<u8> {
    build_client_hello(SSL3_VERSION, &SSL3_SUITES)
}

/// ClientHello offering only RC4-based cipher suites.
pub fn rc4_client_hello() -> Vec<u8> {
    build_client_hello(TLS10_VERSION, &RC4_SUITES)
}

fn build_client_hello(version: [u8; 2], suites: &[u16]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&version);
    // The random bytes carry no meaning for this probe
    body.extend_from_slice(&[0u8; 32]);
    // Empty session id
    body.push(0);
    body.extend_from_slice(&((suites.len() * 2) as u16).to_be_bytes());
    for suite in suites {
        body.extend_from_slice(&suite.to_be_bytes());
    }
    // Null compression only
    body.extend_from_slice(&[1, 0]);

    let mut handshake = Vec::new();
    // Handshake type: ClientHello, with a 24 bit length
    handshake.push(0x01);
    let length = (body.len() as u32).to_be_bytes();
    handshake.extend_from_slice(&length[1..4]);
    handshake.extend_from_slice(&body);

    let mut record = Vec::new();
    // Record type: handshake
    record.push(0x16);
    record.extend_from_slice(&version);
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}

/// Whether the first bytes from the server are a handshake record
/// carrying a ServerHello. Alerts, garbage and closed connections all
/// count as the server rejecting the offered hello.
pub fn is_server_hello(response: &[u8]) -> bool {
    response.len() >= 6 && response[0] == 0x16 && response[5] == 0x02
}

/// Writes a hand-built ClientHello to the stream and classifies the
/// response. Any transport error means the offer was not accepted.
pub async fn offer_client_hello<S>(mut stream: S, hello: &[u8], io_timeout: Duration) -> bool
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let written = timeout(io_timeout, stream.write_all(hello)).await;
    if !matches!(written, Ok(Ok(()))) {
        return false;
    }
    let mut response = [0u8; 6];
    match timeout(io_timeout, stream.read_exact(&mut response)).await {
        Ok(Ok(_)) => is_server_hello(&response),
        _ => false,
    }
}
