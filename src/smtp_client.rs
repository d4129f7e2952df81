use anyhow::{Context, Result, bail};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::rustls::pki_types::ServerName;

// Replies longer than this are not SMTP servers talking to us
const MAX_REPLY_LINES: usize = 64;

/// One SMTP reply: the status code and the text of every reply line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpReply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl SmtpReply {
    pub fn is_positive_completion(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Whether an EHLO reply advertises the given extension keyword.
    /// The first reply line is the server identification, the rest
    /// are extension keywords with optional parameters.
    pub fn has_extension(&self, keyword: &str) -> bool {
        self.lines.iter().skip(1).any(|line| {
            line.split_whitespace()
                .next()
                .is_some_and(|word| word.eq_ignore_ascii_case(keyword))
        })
    }
}

/// A live SMTP conversation. Generic over the transport so tests can
/// drive it with in-memory streams.
pub struct SmtpConnection<S> {
    stream: BufStream<S>,
    timeout: Duration,
}

impl SmtpConnection<TcpStream> {
    /// Dials the server and consumes its greeting.
    pub async fn open(address: &str, io_timeout: Duration) -> Result<Self> {
        let stream = timeout(io_timeout, TcpStream::connect(address))
            .await
            .context("TCP connect timed out")?
            .context("TCP connect failed")?;
        Self::from_stream(stream, io_timeout).await
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> SmtpConnection<S> {
    /// Wraps an established transport and consumes the greeting.
    pub async fn from_stream(stream: S, io_timeout: Duration) -> Result<Self> {
        let mut conn = Self {
            stream: BufStream::new(stream),
            timeout: io_timeout,
        };
        let greeting = conn
            .read_reply()
            .await
            .context("Failed to read server greeting")?;
        if greeting.code != 220 {
            bail!("Unexpected greeting code {}", greeting.code);
        }
        Ok(conn)
    }

    pub async fn ehlo(&mut self, helo_name: &str) -> Result<SmtpReply> {
        let reply = self.command(&format!("EHLO {helo_name}")).await?;
        if !reply.is_positive_completion() {
            bail!("EHLO rejected with code {}", reply.code);
        }
        Ok(reply)
    }

    pub async fn command(&mut self, command: &str) -> Result<SmtpReply> {
        timeout(self.timeout, async {
            self.stream.write_all(command.as_bytes()).await?;
            self.stream.write_all(b"\r\n").await?;
            self.stream.flush().await
        })
        .await
        .context("Sending command timed out")?
        .context("Failed to send command")?;
        self.read_reply().await
    }

    /// Issues STARTTLS and upgrades the transport to TLS.
    pub async fn starttls(
        self,
        config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
    ) -> Result<TlsStream<S>> {
        let io_timeout = self.timeout;
        let stream = self.starttls_raw().await?;
        let connector = TlsConnector::from(config);
        timeout(io_timeout, connector.connect(server_name, stream))
            .await
            .context("TLS handshake timed out")?
            .context("TLS handshake failed")
    }

    /// Issues STARTTLS and hands back the raw transport, for probes
    /// that speak the TLS record layer themselves.
    pub async fn starttls_raw(mut self) -> Result<S> {
        let reply = self.command("STARTTLS").await?;
        if reply.code != 220 {
            bail!("STARTTLS rejected with code {}", reply.code);
        }
        Ok(self.stream.into_inner())
    }

    /// Best-effort QUIT, errors are ignored.
    pub async fn quit(mut self) {
        let _ = timeout(self.timeout, async {
            self.stream.write_all(b"QUIT\r\n").await?;
            self.stream.flush().await
        })
        .await;
    }

    async fn read_reply(&mut self) -> Result<SmtpReply> {
        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            let read = timeout(self.timeout, self.stream.read_line(&mut line))
                .await
                .context("Reading reply timed out")?
                .context("Failed to read reply")?;
            if read == 0 {
                bail!("Connection closed while reading reply");
            }
            let line = line.trim_end_matches(['\r', '\n']);
            let code: u16 = line
                .get(..3)
                .context("Reply line too short")?
                .parse()
                .context("Malformed reply code")?;
            let more = line.as_bytes().get(3) == Some(&b'-');
            lines.push(line.get(4..).unwrap_or("").to_string());
            if !more {
                return Ok(SmtpReply { code, lines });
            }
            if lines.len() >= MAX_REPLY_LINES {
                bail!("Reply has too many lines");
            }
        }
    }
}

/// SMTP probes go to port 25 unless the hostname carries its own port.
pub fn address_with_default_port(hostname: &str) -> String {
    let hostname = hostname.trim_end_matches('.');
    if hostname.contains(':') {
        hostname.to_string()
    } else {
        format!("{hostname}:25")
    }
}

/// The hostname as presented in certificates: no trailing dot, no port.
pub fn host_without_port(hostname: &str) -> &str {
    let hostname = hostname.trim_end_matches('.');
    match hostname.split_once(':') {
        Some((host, _port)) => host,
        None => hostname,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, duplex};

    const TIMEOUT: Duration = Duration::from_secs(2);

    #[test]
    fn default_port_handling() {
        assert_eq!(address_with_default_port("mx.example.com"), "mx.example.com:25");
        assert_eq!(address_with_default_port("mx.example.com."), "mx.example.com:25");
        assert_eq!(address_with_default_port("mx.example.com:2525"), "mx.example.com:2525");
    }

    #[test]
    fn port_stripping() {
        assert_eq!(host_without_port("mx.example.com"), "mx.example.com");
        assert_eq!(host_without_port("mx.example.com."), "mx.example.com");
        assert_eq!(host_without_port("mx.example.com:25"), "mx.example.com");
    }

    #[test]
    fn extension_lookup() {
        let reply = SmtpReply {
            code: 250,
            lines: vec![
                "mx.example.com at your service".to_string(),
                "SIZE 35882577".to_string(),
                "starttls".to_string(),
            ],
        };
        assert!(reply.has_extension("STARTTLS"));
        assert!(reply.has_extension("SIZE"));
        assert!(!reply.has_extension("35882577"));
        assert!(!reply.has_extension("CHUNKING"));
    }

    #[test]
    fn greeting_text_is_not_an_extension() {
        let reply = SmtpReply {
            code: 250,
            lines: vec!["STARTTLS is the name of this server".to_string()],
        };
        assert!(!reply.has_extension("STARTTLS"));
    }

    #[tokio::test]
    async fn multiline_replies() {
        let (client, mut server) = duplex(4096);

        let handle = tokio::spawn(async move {
            server.write_all(b"220 mx.example.com ESMTP\r\n").await.unwrap();
            let mut buf = [0u8; 128];
            let read = server.read(&mut buf).await.unwrap();
            assert!(buf[..read].starts_with(b"EHLO"));
            server
                .write_all(b"250-mx.example.com greets you\r\n250-SIZE 1000\r\n250 STARTTLS\r\n")
                .await
                .unwrap();
        });

        let mut conn = SmtpConnection::from_stream(client, TIMEOUT).await.unwrap();
        let reply = conn.ehlo("localhost").await.unwrap();
        assert_eq!(reply.code, 250);
        assert_eq!(reply.lines.len(), 3);
        assert!(reply.has_extension("STARTTLS"));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn bad_greeting_is_rejected() {
        let (client, mut server) = duplex(4096);
        tokio::spawn(async move {
            server.write_all(b"554 go away\r\n").await.unwrap();
        });
        assert!(SmtpConnection::from_stream(client, TIMEOUT).await.is_err());
    }

    #[tokio::test]
    async fn closed_connection_is_an_error() {
        let (client, server) = duplex(4096);
        drop(server);
        assert!(SmtpConnection::from_stream(client, TIMEOUT).await.is_err());
    }

    #[tokio::test]
    async fn garbage_reply_is_an_error() {
        let (client, mut server) = duplex(4096);
        tokio::spawn(async move {
            server.write_all(b"ok\r\n").await.unwrap();
        });
        assert!(SmtpConnection::from_stream(client, TIMEOUT).await.is_err());
    }
}
