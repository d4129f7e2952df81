use anyhow::{Context, Result, bail, ensure};
use dns_protocol::{Flags, Message, Question, ResourceRecord, ResourceType};
use futures::future::BoxFuture;
use std::net::SocketAddr;
use std::sync::atomic::AtomicU16;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

const CLASS_IN: u16 = 1;

// Enough room for the answer sets mail domains publish
const MAX_ANSWERS: usize = 16;
const MAX_EXTRA: usize = 8;

/// One MX record from a lookup, in server-returned order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxRecord {
    pub hostname: String,
    pub priority: u16,
}

/// DNS lookups the checks need. Lookup errors (timeouts, unreachable
/// server, malformed responses) are distinguishable from empty results.
pub trait DnsLookup: Send + Sync {
    fn lookup_mx<'a>(&'a self, domain: &'a str) -> BoxFuture<'a, Result<Vec<MxRecord>>>;

    fn lookup_txt<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Vec<String>>>;
}

pub struct DnsClient {
    server: SocketAddr,
    next_id: AtomicU16,
    timeout: Duration,
}

impl DnsClient {
    pub fn new(server: SocketAddr, timeout: Duration) -> Self {
        Self {
            server,
            next_id: AtomicU16::new(1),
            timeout,
        }
    }

    async fn query_mx(&self, domain: &str) -> Result<Vec<MxRecord>> {
        // Create a unique ID for the query
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let mut questions = [Question::new(domain, ResourceType::MX, CLASS_IN)];
        let message = Message::new(
            id,
            Flags::standard_query(),
            &mut questions,
            &mut [],
            &mut [],
            &mut [],
        );

        let response = self
            .send_message_receive_udp_data(&message)
            .await
            .context("Failed to send/receive DNS data")?;

        let mut answers = [ResourceRecord::default(); MAX_ANSWERS];
        let mut authorities = [ResourceRecord::default(); MAX_EXTRA];
        let mut additionals = [ResourceRecord::default(); MAX_EXTRA];
        let message = Message::read(
            &response,
            &mut questions,
            &mut answers,
            &mut authorities,
            &mut additionals,
        )
        .context("Failed to read DNS message")?;

        ensure!(
            message.id() == id,
            "Received response with mismatched ID: expected {}, got {}",
            id,
            message.id()
        );

        // Collect the MX answers, keeping the server-returned order
        // within each priority
        let mut records = Vec::new();
        for answer in message.answers() {
            if answer.ty() != ResourceType::MX {
                continue;
            }
            let data = answer.data();
            ensure!(data.len() >= 2, "MX record data too short");
            let priority = u16::from_be_bytes([data[0], data[1]]);
            let hostname = parse_encoded_name(&response, &data[2..])
                .context("Failed to parse MX hostname")?;
            records.push(MxRecord { hostname, priority });
        }
        records.sort_by_key(|r| r.priority);

        Ok(records)
    }

    async fn query_txt(&self, name: &str) -> Result<Vec<String>> {
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let mut questions = [Question::new(name, ResourceType::Txt, CLASS_IN)];
        let message = Message::new(
            id,
            Flags::standard_query(),
            &mut questions,
            &mut [],
            &mut [],
            &mut [],
        );

        let response = self
            .send_message_receive_udp_data(&message)
            .await
            .context("Failed to send/receive DNS data")?;

        let mut answers = [ResourceRecord::default(); MAX_ANSWERS];
        let mut authorities = [ResourceRecord::default(); MAX_EXTRA];
        let mut additionals = [ResourceRecord::default(); MAX_EXTRA];
        let message = Message::read(
            &response,
            &mut questions,
            &mut answers,
            &mut authorities,
            &mut additionals,
        )
        .context("Failed to read DNS message")?;

        ensure!(
            message.id() == id,
            "Received response with mismatched ID: expected {}, got {}",
            id,
            message.id()
        );

        let mut records = Vec::new();
        for answer in message.answers() {
            if answer.ty() != ResourceType::Txt {
                continue;
            }
            records.push(parse_character_strings(answer.data())?);
        }

        Ok(records)
    }

    async fn send_message_receive_udp_data(&self, message: &Message<'_, '_>) -> Result<Vec<u8>> {
        // Serialize the message into a buffer
        let mut buf = vec![0; 1024];
        ensure!(
            message.space_needed() <= buf.len(),
            "DNS query does not fit into buffer"
        );
        let len = message
            .write(&mut buf)
            .context("Failed to serialize DNS message")?;

        // Create a UDP socket
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .context("Failed to bind UDP socket")?;

        // Send the data
        socket
            .send_to(&buf[..len], self.server)
            .await
            .context("Failed to send data")?;

        // Read response data from the socket
        let mut response = vec![0; 1024];
        let len = timeout(self.timeout, socket.recv(&mut response))
            .await
            .context("Timeout while reading response")?
            .context("Failed to read response")?;
        response.truncate(len);

        Ok(response)
    }
}

impl DnsLookup for DnsClient {
    fn lookup_mx<'a>(&'a self, domain: &'a str) -> BoxFuture<'a, Result<Vec<MxRecord>>> {
        Box::pin(self.query_mx(domain))
    }

    fn lookup_txt<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Vec<String>>> {
        Box::pin(self.query_txt(name))
    }
}

/// Parse a DNS name in label format (RFC 1035), following compression
/// pointers into the full message.
fn parse_encoded_name(message: &[u8], data: &[u8]) -> Result<String> {
    let mut labels = Vec::new();
    let mut cursor = data;
    let mut jumps = 0;
    loop {
        ensure!(!cursor.is_empty(), "Name data ended unexpectedly");
        let len = cursor[0] as usize;
        if len == 0 {
            break;
        }
        if len & 0xC0 == 0xC0 {
            // Compression pointer: an offset from the message start
            ensure!(cursor.len() >= 2, "Truncated compression pointer");
            let offset = ((len & 0x3F) << 8) | cursor[1] as usize;
            ensure!(offset < message.len(), "Compression pointer out of bounds");
            jumps += 1;
            ensure!(jumps <= 16, "Too many compression pointers");
            cursor = &message[offset..];
            continue;
        }
        ensure!(len & 0xC0 == 0, "Unsupported label type");
        ensure!(cursor.len() > len, "Label length out of bounds");
        let label = cursor[1..=len].to_owned();
        let parsed = String::from_utf8(label).context("Failed to parse segment as UTF8")?;
        labels.push(parsed);
        cursor = &cursor[len + 1..];
    }
    Ok(labels.join("."))
}

/// A TXT record is a sequence of length-prefixed character strings
/// that are concatenated to form the record value.
fn parse_character_strings(data: &[u8]) -> Result<String> {
    let mut bytes = Vec::new();
    let mut i = 0;
    while i < data.len() {
        let len = data[i] as usize;
        i += 1;
        if i + len > data.len() {
            bail!("Character string length out of bounds");
        }
        bytes.extend_from_slice(&data[i..i + len]);
        i += len;
    }
    Ok(String::from_utf8_lossy(&bytes).to_string())
}
