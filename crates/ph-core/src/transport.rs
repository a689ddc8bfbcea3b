//! Message transport between a plugin and its handler.
//!
//! [`Transport`] is the seam every vendor plugin talks through. Message based
//! handlers exchange terminated text lines; byte oriented handlers (Ismeca's
//! ENQ/ACK handshake) use [`Transport::send_bytes`], [`Transport::read_byte`]
//! and [`Transport::receive_until`].
//!
//! GPIB handlers are reached through a TCP gateway that forwards service
//! requests in band as `SRQ <byte>` lines. [`StreamTransport`] separates those
//! lines from ordinary replies and queues them for [`Transport::test_srq`].

use crate::config::HandlerConfig;
use crate::error::{InterfaceKind, TransportError};
use crate::serial::{connect_tcp, drain_input, open_serial, DynStream, SerialSettings};
use anyhow::Context;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Timeout used for writes when the caller has no better value.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection to a handler.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Interface kind, used to map failures into plugin results.
    fn interface(&self) -> InterfaceKind;

    /// Send one message; the configured terminator is appended.
    async fn send(&self, msg: &str, timeout: Duration) -> Result<(), TransportError>;

    /// Receive one message with the terminator stripped.
    async fn receive(&self, timeout: Duration) -> Result<String, TransportError>;

    /// Send raw bytes without a terminator.
    async fn send_bytes(&self, bytes: &[u8], timeout: Duration) -> Result<(), TransportError>;

    /// Read a single raw byte.
    async fn read_byte(&self, timeout: Duration) -> Result<u8, TransportError>;

    /// Read raw bytes up to and including `delimiter`.
    async fn receive_until(
        &self,
        delimiter: u8,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;

    /// Return a pending service request byte without blocking.
    async fn test_srq(&self) -> Result<Option<u8>, TransportError>;

    /// Wait up to `timeout` for a service request.
    async fn wait_srq(&self, timeout: Duration) -> Result<Option<u8>, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(srq) = self.test_srq().await? {
                return Ok(Some(srq));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Discard all pending input, including queued service requests.
    async fn flush_input(&self) -> Result<usize, TransportError>;
}

struct Link {
    reader: BufReader<DynStream>,
    /// Bytes of an incomplete message, kept across cancelled reads.
    partial: Vec<u8>,
    /// Complete messages read while looking for service requests.
    lines: VecDeque<String>,
    srq: VecDeque<u8>,
}

impl Link {
    /// Read until `delimiter` or until `deadline`. Cancel safe: bytes read so
    /// far stay in `partial`.
    async fn read_until(
        &mut self,
        delimiter: u8,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        if let Some(pos) = self.partial.iter().position(|b| *b == delimiter) {
            let rest = self.partial.split_off(pos + 1);
            return Ok(std::mem::replace(&mut self.partial, rest));
        }
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let available = match tokio::time::timeout(remaining, self.reader.fill_buf()).await {
                Err(_) => return Err(TransportError::ReceiveTimeout(timeout)),
                Ok(res) => res?,
            };
            if available.is_empty() {
                return Err(TransportError::Closed);
            }
            match available.iter().position(|b| *b == delimiter) {
                Some(pos) => {
                    self.partial.extend_from_slice(&available[..=pos]);
                    self.reader.consume(pos + 1);
                    return Ok(std::mem::take(&mut self.partial));
                }
                None => {
                    let n = available.len();
                    self.partial.extend_from_slice(available);
                    self.reader.consume(n);
                }
            }
        }
    }

    /// Next text line, with service request lines diverted into the queue.
    async fn next_line(
        &mut self,
        deadline: Instant,
        timeout: Duration,
        inband_srq: bool,
    ) -> Result<String, TransportError> {
        if let Some(line) = self.lines.pop_front() {
            return Ok(line);
        }
        loop {
            let raw = self.read_until(b'\n', deadline, timeout).await?;
            let line = String::from_utf8_lossy(&raw)
                .trim_end_matches(['\r', '\n'])
                .to_string();
            if inband_srq {
                if let Some(byte) = parse_srq_line(&line) {
                    trace!(srq = %format_args!("0x{:02x}", byte), "service request received");
                    self.srq.push_back(byte);
                    continue;
                }
            }
            return Ok(line);
        }
    }
}

/// Parse an in-band service request line such as `SRQ 0x47` or `SRQ 71`.
pub fn parse_srq_line(line: &str) -> Option<u8> {
    let value = line.trim().strip_prefix("SRQ")?.trim();
    if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        u8::from_str_radix(hex, 16).ok()
    } else {
        value.parse().ok()
    }
}

/// [`Transport`] over any async byte stream.
pub struct StreamTransport {
    link: Mutex<Link>,
    interface: InterfaceKind,
    terminator: String,
    inband_srq: bool,
}

impl StreamTransport {
    /// Wrap a byte stream. `terminator` is appended to every sent message.
    pub fn new(stream: DynStream, interface: InterfaceKind, terminator: &str) -> Self {
        Self {
            link: Mutex::new(Link {
                reader: BufReader::new(stream),
                partial: Vec::new(),
                lines: VecDeque::new(),
                srq: VecDeque::new(),
            }),
            interface,
            terminator: terminator.to_string(),
            inband_srq: interface == InterfaceKind::Gpib,
        }
    }

    /// Enable or disable in-band service request lines.
    pub fn with_inband_srq(mut self, enabled: bool) -> Self {
        self.inband_srq = enabled;
        self
    }

    async fn write(&self, bytes: &[u8], timeout: Duration) -> Result<(), TransportError> {
        let mut link = self.link.lock().await;
        let io = link.reader.get_mut();
        match tokio::time::timeout(timeout, async {
            io.write_all(bytes).await?;
            io.flush().await
        })
        .await
        {
            Err(_) => Err(TransportError::SendTimeout(timeout)),
            Ok(res) => res.map_err(TransportError::from),
        }
    }
}

#[async_trait]
impl Transport for StreamTransport {
    fn interface(&self) -> InterfaceKind {
        self.interface
    }

    async fn send(&self, msg: &str, timeout: Duration) -> Result<(), TransportError> {
        debug!(interface = %self.interface, "-> {:?}", msg);
        let mut framed = Vec::with_capacity(msg.len() + self.terminator.len());
        framed.extend_from_slice(msg.as_bytes());
        framed.extend_from_slice(self.terminator.as_bytes());
        self.write(&framed, timeout).await
    }

    async fn receive(&self, timeout: Duration) -> Result<String, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut link = self.link.lock().await;
        let line = link.next_line(deadline, timeout, self.inband_srq).await?;
        debug!(interface = %self.interface, "<- {:?}", line);
        Ok(line)
    }

    async fn send_bytes(&self, bytes: &[u8], timeout: Duration) -> Result<(), TransportError> {
        trace!(interface = %self.interface, "-> {:02x?}", bytes);
        self.write(bytes, timeout).await
    }

    async fn read_byte(&self, timeout: Duration) -> Result<u8, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut link = self.link.lock().await;
        if !link.partial.is_empty() {
            return Ok(link.partial.remove(0));
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        let available = match tokio::time::timeout(remaining, link.reader.fill_buf()).await {
            Err(_) => return Err(TransportError::ReceiveTimeout(timeout)),
            Ok(res) => res?,
        };
        let Some(&byte) = available.first() else {
            return Err(TransportError::Closed);
        };
        link.reader.consume(1);
        trace!(interface = %self.interface, "<- {:02x}", byte);
        Ok(byte)
    }

    async fn receive_until(
        &self,
        delimiter: u8,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut link = self.link.lock().await;
        let bytes = link.read_until(delimiter, deadline, timeout).await?;
        trace!(interface = %self.interface, "<- {:02x?}", bytes);
        Ok(bytes)
    }

    async fn test_srq(&self) -> Result<Option<u8>, TransportError> {
        if !self.inband_srq {
            return Ok(None);
        }
        let mut link = self.link.lock().await;
        if let Some(srq) = link.srq.pop_front() {
            return Ok(Some(srq));
        }
        // pull in whatever is already buffered without waiting
        loop {
            match link.next_line(Instant::now(), Duration::ZERO, true).await {
                Ok(line) => link.lines.push_back(line),
                Err(TransportError::ReceiveTimeout(_)) => break,
                Err(e) => return Err(e),
            }
            if !link.srq.is_empty() {
                break;
            }
        }
        Ok(link.srq.pop_front())
    }

    async fn flush_input(&self) -> Result<usize, TransportError> {
        let mut link = self.link.lock().await;
        let mut discarded = link.partial.len() + link.srq.len() + link.lines.len();
        if !link.srq.is_empty() {
            debug!(count = link.srq.len(), "discarding queued service requests");
        }
        link.partial.clear();
        link.srq.clear();
        link.lines.clear();
        let buffered = link.reader.buffer().len();
        link.reader.consume(buffered);
        discarded += buffered;
        discarded += drain_input(link.reader.get_mut(), 20).await;
        Ok(discarded)
    }
}

/// Open the transport described by the configuration.
///
/// A GPIB gateway is told the handler's primary address with `++addr <n>`
/// right after connecting.
pub async fn open_transport(config: &HandlerConfig) -> anyhow::Result<StreamTransport> {
    let interface = config
        .interface_type
        .context("interface_type is not configured")?;
    let name = config.symbolic_interface_name.as_str();
    if name.is_empty() {
        anyhow::bail!("symbolic_interface_name is not configured");
    }

    let stream: DynStream = match interface {
        InterfaceKind::Rs232 => open_serial(name, SerialSettings::from_config(config)?).await?,
        InterfaceKind::Lan | InterfaceKind::Gpib => Box::new(
            connect_tcp(name, config.server_port, Duration::from_secs(5)).await?,
        ),
    };

    let transport = StreamTransport::new(stream, interface, config.terminator());
    if interface == InterfaceKind::Gpib {
        match config.gpib_port {
            Some(addr) => transport
                .send_bytes(format!("++addr {}\n", addr).as_bytes(), DEFAULT_SEND_TIMEOUT)
                .await
                .context("failed to select GPIB address on gateway")?,
            None => warn!("gpib_port not configured, using gateway default address"),
        }
    }
    Ok(transport)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn pair(interface: InterfaceKind) -> (tokio::io::DuplexStream, StreamTransport) {
        let (host, device) = tokio::io::duplex(256);
        (host, StreamTransport::new(Box::new(device), interface, "\r\n"))
    }

    #[tokio::test]
    async fn send_appends_terminator() {
        let (mut host, t) = pair(InterfaceKind::Lan);
        t.send("FR?", Duration::from_secs(1)).await.unwrap();
        let mut buf = [0u8; 5];
        host.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"FR?\r\n");
    }

    #[tokio::test]
    async fn receive_strips_terminator_and_times_out() {
        let (mut host, t) = pair(InterfaceKind::Lan);
        host.write_all(b"FR 1\r\n").await.unwrap();
        assert_eq!(t.receive(Duration::from_secs(1)).await.unwrap(), "FR 1");

        let err = t.receive(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, TransportError::ReceiveTimeout(_)));
    }

    #[tokio::test]
    async fn partial_message_survives_timeout() {
        let (mut host, t) = pair(InterfaceKind::Rs232);
        host.write_all(b"FULL").await.unwrap();
        assert!(t.receive(Duration::from_millis(20)).await.is_err());
        host.write_all(b"SITES 1\n").await.unwrap();
        assert_eq!(t.receive(Duration::from_secs(1)).await.unwrap(), "FULLSITES 1");
    }

    #[tokio::test]
    async fn gpib_srq_lines_are_diverted() {
        let (mut host, t) = pair(InterfaceKind::Gpib);
        host.write_all(b"SRQ 0x47\r\nECHO:12\r\nSRQ 72\r\n")
            .await
            .unwrap();
        tokio::task::yield_now().await;

        assert_eq!(t.test_srq().await.unwrap(), Some(0x47));
        assert_eq!(t.receive(Duration::from_secs(1)).await.unwrap(), "ECHO:12");
        assert_eq!(t.test_srq().await.unwrap(), Some(72));
        assert_eq!(t.test_srq().await.unwrap(), None);
    }

    #[tokio::test]
    async fn lan_has_no_srq() {
        let (mut host, t) = pair(InterfaceKind::Lan);
        host.write_all(b"SRQ 0x47\n").await.unwrap();
        assert_eq!(t.test_srq().await.unwrap(), None);
        assert_eq!(t.receive(Duration::from_secs(1)).await.unwrap(), "SRQ 0x47");
    }

    #[tokio::test]
    async fn byte_level_exchange() {
        let (mut host, t) = pair(InterfaceKind::Rs232);
        host.write_all(&[0x06, 0x02, b'C', b'E', 0x03]).await.unwrap();
        assert_eq!(t.read_byte(Duration::from_secs(1)).await.unwrap(), 0x06);
        assert_eq!(
            t.receive_until(0x03, Duration::from_secs(1)).await.unwrap(),
            vec![0x02, b'C', b'E', 0x03]
        );
    }

    #[tokio::test]
    async fn flush_discards_everything() {
        let (mut host, t) = pair(InterfaceKind::Gpib);
        host.write_all(b"SRQ 0x46\nstale\n").await.unwrap();
        tokio::task::yield_now().await;
        assert!(t.flush_input().await.unwrap() > 0);
        assert_eq!(t.test_srq().await.unwrap(), None);
    }

    #[tokio::test]
    async fn scripted_handler_exchange() {
        let handler = tokio_test::io::Builder::new()
            .write(b"FR?\r\n")
            .read(b"FR 0\r\n")
            .write(b"SITESEL F\r\n")
            .read(b"SettingOK\r\n")
            .build();
        let t = StreamTransport::new(Box::new(handler), InterfaceKind::Lan, "\r\n");
        t.send("FR?", Duration::from_secs(1)).await.unwrap();
        assert_eq!(t.receive(Duration::from_secs(1)).await.unwrap(), "FR 0");
        t.send("SITESEL F", Duration::from_secs(1)).await.unwrap();
        assert_eq!(t.receive(Duration::from_secs(1)).await.unwrap(), "SettingOK");
    }

    #[tokio::test]
    async fn closed_peer_is_reported() {
        let (host, t) = pair(InterfaceKind::Lan);
        drop(host);
        let err = t.receive(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }

    #[test]
    fn srq_line_parsing() {
        assert_eq!(parse_srq_line("SRQ 0x3D"), Some(0x3d));
        assert_eq!(parse_srq_line("SRQ 65"), Some(65));
        assert_eq!(parse_srq_line("SRQ"), None);
        assert_eq!(parse_srq_line("FULLSITES 1"), None);
    }
}
