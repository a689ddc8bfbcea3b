//! Byte stream plumbing for handler links.
//!
//! Handlers are attached over a serial line, a TCP connection, or a GPIB
//! gateway reached over TCP. All three end up as a [`DynStream`]: a boxed
//! `AsyncRead + AsyncWrite` that [`crate::transport::StreamTransport`] frames
//! into messages.
//!
//! Tests use `tokio::io::duplex` in place of real hardware.

use crate::config::HandlerConfig;
use anyhow::Context;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

/// Any async byte stream usable as a handler link.
///
/// Implemented for `tokio_serial::SerialStream`, `tokio::net::TcpStream` and
/// `tokio::io::DuplexStream` among others.
pub trait HandlerIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> HandlerIo for T {}

/// Type-erased handler link.
pub type DynStream = Box<dyn HandlerIo>;

/// Line settings of an RS232 handler link.
///
/// `baud_rate` comes from the common configuration; character framing can be
/// changed with `serial_data_bits` (7 or 8), `serial_parity` (none, even,
/// odd) and `serial_stop_bits` (1 or 2). The default is 9600 8N1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialSettings {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Even,
    Odd,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: 1,
        }
    }
}

impl SerialSettings {
    pub fn from_config(config: &HandlerConfig) -> anyhow::Result<Self> {
        let defaults = Self::default();
        let data_bits = match config.extra_f64("serial_data_bits") {
            None => defaults.data_bits,
            Some(v) if v == 7.0 || v == 8.0 => v as u8,
            Some(v) => anyhow::bail!("serial_data_bits must be 7 or 8, got {}", v),
        };
        let stop_bits = match config.extra_f64("serial_stop_bits") {
            None => defaults.stop_bits,
            Some(v) if v == 1.0 || v == 2.0 => v as u8,
            Some(v) => anyhow::bail!("serial_stop_bits must be 1 or 2, got {}", v),
        };
        let parity = match config.extra_str("serial_parity").map(str::to_ascii_lowercase) {
            None => defaults.parity,
            Some(p) if p == "none" => Parity::None,
            Some(p) if p == "even" => Parity::Even,
            Some(p) if p == "odd" => Parity::Odd,
            Some(p) => anyhow::bail!("serial_parity must be none, even or odd, got '{}'", p),
        };
        Ok(Self {
            baud_rate: config.baud_rate.unwrap_or(defaults.baud_rate),
            data_bits,
            parity,
            stop_bits,
        })
    }
}

/// Open the serial port at `path`. Opening blocks, so it runs on the
/// blocking pool.
#[cfg(feature = "serial")]
pub async fn open_serial(path: &str, settings: SerialSettings) -> anyhow::Result<DynStream> {
    use tokio_serial::SerialPortBuilderExt;

    let owned = path.to_string();
    let port = tokio::task::spawn_blocking(move || {
        tokio_serial::new(&owned, settings.baud_rate)
            .data_bits(match settings.data_bits {
                7 => tokio_serial::DataBits::Seven,
                _ => tokio_serial::DataBits::Eight,
            })
            .parity(match settings.parity {
                Parity::None => tokio_serial::Parity::None,
                Parity::Even => tokio_serial::Parity::Even,
                Parity::Odd => tokio_serial::Parity::Odd,
            })
            .stop_bits(match settings.stop_bits {
                2 => tokio_serial::StopBits::Two,
                _ => tokio_serial::StopBits::One,
            })
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .with_context(|| format!("cannot open handler port {}", owned))
    })
    .await
    .context("serial open task failed")??;
    tracing::info!(port = path, ?settings, "serial port open");
    Ok(Box::new(port))
}

#[cfg(not(feature = "serial"))]
pub async fn open_serial(path: &str, _settings: SerialSettings) -> anyhow::Result<DynStream> {
    anyhow::bail!("serial support not compiled in, cannot open {}", path)
}

/// Connect to a handler (or GPIB gateway) over TCP.
///
/// `address` is `host:port`; a bare host is combined with `default_port`.
pub async fn connect_tcp(
    address: &str,
    default_port: Option<u16>,
    connect_timeout: Duration,
) -> anyhow::Result<tokio::net::TcpStream> {
    let target = match (address.contains(':'), default_port) {
        (true, _) => address.to_string(),
        (false, Some(port)) => format!("{}:{}", address, port),
        (false, None) => anyhow::bail!("no TCP port given for handler address '{}'", address),
    };

    let stream = tokio::time::timeout(connect_timeout, tokio::net::TcpStream::connect(&target))
        .await
        .with_context(|| format!("timed out connecting to {}", target))?
        .with_context(|| format!("failed to connect to {}", target))?;
    stream
        .set_nodelay(true)
        .context("failed to set TCP_NODELAY")?;
    tracing::info!(%target, "connected to handler");
    Ok(stream)
}

/// Read and discard whatever arrives within `timeout_ms`.
///
/// Returns the number of bytes discarded.
pub async fn drain_input<R: AsyncRead + Unpin>(link: &mut R, timeout_ms: u64) -> usize {
    let mut scratch = [0u8; 256];
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    let mut dropped = 0;
    while let Ok(Ok(n)) = tokio::time::timeout_at(deadline, link.read(&mut scratch)).await {
        if n == 0 {
            break;
        }
        dropped += n;
    }
    dropped
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn drain_discards_stale_bytes() {
        let (mut host, mut device) = tokio::io::duplex(64);
        host.write_all(b"stale data 12345").await.unwrap();

        let discarded = drain_input(&mut device, 50).await;
        assert_eq!(discarded, 16);

        let mut buf = [0u8; 1];
        let res = tokio::time::timeout(Duration::from_millis(10), device.read(&mut buf)).await;
        assert!(res.is_err(), "buffer should be empty after draining");
    }

    fn config(extra: &str) -> HandlerConfig {
        HandlerConfig::from_toml_str(&format!(
            "handler_site_ids = [\"1\"]\nbaud_rate = 19200\n{}",
            extra
        ))
        .unwrap()
    }

    #[test]
    fn serial_settings_from_config() {
        assert_eq!(
            SerialSettings::from_config(&config("")).unwrap(),
            SerialSettings {
                baud_rate: 19200,
                ..SerialSettings::default()
            }
        );
        let settings = SerialSettings::from_config(&config(
            "serial_data_bits = 7\nserial_parity = \"Even\"\nserial_stop_bits = 2",
        ))
        .unwrap();
        assert_eq!(settings.data_bits, 7);
        assert_eq!(settings.parity, Parity::Even);
        assert_eq!(settings.stop_bits, 2);
        assert!(SerialSettings::from_config(&config("serial_parity = \"mark\"")).is_err());
        assert!(SerialSettings::from_config(&config("serial_data_bits = 5")).is_err());
    }

    #[tokio::test]
    async fn bare_host_without_port_is_rejected() {
        let err = connect_tcp("localhost", None, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no TCP port"));
    }

    #[tokio::test]
    async fn connects_to_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });

        let stream = connect_tcp(&addr.to_string(), None, Duration::from_secs(1)).await;
        assert!(stream.is_ok());
        accept.await.unwrap().unwrap();
    }
}
