//! Line-oriented serial links.
//!
//! Drivers that talk to a controller one text line at a time hold a
//! [`SharedPort`]: the boxed stream behind a buffered reader and an async
//! mutex, so a whole command/reply exchange runs under one lock. Tests pass a
//! `tokio::io::duplex` end instead of a real port.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_valid::Validate;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

/// Anything a line link can run over.
pub trait LineIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> LineIo for T {}

pub type DynSerial = Box<dyn LineIo>;

/// A link shared between the tasks that use one device.
pub type SharedPort = Arc<Mutex<BufReader<DynSerial>>>;

pub fn shared(port: DynSerial) -> SharedPort {
    Arc::new(Mutex::new(BufReader::new(port)))
}

fn default_baud() -> u32 {
    115_200
}

fn default_timeout_ms() -> u64 {
    5000
}

/// Where a link lives and how long to wait for a reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct SerialSettings {
    #[validate(min_length = 1)]
    pub port: String,

    #[serde(default = "default_baud")]
    #[validate(minimum = 1)]
    pub baud: u32,

    /// Reply timeout per line.
    #[serde(default = "default_timeout_ms")]
    #[validate(minimum = 1)]
    pub timeout_ms: u64,
}

impl SerialSettings {
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud: default_baud(),
            timeout_ms: default_timeout_ms(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Write `line` with a trailing newline and flush it.
pub async fn write_line(port: &mut BufReader<DynSerial>, line: &str) -> std::io::Result<()> {
    let stream = port.get_mut();
    stream.write_all(line.as_bytes()).await?;
    stream.write_all(b"\n").await?;
    stream.flush().await
}

/// Throw away whatever input is already waiting, without blocking.
///
/// A reply that arrives after its exchange timed out would otherwise be read
/// as the reply to the next line. Returns the number of bytes dropped.
pub fn discard_pending(port: &mut BufReader<DynSerial>) -> usize {
    let mut discarded = 0;
    loop {
        let n = match port.fill_buf().now_or_never() {
            Some(Ok(buf)) => buf.len(),
            _ => break,
        };
        if n == 0 {
            break;
        }
        port.consume(n);
        discarded += n;
    }
    discarded
}

/// Open the port at 8N1 without flow control.
///
/// Opening can block on some adapters, so it runs on the blocking pool.
#[cfg(feature = "serial")]
pub async fn open(settings: &SerialSettings) -> anyhow::Result<SharedPort> {
    use anyhow::Context;
    use tokio_serial::SerialPortBuilderExt;

    let path = settings.port.clone();
    let baud = settings.baud;
    let stream = tokio::task::spawn_blocking(move || {
        tokio_serial::new(&path, baud)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .with_context(|| format!("failed to open serial port {}", path))
    })
    .await
    .context("serial open task panicked")??;
    Ok(shared(Box::new(stream)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_defaults_and_rules() {
        let settings: SerialSettings = serde_json::from_str(r#"{"port": "/dev/ttyACM0"}"#).unwrap();
        assert_eq!(settings, SerialSettings::new("/dev/ttyACM0"));
        assert_eq!(settings.timeout(), Duration::from_secs(5));
        assert!(settings.validate().is_ok());

        let empty = SerialSettings::new("");
        assert!(empty.validate().is_err());
    }

    #[tokio::test]
    async fn lines_are_newline_terminated() {
        let (host, device) = tokio::io::duplex(64);
        let port = shared(Box::new(host));
        write_line(&mut *port.lock().await, "M400").await.unwrap();

        let mut reader = BufReader::new(device);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "M400\n");
    }

    #[tokio::test]
    async fn stale_input_is_discarded() {
        let (host, mut device) = tokio::io::duplex(64);
        let port = shared(Box::new(host));
        let mut port = port.lock().await;
        assert_eq!(discard_pending(&mut port), 0);

        device.write_all(b"ok\nok\n").await.unwrap();
        tokio::task::yield_now().await;
        assert_eq!(discard_pending(&mut port), 6);
        assert_eq!(discard_pending(&mut port), 0);

        device.write_all(b"fresh\n").await.unwrap();
        let mut line = String::new();
        port.read_line(&mut line).await.unwrap();
        assert_eq!(line, "fresh\n");
    }
}
