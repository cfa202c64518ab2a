use std::time::Duration;

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};

use crate::models::SerialConfig;

mod command;
pub use command::{Command, SendMode};

/// Name fragments identifying common USB-serial bridges.
const USB_SERIAL_HINTS: &[&str] = &["usbmodem", "usbserial", "SLAB_USBtoUART", "wchusbserial"];

#[derive(Debug, Error)]
pub enum SerialError {
    #[error("no serial device found")]
    NoDevice,
    #[error("cannot open {port}: {source}")]
    Open {
        port: String,
        source: tokio_serial::Error,
    },
    #[error("serial port error: {0}")]
    Port(#[from] tokio_serial::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("line codec error: {0}")]
    Codec(#[from] LinesCodecError),
}

type Link = Framed<SerialStream, LinesCodec>;

struct SerialState {
    link: Option<Link>,
    port: Option<String>,
    baud: u32,
}

/// Owner of the controller connection. All writes funnel through the single
/// internal mutex, so callers never interleave commands on the wire.
pub struct SerialChannel {
    state: Mutex<SerialState>,
    config: SerialConfig,
}

impl SerialChannel {
    pub fn new(config: SerialConfig) -> Self {
        let state = SerialState {
            link: None,
            port: config.port.clone(),
            baud: config.baud,
        };

        Self {
            state: Mutex::new(state),
            config,
        }
    }

    /// Canonical device path: macOS exposes each USB serial device as both
    /// `/dev/cu.*` and `/dev/tty.*`, which must not count as two devices.
    fn canonical(path: &str) -> String {
        if let Some(suffix) = path.strip_prefix("/dev/cu.") {
            format!("/dev/tty.{}", suffix)
        } else {
            path.to_owned()
        }
    }

    fn matches_usb_hint(name: &str) -> bool {
        USB_SERIAL_HINTS.iter().any(|hint| name.contains(hint))
    }

    fn autodetect() -> Result<String, SerialError> {
        for info in tokio_serial::available_ports()? {
            if Self::matches_usb_hint(&info.port_name) {
                let device = Self::canonical(&info.port_name);
                info!(device = %device, "detected USB serial device");
                return Ok(device);
            }
        }

        Err(SerialError::NoDevice)
    }

    pub async fn connect(
        &self,
        port: Option<String>,
        baud: Option<u32>,
    ) -> Result<(String, u32), SerialError> {
        let mut state = self.state.lock().await;
        self.open_locked(&mut state, port, baud).await
    }

    async fn open_locked(
        &self,
        state: &mut SerialState,
        port: Option<String>,
        baud: Option<u32>,
    ) -> Result<(String, u32), SerialError> {
        let port = match port.or_else(|| state.port.clone()) {
            Some(port) => Self::canonical(&port),
            None => Self::autodetect()?,
        };
        let baud = baud.unwrap_or(state.baud);

        // Drop any previous link before reopening the device
        state.link = None;

        debug!(port = %port, baud = %baud, "opening serial port");
        let stream = tokio_serial::new(port.as_str(), baud)
            .timeout(Duration::from_millis(self.config.ack_timeout_ms))
            .open_native_async()
            .map_err(|source| SerialError::Open {
                port: port.clone(),
                source,
            })?;

        // Let the link stabilize, then discard whatever the controller
        // pushed while resetting
        tokio::time::sleep(Duration::from_millis(self.config.stabilize_ms)).await;
        stream.clear(tokio_serial::ClearBuffer::All)?;

        state.port = Some(port.clone());
        state.baud = baud;
        state.link = Some(Framed::new(stream, LinesCodec::new()));

        info!(port = %port, baud = %baud, "serial link up");
        Ok((port, baud))
    }

    pub async fn is_open(&self) -> bool {
        self.state.lock().await.link.is_some()
    }

    pub async fn send(&self, command: Command, mode: SendMode) -> Result<(), SerialError> {
        let mut state = self.state.lock().await;

        if state.link.is_none() {
            // One reconnect attempt before giving up
            self.open_locked(&mut state, None, None).await?;
        }

        match self.write_locked(&mut state, command, mode).await {
            Ok(()) => Ok(()),
            Err(error) => {
                warn!(command = %command, error = %error, "serial write failed, marking link down");
                state.link = None;
                Err(error)
            }
        }
    }

    async fn write_locked(
        &self,
        state: &mut SerialState,
        command: Command,
        mode: SendMode,
    ) -> Result<(), SerialError> {
        let link = match state.link.as_mut() {
            Some(link) => link,
            None => return Err(SerialError::NoDevice),
        };

        link.send(command.to_string()).await?;

        match mode {
            SendMode::Ack => {
                match timeout(
                    Duration::from_millis(self.config.ack_timeout_ms),
                    link.next(),
                )
                .await
                {
                    Ok(Some(Ok(reply))) => trace!(command = %command, reply = %reply, "ack"),
                    Ok(Some(Err(error))) => return Err(error.into()),
                    Ok(None) => {
                        return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into())
                    }
                    // The controller's replies are advisory; a silent
                    // firmware is not a transport fault
                    Err(_) => debug!(command = %command, "no ack within timeout"),
                }
            }
            SendMode::FireAndForget => {
                tokio::time::sleep(Duration::from_millis(self.config.write_delay_ms)).await;
            }
        }

        Ok(())
    }

    pub async fn set_pixel(&self, index: usize, red: u8, green: u8, blue: u8) -> Result<(), SerialError> {
        self.send(
            Command::Pixel {
                index,
                red,
                green,
                blue,
            },
            SendMode::Ack,
        )
        .await
    }

    /// Single-pixel write without waiting for a response, for high-rate
    /// drawing.
    pub async fn set_pixel_fast(
        &self,
        index: usize,
        red: u8,
        green: u8,
        blue: u8,
    ) -> Result<(), SerialError> {
        self.send(
            Command::Pixel {
                index,
                red,
                green,
                blue,
            },
            SendMode::FireAndForget,
        )
        .await
    }

    /// Paced batch draw under a single lock acquisition, so the batch is not
    /// interleaved with other writers.
    pub async fn set_pixels_batch(
        &self,
        pixels: &[(usize, u8, u8, u8)],
    ) -> Result<(), SerialError> {
        let mut state = self.state.lock().await;

        if state.link.is_none() {
            self.open_locked(&mut state, None, None).await?;
        }

        for &(index, red, green, blue) in pixels {
            let command = Command::Pixel {
                index,
                red,
                green,
                blue,
            };

            if let Err(error) = self
                .write_locked(&mut state, command, SendMode::FireAndForget)
                .await
            {
                warn!(error = %error, "serial batch write failed, marking link down");
                state.link = None;
                return Err(error);
            }
        }

        Ok(())
    }

    pub async fn set_all(&self, red: u8, green: u8, blue: u8) -> Result<(), SerialError> {
        self.send(Command::All { red, green, blue }, SendMode::Ack).await
    }

    pub async fn clear(&self) -> Result<(), SerialError> {
        self.send(Command::Clear, SendMode::Ack).await
    }

    pub async fn set_brightness(&self, value: u8) -> Result<(), SerialError> {
        self.send(Command::Brightness(value), SendMode::Ack).await
    }

    pub async fn blink(&self, index: usize) -> Result<(), SerialError> {
        self.send(Command::Blink { index }, SendMode::Ack).await
    }

    /// Turn the strip off and drop the link.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;

        if state.link.is_some() {
            if let Err(error) = self
                .write_locked(&mut state, Command::Clear, SendMode::Ack)
                .await
            {
                debug!(error = %error, "clear on close failed");
            }
        }

        state.link = None;
    }
}

/// Seam between the mapping engine and the LED hardware.
#[async_trait::async_trait]
pub trait LedDriver: Send + Sync {
    /// Light a single LED at the given brightness in [0, 1].
    async fn illuminate(&self, index: usize, brightness: f32) -> Result<(), SerialError>;
    async fn extinguish(&self, index: usize) -> Result<(), SerialError>;
    async fn set_strip_brightness(&self, value: u8) -> Result<(), SerialError>;
    async fn all_off(&self) -> Result<(), SerialError>;
}

#[async_trait::async_trait]
impl LedDriver for SerialChannel {
    async fn illuminate(&self, index: usize, brightness: f32) -> Result<(), SerialError> {
        // Green channel only; the detector works on grayscale
        let level = (brightness.clamp(0., 1.) * 255.) as u8;
        self.set_pixel_fast(index, 0, level, 0).await
    }

    async fn extinguish(&self, index: usize) -> Result<(), SerialError> {
        self.set_pixel_fast(index, 0, 0, 0).await
    }

    async fn set_strip_brightness(&self, value: u8) -> Result<(), SerialError> {
        self.set_brightness(value).await
    }

    async fn all_off(&self) -> Result<(), SerialError> {
        self.clear().await
    }
}
