//! Periodic payload hook and the serial loopback device.
//!
//! The cyclic loop invokes a [`PeriodicPayload`] once per period right after
//! measuring its wake-up. The serial implementation writes one byte per
//! period; with TX wired to RX, [`LoopbackReceiver`] reads it back and acts as
//! the event source of the secondary producer.

use crate::secondary::{Event, EventSource};
use nix::sys::termios::{
    self, BaudRate, ControlFlags, FlushArg, InputFlags, SetArg, SpecialCharacterIndices,
};
use rtlat_common::config::{Parity, SerialConfig};
use rtlat_common::error::{LatError, LatResult};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use tracing::{debug, info, trace};

/// Work performed once per period.
pub trait PeriodicPayload: Send {
    /// Run the payload.
    ///
    /// # Errors
    ///
    /// Returns an error when the payload could not run; the loop logs it and
    /// keeps measuring.
    fn fire(&mut self) -> LatResult<()>;
}

impl<F> PeriodicPayload for F
where
    F: FnMut() -> LatResult<()> + Send,
{
    fn fire(&mut self) -> LatResult<()> {
        self()
    }
}

/// Deciseconds a loopback read waits before reporting a timeout.
pub const READ_TIMEOUT_DECISECONDS: u8 = 5;

fn baud_rate(baud: u32) -> LatResult<BaudRate> {
    let rate = match baud {
        1200 => BaudRate::B1200,
        2400 => BaudRate::B2400,
        4800 => BaudRate::B4800,
        9600 => BaudRate::B9600,
        19_200 => BaudRate::B19200,
        38_400 => BaudRate::B38400,
        57_600 => BaudRate::B57600,
        115_200 => BaudRate::B115200,
        230_400 => BaudRate::B230400,
        #[cfg(target_os = "linux")]
        460_800 => BaudRate::B460800,
        #[cfg(target_os = "linux")]
        921_600 => BaudRate::B921600,
        other => return Err(LatError::Payload(format!("unsupported baud rate {other}"))),
    };
    Ok(rate)
}

/// Put `port` in raw 8-bit mode with the configured speed and parity.
///
/// One stop bit, no flow control, receiver enabled, modem lines ignored.
/// Reads return after at most [`READ_TIMEOUT_DECISECONDS`] even when no
/// byte arrived.
///
/// # Errors
///
/// Returns [`LatError::Payload`] if the device rejects the settings.
pub fn configure_port(port: &File, config: &SerialConfig) -> LatResult<()> {
    let err = |op: &str, e: nix::errno::Errno| {
        LatError::Payload(format!("{}: {op} failed: {e}", config.device.display()))
    };

    let mut tio = termios::tcgetattr(port).map_err(|e| err("tcgetattr", e))?;
    termios::cfmakeraw(&mut tio);
    termios::cfsetspeed(&mut tio, baud_rate(config.baud)?).map_err(|e| err("cfsetspeed", e))?;

    let cflags = &mut tio.control_flags;
    cflags.remove(ControlFlags::CSIZE | ControlFlags::CSTOPB | ControlFlags::CRTSCTS);
    cflags.insert(ControlFlags::CS8 | ControlFlags::CLOCAL | ControlFlags::CREAD);
    match config.parity {
        Parity::None => cflags.remove(ControlFlags::PARENB | ControlFlags::PARODD),
        Parity::Even => {
            cflags.insert(ControlFlags::PARENB);
            cflags.remove(ControlFlags::PARODD);
        }
        Parity::Odd => cflags.insert(ControlFlags::PARENB | ControlFlags::PARODD),
    }

    tio.input_flags
        .remove(InputFlags::IXON | InputFlags::IXOFF | InputFlags::IXANY);

    tio.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
    tio.control_chars[SpecialCharacterIndices::VTIME as usize] = READ_TIMEOUT_DECISECONDS;

    termios::tcflush(port, FlushArg::TCIOFLUSH).map_err(|e| err("tcflush", e))?;
    termios::tcsetattr(port, SetArg::TCSANOW, &tio).map_err(|e| err("tcsetattr", e))?;

    debug!(
        device = %config.device.display(),
        baud = config.baud,
        parity = ?config.parity,
        "Serial port configured"
    );
    Ok(())
}

/// Open and configure the device, returning its write and read halves.
///
/// # Errors
///
/// Returns [`LatError::Payload`] if the device cannot be opened or set up.
pub fn open_serial(config: &SerialConfig) -> LatResult<(SerialPayload, LoopbackReceiver)> {
    let port = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY)
        .open(&config.device)
        .map_err(|e| LatError::Payload(format!("{}: open failed: {e}", config.device.display())))?;

    configure_port(&port, config)?;

    let reader = port
        .try_clone()
        .map_err(|e| LatError::Payload(format!("{}: dup failed: {e}", config.device.display())))?;

    info!(device = %config.device.display(), "Serial payload ready");
    Ok((
        SerialPayload::new(port, config.byte),
        LoopbackReceiver::new(reader, config.byte),
    ))
}

/// Writes one byte per period.
#[derive(Debug)]
pub struct SerialPayload {
    port: File,
    byte: u8,
}

impl SerialPayload {
    /// Wrap an already configured port.
    #[must_use]
    pub fn new(port: File, byte: u8) -> Self {
        Self { port, byte }
    }
}

impl PeriodicPayload for SerialPayload {
    fn fire(&mut self) -> LatResult<()> {
        self.port
            .write_all(&[self.byte])
            .map_err(|e| LatError::Payload(format!("serial write failed: {e}")))
    }
}

/// Reads the looped-back byte.
#[derive(Debug)]
pub struct LoopbackReceiver {
    port: File,
    expected: u8,
}

impl LoopbackReceiver {
    /// Wrap an already configured port.
    #[must_use]
    pub fn new(port: File, expected: u8) -> Self {
        Self { port, expected }
    }
}

impl EventSource for LoopbackReceiver {
    fn wait(&mut self) -> LatResult<Event> {
        let mut buf = [0u8; 1];
        loop {
            match self.port.read(&mut buf) {
                Ok(0) => return Ok(Event::Timeout),
                Ok(_) => {
                    if buf[0] != self.expected {
                        trace!(got = buf[0], expected = self.expected, "Unexpected loopback byte");
                    }
                    return Ok(Event::Arrived);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(LatError::Payload(format!("serial read failed: {e}"))),
            }
        }
    }
}
