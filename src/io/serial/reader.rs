// src/io/serial/reader.rs
//
// serialport-backed raw byte source. The session polls it; nothing here
// blocks for longer than the 1 ms port timeout.

use serde::Serialize;
use std::io::{ErrorKind, Read};
use std::time::Duration;

use super::utils::{to_serialport_data_bits, to_serialport_parity, to_serialport_stop_bits};
use crate::io::ByteSource;
use crate::settings::SerialSettings;

/// Information about an available serial port
#[derive(Clone, Debug, Serialize)]
pub struct SerialPortInfo {
    pub port_name: String,
    pub port_type: String,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
}

/// An open serial port polled for bytes.
pub struct SerialByteSource {
    port: Box<dyn serialport::SerialPort>,
    name: String,
    total_bytes: u64,
}

impl SerialByteSource {
    /// Open the configured port with a minimal timeout so polling stays cooperative.
    pub fn open(settings: &SerialSettings) -> Result<Self, serialport::Error> {
        let port = serialport::new(&settings.port, settings.baud_rate)
            .data_bits(to_serialport_data_bits(settings.data_bits))
            .stop_bits(to_serialport_stop_bits(settings.stop_bits))
            .parity(to_serialport_parity(&settings.parity))
            .timeout(Duration::from_millis(1))
            .open()?;

        tlog!(
            "[serial] Opened {} at {} baud ({}-{}-{})",
            settings.port,
            settings.baud_rate,
            settings.data_bits,
            settings.parity.letter(),
            settings.stop_bits
        );

        Ok(SerialByteSource {
            port,
            name: settings.port.clone(),
            total_bytes: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }
}

impl ByteSource for SerialByteSource {
    fn read_available(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self.port.read(buf) {
            Ok(n) => {
                self.total_bytes += n as u64;
                Ok(n)
            }
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }
}

/// List available serial ports
///
/// On macOS, filters out /dev/tty.* devices and only shows /dev/cu.* devices.
pub fn list_serial_ports() -> Result<Vec<SerialPortInfo>, serialport::Error> {
    let ports = serialport::available_ports()?;

    Ok(ports
        .into_iter()
        .filter(|_p| {
            #[cfg(target_os = "macos")]
            {
                !_p.port_name.starts_with("/dev/tty.")
            }
            #[cfg(not(target_os = "macos"))]
            {
                true
            }
        })
        .map(|p| {
            let (port_type, manufacturer, product, serial_number, vid, pid) = match p.port_type {
                serialport::SerialPortType::UsbPort(info) => (
                    "USB".to_string(),
                    info.manufacturer,
                    info.product,
                    info.serial_number,
                    Some(info.vid),
                    Some(info.pid),
                ),
                serialport::SerialPortType::BluetoothPort => {
                    ("Bluetooth".to_string(), None, None, None, None, None)
                }
                serialport::SerialPortType::PciPort => {
                    ("PCI".to_string(), None, None, None, None, None)
                }
                serialport::SerialPortType::Unknown => {
                    ("Unknown".to_string(), None, None, None, None, None)
                }
            };
            SerialPortInfo {
                port_name: p.port_name,
                port_type,
                manufacturer,
                product,
                serial_number,
                vid,
                pid,
            }
        })
        .collect())
}
