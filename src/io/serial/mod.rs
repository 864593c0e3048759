// src/io/serial/mod.rs
//
// Serial input: the ASCII framer and, on desktop targets, a serialport-backed
// byte source.

pub mod framer;
#[cfg(any(target_os = "windows", target_os = "macos", target_os = "linux"))]
pub mod reader;
pub mod utils;

pub use framer::{encode_ascii_frame, AsciiFramer};
#[cfg(any(target_os = "windows", target_os = "macos", target_os = "linux"))]
pub use reader::{list_serial_ports, SerialByteSource, SerialPortInfo};
pub use utils::Parity;
