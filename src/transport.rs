//! Byte transports owned by a bus, and the serial-port seam towards the
//! host system.
//!
//! A connection string is either a serial device path (`/dev/ttyUSB0`,
//! `COM3`) opened through the [`SerialPortService`] collaborator, or a
//! `host:port` endpoint reached over TCP for readers behind terminal
//! servers.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use log::debug;
use thiserror::Error;

use crate::config::BaudRate;

#[derive(Debug, Error)]
pub enum TransportError {
	#[error("transport is closed")]
	Closed,
	#[error(transparent)]
	Io(#[from] io::Error),
	#[error(transparent)]
	Serial(#[from] serialport::Error),
}

/// One byte-stream endpoint, owned exclusively by its bus task.
pub trait Transport: Send {
	/// Reads whatever is available, waiting at most `timeout`.
	///
	/// A zero `timeout` is a poll: return immediately with whatever is
	/// already buffered. Returns `Ok(0)` when nothing arrived in time. An
	/// orderly remote close surfaces as [`TransportError::Closed`].
	fn read_available(
		&mut self,
		buf: &mut [u8],
		timeout: Duration,
	) -> Result<usize, TransportError>;

	fn write_all(&mut self, buf: &[u8]) -> Result<(), TransportError>;

	/// Endpoint name for logs.
	fn describe(&self) -> &str;

	/// Whether captured traffic on this transport carries its own direction
	/// metadata. When it does not, the packet trace derives the direction
	/// from the address byte.
	fn tags_direction(&self) -> bool {
		false
	}
}

/// Host-system seam for serial ports.
pub trait SerialPortService: Send + Sync {
	fn port_exists(&self, path: &str) -> bool;

	fn open(&self, path: &str, baud: BaudRate) -> Result<Box<dyn Transport>, TransportError>;
}

/// [`SerialPortService`] backed by the operating system's port list.
pub struct SystemSerialPorts;

impl SerialPortService for SystemSerialPorts {
	fn port_exists(&self, path: &str) -> bool {
		serialport::available_ports()
			.map(|ports| ports.iter().any(|port| port.port_name == path))
			.unwrap_or(false)
	}

	fn open(&self, path: &str, baud: BaudRate) -> Result<Box<dyn Transport>, TransportError> {
		let port = serialport::new(path, baud.bits_per_second())
			.timeout(Duration::from_millis(10))
			.open()?;
		debug!("opened serial port {path} at {baud} baud");
		Ok(Box::new(SerialTransport {
			port,
			path: path.to_string(),
		}))
	}
}

struct SerialTransport {
	port: Box<dyn serialport::SerialPort>,
	path: String,
}

impl Transport for SerialTransport {
	fn read_available(
		&mut self,
		buf: &mut [u8],
		timeout: Duration,
	) -> Result<usize, TransportError> {
		if timeout.is_zero() && self.port.bytes_to_read()? == 0 {
			return Ok(0);
		}
		// The driver treats a zero timeout as "return what is buffered".
		self.port.set_timeout(timeout)?;
		match self.port.read(buf) {
			Ok(n) => Ok(n),
			Err(err) if matches!(err.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
				Ok(0)
			}
			Err(err) => Err(err.into()),
		}
	}

	fn write_all(&mut self, buf: &[u8]) -> Result<(), TransportError> {
		self.port.write_all(buf)?;
		Ok(())
	}

	fn describe(&self) -> &str {
		&self.path
	}
}

struct TcpTransport {
	stream: TcpStream,
	peer: String,
}

impl Transport for TcpTransport {
	fn read_available(
		&mut self,
		buf: &mut [u8],
		timeout: Duration,
	) -> Result<usize, TransportError> {
		// `set_read_timeout` rejects a zero duration, so polls switch to
		// non-blocking mode instead.
		if timeout.is_zero() {
			self.stream.set_nonblocking(true)?;
			let outcome = self.stream.read(buf);
			self.stream.set_nonblocking(false)?;
			return match outcome {
				Ok(0) => Err(TransportError::Closed),
				Ok(n) => Ok(n),
				Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(0),
				Err(err) => Err(err.into()),
			};
		}
		self.stream.set_read_timeout(Some(timeout))?;
		match self.stream.read(buf) {
			Ok(0) => Err(TransportError::Closed),
			Ok(n) => Ok(n),
			Err(err) if matches!(err.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
				Ok(0)
			}
			Err(err) => Err(err.into()),
		}
	}

	fn write_all(&mut self, buf: &[u8]) -> Result<(), TransportError> {
		self.stream.write_all(buf)?;
		Ok(())
	}

	fn describe(&self) -> &str {
		&self.peer
	}
}

/// Whether a connection string names a network endpoint rather than a
/// serial device.
pub fn is_network_endpoint(connection: &str) -> bool {
	connection
		.rsplit_once(':')
		.is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
}

/// Opens the transport behind a connection string.
pub fn open_endpoint(
	serial: &dyn SerialPortService,
	connection: &str,
	baud: BaudRate,
) -> Result<Box<dyn Transport>, TransportError> {
	if is_network_endpoint(connection) {
		let stream = TcpStream::connect(connection)?;
		stream.set_nodelay(true)?;
		debug!("connected to {connection}");
		Ok(Box::new(TcpTransport {
			stream,
			peer: connection.to_string(),
		}))
	} else {
		serial.open(connection, baud)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn endpoint_classification() {
		assert!(is_network_endpoint("10.1.2.3:4000"));
		assert!(is_network_endpoint("reader.example:9100"));
		assert!(!is_network_endpoint("/dev/ttyUSB0"));
		assert!(!is_network_endpoint("COM3"));
		assert!(!is_network_endpoint(":4000"));
	}
}
