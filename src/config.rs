//! Device configuration and the tunables of the polling core.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::protocol::MAX_DEVICE_ADDRESS;
use crate::protocol::secure::KEY_LEN;

/// Default poll interval per device.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A bus never polls faster than this, whatever the devices ask for.
pub const BUS_POLL_FLOOR: Duration = Duration::from_millis(100);

/// How long a bus waits for the reply to one command.
pub const REPLY_TIMEOUT: Duration = Duration::from_millis(200);

/// Consecutive missed replies before a device is reported offline.
pub const OFFLINE_THRESHOLD: u32 = 3;

/// First retry delay after a transport-level I/O error.
pub const IO_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Retry delays stop growing here.
pub const IO_RETRY_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Idle heartbeat cadence while a device is online.
pub const HEARTBEAT_PERIOD: Duration = Duration::from_secs(5);

/// How long a heartbeat flash lasts, in 100 ms LED timer units.
pub const HEARTBEAT_FLASH_UNITS: u8 = 4;

/// Grace period for a reply in flight when a device is unmounted.
pub const UNMOUNT_DRAIN: Duration = Duration::from_millis(500);

/// `stop()` waits this long for in-flight commands.
pub const STOP_GRACE: Duration = Duration::from_secs(5);

/// Packet-trace ring capacity.
pub const TRACE_CAPACITY: usize = 10_000;

/// Events queued per subscriber before the oldest is dropped.
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 256;

/// Supported line speeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaudRate {
	B9600,
	B19200,
	B38400,
	B57600,
	B115200,
}

impl BaudRate {
	pub fn bits_per_second(self) -> u32 {
		match self {
			Self::B9600 => 9600,
			Self::B19200 => 19_200,
			Self::B38400 => 38_400,
			Self::B57600 => 57_600,
			Self::B115200 => 115_200,
		}
	}
}

impl TryFrom<u32> for BaudRate {
	type Error = ConfigError;

	fn try_from(value: u32) -> Result<Self, ConfigError> {
		match value {
			9600 => Ok(Self::B9600),
			19_200 => Ok(Self::B19200),
			38_400 => Ok(Self::B38400),
			57_600 => Ok(Self::B57600),
			115_200 => Ok(Self::B115200),
			other => Err(ConfigError::UnsupportedBaudRate(other)),
		}
	}
}

impl std::fmt::Display for BaudRate {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.bits_per_second())
	}
}

/// How the link to a device is protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityMode {
	/// No secure channel.
	ClearText,
	/// Use the default base key once, to deliver a fresh device key.
	Install,
	/// Secure channel with the stored device key.
	Secure,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
	#[error("device address {0} out of range (0..={MAX_DEVICE_ADDRESS})")]
	InvalidAddress(u8),
	#[error("connection string is empty")]
	MissingConnection,
	#[error("baud rate {0} is not supported")]
	UnsupportedBaudRate(u32),
	#[error("secure mode requires a {KEY_LEN} byte key")]
	MissingKey,
	#[error("secure-channel key must be {KEY_LEN} bytes, got {0}")]
	InvalidKeyLength(usize),
	#[error("poll interval of zero")]
	ZeroPollInterval,
}

/// Configuration of one reader, as handed over by the external store.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
	/// Stable identity across restarts.
	pub id: Uuid,
	pub name: String,
	/// Bus address, 0..=126.
	pub address: u8,
	/// Serial device path or `host:port`.
	pub connection: String,
	pub baud_rate: BaudRate,
	pub security_mode: SecurityMode,
	/// Required in [`SecurityMode::Secure`], ignored in
	/// [`SecurityMode::Install`], absent in [`SecurityMode::ClearText`].
	pub secure_key: Option<[u8; KEY_LEN]>,
	pub enabled: bool,
	pub poll_interval: Duration,
}

impl DeviceConfig {
	pub fn new(id: Uuid, name: impl Into<String>, connection: impl Into<String>, address: u8) -> Self {
		Self {
			id,
			name: name.into(),
			address,
			connection: connection.into(),
			baud_rate: BaudRate::B9600,
			security_mode: SecurityMode::ClearText,
			secure_key: None,
			enabled: true,
			poll_interval: DEFAULT_POLL_INTERVAL,
		}
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.address > MAX_DEVICE_ADDRESS {
			return Err(ConfigError::InvalidAddress(self.address));
		}
		if self.connection.trim().is_empty() {
			return Err(ConfigError::MissingConnection);
		}
		if self.security_mode == SecurityMode::Secure && self.secure_key.is_none() {
			return Err(ConfigError::MissingKey);
		}
		if self.poll_interval.is_zero() {
			return Err(ConfigError::ZeroPollInterval);
		}
		Ok(())
	}
}

/// Converts key material from the external store into a fixed-size key.
pub fn parse_key(bytes: &[u8]) -> Result<[u8; KEY_LEN], ConfigError> {
	bytes
		.try_into()
		.map_err(|_| ConfigError::InvalidKeyLength(bytes.len()))
}
