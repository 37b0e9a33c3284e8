//! Lifecycle and registry: reconciles device configurations with live
//! buses and sessions, multiplexes connections and keeps the trace
//! attribution maps.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, Weak};

use log::{info, warn};
use thiserror::Error;
use uuid::Uuid;

use crate::bus::{BusHandle, SendError};
use crate::config::{BaudRate, ConfigError, DeviceConfig, SecurityMode};
use crate::events::{EventRouter, Subscription};
use crate::feedback::{Feedback, FeedbackConfigurationService};
use crate::pin::{PinCollector, PinEventSink, PinLimits};
use crate::protocol::Command;
use crate::protocol::frame::Frame;
use crate::protocol::secure::KEY_LEN;
use crate::session::{DeviceSession, SecurityModeUpdateService};
use crate::trace::TraceService;
use crate::transport::{self, SerialPortService};

/// External services the core consumes. Only the serial seam is mandatory.
pub struct Collaborators {
	pub serial: Arc<dyn SerialPortService>,
	pub feedback_config: Option<Arc<dyn FeedbackConfigurationService>>,
	pub security_update: Option<Arc<dyn SecurityModeUpdateService>>,
	pub pin_sink: Option<Arc<dyn PinEventSink>>,
}

#[derive(Debug, Error)]
pub enum AddDeviceError {
	#[error(transparent)]
	Config(#[from] ConfigError),
	#[error("a device with id {0} already exists")]
	DuplicateId(Uuid),
	#[error("address {address} on {connection} is already configured")]
	AddressInUse { connection: String, address: u8 },
	#[error("{connection} is already open at {existing} baud")]
	BaudMismatch {
		connection: String,
		existing: BaudRate,
	},
	#[error("serial port {0} does not exist")]
	PortNotFound(String),
	#[error(transparent)]
	Transport(#[from] crate::transport::TransportError),
	#[error("cannot start bus task: {0}")]
	Spawn(#[from] io::Error),
}

#[derive(Debug, Error)]
#[error("cannot bring up {device}: {source}")]
pub struct StartError {
	pub device: String,
	#[source]
	pub source: AddDeviceError,
}

struct Registry {
	devices: HashMap<Uuid, DeviceConfig>,
	buses: HashMap<String, BusHandle>,
	/// (connection id, address) -> (reader id, reader name), for trace
	/// attribution.
	attribution: HashMap<(Uuid, u8), (Uuid, String)>,
	started: bool,
}

/// The gateway core. Owns every bus and session.
pub struct Manager {
	router: Arc<EventRouter>,
	trace: Arc<TraceService>,
	pin: Arc<PinCollector>,
	serial: Arc<dyn SerialPortService>,
	feedback_config: Option<Arc<dyn FeedbackConfigurationService>>,
	mode_update: Arc<ModeUpdateFanout>,
	registry: Arc<Mutex<Registry>>,
}

/// Applies a mode change to the registry copy before handing it to the
/// external persistence service.
struct ModeUpdateFanout {
	registry: Mutex<Weak<Mutex<Registry>>>,
	external: Option<Arc<dyn SecurityModeUpdateService>>,
}

impl SecurityModeUpdateService for ModeUpdateFanout {
	fn update_security_mode(
		&self,
		device: Uuid,
		mode: SecurityMode,
		key: Option<[u8; KEY_LEN]>,
	) -> bool {
		if let Some(registry) = self.registry.lock().unwrap().upgrade() {
			let mut registry = registry.lock().unwrap();
			if let Some(config) = registry.devices.get_mut(&device) {
				config.security_mode = mode;
				config.secure_key = key;
			}
		}
		self.external
			.as_ref()
			.is_none_or(|service| service.update_security_mode(device, mode, key))
	}
}

impl Manager {
	pub fn new(collaborators: Collaborators) -> Self {
		Self::with_pin_limits(collaborators, PinLimits::default())
	}

	pub fn with_pin_limits(collaborators: Collaborators, limits: PinLimits) -> Self {
		let router = Arc::new(EventRouter::new());
		let pin = Arc::new(PinCollector::new(
			router.clone(),
			collaborators.pin_sink,
			limits,
		));
		let mode_update = Arc::new(ModeUpdateFanout {
			registry: Mutex::new(Weak::new()),
			external: collaborators.security_update,
		});
		let registry = Arc::new(Mutex::new(Registry {
			devices: HashMap::new(),
			buses: HashMap::new(),
			attribution: HashMap::new(),
			started: false,
		}));
		*mode_update.registry.lock().unwrap() = Arc::downgrade(&registry);
		Self {
			router,
			trace: Arc::new(TraceService::default()),
			pin,
			serial: collaborators.serial,
			feedback_config: collaborators.feedback_config,
			mode_update,
			registry,
		}
	}

	/// Registers a device. When the manager is running and the device is
	/// enabled it is mounted right away.
	pub fn add_device(&self, config: DeviceConfig) -> Result<(), AddDeviceError> {
		config.validate()?;
		let mut registry = self.registry.lock().unwrap();
		if registry.devices.contains_key(&config.id) {
			return Err(AddDeviceError::DuplicateId(config.id));
		}
		let taken = registry.devices.values().any(|existing| {
			existing.connection == config.connection && existing.address == config.address
		});
		if taken {
			return Err(AddDeviceError::AddressInUse {
				connection: config.connection.clone(),
				address: config.address,
			});
		}

		if registry.started && config.enabled {
			self.mount_locked(&mut registry, &config)?;
		}
		info!(
			"registered {} at {}:{}",
			config.name, config.connection, config.address
		);
		registry.devices.insert(config.id, config);
		Ok(())
	}

	/// Forgets a device, unmounting it first if necessary.
	pub fn remove_device(&self, device: Uuid) -> bool {
		let mut registry = self.registry.lock().unwrap();
		let Some(config) = registry.devices.remove(&device) else {
			return false;
		};
		self.unmount_locked(&mut registry, &config);
		self.release_idle_buses(&mut registry);
		info!("removed {}", config.name);
		true
	}

	/// Connects all enabled devices. Fails on the first device whose
	/// transport cannot be brought up.
	pub fn start(&self) -> Result<(), StartError> {
		let mut registry = self.registry.lock().unwrap();
		if registry.started {
			return Ok(());
		}
		registry.started = true;
		let configs: Vec<DeviceConfig> = registry
			.devices
			.values()
			.filter(|config| config.enabled)
			.cloned()
			.collect();
		for config in configs {
			self.mount_locked(&mut registry, &config)
				.map_err(|source| StartError {
					device: config.name.clone(),
					source,
				})?;
		}
		info!("gateway started");
		Ok(())
	}

	/// Disconnects every session and releases every transport, waiting for
	/// in-flight work to drain.
	pub fn stop(&self) {
		let mut registry = self.registry.lock().unwrap();
		registry.started = false;
		for (_, bus) in registry.buses.drain() {
			bus.shutdown();
		}
		registry.attribution.clear();
		info!("gateway stopped");
	}

	/// Mounts one device, creating its bus if needed. Idempotent.
	pub fn connect(&self, device: Uuid) -> bool {
		let mut registry = self.registry.lock().unwrap();
		let Some(config) = registry.devices.get(&device).cloned() else {
			return false;
		};
		match self.mount_locked(&mut registry, &config) {
			Ok(()) => true,
			Err(err) => {
				warn!("cannot connect {}: {err}", config.name);
				false
			}
		}
	}

	/// Unmounts one device but keeps its configuration.
	pub fn disconnect(&self, device: Uuid) -> bool {
		let mut registry = self.registry.lock().unwrap();
		let Some(config) = registry.devices.get(&device).cloned() else {
			return false;
		};
		self.unmount_locked(&mut registry, &config);
		self.release_idle_buses(&mut registry);
		true
	}

	/// Queues a feedback burst for a reader. Returns false when the reader
	/// is unknown or not mounted.
	pub fn send_feedback(&self, device: Uuid, feedback: Feedback) -> bool {
		let registry = self.registry.lock().unwrap();
		let Some(config) = registry.devices.get(&device) else {
			return false;
		};
		registry
			.buses
			.get(&config.connection)
			.is_some_and(|bus| bus.enqueue_feedback(config.address, feedback))
	}

	/// Runs one raw command in the device's next bus slot.
	pub fn send(
		&self,
		device: Uuid,
		command: Command,
		payload: Vec<u8>,
	) -> Result<Frame, SendError> {
		// Clone a posting client under the lock, then block outside it.
		let (client, address) = {
			let registry = self.registry.lock().unwrap();
			let config = registry.devices.get(&device).ok_or(SendError::NotMounted)?;
			let bus = registry
				.buses
				.get(&config.connection)
				.ok_or(SendError::NotMounted)?;
			(bus.client(), config.address)
		};
		client.send(address, command, payload)
	}

	pub fn subscribe(&self) -> Subscription {
		self.router.subscribe()
	}

	pub fn router(&self) -> &Arc<EventRouter> {
		&self.router
	}

	pub fn trace(&self) -> &Arc<TraceService> {
		&self.trace
	}

	pub fn device(&self, device: Uuid) -> Option<DeviceConfig> {
		self.registry.lock().unwrap().devices.get(&device).cloned()
	}

	pub fn devices(&self) -> Vec<DeviceConfig> {
		self.registry.lock().unwrap().devices.values().cloned().collect()
	}

	/// All devices configured on one connection string.
	pub fn devices_on(&self, connection: &str) -> Vec<DeviceConfig> {
		self.registry
			.lock()
			.unwrap()
			.devices
			.values()
			.filter(|config| config.connection == connection)
			.cloned()
			.collect()
	}

	/// Reader identity behind a (connection id, address) pair, as used for
	/// trace attribution.
	pub fn reader_at(&self, connection: Uuid, address: u8) -> Option<(Uuid, String)> {
		self.registry
			.lock()
			.unwrap()
			.attribution
			.get(&(connection, address))
			.cloned()
	}

	fn mount_locked(
		&self,
		registry: &mut Registry,
		config: &DeviceConfig,
	) -> Result<(), AddDeviceError> {
		if let Some(bus) = registry.buses.get(&config.connection) {
			if bus.baud != config.baud_rate {
				return Err(AddDeviceError::BaudMismatch {
					connection: config.connection.clone(),
					existing: bus.baud,
				});
			}
		} else {
			if !transport::is_network_endpoint(&config.connection)
				&& !self.serial.port_exists(&config.connection)
			{
				return Err(AddDeviceError::PortNotFound(config.connection.clone()));
			}
			let endpoint =
				transport::open_endpoint(self.serial.as_ref(), &config.connection, config.baud_rate)?;
			let bus = BusHandle::spawn(
				config.connection.clone(),
				config.baud_rate,
				endpoint,
				self.trace.clone(),
				self.pin.clone(),
			)?;
			registry.buses.insert(config.connection.clone(), bus);
		}

		let bus = &registry.buses[&config.connection];
		let session = DeviceSession::new(
			config.clone(),
			self.router.clone(),
			self.pin.clone(),
			self.feedback_config.clone(),
			Some(self.mode_update.clone() as Arc<dyn SecurityModeUpdateService>),
		);
		bus.mount(Box::new(session));
		registry.attribution.insert(
			(bus.connection_id, config.address),
			(config.id, config.name.clone()),
		);
		Ok(())
	}

	fn unmount_locked(&self, registry: &mut Registry, config: &DeviceConfig) {
		if let Some(bus) = registry.buses.get(&config.connection) {
			bus.unmount(config.address);
			let key = (bus.connection_id, config.address);
			registry.attribution.remove(&key);
		}
		self.pin.reset_device(config.id);
	}

	/// Shuts down buses that no longer carry any mounted device, releasing
	/// their transports.
	fn release_idle_buses(&self, registry: &mut Registry) {
		let mounted: std::collections::HashSet<&str> = registry
			.attribution
			.values()
			.filter_map(|(id, _)| registry.devices.get(id))
			.map(|config| config.connection.as_str())
			.collect();
		let idle: Vec<String> = registry
			.buses
			.keys()
			.filter(|connection| !mounted.contains(connection.as_str()))
			.cloned()
			.collect();
		for connection in idle {
			if let Some(bus) = registry.buses.remove(&connection) {
				info!("releasing idle bus {connection}");
				bus.shutdown();
			}
		}
	}
}

impl Drop for Manager {
	fn drop(&mut self) {
		self.stop();
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use super::*;
	use crate::transport::{Transport, TransportError};

	/// A transport that accepts writes and never produces a byte.
	struct DeadAir;

	impl Transport for DeadAir {
		fn read_available(
			&mut self,
			_buf: &mut [u8],
			timeout: Duration,
		) -> Result<usize, TransportError> {
			std::thread::sleep(timeout.min(Duration::from_millis(2)));
			Ok(0)
		}

		fn write_all(&mut self, _buf: &[u8]) -> Result<(), TransportError> {
			Ok(())
		}

		fn describe(&self) -> &str {
			"dead-air"
		}
	}

	struct FakePorts;

	impl SerialPortService for FakePorts {
		fn port_exists(&self, path: &str) -> bool {
			path.starts_with("/dev/")
		}

		fn open(&self, _path: &str, _baud: BaudRate) -> Result<Box<dyn Transport>, TransportError> {
			Ok(Box::new(DeadAir))
		}
	}

	fn manager() -> Manager {
		Manager::new(Collaborators {
			serial: Arc::new(FakePorts),
			feedback_config: None,
			security_update: None,
			pin_sink: None,
		})
	}

	fn config(name: &str, connection: &str, address: u8) -> DeviceConfig {
		DeviceConfig::new(Uuid::new_v4(), name, connection, address)
	}

	#[test]
	fn duplicate_address_on_connection_is_rejected() {
		let m = manager();
		m.add_device(config("a", "/dev/ttyS0", 1)).unwrap();
		let err = m.add_device(config("b", "/dev/ttyS0", 1)).unwrap_err();
		assert!(matches!(err, AddDeviceError::AddressInUse { address: 1, .. }));
		// Same address elsewhere is fine.
		m.add_device(config("c", "/dev/ttyS1", 1)).unwrap();
	}

	#[test]
	fn duplicate_id_is_rejected() {
		let m = manager();
		let c = config("a", "/dev/ttyS0", 1);
		let mut other = c.clone();
		other.address = 2;
		m.add_device(c).unwrap();
		assert!(matches!(
			m.add_device(other),
			Err(AddDeviceError::DuplicateId(_))
		));
	}

	#[test]
	fn baud_mismatch_on_shared_connection() {
		let m = manager();
		m.add_device(config("a", "/dev/ttyS0", 1)).unwrap();
		let mut fast = config("b", "/dev/ttyS0", 2);
		fast.baud_rate = BaudRate::B115200;
		m.add_device(fast.clone()).unwrap();
		// The conflict only surfaces when both must share a live bus.
		m.start().unwrap_err();
	}

	#[test]
	fn missing_port_fails_start() {
		let m = manager();
		m.add_device(config("a", "COM9", 1)).unwrap();
		let err = m.start().unwrap_err();
		assert!(matches!(err.source, AddDeviceError::PortNotFound(_)));
	}

	#[test]
	fn attribution_follows_mount_lifecycle() {
		let m = manager();
		let c = config("door", "/dev/ttyS0", 4);
		let id = c.id;
		m.add_device(c).unwrap();
		m.start().unwrap();

		let connection_id = {
			let registry = m.registry.lock().unwrap();
			registry.buses["/dev/ttyS0"].connection_id
		};
		assert_eq!(
			m.reader_at(connection_id, 4),
			Some((id, "door".to_string()))
		);

		m.disconnect(id);
		assert_eq!(m.reader_at(connection_id, 4), None);
		// The bus went idle and was released.
		assert!(m.registry.lock().unwrap().buses.is_empty());
		m.stop();
	}

	#[test]
	fn start_is_idempotent_and_stop_releases_buses() {
		let m = manager();
		m.add_device(config("a", "/dev/ttyS0", 1)).unwrap();
		m.start().unwrap();
		m.start().unwrap();
		assert_eq!(m.registry.lock().unwrap().buses.len(), 1);
		m.stop();
		assert!(m.registry.lock().unwrap().buses.is_empty());
	}

	#[test]
	fn disabled_devices_are_not_mounted() {
		let m = manager();
		let mut c = config("a", "/dev/ttyS0", 1);
		c.enabled = false;
		m.add_device(c).unwrap();
		m.start().unwrap();
		assert!(m.registry.lock().unwrap().buses.is_empty());
		m.stop();
	}
}
