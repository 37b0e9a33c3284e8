//! One task per bus.
//!
//! Each bus runs a single thread that owns its transport exclusively. All
//! frames on the wire are linearized by that thread: it polls mounted
//! devices round-robin, lets queued commands preempt the next poll slot and
//! dispatches every decoded reply to the owning session. Everyone else
//! talks to the bus by posting requests into its queue.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, SyncSender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};
use thiserror::Error;
use uuid::Uuid;

use crate::config::{
	BUS_POLL_FLOOR, BaudRate, IO_RETRY_BACKOFF, IO_RETRY_BACKOFF_MAX, OFFLINE_THRESHOLD,
	REPLY_TIMEOUT, STOP_GRACE, UNMOUNT_DRAIN,
};
use crate::feedback::Feedback;
use crate::pin::PinCollector;
use crate::protocol::frame::{self, EncodeError, Frame};
use crate::protocol::{Command, Direction};
use crate::session::DeviceSession;
use crate::trace::TraceService;
use crate::transport::{Transport, TransportError};

/// How long a caller waits for the bus to run its command and report back.
const SEND_WAIT: Duration = Duration::from_secs(2);

/// Idle wait cap so request posts and PIN timeouts stay responsive.
const IDLE_WAIT: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum SendError {
	#[error("timed out waiting for a reply")]
	Timeout,
	#[error("device is offline")]
	DeviceOffline,
	#[error("device is not mounted on this bus")]
	NotMounted,
	#[error("transport is closed")]
	TransportClosed,
	#[error("operation cancelled")]
	Cancelled,
	#[error("command rejected: {0}")]
	Rejected(EncodeError),
}

pub(crate) enum BusRequest {
	Mount(Box<DeviceSession>),
	Unmount {
		address: u8,
		done: SyncSender<()>,
	},
	Send {
		address: u8,
		command: Command,
		payload: Vec<u8>,
		reply: SyncSender<Result<Frame, SendError>>,
	},
	Feedback {
		address: u8,
		feedback: Feedback,
	},
	Shutdown,
}

struct Shared {
	queue: Mutex<VecDeque<BusRequest>>,
	wake: Condvar,
	closed: AtomicBool,
}

/// Owning handle to a bus task; the manager holds one per connection.
pub(crate) struct BusHandle {
	pub connection: String,
	pub connection_id: Uuid,
	pub baud: BaudRate,
	shared: Arc<Shared>,
	thread: Option<JoinHandle<()>>,
}

impl BusHandle {
	/// Spawns the bus task over an opened transport.
	pub fn spawn(
		connection: String,
		baud: BaudRate,
		transport: Box<dyn Transport>,
		trace: Arc<TraceService>,
		pin: Arc<PinCollector>,
	) -> std::io::Result<Self> {
		let connection_id = Uuid::new_v4();
		let shared = Arc::new(Shared {
			queue: Mutex::new(VecDeque::new()),
			wake: Condvar::new(),
			closed: AtomicBool::new(false),
		});
		let task_shared = shared.clone();
		let task_name = connection.clone();
		let thread = thread::Builder::new()
			.name(format!("osdp-bus {connection}"))
			.spawn(move || {
				BusTask {
					name: task_name,
					connection_id,
					transport,
					shared: task_shared,
					sessions: HashMap::new(),
					order: Vec::new(),
					next_slot: 0,
					last_polled: HashMap::new(),
					read_buf: Vec::new(),
					trace,
					pin,
					io_failures: 0,
					backoff: IO_RETRY_BACKOFF,
				}
				.run();
			})?;
		Ok(Self {
			connection,
			connection_id,
			baud,
			shared,
			thread: Some(thread),
		})
	}

	fn post(&self, request: BusRequest) -> bool {
		post(&self.shared, request)
	}

	/// A cheap handle for posting work without holding the manager's
	/// registry lock across a blocking call.
	pub fn client(&self) -> BusClient {
		BusClient {
			shared: self.shared.clone(),
		}
	}

	/// Adds a device to the schedule. Idempotent per device identity.
	pub fn mount(&self, session: Box<DeviceSession>) -> bool {
		self.post(BusRequest::Mount(session))
	}

	/// Removes a device, cancelling its queued work and letting a reply in
	/// flight drain before the address can be reused.
	pub fn unmount(&self, address: u8) {
		let (done, finished) = mpsc::sync_channel(1);
		if self.post(BusRequest::Unmount { address, done }) {
			let _ = finished.recv_timeout(UNMOUNT_DRAIN + SEND_WAIT);
		}
	}

	/// Runs one command in the device's next slot, ahead of its poll, and
	/// waits for the matching reply.
	pub fn send(&self, address: u8, command: Command, payload: Vec<u8>) -> Result<Frame, SendError> {
		self.client().send(address, command, payload)
	}

	/// Queues a feedback burst without waiting for it to run.
	pub fn enqueue_feedback(&self, address: u8, feedback: Feedback) -> bool {
		self.post(BusRequest::Feedback { address, feedback })
	}

	/// Stops the task, waiting up to the stop grace for in-flight work to
	/// drain. Pending work fails with [`SendError::TransportClosed`].
	pub fn shutdown(mut self) {
		self.post(BusRequest::Shutdown);
		let Some(thread) = self.thread.take() else {
			return;
		};
		let deadline = Instant::now() + STOP_GRACE;
		while !thread.is_finished() && Instant::now() < deadline {
			thread::sleep(Duration::from_millis(10));
		}
		if thread.is_finished() {
			let _ = thread.join();
		} else {
			warn!("bus {} did not stop within the grace period", self.connection);
		}
	}
}

impl Drop for BusHandle {
	fn drop(&mut self) {
		self.post(BusRequest::Shutdown);
		if let Some(thread) = self.thread.take() {
			let _ = thread.join();
		}
	}
}

fn post(shared: &Arc<Shared>, request: BusRequest) -> bool {
	if shared.closed.load(Ordering::Acquire) {
		return false;
	}
	shared.queue.lock().unwrap().push_back(request);
	shared.wake.notify_one();
	true
}

/// Posting-only view of a bus, detached from its owning handle.
#[derive(Clone)]
pub(crate) struct BusClient {
	shared: Arc<Shared>,
}

impl BusClient {
	pub fn send(&self, address: u8, command: Command, payload: Vec<u8>) -> Result<Frame, SendError> {
		let (reply, result) = mpsc::sync_channel(1);
		if !post(
			&self.shared,
			BusRequest::Send {
				address,
				command,
				payload,
				reply,
			},
		) {
			return Err(SendError::TransportClosed);
		}
		match result.recv_timeout(SEND_WAIT) {
			Ok(outcome) => outcome,
			Err(mpsc::RecvTimeoutError::Timeout) => Err(SendError::Timeout),
			Err(mpsc::RecvTimeoutError::Disconnected) => Err(SendError::TransportClosed),
		}
	}
}

struct BusTask {
	name: String,
	connection_id: Uuid,
	transport: Box<dyn Transport>,
	shared: Arc<Shared>,
	sessions: HashMap<u8, DeviceSession>,
	order: Vec<u8>,
	next_slot: usize,
	last_polled: HashMap<u8, Instant>,
	read_buf: Vec<u8>,
	trace: Arc<TraceService>,
	pin: Arc<PinCollector>,
	io_failures: u32,
	backoff: Duration,
}

impl BusTask {
	fn run(mut self) {
		info!("bus {} started", self.name);
		loop {
			if self.handle_requests() {
				break;
			}
			let now = Instant::now();
			self.pin.poll(now);
			match self.next_due(now) {
				Some(address) => self.cycle(address),
				None => self.idle_wait(now),
			}
		}
		self.wind_down();
	}

	/// Services queued requests. Returns true on shutdown.
	fn handle_requests(&mut self) -> bool {
		let drained: Vec<BusRequest> = {
			let mut queue = self.shared.queue.lock().unwrap();
			queue.drain(..).collect()
		};
		let now = Instant::now();
		for request in drained {
			match request {
				BusRequest::Mount(session) => self.mount(session),
				BusRequest::Unmount { address, done } => {
					self.unmount(address);
					let _ = done.try_send(());
				}
				BusRequest::Send {
					address,
					command,
					payload,
					reply,
				} => match self.sessions.get_mut(&address) {
					Some(session) if session.is_offline() => {
						let _ = reply.try_send(Err(SendError::DeviceOffline));
					}
					Some(session) => session.enqueue(command, payload, Some(reply)),
					None => {
						let _ = reply.try_send(Err(SendError::NotMounted));
					}
				},
				BusRequest::Feedback { address, feedback } => {
					if let Some(session) = self.sessions.get_mut(&address) {
						session.apply_feedback(&feedback, now);
					}
				}
				BusRequest::Shutdown => return true,
			}
		}
		false
	}

	fn mount(&mut self, session: Box<DeviceSession>) {
		let address = session.address();
		match self.sessions.get(&address) {
			Some(existing) if existing.device_id() == session.device_id() => {
				debug!(
					"bus {}: device {} already mounted at {address}",
					self.name,
					session.name()
				);
			}
			Some(_) => {
				warn!(
					"bus {}: replacing device at address {address}",
					self.name
				);
				self.unmount(address);
				self.insert(address, *session);
			}
			None => self.insert(address, *session),
		}
	}

	fn insert(&mut self, address: u8, session: DeviceSession) {
		info!(
			"bus {}: mounted {} at address {address}",
			self.name,
			session.name()
		);
		self.sessions.insert(address, session);
		self.order.push(address);
	}

	fn unmount(&mut self, address: u8) {
		let Some(mut session) = self.sessions.remove(&address) else {
			return;
		};
		session.cancel_all(|| SendError::Cancelled);
		self.order.retain(|a| *a != address);
		self.last_polled.remove(&address);
		// Let a reply in flight drain, then discard it, so the address can
		// be reused without a stale frame confusing its next owner.
		thread::sleep(UNMOUNT_DRAIN);
		let mut sink = [0u8; 256];
		loop {
			match self.transport.read_available(&mut sink, Duration::ZERO) {
				Ok(0) => break,
				Ok(_) => {}
				Err(err) => {
					warn!(
						"bus {}: cannot drain input after unmounting addr {address}: {err}",
						self.name
					);
					break;
				}
			}
		}
		self.read_buf.clear();
		info!("bus {}: unmounted address {address}", self.name);
	}

	/// The effective cycle interval: the fastest configured device, floored
	/// by the transport round-trip minimum.
	fn interval(&self) -> Duration {
		self.sessions
			.values()
			.map(|session| session.config().poll_interval)
			.min()
			.unwrap_or(BUS_POLL_FLOOR)
			.max(BUS_POLL_FLOOR)
	}

	fn next_due(&mut self, now: Instant) -> Option<u8> {
		if self.order.is_empty() {
			return None;
		}
		let interval = self.interval();
		for step in 0..self.order.len() {
			let index = (self.next_slot + step) % self.order.len();
			let address = self.order[index];
			let Some(session) = self.sessions.get(&address) else {
				continue;
			};
			let due = session.has_pending()
				|| self
					.last_polled
					.get(&address)
					.is_none_or(|last| now.duration_since(*last) >= interval);
			if due {
				self.next_slot = index + 1;
				return Some(address);
			}
		}
		None
	}

	fn idle_wait(&self, now: Instant) {
		let interval = self.interval();
		let next_due = self
			.order
			.iter()
			.filter_map(|address| self.last_polled.get(address))
			.map(|last| *last + interval)
			.min();
		let wait = next_due
			.map(|at| at.saturating_duration_since(now))
			.unwrap_or(IDLE_WAIT)
			.min(IDLE_WAIT);

		let queue = self.shared.queue.lock().unwrap();
		if queue.is_empty() && !wait.is_zero() {
			let _ = self.shared.wake.wait_timeout(queue, wait).unwrap();
		}
	}

	/// One slot for one address: emit its command or a poll, collect and
	/// dispatch the reply.
	fn cycle(&mut self, address: u8) {
		let now = Instant::now();
		self.last_polled.insert(address, now);
		let Some(session) = self.sessions.get_mut(&address) else {
			return;
		};
		let reader = Some(session.device_id());
		let (bytes, command) = session.next_frame(now);
		trace!(
			"bus {}: addr {address} <- {command:?} ({} bytes)",
			self.name,
			bytes.len()
		);

		let meta = self.transport.tags_direction();
		self.trace.record(
			self.connection_id,
			Some(address),
			reader,
			meta.then_some(Direction::Outgoing),
			&bytes,
		);

		if let Err(err) = self.transport.write_all(&bytes) {
			self.on_io_error(&err);
			return;
		}

		let deadline = Instant::now() + REPLY_TIMEOUT;
		loop {
			match self.read_packet(deadline) {
				Ok(Some(packet)) => {
					self.trace.record(
						self.connection_id,
						Some(address),
						reader,
						meta.then_some(Direction::Incoming),
						&packet,
					);
					// A frame for another address does not use up this
					// slot's reply window.
					let stray = packet.get(1).is_none_or(|byte| *byte & 0x7f != address);
					if stray {
						debug!(
							"bus {}: dropping stray frame while waiting on addr {address}",
							self.name
						);
						continue;
					}
					self.io_failures = 0;
					self.backoff = IO_RETRY_BACKOFF;
					let session = self
						.sessions
						.get_mut(&address)
						.expect("session vanished mid-cycle");
					match session.decode(&packet) {
						Ok(reply) => {
							session.handle_reply(reply, Instant::now());
						}
						Err(err) => {
							debug!(
								"bus {}: dropping undecodable reply from addr {address}: {err}",
								self.name
							);
							session.on_missed_reply();
						}
					}
				}
				Ok(None) => {
					trace!("bus {}: addr {address} reply timeout", self.name);
					let session = self
						.sessions
						.get_mut(&address)
						.expect("session vanished mid-cycle");
					session.on_missed_reply();
				}
				Err(err) => self.on_io_error(&err),
			}
			break;
		}
	}

	/// Accumulates transport bytes until one complete packet is framed or
	/// the deadline lapses. Leading garbage is skipped byte by byte.
	fn read_packet(&mut self, deadline: Instant) -> Result<Option<Vec<u8>>, TransportError> {
		loop {
			while !self.read_buf.is_empty() {
				match frame::wire_len(&self.read_buf) {
					Some(Err(_)) => {
						self.read_buf.remove(0);
					}
					Some(Ok(len)) if self.read_buf.len() >= len => {
						return Ok(Some(self.read_buf.drain(..len).collect()));
					}
					_ => break,
				}
			}

			let now = Instant::now();
			if now >= deadline {
				return Ok(None);
			}
			let mut chunk = [0u8; 256];
			let n = self
				.transport
				.read_available(&mut chunk, deadline.duration_since(now))?;
			if n == 0 && Instant::now() >= deadline {
				return Ok(None);
			}
			self.read_buf.extend_from_slice(&chunk[..n]);
		}
	}

	fn on_io_error(&mut self, err: &TransportError) {
		self.io_failures += 1;
		warn!(
			"bus {}: transport error ({err}), retry in {:?}",
			self.name, self.backoff
		);
		if self.io_failures == OFFLINE_THRESHOLD {
			warn!(
				"bus {}: {OFFLINE_THRESHOLD} consecutive transport failures, marking all devices offline",
				self.name
			);
			for session in self.sessions.values_mut() {
				session.mark_offline();
			}
		}
		thread::sleep(self.backoff);
		self.backoff = (self.backoff * 2).min(IO_RETRY_BACKOFF_MAX);
	}

	fn wind_down(&mut self) {
		self.shared.closed.store(true, Ordering::Release);
		for session in self.sessions.values_mut() {
			session.cancel_all(|| SendError::TransportClosed);
		}
		let leftovers: Vec<BusRequest> = self.shared.queue.lock().unwrap().drain(..).collect();
		for request in leftovers {
			match request {
				BusRequest::Send { reply, .. } => {
					let _ = reply.try_send(Err(SendError::TransportClosed));
				}
				BusRequest::Unmount { done, .. } => {
					let _ = done.try_send(());
				}
				_ => {}
			}
		}
		info!("bus {} stopped", self.name);
	}
}
