//! Per-device session: link state, secure-channel handshake, key install
//! and the translation of replies into domain events.
//!
//! A session never runs on its own; its bus task calls in for every cycle
//! and the manager enqueues work through the bus. State transitions:
//!
//! ```text
//! mount -> Polling -> Online <-> Offline
//! ```
//!
//! with the secure-channel handshake and key installation layered on top of
//! Online whenever the configured mode asks for them.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::mpsc::SyncSender;
use std::time::Instant;

use log::{debug, info, warn};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::bus::SendError;
use crate::config::{DeviceConfig, OFFLINE_THRESHOLD, SecurityMode};
use crate::entropy;
use crate::events::{
	CardFormat, CardReadEvent, Event, EventRouter, SecurityModeChange, StatusChange,
};
use crate::feedback::{
	Feedback, FeedbackConfigurationService, IdleScheduler, IdleState, LedColor,
	buzzer_payload, feedback_led_payload, heartbeat_led_payload,
};
use crate::pin::PinCollector;
use crate::protocol::frame::{DecodeError, Frame, SecurityBlock, scs};
use crate::protocol::secure::{KEY_LEN, SecureChannel};
use crate::protocol::{Command, Direction, NakCode, Reply};
use crate::util;

/// External persistence of a successful Install -> Secure transition.
pub trait SecurityModeUpdateService: Send + Sync {
	fn update_security_mode(
		&self,
		device: Uuid,
		mode: SecurityMode,
		key: Option<[u8; KEY_LEN]>,
	) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
	Polling,
	Online,
	Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyInstall {
	Idle,
	AwaitingAck([u8; KEY_LEN]),
	Installed,
	Failed,
}

/// How an outgoing command is protected on the wire.
enum Wrap {
	/// Plaintext, or session-wrapped once the channel is up.
	Plain,
	/// Handshake frame with an explicit security block, never MACed.
	Handshake(SecurityBlock),
}

pub(crate) struct PendingCommand {
	pub command: Command,
	pub payload: Vec<u8>,
	wrap: Wrap,
	pub waiter: Option<SyncSender<Result<Frame, SendError>>>,
}

impl PendingCommand {
	fn internal(command: Command, payload: Vec<u8>) -> Self {
		Self {
			command,
			payload,
			wrap: Wrap::Plain,
			waiter: None,
		}
	}
}

pub(crate) struct DeviceSession {
	config: DeviceConfig,
	state: LinkState,
	announced: Option<bool>,
	sequence: u8,
	resync: bool,
	missed: u32,
	secure: Option<SecureChannel>,
	secure_fallback: bool,
	key_install: KeyInstall,
	persist_pending: Option<[u8; KEY_LEN]>,
	pending: VecDeque<PendingCommand>,
	in_flight: Option<PendingCommand>,
	idle: IdleScheduler,
	identified: bool,
	last_activity: Option<Instant>,
	router: Arc<EventRouter>,
	pin: Arc<PinCollector>,
	feedback_config: Option<Arc<dyn FeedbackConfigurationService>>,
	security_update: Option<Arc<dyn SecurityModeUpdateService>>,
}

impl DeviceSession {
	pub fn new(
		config: DeviceConfig,
		router: Arc<EventRouter>,
		pin: Arc<PinCollector>,
		feedback_config: Option<Arc<dyn FeedbackConfigurationService>>,
		security_update: Option<Arc<dyn SecurityModeUpdateService>>,
	) -> Self {
		let secure = match config.security_mode {
			SecurityMode::ClearText => None,
			SecurityMode::Install => Some(SecureChannel::with_default_key()),
			SecurityMode::Secure => config.secure_key.map(SecureChannel::new),
		};
		Self {
			config,
			state: LinkState::Polling,
			announced: None,
			sequence: 0,
			resync: true,
			missed: 0,
			secure,
			secure_fallback: false,
			key_install: KeyInstall::Idle,
			persist_pending: None,
			pending: VecDeque::new(),
			in_flight: None,
			idle: IdleScheduler::default(),
			identified: false,
			last_activity: None,
			router,
			pin,
			feedback_config,
			security_update,
		}
	}

	pub fn device_id(&self) -> Uuid {
		self.config.id
	}

	pub fn name(&self) -> &str {
		&self.config.name
	}

	pub fn address(&self) -> u8 {
		self.config.address
	}

	pub fn config(&self) -> &DeviceConfig {
		&self.config
	}

	pub fn is_online(&self) -> bool {
		self.state == LinkState::Online
	}

	pub fn is_offline(&self) -> bool {
		self.state == LinkState::Offline
	}

	/// Forces the offline transition, e.g. when the whole bus loses its
	/// transport.
	pub fn mark_offline(&mut self) {
		self.set_offline();
	}

	pub fn has_pending(&self) -> bool {
		!self.pending.is_empty()
	}

	/// Queues an externally requested command.
	pub fn enqueue(
		&mut self,
		command: Command,
		payload: Vec<u8>,
		waiter: Option<SyncSender<Result<Frame, SendError>>>,
	) {
		self.pending.push_back(PendingCommand {
			command,
			payload,
			wrap: Wrap::Plain,
			waiter,
		});
	}

	/// Queues the LED/buzzer commands of one feedback burst and pauses the
	/// idle heartbeat for its duration.
	pub fn apply_feedback(&mut self, feedback: &Feedback, now: Instant) {
		if self.state != LinkState::Online {
			debug!("{}: dropping feedback for offline reader", self.config.name);
			return;
		}
		let idle = self.idle_colors();
		if let Some(color) = feedback.led_color {
			let permanent = idle.permanent_color.unwrap_or(LedColor::Black);
			self.pending.push_back(PendingCommand::internal(
				Command::Led,
				feedback_led_payload(color, feedback.led_duration_s, permanent),
			));
			self.idle.pause(
				now,
				std::time::Duration::from_secs(u64::from(feedback.led_duration_s)),
			);
		}
		if feedback.beep_count > 0 {
			self.pending.push_back(PendingCommand::internal(
				Command::Buzzer,
				buzzer_payload(feedback.beep_count),
			));
		}
		if feedback.display_message.is_some() {
			debug!("{}: text output not implemented", self.config.name);
		}
	}

	/// Per-cycle housekeeping: handshake initiation and idle heartbeat.
	pub fn tick(&mut self, now: Instant) {
		if self.state != LinkState::Online {
			return;
		}

		if self.wants_handshake() {
			self.begin_handshake();
		}

		if self.idle.heartbeat_due(now) {
			let idle = self.idle_colors();
			let permanent = idle.permanent_color.unwrap_or(LedColor::Black);
			let heartbeat = idle.heartbeat_color.unwrap_or(LedColor::Black);
			self.pending.push_back(PendingCommand::internal(
				Command::Led,
				heartbeat_led_payload(heartbeat, permanent),
			));
			self.idle.mark_sent(now);
		}
	}

	/// Picks and serializes the next outgoing frame for this device: the
	/// queued command if any, a poll otherwise.
	pub fn next_frame(&mut self, now: Instant) -> (Vec<u8>, Command) {
		self.tick(now);
		loop {
			let command = self
				.pending
				.pop_front()
				.unwrap_or_else(|| PendingCommand::internal(Command::Poll, Vec::new()));
			match self.encode(&command) {
				Ok(bytes) => {
					let code = command.command;
					self.in_flight = Some(command);
					return (bytes, code);
				}
				Err(err) => {
					warn!(
						"{}: cannot encode {:?}: {err}",
						self.config.name, command.command
					);
					if let Some(waiter) = command.waiter {
						let _ = waiter.try_send(Err(SendError::Rejected(err)));
					}
				}
			}
		}
	}

	fn encode(&mut self, command: &PendingCommand) -> Result<Vec<u8>, crate::protocol::frame::EncodeError> {
		let sequence = if self.resync {
			self.resync = false;
			self.sequence = 0;
			0
		} else {
			self.sequence = if self.sequence >= 3 { 1 } else { self.sequence + 1 };
			self.sequence
		};

		let mut frame = Frame::command(
			self.config.address,
			sequence,
			true,
			command.command.into(),
			command.payload.clone(),
		);
		match &command.wrap {
			Wrap::Handshake(block) => {
				frame.security_block = Some(block.clone());
				frame.encode(None)
			}
			Wrap::Plain => match self.secure.as_mut() {
				Some(channel) if channel.is_established() => frame.encode(Some(channel)),
				_ => frame.encode(None),
			},
		}
	}

	/// Decodes a received packet in the context of this session.
	pub fn decode(&mut self, bytes: &[u8]) -> Result<Frame, DecodeError> {
		Frame::decode(bytes, self.secure.as_mut())
	}

	/// Dispatches a decoded reply.
	pub fn handle_reply(&mut self, frame: Frame, now: Instant) {
		if frame.direction != Direction::Incoming || frame.address != self.config.address {
			debug!(
				"{}: ignoring stray frame for address {}",
				self.config.name, frame.address
			);
			return;
		}
		if frame.sequence != self.sequence {
			warn!(
				"{} (addr {}): reply sequence {} does not match {}, forcing resync",
				self.config.name, self.config.address, frame.sequence, self.sequence
			);
			self.force_resync();
			self.fail_in_flight(SendError::Timeout);
			return;
		}

		self.missed = 0;
		self.last_activity = Some(now);
		self.set_online(now);

		let reply = match Reply::try_from(frame.code) {
			Ok(reply) => reply,
			Err(_) => {
				debug!(
					"{} (addr {}): unknown reply code {:#04x}",
					self.config.name, self.config.address, frame.code
				);
				self.resolve_in_flight(frame);
				return;
			}
		};

		// A busy device keeps its command queued; the pending work makes
		// the address immediately due again, so the retry does not wait a
		// full poll interval.
		if reply == Reply::Busy {
			debug!("{}: device busy, retrying command", self.config.name);
			if let Some(command) = self.in_flight.take() {
				self.pending.push_front(command);
			}
			return;
		}

		match reply {
			Reply::Ack => self.on_ack(),
			Reply::Nak => self.on_nak(&frame),
			Reply::RawCardData => self.on_card_data(&frame),
			Reply::Keypad => self.on_keypad(&frame, now),
			Reply::ClientCryptogram => self.on_client_cryptogram(&frame),
			Reply::InitialRMac => self.on_initial_mac(&frame),
			Reply::IdReport => self.on_id_report(&frame),
			Reply::Capabilities => {
				info!(
					"{}: reported {} capability entries",
					self.config.name,
					frame.payload.len() / 3
				);
			}
			Reply::LocalStatus => self.on_local_status(&frame),
			Reply::Busy => unreachable!(),
		}

		self.resolve_in_flight(frame);
	}

	/// Counts a lost or undecodable reply; at the threshold the device goes
	/// offline and the sequence is reset.
	pub fn on_missed_reply(&mut self) {
		self.missed += 1;
		let handshake = matches!(
			self.in_flight.as_ref().map(|c| c.command),
			Some(Command::Challenge | Command::ServerCryptogram)
		);
		if handshake {
			warn!(
				"{}: secure-channel handshake got no reply, staying in clear text",
				self.config.name
			);
			self.abandon_secure_channel();
		}
		let keyset = self
			.in_flight
			.as_ref()
			.is_some_and(|c| c.command == Command::KeySet);
		if keyset && matches!(self.key_install, KeyInstall::AwaitingAck(_)) {
			warn!("{}: key install timed out, mode stays Install", self.config.name);
			self.key_install = KeyInstall::Failed;
		}
		self.fail_in_flight(SendError::Timeout);
		if self.missed >= OFFLINE_THRESHOLD {
			self.set_offline();
		}
	}

	/// Fails everything queued, e.g. on unmount or bus shutdown.
	pub fn cancel_all(&mut self, error: fn() -> SendError) {
		self.fail_in_flight(error());
		for command in self.pending.drain(..) {
			if let Some(waiter) = command.waiter {
				let _ = waiter.try_send(Err(error()));
			}
		}
		self.idle.on_offline();
		self.pin.reset_device(self.config.id);
	}

	fn set_online(&mut self, now: Instant) {
		if self.state == LinkState::Online {
			return;
		}
		self.state = LinkState::Online;
		self.idle.on_online(now);
		info!(
			"{} (addr {}) is online",
			self.config.name, self.config.address
		);
		if self.announced != Some(true) {
			self.announced = Some(true);
			self.publish_status(true);
		}
		if !self.identified {
			self.identified = true;
			self.pending
				.push_back(PendingCommand::internal(Command::IdReport, vec![0x00]));
			self.pending
				.push_back(PendingCommand::internal(Command::Capabilities, vec![0x00]));
			self.pending
				.push_back(PendingCommand::internal(Command::LocalStatus, Vec::new()));
		}
	}

	fn set_offline(&mut self) {
		if self.state == LinkState::Offline {
			return;
		}
		let was = self.state;
		self.state = LinkState::Offline;
		self.resync = true;
		self.idle.on_offline();
		self.identified = false;
		self.pin.reset_device(self.config.id);
		// Re-arm the secure channel for the next online transition.
		self.secure_fallback = false;
		if let Some(channel) = self.secure.as_mut() {
			channel.reset();
		}
		if self.key_install != KeyInstall::Installed {
			self.key_install = KeyInstall::Idle;
		}
		warn!(
			"{} (addr {}) is offline, last activity {:?} ago",
			self.config.name,
			self.config.address,
			self.last_activity.map(|at| at.elapsed())
		);
		if self.announced != Some(false) && (was == LinkState::Online || self.announced.is_none()) {
			self.announced = Some(false);
			self.publish_status(false);
		}
	}

	fn publish_status(&self, online: bool) {
		self.router.publish(Event::Status(StatusChange {
			device: self.config.id,
			device_name: self.config.name.clone(),
			online,
			timestamp: OffsetDateTime::now_utc(),
		}));
	}

	fn force_resync(&mut self) {
		self.resync = true;
		// The MAC chain is tied to the sequence; re-derive it from a fresh
		// challenge.
		if let Some(channel) = self.secure.as_mut() {
			channel.reset();
		}
	}

	fn wants_handshake(&self) -> bool {
		!self.secure_fallback
			&& self
				.secure
				.as_ref()
				.is_some_and(|channel| !channel.is_established())
			&& !self.handshake_in_progress()
	}

	fn handshake_in_progress(&self) -> bool {
		let is_handshake = |command: &PendingCommand| {
			matches!(
				command.command,
				Command::Challenge | Command::ServerCryptogram
			)
		};
		self.pending.iter().any(is_handshake)
			|| self.in_flight.as_ref().is_some_and(is_handshake)
	}

	fn begin_handshake(&mut self) {
		let Some(channel) = self.secure.as_mut() else {
			return;
		};
		match channel.begin() {
			Ok(rnd_a) => {
				let block = SecurityBlock::with_data(scs::SCS_11, &[channel.key_reference()]);
				self.pending.push_front(PendingCommand {
					command: Command::Challenge,
					payload: rnd_a.to_vec(),
					wrap: Wrap::Handshake(block),
					waiter: None,
				});
			}
			Err(err) => {
				warn!("{}: cannot start handshake: {err}", self.config.name);
				self.abandon_secure_channel();
			}
		}
	}

	fn abandon_secure_channel(&mut self) {
		self.secure_fallback = true;
		if let Some(channel) = self.secure.as_mut() {
			channel.reset();
		}
		self.pending.retain(|command| {
			!matches!(
				command.command,
				Command::Challenge | Command::ServerCryptogram | Command::KeySet
			)
		});
	}

	fn on_ack(&mut self) {
		let was_keyset = self
			.in_flight
			.as_ref()
			.is_some_and(|c| c.command == Command::KeySet);
		if !was_keyset {
			return;
		}
		let KeyInstall::AwaitingAck(key) = self.key_install else {
			return;
		};
		self.key_install = KeyInstall::Installed;
		self.config.security_mode = SecurityMode::Secure;
		self.config.secure_key = Some(key);
		info!(
			"{}: new secure-channel key installed, switching to secure mode",
			self.config.name
		);
		self.router.publish(Event::SecurityMode(SecurityModeChange {
			device: self.config.id,
			mode: SecurityMode::Secure,
			key: Some(key),
			timestamp: OffsetDateTime::now_utc(),
		}));
		self.persist_mode(key);
		// Re-handshake under the installed key.
		self.secure = Some(SecureChannel::new(key));
	}

	fn persist_mode(&mut self, key: [u8; KEY_LEN]) {
		let persisted = self.security_update.as_ref().is_none_or(|service| {
			service.update_security_mode(self.config.id, SecurityMode::Secure, Some(key))
		});
		if persisted {
			self.persist_pending = None;
		} else {
			warn!(
				"{}: persisting the new security mode failed, will retry",
				self.config.name
			);
			self.persist_pending = Some(key);
		}
	}

	fn on_nak(&mut self, frame: &Frame) {
		let code = frame.payload.first().copied();
		let nak = code.and_then(|code| NakCode::try_from(code).ok());
		warn!(
			"{} (addr {}): NAK {:?}",
			self.config.name, self.config.address, nak
		);
		if nak == Some(NakCode::SequenceError) {
			self.force_resync();
		}
		match self.in_flight.as_ref().map(|c| c.command) {
			Some(Command::Challenge | Command::ServerCryptogram) => {
				warn!(
					"{}: device declined the secure-channel handshake, staying in clear text",
					self.config.name
				);
				self.abandon_secure_channel();
			}
			Some(Command::KeySet) => {
				warn!("{}: key install rejected, mode stays Install", self.config.name);
				self.key_install = KeyInstall::Failed;
			}
			_ => {}
		}
	}

	fn on_card_data(&mut self, frame: &Frame) {
		// reader, format, bit count (LE), data bits.
		if frame.payload.len() < 4 {
			warn!("{}: malformed card data reply", self.config.name);
			return;
		}
		let format = CardFormat::from(frame.payload[1]);
		let bit_length = u16::from_le_bytes([frame.payload[2], frame.payload[3]]);
		let data = &frame.payload[4..];
		if usize::from(bit_length).div_ceil(8) > data.len() {
			warn!("{}: card data shorter than its bit count", self.config.name);
			return;
		}
		let bits = util::bit_string(data, usize::from(bit_length));
		let card_number = util::bits_to_decimal(data, usize::from(bit_length));
		info!(
			"{}: card read, {bit_length} bits",
			self.config.name
		);
		self.router.publish(Event::CardRead(CardReadEvent {
			device: self.config.id,
			device_name: self.config.name.clone(),
			card_number,
			bit_length,
			format,
			timestamp: OffsetDateTime::now_utc(),
			bits,
		}));
	}

	fn on_keypad(&mut self, frame: &Frame, now: Instant) {
		// reader, digit count, digits.
		if frame.payload.len() < 2 {
			warn!("{}: malformed keypad reply", self.config.name);
			return;
		}
		let count = usize::from(frame.payload[1]).min(frame.payload.len() - 2);
		for byte in &frame.payload[2..2 + count] {
			let key = match byte {
				0x30..=0x39 => char::from(*byte),
				0x0d => '#',
				0x7f => '*',
				other => char::from(*other),
			};
			self.pin
				.handle_key(self.config.id, &self.config.name, key, now);
		}
	}

	fn on_client_cryptogram(&mut self, frame: &Frame) {
		let Some(channel) = self.secure.as_mut() else {
			return;
		};
		match channel.handle_client_cryptogram(&frame.payload) {
			Ok(cryptogram) => {
				let block = SecurityBlock::with_data(scs::SCS_13, &[channel.key_reference()]);
				self.pending.push_front(PendingCommand {
					command: Command::ServerCryptogram,
					payload: cryptogram.to_vec(),
					wrap: Wrap::Handshake(block),
					waiter: None,
				});
			}
			Err(err) => {
				warn!(
					"{}: secure-channel handshake failed ({err}), staying in clear text",
					self.config.name
				);
				self.abandon_secure_channel();
			}
		}
	}

	fn on_initial_mac(&mut self, frame: &Frame) {
		let Some(channel) = self.secure.as_mut() else {
			return;
		};
		if let Err(err) = channel.handle_initial_mac(&frame.payload) {
			warn!(
				"{}: secure-channel handshake failed ({err}), staying in clear text",
				self.config.name
			);
			self.abandon_secure_channel();
			return;
		}
		info!(
			"{} (addr {}): secure channel established",
			self.config.name, self.config.address
		);
		if let Some(key) = self.persist_pending {
			self.persist_mode(key);
		}
		if self.config.security_mode == SecurityMode::Install
			&& self.key_install == KeyInstall::Idle
		{
			self.queue_key_install();
		}
	}

	fn queue_key_install(&mut self) {
		let mut key = [0u8; KEY_LEN];
		if let Err(err) = entropy::fill(&mut key) {
			warn!("{}: cannot generate a device key: {err}", self.config.name);
			return;
		}
		let mut payload = vec![0x01, KEY_LEN as u8];
		payload.extend_from_slice(&key);
		self.key_install = KeyInstall::AwaitingAck(key);
		self.pending
			.push_back(PendingCommand::internal(Command::KeySet, payload));
	}

	fn on_id_report(&mut self, frame: &Frame) {
		if frame.payload.len() < 12 {
			debug!("{}: short identification report", self.config.name);
			return;
		}
		let p = &frame.payload;
		info!(
			"{}: vendor {:02x}:{:02x}:{:02x}, model {}, firmware {}.{}.{}",
			self.config.name, p[0], p[1], p[2], p[3], p[9], p[10], p[11]
		);
	}

	fn on_local_status(&mut self, frame: &Frame) {
		let tamper = frame.payload.first().copied().unwrap_or(0);
		let power = frame.payload.get(1).copied().unwrap_or(0);
		if tamper != 0 || power != 0 {
			warn!(
				"{} (addr {}): local status tamper={tamper} power={power}",
				self.config.name, self.config.address
			);
		}
	}

	fn idle_colors(&self) -> IdleState {
		match self.feedback_config.as_ref().map(|s| s.idle_state()) {
			Some(Ok(state)) => state,
			Some(Err(err)) => {
				debug!("{}: {err}; using dark idle state", self.config.name);
				IdleState::default()
			}
			None => IdleState::default(),
		}
	}

	fn resolve_in_flight(&mut self, frame: Frame) {
		if let Some(command) = self.in_flight.take()
			&& let Some(waiter) = command.waiter
		{
			let _ = waiter.try_send(Ok(frame));
		}
	}

	fn fail_in_flight(&mut self, error: SendError) {
		if let Some(command) = self.in_flight.take()
			&& let Some(waiter) = command.waiter
		{
			let _ = waiter.try_send(Err(error));
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::events::{EventKind, PinCompletionReason, Subscription};
	use crate::pin::PinLimits;
	use crate::protocol::secure::DEFAULT_BASE_KEY;
	use crate::protocol::secure::testing::DeviceChannel;

	struct Harness {
		session: DeviceSession,
		sub: Subscription,
		now: Instant,
	}

	fn harness(mode: SecurityMode) -> Harness {
		let router = Arc::new(EventRouter::new());
		let pin = Arc::new(PinCollector::new(router.clone(), None, PinLimits::default()));
		let mut config = DeviceConfig::new(Uuid::new_v4(), "door", "/dev/ttyS1", 3);
		config.security_mode = mode;
		if mode == SecurityMode::Secure {
			config.secure_key = Some([0x42; KEY_LEN]);
		}
		let sub = router.subscribe();
		let session = DeviceSession::new(config, router, pin, None, None);
		Harness {
			session,
			sub,
			now: Instant::now(),
		}
	}

	fn reply(session: &DeviceSession, code: Reply, payload: Vec<u8>) -> Frame {
		Frame::reply(session.address(), session.sequence, true, code.into(), payload)
	}

	/// Runs one poll cycle answered with an ACK, bringing the link up.
	fn go_online(h: &mut Harness) {
		let (_bytes, _) = h.session.next_frame(h.now);
		let ack = reply(&h.session, Reply::Ack, Vec::new());
		h.session.handle_reply(ack, h.now);
		assert!(h.session.is_online());
	}

	fn events_of(sub: &Subscription, kind: EventKind) -> Vec<Event> {
		std::iter::from_fn(|| sub.try_recv())
			.filter(|event| event.kind() == kind)
			.collect()
	}

	#[test]
	fn first_frame_uses_sequence_zero() {
		let mut h = harness(SecurityMode::ClearText);
		let (bytes, command) = h.session.next_frame(h.now);
		assert_eq!(command, Command::Poll);
		let frame = Frame::decode(&bytes, None).unwrap();
		assert_eq!(frame.sequence, 0);

		// Subsequent frames cycle 1..=3, never 0.
		let ack = reply(&h.session, Reply::Ack, Vec::new());
		h.session.handle_reply(ack, h.now);
		let mut seen = Vec::new();
		for _ in 0..5 {
			let (bytes, _) = h.session.next_frame(h.now);
			let frame = Frame::decode(&bytes, None).unwrap();
			seen.push(frame.sequence);
			let ack = reply(&h.session, Reply::Ack, Vec::new());
			h.session.handle_reply(ack, h.now);
		}
		assert_eq!(seen, [1, 2, 3, 1, 2]);
	}

	#[test]
	fn online_announced_exactly_once() {
		let mut h = harness(SecurityMode::ClearText);
		go_online(&mut h);
		for _ in 0..3 {
			let (_bytes, _) = h.session.next_frame(h.now);
			let ack = reply(&h.session, Reply::Ack, Vec::new());
			h.session.handle_reply(ack, h.now);
		}
		let statuses = events_of(&h.sub, EventKind::Status);
		assert_eq!(statuses.len(), 1);
	}

	#[test]
	fn offline_after_threshold_and_resync_on_return() {
		let mut h = harness(SecurityMode::ClearText);
		go_online(&mut h);
		let _ = events_of(&h.sub, EventKind::Status);

		for _ in 0..OFFLINE_THRESHOLD {
			let (_bytes, _) = h.session.next_frame(h.now);
			h.session.on_missed_reply();
		}
		assert!(!h.session.is_online());
		let statuses = events_of(&h.sub, EventKind::Status);
		assert_eq!(statuses.len(), 1);

		// First frame after coming back is a resync.
		let (bytes, _) = h.session.next_frame(h.now);
		let frame = Frame::decode(&bytes, None).unwrap();
		assert_eq!(frame.sequence, 0);
	}

	#[test]
	fn card_reply_becomes_event() {
		let mut h = harness(SecurityMode::ClearText);
		go_online(&mut h);
		// Drain the identification commands first.
		for _ in 0..3 {
			let (_bytes, _) = h.session.next_frame(h.now);
			let ack = reply(&h.session, Reply::Ack, Vec::new());
			h.session.handle_reply(ack, h.now);
		}

		let (_bytes, _) = h.session.next_frame(h.now);
		let mut payload = vec![0x00, 0x01, 32, 0];
		payload.extend_from_slice(&[0x01, 0x23, 0x45, 0x67]);
		let card = reply(&h.session, Reply::RawCardData, payload);
		h.session.handle_reply(card, h.now);

		let events = events_of(&h.sub, EventKind::CardRead);
		let [Event::CardRead(card)] = events.as_slice() else {
			panic!("expected one card event, got {events:?}");
		};
		assert_eq!(card.card_number, "19088743");
		assert_eq!(card.bit_length, 32);
		assert_eq!(card.bits.len(), 32);
		assert_eq!(card.format, CardFormat::Wiegand);
	}

	#[test]
	fn keypad_reply_feeds_pin_collector() {
		let mut h = harness(SecurityMode::ClearText);
		go_online(&mut h);

		let (_bytes, _) = h.session.next_frame(h.now);
		let keys = reply(
			&h.session,
			Reply::Keypad,
			vec![0x00, 4, 0x31, 0x32, 0x33, 0x0d],
		);
		h.session.handle_reply(keys, h.now);

		let digits = events_of(&h.sub, EventKind::PinDigit);
		assert_eq!(digits.len(), 3);
		let reads = events_of(&h.sub, EventKind::PinRead);
		let [Event::PinRead(read)] = reads.as_slice() else {
			panic!("expected one pin read");
		};
		assert_eq!(read.pin, "123");
		assert_eq!(read.reason, PinCompletionReason::PoundKey);
	}

	#[test]
	fn install_mode_installs_a_key_once() {
		let mut h = harness(SecurityMode::Install);
		let mut device = DeviceChannel::new(DEFAULT_BASE_KEY);
		go_online(&mut h);

		// The session now wants a handshake: CHLNG goes out first.
		let (bytes, command) = h.session.next_frame(h.now);
		assert_eq!(command, Command::Challenge);
		let chlng = Frame::decode(&bytes, None).unwrap();
		assert_eq!(
			chlng.security_block.as_ref().map(|b| b.block_type),
			Some(scs::SCS_11)
		);
		let ccrypt_payload = device.answer_challenge(&chlng.payload);
		let ccrypt = reply(&h.session, Reply::ClientCryptogram, ccrypt_payload);
		h.session.handle_reply(ccrypt, h.now);

		let (bytes, command) = h.session.next_frame(h.now);
		assert_eq!(command, Command::ServerCryptogram);
		let scrypt = Frame::decode(&bytes, None).unwrap();
		let rmac_payload = device.answer_server_cryptogram(&scrypt.payload);
		let rmac = reply(&h.session, Reply::InitialRMac, rmac_payload);
		h.session.handle_reply(rmac, h.now);

		// Identification runs under the fresh session; skip to KEYSET.
		let keyset = loop {
			let (bytes, command) = h.session.next_frame(h.now);
			let frame = Frame::decode(&bytes, Some(device.channel())).unwrap();
			if command == Command::KeySet {
				break frame;
			}
			let ack = Frame::reply(h.session.address(), frame.sequence, true, Reply::Ack.into(), Vec::new());
			let wire = ack.encode(Some(device.channel())).unwrap();
			let decoded = h.session.decode(&wire).unwrap();
			h.session.handle_reply(decoded, h.now);
		};
		assert_eq!(keyset.payload[0], 0x01);
		assert_eq!(usize::from(keyset.payload[1]), KEY_LEN);
		let new_key: [u8; KEY_LEN] = keyset.payload[2..].try_into().unwrap();

		// ACK the key install through the secure channel.
		let ack = Frame::reply(
			h.session.address(),
			h.session.sequence,
			true,
			Reply::Ack.into(),
			Vec::new(),
		);
		let wire = ack.encode(Some(device.channel())).unwrap();
		let decoded = h.session.decode(&wire).unwrap();
		h.session.handle_reply(decoded, h.now);

		let changes = events_of(&h.sub, EventKind::SecurityMode);
		let [Event::SecurityMode(change)] = changes.as_slice() else {
			panic!("expected one mode change");
		};
		assert_eq!(change.mode, SecurityMode::Secure);
		assert_eq!(change.key, Some(new_key));
		assert_eq!(h.session.config().security_mode, SecurityMode::Secure);

		// The session immediately re-handshakes under the new key.
		let (_bytes, command) = h.session.next_frame(h.now);
		assert_eq!(command, Command::Challenge);
	}

	#[test]
	fn handshake_nak_falls_back_to_clear_text() {
		let mut h = harness(SecurityMode::Secure);
		go_online(&mut h);

		let (_bytes, command) = h.session.next_frame(h.now);
		assert_eq!(command, Command::Challenge);
		let nak = reply(
			&h.session,
			Reply::Nak,
			vec![NakCode::UnsupportedSecurityBlock.into()],
		);
		h.session.handle_reply(nak, h.now);

		// Polling continues in the clear; no further handshake attempts.
		for _ in 0..4 {
			let (bytes, command) = h.session.next_frame(h.now);
			assert_ne!(command, Command::Challenge);
			// Frames go out unsecured again.
			Frame::decode(&bytes, None).unwrap();
			let ack = reply(&h.session, Reply::Ack, Vec::new());
			h.session.handle_reply(ack, h.now);
		}
	}

	#[test]
	fn busy_reply_requeues_the_command() {
		let mut h = harness(SecurityMode::ClearText);
		go_online(&mut h);
		// Drain the identification commands first.
		for _ in 0..3 {
			let (_bytes, _) = h.session.next_frame(h.now);
			let ack = reply(&h.session, Reply::Ack, Vec::new());
			h.session.handle_reply(ack, h.now);
		}

		h.session.enqueue(Command::Buzzer, vec![0, 2, 2, 2, 1], None);
		let (_bytes, command) = h.session.next_frame(h.now);
		assert_eq!(command, Command::Buzzer);
		let busy = reply(&h.session, Reply::Busy, Vec::new());
		h.session.handle_reply(busy, h.now);

		// The command is queued again and goes out in the very next slot.
		assert!(h.session.has_pending());
		let (_bytes, command) = h.session.next_frame(h.now);
		assert_eq!(command, Command::Buzzer);
	}

	#[test]
	fn sequence_error_nak_forces_resync() {
		let mut h = harness(SecurityMode::ClearText);
		go_online(&mut h);

		let (_bytes, _) = h.session.next_frame(h.now);
		let nak = reply(&h.session, Reply::Nak, vec![NakCode::SequenceError.into()]);
		h.session.handle_reply(nak, h.now);

		let (bytes, _) = h.session.next_frame(h.now);
		let frame = Frame::decode(&bytes, None).unwrap();
		assert_eq!(frame.sequence, 0);
	}

	#[test]
	fn sequence_mismatch_forces_resync() {
		let mut h = harness(SecurityMode::ClearText);
		go_online(&mut h);

		let (_bytes, _) = h.session.next_frame(h.now);
		let bad = Frame::reply(h.session.address(), (h.session.sequence + 1) % 4, true, Reply::Ack.into(), Vec::new());
		h.session.handle_reply(bad, h.now);

		let (bytes, _) = h.session.next_frame(h.now);
		let frame = Frame::decode(&bytes, None).unwrap();
		assert_eq!(frame.sequence, 0);
	}
}
