//! Per-reader PIN digit aggregation.
//!
//! Keypad bytes arrive one at a time; this module buffers digits per reader
//! until a pound key, a timeout or the length cap completes the entry. A
//! star key clears the buffer without emitting anything.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::debug;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::events::{Event, EventRouter, PinCompletionReason, PinDigitEvent, PinReadEvent};

/// Aggregation limits, configurable per installation.
#[derive(Debug, Clone, Copy)]
pub struct PinLimits {
	/// Completing silence between two digits.
	pub inter_digit_timeout: Duration,
	/// Hard cap on one entry, measured from the first digit.
	pub max_total_time: Duration,
	/// Digit count that completes the entry immediately.
	pub max_length: usize,
}

impl Default for PinLimits {
	fn default() -> Self {
		Self {
			inter_digit_timeout: Duration::from_secs(5),
			max_total_time: Duration::from_secs(30),
			max_length: 16,
		}
	}
}

/// External persistence hook for completed PIN entries. Must not block.
pub trait PinEventSink: Send + Sync {
	fn persist(&self, event: &PinReadEvent);
}

struct Collection {
	device_name: String,
	digits: String,
	started: Instant,
	last_digit: Instant,
}

/// Digit aggregation for all readers, keyed by reader identity.
pub struct PinCollector {
	states: Mutex<HashMap<Uuid, Collection>>,
	router: Arc<EventRouter>,
	sink: Option<Arc<dyn PinEventSink>>,
	limits: PinLimits,
}

impl PinCollector {
	pub fn new(
		router: Arc<EventRouter>,
		sink: Option<Arc<dyn PinEventSink>>,
		limits: PinLimits,
	) -> Self {
		Self {
			states: Mutex::new(HashMap::new()),
			router,
			sink,
			limits,
		}
	}

	/// Feeds one mapped keypad character from a reader.
	///
	/// Emits the per-key [`PinDigitEvent`] and, when the key completes an
	/// entry, the [`PinReadEvent`].
	pub fn handle_key(&self, device: Uuid, device_name: &str, key: char, now: Instant) {
		let mut states = self.states.lock().unwrap();

		// A stale collection completes by timeout before the new key is
		// looked at, so a digit arriving late starts a fresh entry.
		if let Some(state) = states.get(&device)
			&& self.expired(state, now)
		{
			let state = states.remove(&device).unwrap();
			self.complete(device, state, PinCompletionReason::Timeout);
		}

		let sequence = states.get(&device).map_or(0, |s| s.digits.len() as u32) + 1;
		let emit_digit = |collector: &Self| {
			collector.router.publish(Event::PinDigit(PinDigitEvent {
				device,
				device_name: device_name.to_string(),
				digit: key,
				timestamp: OffsetDateTime::now_utc(),
				sequence,
			}));
		};

		match key {
			'0'..='9' => {
				emit_digit(self);
				let state = states.entry(device).or_insert_with(|| Collection {
					device_name: device_name.to_string(),
					digits: String::new(),
					started: now,
					last_digit: now,
				});
				state.digits.push(key);
				state.last_digit = now;
				if state.digits.len() >= self.limits.max_length {
					let state = states.remove(&device).unwrap();
					self.complete(device, state, PinCompletionReason::MaxLength);
				}
			}
			// Pound and star act on a running collection as control keys;
			// pressed on an idle keypad they surface as plain key events.
			'#' => match states.remove(&device) {
				Some(state) => self.complete(device, state, PinCompletionReason::PoundKey),
				None => emit_digit(self),
			},
			'*' => {
				if states.remove(&device).is_some() {
					debug!("{device_name}: PIN entry cleared");
				} else {
					emit_digit(self);
				}
			}
			other => {
				debug!("{device_name}: passing through keypad character {other:?}");
				emit_digit(self);
			}
		}
	}

	/// Completes timed-out collections. Driven from the bus cycle.
	pub fn poll(&self, now: Instant) {
		let mut states = self.states.lock().unwrap();
		let expired: Vec<Uuid> = states
			.iter()
			.filter(|(_, state)| self.expired(state, now))
			.map(|(device, _)| *device)
			.collect();
		for device in expired {
			let state = states.remove(&device).unwrap();
			self.complete(device, state, PinCompletionReason::Timeout);
		}
	}

	/// Drops any buffered digits for a reader, e.g. when it goes away.
	pub fn reset_device(&self, device: Uuid) {
		self.states.lock().unwrap().remove(&device);
	}

	fn expired(&self, state: &Collection, now: Instant) -> bool {
		now.duration_since(state.last_digit) >= self.limits.inter_digit_timeout
			|| now.duration_since(state.started) >= self.limits.max_total_time
	}

	fn complete(&self, device: Uuid, state: Collection, reason: PinCompletionReason) {
		let event = PinReadEvent {
			device,
			device_name: state.device_name,
			pin: state.digits,
			reason,
			timestamp: OffsetDateTime::now_utc(),
		};
		if let Some(sink) = &self.sink {
			sink.persist(&event);
		}
		self.router.publish(Event::PinRead(event));
	}
}
