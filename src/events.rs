//! Domain events and their fan-out to subscribers.
//!
//! Every subscriber gets its own bounded queue. Publishing never blocks a
//! bus task: when a queue is full the oldest entry is dropped and counted,
//! so a slow consumer only ever hurts itself.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::config::{SUBSCRIBER_QUEUE_CAPACITY, SecurityMode};
use crate::protocol::secure::KEY_LEN;

/// Card data format tag as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardFormat {
	Unspecified,
	Wiegand,
	Other(u8),
}

impl From<u8> for CardFormat {
	fn from(value: u8) -> Self {
		match value {
			0 => Self::Unspecified,
			1 => Self::Wiegand,
			other => Self::Other(other),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardReadEvent {
	pub device: Uuid,
	pub device_name: String,
	/// Decimal rendering of the card bits read big-endian.
	pub card_number: String,
	pub bit_length: u16,
	pub format: CardFormat,
	pub timestamp: OffsetDateTime,
	/// The raw bits as a '0'/'1' string, kept alongside the number.
	pub bits: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinDigitEvent {
	pub device: Uuid,
	pub device_name: String,
	pub digit: char,
	pub timestamp: OffsetDateTime,
	/// 1-based position within the current collection.
	pub sequence: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinCompletionReason {
	PoundKey,
	Timeout,
	MaxLength,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinReadEvent {
	pub device: Uuid,
	pub device_name: String,
	pub pin: String,
	pub reason: PinCompletionReason,
	pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
	pub device: Uuid,
	pub device_name: String,
	pub online: bool,
	pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityModeChange {
	pub device: Uuid,
	pub mode: SecurityMode,
	pub key: Option<[u8; KEY_LEN]>,
	pub timestamp: OffsetDateTime,
}

/// One event as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
	CardRead(CardReadEvent),
	PinDigit(PinDigitEvent),
	PinRead(PinReadEvent),
	Status(StatusChange),
	SecurityMode(SecurityModeChange),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
	CardRead,
	PinDigit,
	PinRead,
	Status,
	SecurityMode,
}

impl Event {
	pub fn kind(&self) -> EventKind {
		match self {
			Self::CardRead(_) => EventKind::CardRead,
			Self::PinDigit(_) => EventKind::PinDigit,
			Self::PinRead(_) => EventKind::PinRead,
			Self::Status(_) => EventKind::Status,
			Self::SecurityMode(_) => EventKind::SecurityMode,
		}
	}
}

struct SubscriberQueue {
	entries: Mutex<VecDeque<Event>>,
	available: Condvar,
	capacity: usize,
	dropped: AtomicU64,
}

impl SubscriberQueue {
	fn push(&self, event: Event) {
		let mut entries = self.entries.lock().unwrap();
		if entries.len() == self.capacity {
			entries.pop_front();
			self.dropped.fetch_add(1, Ordering::Relaxed);
		}
		entries.push_back(event);
		drop(entries);
		self.available.notify_one();
	}
}

struct Slot {
	id: u64,
	kinds: Option<Vec<EventKind>>,
	queue: Arc<SubscriberQueue>,
}

/// Fan-out point for all domain events of one manager.
pub struct EventRouter {
	slots: Mutex<Vec<Slot>>,
	next_id: AtomicU64,
	published: AtomicU64,
}

impl Default for EventRouter {
	fn default() -> Self {
		Self::new()
	}
}

impl EventRouter {
	pub fn new() -> Self {
		Self {
			slots: Mutex::new(Vec::new()),
			next_id: AtomicU64::new(0),
			published: AtomicU64::new(0),
		}
	}

	/// Subscribes to every event kind.
	pub fn subscribe(self: &Arc<Self>) -> Subscription {
		self.subscribe_inner(None, SUBSCRIBER_QUEUE_CAPACITY)
	}

	/// Subscribes to a subset of event kinds with a custom queue capacity.
	pub fn subscribe_filtered(self: &Arc<Self>, kinds: &[EventKind], capacity: usize) -> Subscription {
		self.subscribe_inner(Some(kinds.to_vec()), capacity.max(1))
	}

	fn subscribe_inner(self: &Arc<Self>, kinds: Option<Vec<EventKind>>, capacity: usize) -> Subscription {
		let queue = Arc::new(SubscriberQueue {
			entries: Mutex::new(VecDeque::new()),
			available: Condvar::new(),
			capacity,
			dropped: AtomicU64::new(0),
		});
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		self.slots.lock().unwrap().push(Slot {
			id,
			kinds,
			queue: queue.clone(),
		});
		Subscription {
			router: Arc::downgrade(self),
			id,
			queue,
		}
	}

	/// Delivers an event to every matching subscriber. Never blocks.
	pub fn publish(&self, event: Event) {
		self.published.fetch_add(1, Ordering::Relaxed);
		let slots = self.slots.lock().unwrap();
		for slot in slots.iter() {
			let wanted = slot
				.kinds
				.as_ref()
				.is_none_or(|kinds| kinds.contains(&event.kind()));
			if wanted {
				slot.queue.push(event.clone());
			}
		}
	}

	/// Total events published over the router's lifetime.
	pub fn published(&self) -> u64 {
		self.published.load(Ordering::Relaxed)
	}

	fn unsubscribe(&self, id: u64) {
		self.slots.lock().unwrap().retain(|slot| slot.id != id);
	}
}

/// A live subscription. Dropping it ends delivery.
pub struct Subscription {
	router: Weak<EventRouter>,
	id: u64,
	queue: Arc<SubscriberQueue>,
}

impl Subscription {
	/// Takes the next queued event without waiting.
	pub fn try_recv(&self) -> Option<Event> {
		self.queue.entries.lock().unwrap().pop_front()
	}

	/// Waits up to `timeout` for the next event.
	pub fn recv_timeout(&self, timeout: Duration) -> Option<Event> {
		let deadline = std::time::Instant::now() + timeout;
		let mut entries = self.queue.entries.lock().unwrap();
		loop {
			if let Some(event) = entries.pop_front() {
				return Some(event);
			}
			let now = std::time::Instant::now();
			if now >= deadline {
				return None;
			}
			let (guard, _) = self
				.queue
				.available
				.wait_timeout(entries, deadline - now)
				.unwrap();
			entries = guard;
		}
	}

	/// Events lost to queue overflow so far.
	pub fn dropped(&self) -> u64 {
		self.queue.dropped.load(Ordering::Relaxed)
	}
}

impl Drop for Subscription {
	fn drop(&mut self) {
		if let Some(router) = self.router.upgrade() {
			router.unsubscribe(self.id);
		}
	}
}
