//! Packet-trace capture.
//!
//! When enabled (globally or per reader) every frame crossing a bus is
//! copied into a bounded ring, oldest entries evicted first. Capture is
//! always unfiltered; the poll/ack filters apply when the ring is read.

use std::collections::{HashSet, VecDeque};
use std::io::{self, Write};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use log::warn;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::config::TRACE_CAPACITY;
use crate::protocol::{ControlField, Direction, FrameKind, HEADER_LEN, classify, direction_of};

/// Export container identification.
const EXPORT_MAGIC: &[u8; 8] = b"OSDPCAP\0";
const EXPORT_VERSION: u16 = 1;

/// One captured packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEntry {
	/// Monotonic capture sequence number, gap-free per service.
	pub sequence: u64,
	pub connection: Uuid,
	pub address: Option<u8>,
	pub direction: Direction,
	pub timestamp: OffsetDateTime,
	/// Time since the trace service started.
	pub monotonic: Duration,
	pub bytes: Vec<u8>,
	pub kind: FrameKind,
}

/// Read-side filter. Capture itself is never filtered.
#[derive(Debug, Clone, Copy, Default)]
pub struct TraceFilter {
	pub drop_polls: bool,
	pub drop_acks: bool,
}

impl TraceFilter {
	fn keeps(&self, entry: &TraceEntry) -> bool {
		!(self.drop_polls && entry.kind == FrameKind::Poll
			|| self.drop_acks && entry.kind == FrameKind::Ack)
	}
}

/// Consumer of trace snapshots, e.g. an exporter.
pub trait PacketTraceSink: Send + Sync {
	fn accept(&self, entries: &[TraceEntry]);
}

/// Bounded capture ring shared by all buses of one manager.
pub struct TraceService {
	ring: Mutex<VecDeque<TraceEntry>>,
	capacity: usize,
	start: Instant,
	sequence: AtomicU64,
	evicted: AtomicU64,
	global: AtomicBool,
	readers: Mutex<HashSet<Uuid>>,
	direction_warned: Mutex<HashSet<Uuid>>,
}

impl Default for TraceService {
	fn default() -> Self {
		Self::new(TRACE_CAPACITY)
	}
}

impl TraceService {
	pub fn new(capacity: usize) -> Self {
		Self {
			ring: Mutex::new(VecDeque::new()),
			capacity: capacity.max(1),
			start: Instant::now(),
			sequence: AtomicU64::new(0),
			evicted: AtomicU64::new(0),
			global: AtomicBool::new(false),
			readers: Mutex::new(HashSet::new()),
			direction_warned: Mutex::new(HashSet::new()),
		}
	}

	/// Captures every frame on every bus.
	pub fn set_global(&self, enabled: bool) {
		self.global.store(enabled, Ordering::Relaxed);
	}

	/// Captures frames attributed to one reader.
	pub fn set_reader(&self, reader: Uuid, enabled: bool) {
		let mut readers = self.readers.lock().unwrap();
		if enabled {
			readers.insert(reader);
		} else {
			readers.remove(&reader);
		}
	}

	pub(crate) fn is_active(&self, reader: Option<Uuid>) -> bool {
		self.global.load(Ordering::Relaxed)
			|| reader.is_some_and(|reader| self.readers.lock().unwrap().contains(&reader))
	}

	/// Captures one frame.
	///
	/// `direction` comes from transport metadata when the transport tags it;
	/// otherwise it is derived from bit 7 of the address byte, with a
	/// warning the first time that happens on a connection.
	pub(crate) fn record(
		&self,
		connection: Uuid,
		address: Option<u8>,
		reader: Option<Uuid>,
		direction: Option<Direction>,
		bytes: &[u8],
	) {
		if !self.is_active(reader) {
			return;
		}

		let direction = direction.unwrap_or_else(|| {
			if self.direction_warned.lock().unwrap().insert(connection) {
				warn!("trace on {connection}: no transport direction metadata, deriving from address bit");
			}
			bytes.get(1).copied().map_or(Direction::Outgoing, direction_of)
		});

		let entry = TraceEntry {
			sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
			connection,
			address,
			direction,
			timestamp: OffsetDateTime::now_utc(),
			monotonic: self.start.elapsed(),
			bytes: bytes.to_vec(),
			kind: classify_bytes(direction, bytes),
		};

		let mut ring = self.ring.lock().unwrap();
		if ring.len() == self.capacity {
			ring.pop_front();
			self.evicted.fetch_add(1, Ordering::Relaxed);
		}
		ring.push_back(entry);
	}

	/// Read-only copy of the ring, oldest first, with the filter applied.
	pub fn snapshot(&self, filter: TraceFilter) -> Vec<TraceEntry> {
		self.ring
			.lock()
			.unwrap()
			.iter()
			.filter(|entry| filter.keeps(entry))
			.cloned()
			.collect()
	}

	/// Streams a snapshot into a sink.
	pub fn stream_to(&self, sink: &dyn PacketTraceSink, filter: TraceFilter) {
		sink.accept(&self.snapshot(filter));
	}

	pub fn len(&self) -> usize {
		self.ring.lock().unwrap().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Entries evicted by ring overflow so far.
	pub fn evicted(&self) -> u64 {
		self.evicted.load(Ordering::Relaxed)
	}

	pub fn clear(&self) {
		self.ring.lock().unwrap().clear();
	}

	/// Writes an OSDPCAP container: magic, version, capture start/end,
	/// device name, then length-prefixed entries.
	pub fn export<W: Write>(
		&self,
		writer: &mut W,
		device_name: &str,
		filter: TraceFilter,
	) -> io::Result<()> {
		let entries = self.snapshot(filter);
		let start = entries.first().map_or_else(OffsetDateTime::now_utc, |e| e.timestamp);
		let end = entries.last().map_or(start, |e| e.timestamp);

		writer.write_all(EXPORT_MAGIC)?;
		writer.write_all(&EXPORT_VERSION.to_le_bytes())?;
		writer.write_all(&unix_nanos(start).to_le_bytes())?;
		writer.write_all(&unix_nanos(end).to_le_bytes())?;
		let name = device_name.as_bytes();
		writer.write_all(&(name.len() as u16).to_le_bytes())?;
		writer.write_all(name)?;

		for entry in &entries {
			writer.write_all(&entry.sequence.to_le_bytes())?;
			writer.write_all(&unix_nanos(entry.timestamp).to_le_bytes())?;
			writer.write_all(&[
				match entry.direction {
					Direction::Outgoing => 0,
					Direction::Incoming => 1,
				},
				entry.address.map_or(0xff, |a| a),
				kind_code(entry.kind),
			])?;
			writer.write_all(&(entry.bytes.len() as u32).to_le_bytes())?;
			writer.write_all(&entry.bytes)?;
		}
		Ok(())
	}
}

fn unix_nanos(ts: OffsetDateTime) -> i64 {
	ts.unix_timestamp_nanos() as i64
}

fn kind_code(kind: FrameKind) -> u8 {
	match kind {
		FrameKind::Poll => 0,
		FrameKind::Ack => 1,
		FrameKind::CardRead => 2,
		FrameKind::KeypadData => 3,
		FrameKind::LedControl => 4,
		FrameKind::BuzzerControl => 5,
		FrameKind::EncryptionKeySet => 6,
		FrameKind::Other => 7,
	}
}

/// Shallow classification of a raw packet without touching secure-channel
/// state: skip the header and an optional security block, classify the code.
fn classify_bytes(direction: Direction, bytes: &[u8]) -> FrameKind {
	let Some(ctrl) = bytes.get(4) else {
		return FrameKind::Other;
	};
	let ctrl = ControlField::from_bits_retain(*ctrl);
	let mut offset = HEADER_LEN;
	if ctrl.contains(ControlField::SECURITY_BLOCK) {
		match bytes.get(offset) {
			Some(len) if *len >= 2 => offset += usize::from(*len),
			_ => return FrameKind::Other,
		}
	}
	bytes
		.get(offset)
		.map_or(FrameKind::Other, |code| classify(direction, *code))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::protocol::frame::Frame;
	use crate::protocol::{Command, Reply};

	fn poll_bytes(addr: u8) -> Vec<u8> {
		Frame::command(addr, 0, true, Command::Poll.into(), Vec::new())
			.encode(None)
			.unwrap()
	}

	fn ack_bytes(addr: u8) -> Vec<u8> {
		Frame::reply(addr, 0, true, Reply::Ack.into(), Vec::new())
			.encode(None)
			.unwrap()
	}

	fn card_bytes(addr: u8) -> Vec<u8> {
		Frame::reply(addr, 0, true, Reply::RawCardData.into(), vec![0, 1, 32, 0, 1, 2, 3])
			.encode(None)
			.unwrap()
	}

	#[test]
	fn capture_preserves_arrival_order() {
		let trace = TraceService::new(16);
		trace.set_global(true);
		let conn = Uuid::new_v4();
		for i in 0..5u8 {
			trace.record(conn, Some(i), None, Some(Direction::Outgoing), &poll_bytes(i));
		}
		let all = trace.snapshot(TraceFilter::default());
		assert_eq!(all.len(), 5);
		assert!(all.windows(2).all(|w| w[0].sequence + 1 == w[1].sequence));
	}

	#[test]
	fn ring_keeps_only_the_newest() {
		let trace = TraceService::new(3);
		trace.set_global(true);
		let conn = Uuid::new_v4();
		for _ in 0..10 {
			trace.record(conn, Some(1), None, Some(Direction::Outgoing), &poll_bytes(1));
		}
		assert_eq!(trace.len(), 3);
		assert_eq!(trace.evicted(), 7);
		let last = trace.snapshot(TraceFilter::default());
		assert_eq!(last.last().unwrap().sequence, 9);
	}

	#[test]
	fn filters_apply_on_read_only() {
		let trace = TraceService::new(1024);
		trace.set_global(true);
		let conn = Uuid::new_v4();
		for _ in 0..100 {
			trace.record(conn, Some(1), None, Some(Direction::Outgoing), &poll_bytes(1));
			trace.record(conn, Some(1), None, Some(Direction::Incoming), &ack_bytes(1));
		}
		trace.record(conn, Some(1), None, Some(Direction::Incoming), &card_bytes(1));

		assert_eq!(trace.len(), 201);
		let filtered = trace.snapshot(TraceFilter {
			drop_polls: true,
			drop_acks: true,
		});
		assert_eq!(filtered.len(), 1);
		assert_eq!(filtered[0].kind, FrameKind::CardRead);
	}

	#[test]
	fn per_reader_capture() {
		let trace = TraceService::new(16);
		let reader = Uuid::new_v4();
		let other = Uuid::new_v4();
		trace.set_reader(reader, true);
		let conn = Uuid::new_v4();
		trace.record(conn, Some(1), Some(reader), Some(Direction::Outgoing), &poll_bytes(1));
		trace.record(conn, Some(2), Some(other), Some(Direction::Outgoing), &poll_bytes(2));
		assert_eq!(trace.len(), 1);
	}

	#[test]
	fn direction_falls_back_to_address_bit() {
		let trace = TraceService::new(16);
		trace.set_global(true);
		let conn = Uuid::new_v4();
		trace.record(conn, Some(1), None, None, &ack_bytes(1));
		let all = trace.snapshot(TraceFilter::default());
		assert_eq!(all[0].direction, Direction::Incoming);
	}

	#[test]
	fn export_roundtrips_entry_count() {
		let trace = TraceService::new(16);
		trace.set_global(true);
		let conn = Uuid::new_v4();
		trace.record(conn, Some(1), None, Some(Direction::Outgoing), &poll_bytes(1));
		trace.record(conn, Some(1), None, Some(Direction::Incoming), &card_bytes(1));

		let mut out = Vec::new();
		trace.export(&mut out, "front door", TraceFilter::default()).unwrap();

		assert_eq!(&out[..8], EXPORT_MAGIC);
		let name_len = u16::from_le_bytes([out[26], out[27]]) as usize;
		assert_eq!(&out[28..28 + name_len], b"front door");

		// Walk the length-prefixed entries.
		let mut offset = 28 + name_len;
		let mut count = 0;
		while offset < out.len() {
			offset += 8 + 8 + 3;
			let len = u32::from_le_bytes(out[offset..offset + 4].try_into().unwrap()) as usize;
			offset += 4 + len;
			count += 1;
		}
		assert_eq!(count, 2);
		assert_eq!(offset, out.len());
	}
}
