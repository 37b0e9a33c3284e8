//! End-to-end scenarios against simulated readers: the manager opens a
//! scripted "serial port", mounts devices on it and the full poll cycle,
//! event fan-out and trace capture run exactly as against hardware.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use osdp_gateway::protocol::frame::{self, Frame};
use osdp_gateway::protocol::{Command, FrameKind, Reply};
use osdp_gateway::{
	BaudRate, Collaborators, DeviceConfig, Event, Feedback, LedColor, Manager, SerialPortService,
	TraceFilter, Transport, TransportError,
};
use uuid::Uuid;

/// One simulated reader on the scripted line.
#[derive(Default)]
struct Reader {
	/// RAW card payloads to hand out on upcoming polls.
	cards: VecDeque<Vec<u8>>,
	/// Keypad payloads to hand out on upcoming polls.
	keys: VecDeque<Vec<u8>>,
	/// Every command code this reader received.
	received: Vec<u8>,
}

#[derive(Default)]
struct LineState {
	readers: HashMap<u8, Reader>,
}

impl LineState {
	fn respond(&mut self, request: &Frame) -> Option<Frame> {
		let reader = self.readers.get_mut(&request.address)?;
		reader.received.push(request.code);

		let ack = |code, payload| Frame::reply(request.address, request.sequence, true, code, payload);
		if request.code == u8::from(Command::Poll) {
			if let Some(card) = reader.cards.pop_front() {
				return Some(ack(Reply::RawCardData.into(), card));
			}
			if let Some(keys) = reader.keys.pop_front() {
				return Some(ack(Reply::Keypad.into(), keys));
			}
		}
		Some(ack(Reply::Ack.into(), Vec::new()))
	}
}

/// Transport end of the scripted line: decodes panel frames, lets the
/// shared [`LineState`] answer them.
struct ScriptedLine {
	state: Arc<Mutex<LineState>>,
	from_readers: VecDeque<u8>,
	to_readers: Vec<u8>,
}

impl Transport for ScriptedLine {
	fn read_available(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
		if self.from_readers.is_empty() {
			thread::sleep(timeout.min(Duration::from_millis(2)));
			return Ok(0);
		}
		let n = buf.len().min(self.from_readers.len());
		for slot in buf.iter_mut().take(n) {
			*slot = self.from_readers.pop_front().unwrap();
		}
		Ok(n)
	}

	fn write_all(&mut self, buf: &[u8]) -> Result<(), TransportError> {
		self.to_readers.extend_from_slice(buf);
		while let Some(Ok(len)) = frame::wire_len(&self.to_readers) {
			if self.to_readers.len() < len {
				break;
			}
			let packet: Vec<u8> = self.to_readers.drain(..len).collect();
			if let Ok(request) = Frame::decode(&packet, None)
				&& let Some(reply) = self.state.lock().unwrap().respond(&request)
			{
				self.from_readers.extend(reply.encode(None).unwrap());
			}
		}
		Ok(())
	}

	fn describe(&self) -> &str {
		"scripted-line"
	}

	fn tags_direction(&self) -> bool {
		true
	}
}

struct ScriptedPorts {
	state: Arc<Mutex<LineState>>,
}

impl SerialPortService for ScriptedPorts {
	fn port_exists(&self, _path: &str) -> bool {
		true
	}

	fn open(&self, _path: &str, _baud: BaudRate) -> Result<Box<dyn Transport>, TransportError> {
		Ok(Box::new(ScriptedLine {
			state: self.state.clone(),
			from_readers: VecDeque::new(),
			to_readers: Vec::new(),
		}))
	}
}

struct Rig {
	manager: Manager,
	line: Arc<Mutex<LineState>>,
}

fn rig(addresses: &[u8]) -> Rig {
	let _ = env_logger::builder().is_test(true).try_init();
	let line = Arc::new(Mutex::new(LineState::default()));
	{
		let mut state = line.lock().unwrap();
		for address in addresses {
			state.readers.insert(*address, Reader::default());
		}
	}
	let manager = Manager::new(Collaborators {
		serial: Arc::new(ScriptedPorts { state: line.clone() }),
		feedback_config: None,
		security_update: None,
		pin_sink: None,
	});
	Rig { manager, line }
}

fn device(name: &str, address: u8) -> DeviceConfig {
	let mut config = DeviceConfig::new(Uuid::new_v4(), name, "/dev/scripted0", address);
	config.poll_interval = Duration::from_millis(20);
	config
}

fn await_online(sub: &osdp_gateway::Subscription, expected: usize) {
	let mut online = 0;
	while online < expected {
		match sub.recv_timeout(Duration::from_secs(2)) {
			Some(Event::Status(status)) if status.online => online += 1,
			Some(_) => {}
			None => panic!("timed out waiting for {expected} readers to come online"),
		}
	}
}

#[test]
fn two_readers_share_one_line() {
	let rig = rig(&[1, 2]);
	let sub = rig.manager.subscribe();
	rig.manager.add_device(device("front", 1)).unwrap();
	rig.manager.add_device(device("back", 2)).unwrap();
	rig.manager.start().unwrap();

	await_online(&sub, 2);
	thread::sleep(Duration::from_millis(500));
	rig.manager.stop();

	// Exactly one online transition each and no card or PIN events.
	let mut statuses = 0;
	while let Some(event) = sub.try_recv() {
		match event {
			Event::Status(status) => {
				assert!(status.online);
				statuses += 1;
			}
			other => panic!("unexpected event {other:?}"),
		}
	}
	assert_eq!(statuses, 0, "duplicate status changes after the first two");

	// Both readers were actually polled.
	let state = rig.line.lock().unwrap();
	for address in [1u8, 2] {
		let polls = state.readers[&address]
			.received
			.iter()
			.filter(|code| **code == u8::from(Command::Poll))
			.count();
		assert!(polls >= 3, "reader {address} saw only {polls} polls");
	}
}

#[test]
fn card_read_is_decoded_and_traced() {
	let rig = rig(&[3]);
	rig.manager.trace().set_global(true);
	let sub = rig.manager.subscribe();
	let config = device("lobby", 3);
	let reader_id = config.id;
	rig.manager.add_device(config).unwrap();
	rig.manager.start().unwrap();
	await_online(&sub, 1);

	// 0b00000001_00100011_01000101_01100111, 32 bits.
	let mut payload = vec![0x00, 0x01, 32, 0];
	payload.extend_from_slice(&[0x01, 0x23, 0x45, 0x67]);
	rig.line.lock().unwrap().readers.get_mut(&3).unwrap().cards.push_back(payload);

	let card = loop {
		match sub.recv_timeout(Duration::from_secs(2)) {
			Some(Event::CardRead(card)) => break card,
			Some(_) => {}
			None => panic!("no card event"),
		}
	};
	assert_eq!(card.device, reader_id);
	assert_eq!(card.card_number, "19088743");
	assert_eq!(card.bit_length, 32);
	assert_eq!(card.bits, "00000001001000110100010101100111");
	rig.manager.stop();

	// With polls and acks filtered out, exactly one card read remains and
	// nothing poll- or ack-shaped survives the filter.
	let filtered = rig.manager.trace().snapshot(TraceFilter {
		drop_polls: true,
		drop_acks: true,
	});
	let cards = filtered
		.iter()
		.filter(|entry| entry.kind == FrameKind::CardRead)
		.count();
	assert_eq!(cards, 1);
	assert!(
		filtered
			.iter()
			.all(|entry| entry.kind != FrameKind::Poll && entry.kind != FrameKind::Ack)
	);
	let unfiltered = rig.manager.trace().snapshot(TraceFilter::default());
	assert!(unfiltered.len() > filtered.len());
}

#[test]
fn keypad_entry_completes_with_pound() {
	let rig = rig(&[4]);
	let sub = rig.manager.subscribe();
	rig.manager.add_device(device("pin pad", 4)).unwrap();
	rig.manager.start().unwrap();
	await_online(&sub, 1);

	rig.line
		.lock()
		.unwrap()
		.readers
		.get_mut(&4)
		.unwrap()
		.keys
		.push_back(vec![0x00, 4, 0x31, 0x32, 0x33, 0x0d]);

	let mut digits = Vec::new();
	let read = loop {
		match sub.recv_timeout(Duration::from_secs(2)) {
			Some(Event::PinDigit(digit)) => digits.push(digit.digit),
			Some(Event::PinRead(read)) => break read,
			Some(_) => {}
			None => panic!("no pin read event"),
		}
	};
	assert_eq!(digits, ['1', '2', '3']);
	assert_eq!(read.pin, "123");
	assert_eq!(
		read.reason,
		osdp_gateway::PinCompletionReason::PoundKey
	);
	rig.manager.stop();
}

#[test]
fn feedback_renders_led_and_buzzer() {
	let rig = rig(&[5]);
	let sub = rig.manager.subscribe();
	let config = device("gate", 5);
	let reader_id = config.id;
	rig.manager.add_device(config).unwrap();
	rig.manager.start().unwrap();
	await_online(&sub, 1);

	// Identification runs right after the online transition; let it finish
	// so the command log below starts clean.
	thread::sleep(Duration::from_millis(400));
	rig.line.lock().unwrap().readers.get_mut(&5).unwrap().received.clear();

	assert!(rig.manager.send_feedback(
		reader_id,
		Feedback {
			led_color: Some(LedColor::Green),
			led_duration_s: 2,
			beep_count: 1,
			display_message: None,
		},
	));
	thread::sleep(Duration::from_millis(600));
	rig.manager.stop();

	let state = rig.line.lock().unwrap();
	let received = &state.readers[&5].received;
	let leds = received.iter().filter(|c| **c == u8::from(Command::Led)).count();
	let buzzes = received.iter().filter(|c| **c == u8::from(Command::Buzzer)).count();
	assert_eq!(leds, 1, "expected exactly one LED command, log: {received:?}");
	assert_eq!(buzzes, 1, "expected exactly one buzzer command");
}

#[test]
fn silent_reader_reports_offline_then_recovers() {
	let rig = rig(&[6]);
	let sub = rig.manager.subscribe();
	rig.manager.add_device(device("flaky", 6)).unwrap();
	rig.manager.start().unwrap();
	await_online(&sub, 1);

	// Take the reader off the line: polls now go unanswered.
	rig.line.lock().unwrap().readers.remove(&6);
	let offline = loop {
		match sub.recv_timeout(Duration::from_secs(3)) {
			Some(Event::Status(status)) => break status,
			Some(_) => {}
			None => panic!("reader never went offline"),
		}
	};
	assert!(!offline.online);

	// Put it back; polling brings it online again.
	rig.line.lock().unwrap().readers.insert(6, Reader::default());
	let online = loop {
		match sub.recv_timeout(Duration::from_secs(3)) {
			Some(Event::Status(status)) => break status,
			Some(_) => {}
			None => panic!("reader never came back"),
		}
	};
	assert!(online.online);
	rig.manager.stop();
}

#[test]
fn send_feedback_to_unknown_reader_is_refused() {
	let rig = rig(&[]);
	assert!(!rig.manager.send_feedback(Uuid::new_v4(), Feedback::default()));
}
