//! Reader UI affordances: LED and buzzer command payloads, the idle
//! heartbeat cadence and the feedback pause window.

use std::time::{Duration, Instant};

use thiserror::Error;

use crate::config::{HEARTBEAT_FLASH_UNITS, HEARTBEAT_PERIOD};

/// LED color codes as the wire protocol numbers them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedColor {
	Black,
	Red,
	Green,
	Amber,
	Blue,
	Magenta,
	Cyan,
	White,
}

impl LedColor {
	pub fn code(self) -> u8 {
		match self {
			Self::Black => 0,
			Self::Red => 1,
			Self::Green => 2,
			Self::Amber => 3,
			Self::Blue => 4,
			Self::Magenta => 5,
			Self::Cyan => 6,
			Self::White => 7,
		}
	}
}

/// One feedback burst as requested by a caller.
#[derive(Debug, Clone, Default)]
pub struct Feedback {
	pub led_color: Option<LedColor>,
	/// Whole seconds the LED holds the feedback color.
	pub led_duration_s: u8,
	pub beep_count: u8,
	/// Accepted, but devices without a display never see it.
	pub display_message: Option<String>,
}

/// Idle colors from the feedback-configuration collaborator.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdleState {
	pub permanent_color: Option<LedColor>,
	pub heartbeat_color: Option<LedColor>,
}

/// Preconfigured feedback pair for accept/deny outcomes.
#[derive(Debug, Clone, Default)]
pub struct DefaultFeedback {
	pub success: Feedback,
	pub failure: Feedback,
}

#[derive(Debug, Error)]
#[error("feedback configuration unavailable: {0}")]
pub struct FeedbackConfigError(pub String);

/// External source of idle colors and default feedback.
///
/// Failures fall back to black-on-black, i.e. a dark reader.
pub trait FeedbackConfigurationService: Send + Sync {
	fn idle_state(&self) -> Result<IdleState, FeedbackConfigError>;

	fn default_feedback(&self) -> Result<DefaultFeedback, FeedbackConfigError>;
}

/// `osdp_LED` payload: one temporary action followed by one permanent
/// action for the reader's LED zero.
pub(crate) fn led_payload(
	temp_on: LedColor,
	temp_off: LedColor,
	timer_units: u16,
	permanent: LedColor,
) -> Vec<u8> {
	let timer = timer_units.to_le_bytes();
	vec![
		0x00, // reader 0
		0x00, // LED 0
		0x02, // temporary: set
		0x02, // 200 ms on
		0x02, // 200 ms off
		temp_on.code(),
		temp_off.code(),
		timer[0],
		timer[1],
		0x01, // permanent: set
		0x01,
		0x00,
		permanent.code(),
		permanent.code(),
	]
}

/// Solid temporary color, as used for feedback bursts: both blink colors
/// are the feedback color, so the LED simply holds it for the timer.
pub(crate) fn feedback_led_payload(color: LedColor, duration_s: u8, permanent: LedColor) -> Vec<u8> {
	led_payload(color, color, u16::from(duration_s) * 10, permanent)
}

/// Brief heartbeat flash over the permanent color.
pub(crate) fn heartbeat_led_payload(heartbeat: LedColor, permanent: LedColor) -> Vec<u8> {
	led_payload(heartbeat, permanent, u16::from(HEARTBEAT_FLASH_UNITS), permanent)
}

/// `osdp_BUZ` payload: `count` beeps of 200 ms on / 200 ms off.
pub(crate) fn buzzer_payload(count: u8) -> Vec<u8> {
	vec![
		0x00, // reader 0
		0x02, // default tone
		0x02, // 200 ms on
		0x02, // 200 ms off
		count,
	]
}

/// Heartbeat/pause bookkeeping for one online device.
///
/// A feedback burst preempts the cadence; once the pause lapses the next
/// heartbeat is rescheduled a full period out, never backdated.
#[derive(Debug, Default)]
pub(crate) struct IdleScheduler {
	next_heartbeat: Option<Instant>,
	pause_until: Option<Instant>,
}

impl IdleScheduler {
	pub fn on_online(&mut self, now: Instant) {
		self.next_heartbeat = Some(now + HEARTBEAT_PERIOD);
		self.pause_until = None;
	}

	pub fn on_offline(&mut self) {
		self.next_heartbeat = None;
		self.pause_until = None;
	}

	pub fn pause(&mut self, now: Instant, duration: Duration) {
		self.pause_until = Some(now + duration);
	}

	/// Whether a heartbeat should go out now. The caller confirms emission
	/// with [`IdleScheduler::mark_sent`].
	pub fn heartbeat_due(&mut self, now: Instant) -> bool {
		if let Some(until) = self.pause_until {
			if now < until {
				return false;
			}
			self.pause_until = None;
			self.next_heartbeat = Some(now + HEARTBEAT_PERIOD);
			return false;
		}
		self.next_heartbeat.is_some_and(|at| now >= at)
	}

	pub fn mark_sent(&mut self, now: Instant) {
		self.next_heartbeat = Some(now + HEARTBEAT_PERIOD);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn heartbeat_fires_once_per_period() {
		let start = Instant::now();
		let mut idle = IdleScheduler::default();
		idle.on_online(start);

		let mut fired = Vec::new();
		// One tick per 100 ms of simulated time over 16 s.
		for tick in 0..160 {
			let now = start + Duration::from_millis(tick * 100);
			if idle.heartbeat_due(now) {
				idle.mark_sent(now);
				fired.push(tick);
			}
		}
		assert_eq!(fired, [50, 100, 150]);
	}

	#[test]
	fn no_heartbeat_while_offline() {
		let start = Instant::now();
		let mut idle = IdleScheduler::default();
		assert!(!idle.heartbeat_due(start + Duration::from_secs(60)));
		idle.on_online(start);
		idle.on_offline();
		assert!(!idle.heartbeat_due(start + Duration::from_secs(60)));
	}

	#[test]
	fn pause_suppresses_and_reschedules() {
		let start = Instant::now();
		let mut idle = IdleScheduler::default();
		idle.on_online(start);

		// Feedback at t=4 s pauses for 2 s; the t=5 s heartbeat must not
		// fire, and the next one comes a full period after the pause.
		idle.pause(start + Duration::from_secs(4), Duration::from_secs(2));
		let mut fired = Vec::new();
		for tick in 0..130 {
			let now = start + Duration::from_millis(tick * 100);
			if idle.heartbeat_due(now) {
				idle.mark_sent(now);
				fired.push(tick);
			}
		}
		// Pause lapses at t=6 s, next heartbeat at t=11 s.
		assert_eq!(fired, [110]);
	}

	#[test]
	fn led_timer_uses_100ms_units() {
		let payload = feedback_led_payload(LedColor::Green, 2, LedColor::Black);
		assert_eq!(payload.len(), 14);
		assert_eq!(u16::from_le_bytes([payload[7], payload[8]]), 20);
		assert_eq!(payload[5], LedColor::Green.code());
	}

	#[test]
	fn buzzer_counts_beeps() {
		let payload = buzzer_payload(3);
		assert_eq!(payload, [0x00, 0x02, 0x02, 0x02, 3]);
	}
}
