//! OSDP wire protocol: command and reply codes, the packet control field and
//! frame classification.
//!
//! The frame build/parse logic lives in [`frame`], the secure-channel session
//! in [`secure`].

pub mod frame;
pub mod secure;

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Start-of-message byte. Every OSDP packet begins with it.
pub const SOM: u8 = 0xff;

/// Largest packet the protocol allows, header and trailer included.
pub const MAX_PACKET_LEN: usize = 1440;

/// Fixed header in front of the (optional) security block: SOM, address,
/// two length bytes and the control field.
pub const HEADER_LEN: usize = 5;

/// Address reserved for broadcast commands. Never used by replies.
pub const BROADCAST_ADDRESS: u8 = 0x7f;

/// Highest address a device can be configured at.
pub const MAX_DEVICE_ADDRESS: u8 = 0x7e;

/// Set in the address byte of every reply.
pub const REPLY_ADDRESS_BIT: u8 = 0x80;

bitflags::bitflags! {
	/// The packet control field.
	///
	/// Bits 0-1 carry the sequence number, bit 2 selects the 16-bit CRC over
	/// the 8-bit checksum and bit 3 announces a security control block
	/// between the header and the command/reply code.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct ControlField: u8 {
		const SEQUENCE = 0b0000_0011;
		const CRC16 = 0b0000_0100;
		const SECURITY_BLOCK = 0b0000_1000;
	}
}

impl ControlField {
	pub fn sequence(self) -> u8 {
		self.bits() & Self::SEQUENCE.bits()
	}
}

/// Commands the control panel sends to a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Command {
	Poll = 0x60,
	IdReport = 0x61,
	Capabilities = 0x62,
	LocalStatus = 0x64,
	Led = 0x69,
	Buzzer = 0x6a,
	Text = 0x6b,
	KeySet = 0x75,
	Challenge = 0x76,
	ServerCryptogram = 0x77,
}

/// Replies a device sends back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Reply {
	Ack = 0x40,
	Nak = 0x41,
	IdReport = 0x45,
	Capabilities = 0x46,
	LocalStatus = 0x48,
	RawCardData = 0x50,
	Keypad = 0x53,
	ClientCryptogram = 0x76,
	InitialRMac = 0x78,
	Busy = 0x79,
}

/// Error codes carried in a NAK reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum NakCode {
	MessageCheckError = 0x01,
	CommandLengthError = 0x02,
	UnknownCommand = 0x03,
	SequenceError = 0x04,
	UnsupportedSecurityBlock = 0x05,
	CommunicationDeclined = 0x06,
	BioTypeUnsupported = 0x07,
	BioFormatUnsupported = 0x08,
}

/// Which way a frame travelled over the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
	/// Control panel to device.
	Outgoing,
	/// Device to control panel.
	Incoming,
}

/// Coarse classification of a frame, used by the packet trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
	Poll,
	Ack,
	CardRead,
	KeypadData,
	LedControl,
	BuzzerControl,
	EncryptionKeySet,
	Other,
}

/// Classifies a frame from its command/reply code and direction.
///
/// The direction normally comes from the transport side that observed the
/// frame; [`direction_of`] derives it from the address byte when it does not.
pub fn classify(direction: Direction, code: u8) -> FrameKind {
	match direction {
		Direction::Outgoing => match Command::try_from(code) {
			Ok(Command::Poll) => FrameKind::Poll,
			Ok(Command::Led) => FrameKind::LedControl,
			Ok(Command::Buzzer) => FrameKind::BuzzerControl,
			Ok(Command::KeySet) => FrameKind::EncryptionKeySet,
			_ => FrameKind::Other,
		},
		Direction::Incoming => match Reply::try_from(code) {
			Ok(Reply::Ack) => FrameKind::Ack,
			Ok(Reply::RawCardData) => FrameKind::CardRead,
			Ok(Reply::Keypad) => FrameKind::KeypadData,
			_ => FrameKind::Other,
		},
	}
}

/// Derives the direction of a raw packet from bit 7 of its address byte.
///
/// A broadcast packet is never a reply, whatever its bit 7 says.
pub fn direction_of(address_byte: u8) -> Direction {
	if address_byte & REPLY_ADDRESS_BIT != 0 && address_byte & !REPLY_ADDRESS_BIT != BROADCAST_ADDRESS
	{
		Direction::Incoming
	} else {
		Direction::Outgoing
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn classify_by_direction() {
		assert_eq!(
			classify(Direction::Outgoing, Command::Poll.into()),
			FrameKind::Poll
		);
		assert_eq!(
			classify(Direction::Incoming, Reply::Ack.into()),
			FrameKind::Ack
		);
		// 0x50 is RAW only when it is a reply.
		assert_eq!(
			classify(Direction::Incoming, Reply::RawCardData.into()),
			FrameKind::CardRead
		);
		assert_eq!(classify(Direction::Outgoing, 0x50), FrameKind::Other);
	}

	#[test]
	fn reply_bit_sets_direction() {
		assert_eq!(direction_of(0x01), Direction::Outgoing);
		assert_eq!(direction_of(0x81), Direction::Incoming);
		// Broadcast can carry bit 7 noise without becoming a reply.
		assert_eq!(direction_of(0xff), Direction::Outgoing);
	}
}
