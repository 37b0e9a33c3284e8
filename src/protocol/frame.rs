//! OSDP packet build and parse.
//!
//! Packet layout on the wire:
//!
//! ```text
//! SOM | ADDR | LEN_LSB | LEN_MSB | CTRL | [security block] | CODE | DATA... | [MAC] | CHECK
//! ```
//!
//! The length field counts the whole packet including the trailing check
//! bytes. The check is a 16-bit CRC when the control field says so, an 8-bit
//! additive checksum otherwise. Secure-channel packets carry a security
//! control block between the header and the code and, once the session is
//! established, a truncated 4-byte MAC in front of the check.

use smallvec::SmallVec;
use thiserror::Error;

use super::secure::SecureChannel;
use super::{
	BROADCAST_ADDRESS, ControlField, Direction, FrameKind, HEADER_LEN, MAX_PACKET_LEN,
	REPLY_ADDRESS_BIT, SOM, classify,
};

/// CRC-16 used by OSDP: polynomial 0x1021, initial value 0x1D0F.
const CRC16: crc::Crc<u16> = crc::Crc::<u16>::new(&crc::CRC_16_SPI_FUJITSU);

/// Bytes of truncated MAC appended to an authenticated packet.
pub(crate) const MAC_LEN: usize = 4;

/// Security block types for the secure-channel handshake and session.
pub mod scs {
	/// `osdp_CHLNG`, begin sequence.
	pub const SCS_11: u8 = 0x11;
	/// `osdp_CCRYPT` reply.
	pub const SCS_12: u8 = 0x12;
	/// `osdp_SCRYPT`, server cryptogram.
	pub const SCS_13: u8 = 0x13;
	/// `osdp_RMAC_I` reply, initial reply MAC.
	pub const SCS_14: u8 = 0x14;
	/// Command with MAC, plaintext data.
	pub const SCS_15: u8 = 0x15;
	/// Reply with MAC, plaintext data.
	pub const SCS_16: u8 = 0x16;
	/// Command with MAC and encrypted data.
	pub const SCS_17: u8 = 0x17;
	/// Reply with MAC and encrypted data.
	pub const SCS_18: u8 = 0x18;
}

/// A security control block as carried between header and code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityBlock {
	pub block_type: u8,
	pub data: SmallVec<[u8; 2]>,
}

impl SecurityBlock {
	pub fn new(block_type: u8) -> Self {
		Self {
			block_type,
			data: SmallVec::new(),
		}
	}

	pub fn with_data(block_type: u8, data: &[u8]) -> Self {
		Self {
			block_type,
			data: SmallVec::from_slice(data),
		}
	}

	fn wire_len(&self) -> usize {
		2 + self.data.len()
	}

	/// Whether packets carrying this block are authenticated with a MAC.
	fn has_mac(&self) -> bool {
		matches!(
			self.block_type,
			scs::SCS_15 | scs::SCS_16 | scs::SCS_17 | scs::SCS_18
		)
	}

	fn has_encrypted_data(&self) -> bool {
		matches!(self.block_type, scs::SCS_17 | scs::SCS_18)
	}
}

/// A decoded (or to-be-encoded) OSDP packet.
///
/// `payload` always holds plaintext; encryption and decryption happen during
/// [`Frame::encode`] and [`Frame::decode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
	pub direction: Direction,
	/// 7-bit device address without the reply bit.
	pub address: u8,
	pub sequence: u8,
	/// Use the 16-bit CRC instead of the additive checksum.
	pub crc: bool,
	pub security_block: Option<SecurityBlock>,
	pub code: u8,
	pub payload: Vec<u8>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncodeError {
	#[error("payload of {0} bytes does not fit a {MAX_PACKET_LEN} byte packet")]
	PayloadTooLarge(usize),
	#[error("secure channel is not established")]
	SecureChannelNotReady,
	#[error("address {0:#04x} out of range")]
	InvalidAddress(u8),
	#[error("sequence number {0} out of range")]
	InvalidSequence(u8),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
	#[error("packet truncated ({0} bytes)")]
	Truncated(usize),
	#[error("start of message missing")]
	MissingSom,
	#[error("length field {field} does not match the {actual} received bytes")]
	LengthMismatch { field: usize, actual: usize },
	#[error("checksum mismatch")]
	ChecksumMismatch,
	#[error("CRC mismatch")]
	CrcMismatch,
	#[error("message authentication failed")]
	MacInvalid,
	#[error("malformed security block")]
	MalformedSecurityBlock,
	#[error("secured packet without an established secure channel")]
	SecureChannelNotReady,
	#[error("encrypted payload is malformed")]
	MalformedCiphertext,
}

impl Frame {
	/// A command frame addressed to a device.
	pub fn command(address: u8, sequence: u8, crc: bool, code: u8, payload: Vec<u8>) -> Self {
		Self {
			direction: Direction::Outgoing,
			address,
			sequence,
			crc,
			security_block: None,
			code,
			payload,
		}
	}

	/// A reply frame as a device would send it.
	pub fn reply(address: u8, sequence: u8, crc: bool, code: u8, payload: Vec<u8>) -> Self {
		Self {
			direction: Direction::Incoming,
			address,
			sequence,
			crc,
			security_block: None,
			code,
			payload,
		}
	}

	pub fn kind(&self) -> FrameKind {
		classify(self.direction, self.code)
	}

	/// Serializes the frame.
	///
	/// With an established [`SecureChannel`] the payload is wrapped per the
	/// session: a security block is inserted, a non-empty payload is
	/// encrypted, and a truncated MAC is appended in front of the check.
	/// Handshake frames instead set [`Frame::security_block`] themselves and
	/// pass no channel.
	pub fn encode(&self, secure: Option<&mut SecureChannel>) -> Result<Vec<u8>, EncodeError> {
		if self.address > BROADCAST_ADDRESS {
			return Err(EncodeError::InvalidAddress(self.address));
		}
		if self.sequence > 3 {
			return Err(EncodeError::InvalidSequence(self.sequence));
		}

		let (block, data) = match secure {
			Some(channel) => {
				if !channel.is_established() {
					return Err(EncodeError::SecureChannelNotReady);
				}
				let block_type = match (self.direction, self.payload.is_empty()) {
					(Direction::Outgoing, true) => scs::SCS_15,
					(Direction::Incoming, true) => scs::SCS_16,
					(Direction::Outgoing, false) => scs::SCS_17,
					(Direction::Incoming, false) => scs::SCS_18,
				};
				let data = if self.payload.is_empty() {
					Vec::new()
				} else {
					channel
						.encrypt_payload(self.direction, &self.payload)
						.map_err(|_| EncodeError::SecureChannelNotReady)?
				};
				(Some((SecurityBlock::new(block_type), Some(channel))), data)
			}
			None => (
				self.security_block.clone().map(|b| (b, None)),
				self.payload.clone(),
			),
		};

		let block_len = block.as_ref().map_or(0, |(b, _)| b.wire_len());
		let has_mac = block.as_ref().is_some_and(|(b, _)| b.has_mac());
		let check_len = if self.crc { 2 } else { 1 };
		let total = HEADER_LEN
			+ block_len
			+ 1
			+ data.len()
			+ if has_mac { MAC_LEN } else { 0 }
			+ check_len;
		if total > MAX_PACKET_LEN {
			return Err(EncodeError::PayloadTooLarge(self.payload.len()));
		}

		let mut buf = Vec::with_capacity(total);
		buf.push(SOM);
		buf.push(match self.direction {
			Direction::Outgoing => self.address,
			Direction::Incoming => self.address | REPLY_ADDRESS_BIT,
		});
		buf.extend_from_slice(&(total as u16).to_le_bytes());
		let mut ctrl = ControlField::from_bits_retain(self.sequence);
		if self.crc {
			ctrl |= ControlField::CRC16;
		}
		if block.is_some() {
			ctrl |= ControlField::SECURITY_BLOCK;
		}
		buf.push(ctrl.bits());
		let channel = if let Some((b, channel)) = block {
			buf.push(b.wire_len() as u8);
			buf.push(b.block_type);
			buf.extend_from_slice(&b.data);
			channel
		} else {
			None
		};
		buf.push(self.code);
		buf.extend_from_slice(&data);

		if let Some(channel) = channel {
			let mac = channel
				.mac_commit(self.direction, &buf)
				.map_err(|_| EncodeError::SecureChannelNotReady)?;
			buf.extend_from_slice(&mac[..MAC_LEN]);
		}

		if self.crc {
			buf.extend_from_slice(&CRC16.checksum(&buf).to_le_bytes());
		} else {
			buf.push(checksum(&buf));
		}
		Ok(buf)
	}

	/// Parses one complete packet.
	///
	/// `buf` must hold exactly the packet announced by its length field;
	/// callers accumulate bytes with [`wire_len`] first. Integrity is
	/// verified before anything is interpreted; secured packets additionally
	/// authenticate against `secure` and have their payload decrypted.
	pub fn decode(
		buf: &[u8],
		mut secure: Option<&mut SecureChannel>,
	) -> Result<Frame, DecodeError> {
		if buf.len() < HEADER_LEN + 2 {
			return Err(DecodeError::Truncated(buf.len()));
		}
		if buf[0] != SOM {
			return Err(DecodeError::MissingSom);
		}
		let field = usize::from(u16::from_le_bytes([buf[2], buf[3]]));
		if field != buf.len() {
			return Err(DecodeError::LengthMismatch {
				field,
				actual: buf.len(),
			});
		}

		let ctrl = ControlField::from_bits_retain(buf[4]);
		let crc = ctrl.contains(ControlField::CRC16);
		let body_end = if crc {
			let trailer = u16::from_le_bytes([buf[buf.len() - 2], buf[buf.len() - 1]]);
			let end = buf.len() - 2;
			if CRC16.checksum(&buf[..end]) != trailer {
				return Err(DecodeError::CrcMismatch);
			}
			end
		} else {
			let end = buf.len() - 1;
			if checksum(&buf[..end]) != buf[end] {
				return Err(DecodeError::ChecksumMismatch);
			}
			end
		};

		let direction = super::direction_of(buf[1]);
		let address = buf[1] & !REPLY_ADDRESS_BIT;

		let mut offset = HEADER_LEN;
		let block = if ctrl.contains(ControlField::SECURITY_BLOCK) {
			let len = usize::from(*buf.get(offset).ok_or(DecodeError::MalformedSecurityBlock)?);
			if len < 2 || offset + len >= body_end {
				return Err(DecodeError::MalformedSecurityBlock);
			}
			let block = SecurityBlock::with_data(buf[offset + 1], &buf[offset + 2..offset + len]);
			offset += len;
			Some(block)
		} else {
			None
		};

		let has_mac = block.as_ref().is_some_and(SecurityBlock::has_mac);
		let encrypted = block.as_ref().is_some_and(SecurityBlock::has_encrypted_data);
		let data_end = if has_mac {
			let channel = match secure.as_deref_mut() {
				Some(channel) if channel.is_established() => channel,
				_ => return Err(DecodeError::SecureChannelNotReady),
			};
			let mac_off = body_end
				.checked_sub(MAC_LEN)
				.filter(|end| *end > offset)
				.ok_or(DecodeError::Truncated(buf.len()))?;
			channel
				.verify_commit(direction, &buf[..mac_off], &buf[mac_off..body_end])
				.map_err(|_| DecodeError::MacInvalid)?;
			mac_off
		} else {
			body_end
		};

		let code = buf[offset];
		let data = &buf[offset + 1..data_end];
		let payload = if encrypted && !data.is_empty() {
			let channel = secure.ok_or(DecodeError::SecureChannelNotReady)?;
			channel
				.decrypt_payload(direction, data)
				.map_err(|_| DecodeError::MalformedCiphertext)?
		} else {
			data.to_vec()
		};

		Ok(Frame {
			direction,
			address,
			sequence: ctrl.sequence(),
			crc,
			security_block: block,
			code,
			payload,
		})
	}
}

/// 8-bit additive checksum: two's complement of the byte sum.
fn checksum(data: &[u8]) -> u8 {
	data.iter()
		.fold(0u8, |sum, byte| sum.wrapping_add(*byte))
		.wrapping_neg()
}

/// Total packet length announced by a partially received buffer, once the
/// header's length field is available. Returns `None` until then.
///
/// A nonsensical length field is reported as an error so the caller can
/// resynchronize on the next SOM.
pub fn wire_len(buf: &[u8]) -> Option<Result<usize, DecodeError>> {
	if buf.first().is_some_and(|som| *som != SOM) {
		return Some(Err(DecodeError::MissingSom));
	}
	if buf.len() < 4 {
		return None;
	}
	let field = usize::from(u16::from_le_bytes([buf[2], buf[3]]));
	if field < HEADER_LEN + 2 || field > MAX_PACKET_LEN {
		Some(Err(DecodeError::LengthMismatch {
			field,
			actual: buf.len(),
		}))
	} else {
		Some(Ok(field))
	}
}
