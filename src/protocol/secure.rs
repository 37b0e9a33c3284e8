//! Secure-channel session (SCS) state for one device.
//!
//! The control panel opens a session with a challenge/response handshake:
//! `osdp_CHLNG` carries our random number, the device answers with
//! `osdp_CCRYPT` (its random number plus a cryptogram proving it holds the
//! base key), `osdp_SCRYPT` returns our cryptogram and `osdp_RMAC_I` seeds
//! the reply MAC chain. From then on every packet in either direction is
//! authenticated with a truncated AES-MAC and non-empty payloads are
//! AES-128-CBC encrypted.
//!
//! All key material is derived per session from the base key (SCBK, or the
//! well-known default key while a fresh key is being installed) and the
//! challenge random number.

use aes::Aes128;
use aes::cipher::block_padding::NoPadding;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncrypt, BlockEncryptMut, KeyInit, KeyIvInit};
use thiserror::Error;

use super::Direction;
use crate::entropy;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Length of the secure-channel base key and everything derived from it.
pub const KEY_LEN: usize = 16;

/// Length of the challenge random number (RND.A / RND.B).
pub const CHALLENGE_LEN: usize = 8;

/// The default secure-channel base key (SCBK-D) used only to install a
/// device-specific key.
pub const DEFAULT_BASE_KEY: [u8; KEY_LEN] = [
	0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x3a, 0x3b, 0x3c, 0x3d, 0x3e, 0x3f,
];

#[derive(Debug, Error)]
pub enum SecureChannelError {
	#[error("secure channel is not established")]
	NotEstablished,
	#[error("unexpected handshake message for the current state")]
	BadState,
	#[error("malformed handshake payload ({0} bytes)")]
	MalformedPayload(usize),
	#[error("device cryptogram does not match the base key")]
	CryptogramMismatch,
	#[error("message authentication failed")]
	MacInvalid,
	#[error("ciphertext is not block aligned or badly padded")]
	BadCiphertext,
	#[error(transparent)]
	Entropy(#[from] entropy::EntropyError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScsState {
	Inactive,
	WaitClientCryptogram,
	WaitInitialMac,
	Established,
}

#[derive(Clone)]
struct SessionKeys {
	s_enc: [u8; KEY_LEN],
	s_mac1: [u8; KEY_LEN],
	s_mac2: [u8; KEY_LEN],
}

/// Per-device secure-channel state, owned by the device session.
pub struct SecureChannel {
	base_key: [u8; KEY_LEN],
	default_key: bool,
	state: ScsState,
	rnd_a: [u8; CHALLENGE_LEN],
	keys: Option<SessionKeys>,
	/// MAC of the last packet seen per direction; the opposite direction's
	/// entry seeds both the next MAC and the next payload IV.
	last_mac: [Option<[u8; KEY_LEN]>; 2],
}

impl SecureChannel {
	/// A channel keyed with a device-specific base key.
	pub fn new(base_key: [u8; KEY_LEN]) -> Self {
		Self {
			base_key,
			default_key: false,
			state: ScsState::Inactive,
			rnd_a: [0; CHALLENGE_LEN],
			keys: None,
			last_mac: [None, None],
		}
	}

	/// A channel keyed with the well-known install key.
	pub fn with_default_key() -> Self {
		Self {
			default_key: true,
			..Self::new(DEFAULT_BASE_KEY)
		}
	}

	pub fn is_established(&self) -> bool {
		self.state == ScsState::Established
	}

	pub fn uses_default_key(&self) -> bool {
		self.default_key
	}

	/// Drops all session state. The next handshake re-derives everything
	/// from a fresh challenge.
	pub fn reset(&mut self) {
		self.state = ScsState::Inactive;
		self.keys = None;
		self.last_mac = [None, None];
	}

	/// Key reference byte for the `SCS_11` block: 0 for the default key,
	/// 1 for an installed SCBK.
	pub fn key_reference(&self) -> u8 {
		if self.default_key { 0x00 } else { 0x01 }
	}

	/// Starts a handshake and returns the challenge random number to send
	/// in `osdp_CHLNG`.
	pub fn begin(&mut self) -> Result<[u8; CHALLENGE_LEN], SecureChannelError> {
		self.reset();
		entropy::fill(&mut self.rnd_a)?;
		self.state = ScsState::WaitClientCryptogram;
		Ok(self.rnd_a)
	}

	/// Consumes an `osdp_CCRYPT` payload, verifies the device cryptogram
	/// and returns our cryptogram for `osdp_SCRYPT`.
	pub fn handle_client_cryptogram(
		&mut self,
		payload: &[u8],
	) -> Result<[u8; KEY_LEN], SecureChannelError> {
		if self.state != ScsState::WaitClientCryptogram {
			return Err(SecureChannelError::BadState);
		}
		// Client UID (8), RND.B (8), device cryptogram (16).
		if payload.len() != 32 {
			return Err(SecureChannelError::MalformedPayload(payload.len()));
		}
		let rnd_b: [u8; CHALLENGE_LEN] = payload[8..16].try_into().unwrap();
		let keys = derive_session_keys(&self.base_key, &self.rnd_a);

		let expected = device_cryptogram(&keys.s_enc, &self.rnd_a, &rnd_b);
		if expected != payload[16..32] {
			self.reset();
			return Err(SecureChannelError::CryptogramMismatch);
		}

		let ours = panel_cryptogram(&keys.s_enc, &self.rnd_a, &rnd_b);
		self.keys = Some(keys);
		self.state = ScsState::WaitInitialMac;
		Ok(ours)
	}

	/// Consumes an `osdp_RMAC_I` payload and brings the session up.
	pub fn handle_initial_mac(&mut self, payload: &[u8]) -> Result<(), SecureChannelError> {
		if self.state != ScsState::WaitInitialMac {
			return Err(SecureChannelError::BadState);
		}
		let mac: [u8; KEY_LEN] = payload
			.try_into()
			.map_err(|_| SecureChannelError::MalformedPayload(payload.len()))?;
		self.last_mac[mac_slot(Direction::Incoming)] = Some(mac);
		self.state = ScsState::Established;
		Ok(())
	}

	/// Computes and commits the MAC for an outgoing wire image. Returns the
	/// full 16 bytes; packets carry the first four.
	pub(crate) fn mac_commit(
		&mut self,
		direction: Direction,
		bytes: &[u8],
	) -> Result<[u8; KEY_LEN], SecureChannelError> {
		let mac = self.compute_mac(direction, bytes)?;
		self.last_mac[mac_slot(direction)] = Some(mac);
		Ok(mac)
	}

	/// Verifies the truncated MAC of a received wire image and, on success,
	/// commits it to the chain. A failed check leaves the chain untouched so
	/// the frame counts as lost rather than desynchronizing the session.
	pub(crate) fn verify_commit(
		&mut self,
		direction: Direction,
		bytes: &[u8],
		tag: &[u8],
	) -> Result<(), SecureChannelError> {
		let mac = self.compute_mac(direction, bytes)?;
		if tag.len() != super::frame::MAC_LEN || mac[..tag.len()] != *tag {
			return Err(SecureChannelError::MacInvalid);
		}
		self.last_mac[mac_slot(direction)] = Some(mac);
		Ok(())
	}

	pub(crate) fn encrypt_payload(
		&self,
		direction: Direction,
		data: &[u8],
	) -> Result<Vec<u8>, SecureChannelError> {
		let keys = self.keys.as_ref().ok_or(SecureChannelError::NotEstablished)?;
		let iv = self.payload_iv(direction)?;
		let mut padded = data.to_vec();
		padded.push(0x80);
		while padded.len() % 16 != 0 {
			padded.push(0x00);
		}
		let enc = Aes128CbcEnc::new(
			GenericArray::from_slice(&keys.s_enc),
			GenericArray::from_slice(&iv),
		);
		Ok(enc.encrypt_padded_vec_mut::<NoPadding>(&padded))
	}

	pub(crate) fn decrypt_payload(
		&self,
		direction: Direction,
		data: &[u8],
	) -> Result<Vec<u8>, SecureChannelError> {
		let keys = self.keys.as_ref().ok_or(SecureChannelError::NotEstablished)?;
		if data.is_empty() || data.len() % 16 != 0 {
			return Err(SecureChannelError::BadCiphertext);
		}
		let iv = self.payload_iv(direction)?;
		let dec = Aes128CbcDec::new(
			GenericArray::from_slice(&keys.s_enc),
			GenericArray::from_slice(&iv),
		);
		let mut plain = dec
			.decrypt_padded_vec_mut::<NoPadding>(data)
			.map_err(|_| SecureChannelError::BadCiphertext)?;
		while plain.last() == Some(&0x00) {
			plain.pop();
		}
		if plain.pop() != Some(0x80) {
			return Err(SecureChannelError::BadCiphertext);
		}
		Ok(plain)
	}

	/// CBC IV for a payload travelling in `direction`: the bitwise inverse
	/// of the last MAC seen in the opposite direction.
	fn payload_iv(&self, direction: Direction) -> Result<[u8; KEY_LEN], SecureChannelError> {
		let mut iv = self.last_mac[mac_slot(opposite(direction))]
			.ok_or(SecureChannelError::NotEstablished)?;
		for byte in &mut iv {
			*byte = !*byte;
		}
		Ok(iv)
	}

	fn compute_mac(
		&self,
		direction: Direction,
		bytes: &[u8],
	) -> Result<[u8; KEY_LEN], SecureChannelError> {
		let keys = self.keys.as_ref().ok_or(SecureChannelError::NotEstablished)?;
		let iv = self.last_mac[mac_slot(opposite(direction))]
			.ok_or(SecureChannelError::NotEstablished)?;
		Ok(mac_chain(keys, &iv, bytes))
	}
}

fn opposite(direction: Direction) -> Direction {
	match direction {
		Direction::Outgoing => Direction::Incoming,
		Direction::Incoming => Direction::Outgoing,
	}
}

fn mac_slot(direction: Direction) -> usize {
	match direction {
		Direction::Outgoing => 0,
		Direction::Incoming => 1,
	}
}

fn ecb_encrypt(key: &[u8; KEY_LEN], block: [u8; 16]) -> [u8; 16] {
	let cipher = Aes128::new(GenericArray::from_slice(key));
	let mut block = GenericArray::from(block);
	cipher.encrypt_block(&mut block);
	block.into()
}

/// Derives S-ENC and the two MAC keys from the base key and RND.A.
fn derive_session_keys(base_key: &[u8; KEY_LEN], rnd_a: &[u8; CHALLENGE_LEN]) -> SessionKeys {
	let mut seed = [0u8; 16];
	seed[2..8].copy_from_slice(&rnd_a[..6]);

	seed[0] = 0x01;
	seed[1] = 0x82;
	let s_enc = ecb_encrypt(base_key, seed);
	seed[1] = 0x01;
	let s_mac1 = ecb_encrypt(base_key, seed);
	seed[1] = 0x02;
	let s_mac2 = ecb_encrypt(base_key, seed);

	SessionKeys {
		s_enc,
		s_mac1,
		s_mac2,
	}
}

fn cryptogram(s_enc: &[u8; KEY_LEN], first: &[u8; 8], second: &[u8; 8]) -> [u8; 16] {
	let mut block = [0u8; 16];
	block[..8].copy_from_slice(first);
	block[8..].copy_from_slice(second);
	ecb_encrypt(s_enc, block)
}

/// Cryptogram the device proves itself with: E(S-ENC, RND.B || RND.A).
fn device_cryptogram(s_enc: &[u8; KEY_LEN], rnd_a: &[u8; 8], rnd_b: &[u8; 8]) -> [u8; 16] {
	cryptogram(s_enc, rnd_b, rnd_a)
}

/// Cryptogram the panel answers with: E(S-ENC, RND.A || RND.B).
fn panel_cryptogram(s_enc: &[u8; KEY_LEN], rnd_a: &[u8; 8], rnd_b: &[u8; 8]) -> [u8; 16] {
	cryptogram(s_enc, rnd_a, rnd_b)
}

/// AES-MAC over `data`: CBC chain keyed with S-MAC1, final block keyed with
/// S-MAC2, initialized with the previous MAC. Unaligned data is padded with
/// a 0x80 marker and zeros.
fn mac_chain(keys: &SessionKeys, iv: &[u8; KEY_LEN], data: &[u8]) -> [u8; KEY_LEN] {
	let mut padded = data.to_vec();
	if padded.is_empty() || padded.len() % 16 != 0 {
		padded.push(0x80);
		while padded.len() % 16 != 0 {
			padded.push(0x00);
		}
	}

	let blocks = padded.len() / 16;
	let mut chain = *iv;
	for (index, block) in padded.chunks_exact(16).enumerate() {
		for (c, b) in chain.iter_mut().zip(block) {
			*c ^= *b;
		}
		let key = if index == blocks - 1 {
			&keys.s_mac2
		} else {
			&keys.s_mac1
		};
		chain = ecb_encrypt(key, chain);
	}
	chain
}
