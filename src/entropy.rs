//! Cryptographically secure random data generation.
//!
//! A ChaCha-based generator seeded once from the operating system's entropy
//! source backs all key and challenge material.

use std::sync::Mutex;

use rand_chacha::ChaCha20Rng;
use rand_chacha::rand_core::{RngCore, SeedableRng};
use rand_core::TryRngCore;
use thiserror::Error;

static POOL: Mutex<Option<ChaCha20Rng>> = Mutex::new(None);

#[derive(Debug, Error)]
#[error("system entropy source unavailable")]
pub struct EntropyError;

/// Fills `buf` with random data.
///
/// Fails only if the generator has not been seeded yet and the system
/// refuses to provide seed material.
pub fn fill(buf: &mut [u8]) -> Result<(), EntropyError> {
	let pool = &mut *POOL.lock().unwrap();
	let pool = match pool {
		Some(pool) => pool,
		pool @ None => {
			let mut seed = <ChaCha20Rng as SeedableRng>::Seed::default();
			rand_core::OsRng
				.try_fill_bytes(&mut seed)
				.map_err(|_| EntropyError)?;
			pool.insert(ChaCha20Rng::from_seed(seed))
		}
	};

	pool.fill_bytes(buf);
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn fills_are_distinct() {
		let mut a = [0u8; 16];
		let mut b = [0u8; 16];
		fill(&mut a).unwrap();
		fill(&mut b).unwrap();
		assert_ne!(a, b);
	}
}
