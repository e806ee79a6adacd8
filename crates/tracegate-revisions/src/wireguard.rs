//! WireGuard keypair generation. The original shelled out to the `wg`
//! binary; here the keys are generated in-process with `x25519-dalek`,
//! following the same base64-encoding convention as WireGuard's own wire
//! format (see `other_examples`' junkNAS controller for the precedent).

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use x25519_dalek::{PublicKey, StaticSecret};

pub struct WireguardKeypair {
	pub private_key_b64: String,
	pub public_key_b64: String,
}

pub fn generate_keypair() -> WireguardKeypair {
	let secret = StaticSecret::random();
	let public = PublicKey::from(&secret);
	WireguardKeypair { private_key_b64: STANDARD.encode(secret.to_bytes()), public_key_b64: STANDARD.encode(public.to_bytes()) }
}

pub fn generate_preshared_key() -> String {
	let secret = StaticSecret::random();
	STANDARD.encode(secret.to_bytes())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn keys_are_32_bytes_base64() {
		let kp = generate_keypair();
		assert_eq!(STANDARD.decode(&kp.private_key_b64).unwrap().len(), 32);
		assert_eq!(STANDARD.decode(&kp.public_key_b64).unwrap().len(), 32);
		assert_ne!(kp.private_key_b64, kp.public_key_b64);
	}
}
