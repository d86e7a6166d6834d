//! Ephemeral Diffie-Hellman key exchange over the RFC 3526 2048-bit MODP group
//!
//! Every tunnel connection generates a fresh [`KeyPair`], swaps public values in
//! the hello exchange and feeds the fixed-width shared secret through
//! HKDF-SHA256 to obtain the 128-bit AES session key.

use hkdf::Hkdf;
use num_bigint::BigUint;
use rand::rngs::OsRng;
use sha2::Sha256;
use std::fmt;
use std::sync::OnceLock;

/// Size in bytes of every public value / shared secret on the wire
pub const PUBLIC_VALUE_LEN: usize = 2048 / 8;

/// AES-128 session key length
pub const SESSION_KEY_LEN: usize = 128 / 8;

/// Smallest private exponent accepted by the prime generator
pub const MIN_KEY_BITS: usize = 128;

/// Private exponent can never be wider than the modulus
pub const MAX_KEY_BITS: usize = 2048;

/// Default private exponent size (2x the ~112-bit strength of group 14)
pub const DEFAULT_KEY_BITS: usize = 256;

const HKDF_SALT: &[u8] = b"dnsproxy/tunnel/salt/v1";
const HKDF_INFO: &[u8] = b"dnsproxy/session-key";

/// RFC 3526 group 14 prime
const MODP_2048_HEX: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1",
    "29024E088A67CC74020BBEA63B139B22514A08798E3404DD",
    "EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245",
    "E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D",
    "C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F",
    "83655D23DCA3AD961C62F356208552BB9ED529077096966D",
    "670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B",
    "E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9",
    "DE2BCBF6955817183995497CEA956AE515D2261898FA0510",
    "15728E5A8AACAA68FFFFFFFFFFFFFFFF",
);

/// Key exchange errors
#[derive(Debug, thiserror::Error)]
pub enum KeyExchangeError {
    /// Private exponent size outside the supported range
    #[error("Invalid private key length {0} bits (expected {MIN_KEY_BITS}..={MAX_KEY_BITS})")]
    InvalidKeyBits(usize),

    /// Peer public value is degenerate or out of the group
    #[error("Peer public value out of range")]
    InvalidPublicValue,

    /// HKDF output length rejected
    #[error("Session key derivation failed")]
    KeyDerivation,
}

/// The 2048-bit safe prime `p`
pub fn modulus() -> &'static BigUint {
    static MODULUS: OnceLock<BigUint> = OnceLock::new();
    MODULUS.get_or_init(|| {
        BigUint::parse_bytes(MODP_2048_HEX.as_bytes(), 16).expect("MODP group 14 prime is valid hex")
    })
}

/// `p - 2`, the exclusive upper bound for private exponents
fn modulus_minus_two() -> &'static BigUint {
    static BOUND: OnceLock<BigUint> = OnceLock::new();
    BOUND.get_or_init(|| modulus() - 2u32)
}

fn generator() -> BigUint {
    BigUint::from(2u32)
}

/// Ephemeral key pair, generated once per connection
pub struct KeyPair {
    private_exponent: BigUint,
    public_value: BigUint,
}

impl KeyPair {
    /// `g^x mod p`
    pub fn public_value(&self) -> &BigUint {
        &self.public_value
    }

    pub(crate) fn private_exponent(&self) -> &BigUint {
        &self.private_exponent
    }

    /// Combine with the peer's public value. Consumes the pair: the private
    /// exponent must not outlive the shared secret derivation.
    pub fn into_shared_secret(self, peer_public: &BigUint) -> BigUint {
        derive_shared_secret(self.private_exponent(), peer_public)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let public = encode_fixed_width(&self.public_value);
        f.debug_struct("KeyPair")
            .field("public_value", &hex::encode(&public[..8]))
            .field("private_exponent", &"<redacted>")
            .finish()
    }
}

/// Generator of ephemeral key pairs with a fixed private exponent size
#[derive(Debug, Clone, Copy)]
pub struct KeyExchange {
    key_bits: usize,
}

impl Default for KeyExchange {
    fn default() -> Self {
        Self {
            key_bits: DEFAULT_KEY_BITS,
        }
    }
}

impl KeyExchange {
    /// Create a key exchange producing private exponents of `key_bits` bits
    pub fn new(key_bits: usize) -> Result<Self, KeyExchangeError> {
        if !(MIN_KEY_BITS..=MAX_KEY_BITS).contains(&key_bits) {
            return Err(KeyExchangeError::InvalidKeyBits(key_bits));
        }
        Ok(Self { key_bits })
    }

    pub fn key_bits(&self) -> usize {
        self.key_bits
    }

    /// Generate a fresh key pair.
    ///
    /// The private exponent is a probable prime with `1 < x < p - 2`;
    /// candidates outside that range are discarded and regenerated.
    pub fn generate(&self) -> KeyPair {
        let one = BigUint::from(1u32);
        loop {
            let candidate = match glass_pumpkin::prime::from_rng(self.key_bits, &mut OsRng) {
                Ok(prime) => prime,
                Err(e) => {
                    log::warn!("Prime generation failed, retrying: {}", e);
                    continue;
                }
            };

            if candidate <= one || candidate >= *modulus_minus_two() {
                continue;
            }

            let public_value = generator().modpow(&candidate, modulus());
            return KeyPair {
                private_exponent: candidate,
                public_value,
            };
        }
    }
}

/// `peer_public ^ private_exponent mod p`
pub fn derive_shared_secret(private_exponent: &BigUint, peer_public: &BigUint) -> BigUint {
    peer_public.modpow(private_exponent, modulus())
}

/// Reject public values that would collapse the shared secret (0, 1, p-1 and
/// anything outside the group).
pub fn validate_public_value(value: &BigUint) -> Result<(), KeyExchangeError> {
    let one = BigUint::from(1u32);
    if *value <= one || value > modulus_minus_two() {
        return Err(KeyExchangeError::InvalidPublicValue);
    }
    Ok(())
}

/// Big-endian encoding padded (or trimmed of leading zero bytes) to exactly
/// [`PUBLIC_VALUE_LEN`] bytes.
pub fn encode_fixed_width(n: &BigUint) -> [u8; PUBLIC_VALUE_LEN] {
    let bytes = n.to_bytes_be();
    let mut out = [0u8; PUBLIC_VALUE_LEN];
    if bytes.len() <= PUBLIC_VALUE_LEN {
        out[PUBLIC_VALUE_LEN - bytes.len()..].copy_from_slice(&bytes);
    } else {
        debug_assert!(bytes[..bytes.len() - PUBLIC_VALUE_LEN].iter().all(|b| *b == 0));
        out.copy_from_slice(&bytes[bytes.len() - PUBLIC_VALUE_LEN..]);
    }
    out
}

/// Inverse of [`encode_fixed_width`]; always non-negative
pub fn decode_fixed_width(bytes: &[u8]) -> BigUint {
    BigUint::from_bytes_be(bytes)
}

/// 128-bit AES key shared by both FrameCodec endpoints of one connection
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey([u8; SESSION_KEY_LEN]);

impl SessionKey {
    pub fn from_bytes(bytes: [u8; SESSION_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(<redacted>)")
    }
}

/// HKDF-Extract/Expand (HMAC-SHA256) of the input keying material with the
/// application salt and info string.
pub fn derive_session_key(ikm: &[u8]) -> Result<SessionKey, KeyExchangeError> {
    let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), ikm);
    let mut okm = [0u8; SESSION_KEY_LEN];
    hk.expand(HKDF_INFO, &mut okm)
        .map_err(|_| KeyExchangeError::KeyDerivation)?;
    Ok(SessionKey(okm))
}

/// Shared secret of `pair` and `peer_public`, run through HKDF
pub fn session_key_for(pair: KeyPair, peer_public: &BigUint) -> Result<SessionKey, KeyExchangeError> {
    let shared = pair.into_shared_secret(peer_public);
    derive_session_key(&encode_fixed_width(&shared))
}
