//! Session keypair imported from a bech32 `nsec` secret.

use bech32::{Bech32, Hrp};
use secp256k1::{Keypair, Secp256k1, SecretKey, XOnlyPublicKey};
use zeroize::Zeroizing;

use crate::error::{Error, Result};

const NSEC_HRP: Hrp = Hrp::parse_unchecked("nsec");

/// A participant keypair, alive for one session.
///
/// The public key is derived from the secret on import and exposed as the
/// 64-char hex x-only form used in event `pubkey` fields and `p` tags. Secret
/// material is erased when the identity is dropped and never written anywhere.
pub struct Identity {
    keypair: Keypair,
    public_hex: String,
}

impl Identity {
    /// Import an identity from a bech32-encoded `nsec1...` secret key.
    pub fn from_nsec(text: &str) -> Result<Self> {
        let (hrp, data) =
            bech32::decode(text.trim()).map_err(|e| Error::Decode(format!("bad nsec: {e}")))?;
        if hrp != NSEC_HRP {
            return Err(Error::Decode(format!("unexpected prefix: {hrp}")));
        }
        let data = Zeroizing::new(data);
        if data.len() != 32 {
            return Err(Error::Decode(format!(
                "nsec payload is {} bytes, expected 32",
                data.len()
            )));
        }
        let sk = SecretKey::from_slice(&data).map_err(|_| Error::InvalidKey)?;
        Ok(Self::from_secret(sk))
    }

    /// Generate a fresh random identity, returning it with its encoded nsec.
    pub fn generate() -> Result<(Self, String)> {
        let sk = SecretKey::new(&mut rand::thread_rng());
        let bytes = Zeroizing::new(sk.secret_bytes());
        let nsec = bech32::encode::<Bech32>(NSEC_HRP, bytes.as_ref())
            .map_err(|e| Error::Decode(format!("nsec encoding: {e}")))?;
        Ok((Self::from_secret(sk), nsec))
    }

    fn from_secret(sk: SecretKey) -> Self {
        let secp = Secp256k1::new();
        let keypair = Keypair::from_secret_key(&secp, &sk);
        let public_hex = hex::encode(keypair.x_only_public_key().0.serialize());
        Self {
            keypair,
            public_hex,
        }
    }

    /// Hex x-only public key, a pure function of the secret.
    pub fn public_key(&self) -> &str {
        &self.public_hex
    }

    /// Signing keypair for event signatures and ECDH.
    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }
}

impl Drop for Identity {
    fn drop(&mut self) {
        self.keypair.non_secure_erase();
    }
}

/// Parse a hex x-only public key as used in `pubkey` fields and `p` tags.
pub fn parse_public_key(hex_key: &str) -> Result<XOnlyPublicKey> {
    let bytes = hex::decode(hex_key).map_err(|e| Error::Decode(format!("bad pubkey: {e}")))?;
    XOnlyPublicKey::from_slice(&bytes).map_err(|_| Error::Decode("bad pubkey".into()))
}
