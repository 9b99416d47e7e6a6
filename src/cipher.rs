//! NIP-04 payload encryption between two identities.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::Rng;
use secp256k1::{ecdh, Parity, PublicKey, SecretKey};

use crate::error::{Error, Result};
use crate::identity;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Symmetric key shared between two identities.
///
/// The x coordinate of the ECDH point, unhashed, as NIP-04 defines it. The
/// same value comes out on both sides regardless of which party derives it:
/// lifting the x-only peer key to even parity at worst negates the point,
/// which leaves the x coordinate untouched.
pub fn shared_secret(secret: &SecretKey, their_pub_hex: &str) -> Result<[u8; 32]> {
    let xonly = identity::parse_public_key(their_pub_hex)?;
    let full = PublicKey::from_x_only_public_key(xonly, Parity::Even);
    let point = ecdh::shared_secret_point(&full, secret);
    let mut key = [0u8; 32];
    key.copy_from_slice(&point[..32]);
    Ok(key)
}

/// Encrypt a message into a `base64(ct)?iv=base64(iv)` envelope.
///
/// A fresh random IV is drawn on every call; the envelope carries it so the
/// receiver needs no side-channel state.
pub fn encrypt(shared: &[u8; 32], plaintext: &str) -> String {
    let iv: [u8; 16] = rand::thread_rng().gen();
    let ct = Aes256CbcEnc::new(shared.into(), &iv.into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
    format!("{}?iv={}", BASE64.encode(ct), BASE64.encode(iv))
}

/// Decrypt a NIP-04 envelope produced by [`encrypt`].
pub fn decrypt(shared: &[u8; 32], envelope: &str) -> Result<String> {
    let (ct_b64, iv_b64) = envelope
        .split_once("?iv=")
        .ok_or_else(|| Error::Decryption("missing iv separator".into()))?;
    let ct = BASE64
        .decode(ct_b64)
        .map_err(|e| Error::Decryption(format!("ciphertext base64: {e}")))?;
    let iv_bytes = BASE64
        .decode(iv_b64)
        .map_err(|e| Error::Decryption(format!("iv base64: {e}")))?;
    let iv: [u8; 16] = iv_bytes
        .try_into()
        .map_err(|_| Error::Decryption("iv is not 16 bytes".into()))?;
    let pt = Aes256CbcDec::new(shared.into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(&ct)
        .map_err(|_| Error::Decryption("bad padding".into()))?;
    String::from_utf8(pt).map_err(|_| Error::Decryption("plaintext is not utf-8".into()))
}
