use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};

use crate::auth::AuthError;

pub const KEY_BYTES: usize = 32;
const NONCE_BYTES: usize = 12;
const ENVELOPE_VERSION: u8 = 1;

/// On-disk shape of an encrypted credential record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct EncryptedEnvelope {
    version: u8,
    nonce_hex: String,
    ciphertext_hex: String,
}

pub(crate) fn seal(plaintext: &[u8], key: &[u8; KEY_BYTES]) -> Result<String, AuthError> {
    let key = aead_key(key)?;

    let mut nonce_bytes = [0u8; NONCE_BYTES];
    SystemRandom::new()
        .fill(&mut nonce_bytes)
        .map_err(|_| AuthError::Crypto("generate random nonce".to_string()))?;

    let mut buffer = plaintext.to_vec();
    key.seal_in_place_append_tag(
        Nonce::assume_unique_for_key(nonce_bytes),
        Aad::empty(),
        &mut buffer,
    )
    .map_err(|_| AuthError::Crypto("encrypt credential record".to_string()))?;

    let envelope = EncryptedEnvelope {
        version: ENVELOPE_VERSION,
        nonce_hex: hex_encode(&nonce_bytes),
        ciphertext_hex: hex_encode(&buffer),
    };
    Ok(serde_json::to_string(&envelope)?)
}

pub(crate) fn open(raw: &str, key: &[u8; KEY_BYTES]) -> Result<Vec<u8>, AuthError> {
    let envelope: EncryptedEnvelope = serde_json::from_str(raw)?;
    if envelope.version != ENVELOPE_VERSION {
        return Err(AuthError::Crypto(format!(
            "unsupported envelope version {}",
            envelope.version
        )));
    }

    let nonce_bytes: [u8; NONCE_BYTES] = hex_decode(&envelope.nonce_hex)?
        .try_into()
        .map_err(|_| AuthError::Crypto("invalid nonce length".to_string()))?;
    let mut ciphertext = hex_decode(&envelope.ciphertext_hex)?;

    let plaintext = aead_key(key)?
        .open_in_place(
            Nonce::assume_unique_for_key(nonce_bytes),
            Aad::empty(),
            &mut ciphertext,
        )
        .map_err(|_| AuthError::Crypto("decrypt credential record".to_string()))?;
    Ok(plaintext.to_vec())
}

pub(crate) fn is_envelope(raw: &str) -> bool {
    serde_json::from_str::<EncryptedEnvelope>(raw).is_ok()
}

pub fn parse_key_hex(raw: &str) -> Result<[u8; KEY_BYTES], AuthError> {
    hex_decode(raw)?
        .try_into()
        .map_err(|_| AuthError::Crypto("credential key must be 32 bytes".to_string()))
}

fn aead_key(key: &[u8; KEY_BYTES]) -> Result<LessSafeKey, AuthError> {
    let unbound = UnboundKey::new(&AES_256_GCM, key)
        .map_err(|_| AuthError::Crypto("construct AES-256-GCM key".to_string()))?;
    Ok(LessSafeKey::new(unbound))
}

fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0f) as usize] as char);
    }
    out
}

fn hex_decode(raw: &str) -> Result<Vec<u8>, AuthError> {
    let bytes = raw.trim().as_bytes();
    if bytes.len() % 2 != 0 {
        return Err(AuthError::Crypto("hex string length must be even".to_string()));
    }

    bytes
        .chunks(2)
        .map(|pair| match (nibble(pair[0]), nibble(pair[1])) {
            (Some(hi), Some(lo)) => Ok((hi << 4) | lo),
            _ => Err(AuthError::Crypto("invalid hex digit".to_string())),
        })
        .collect()
}

fn nibble(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}
