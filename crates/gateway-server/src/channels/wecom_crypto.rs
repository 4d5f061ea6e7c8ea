//! WeCom callback message crypto (signature, AES-256-CBC envelope)

use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, KeyIvInit};
use base64::alphabet;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::engine::{GeneralPurpose, GeneralPurposeConfig};
use base64::Engine as _;
use sha1::{Digest, Sha1};
use subtle::ConstantTimeEq;
use thiserror::Error;

use vg_core::VerificationError;

type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
#[cfg(test)]
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;

/// EncodingAESKey is 43 chars of base64 whose last symbol carries spare bits.
const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_allow_trailing_bits(true),
);

const PAD_BLOCK: usize = 32;
const RANDOM_PREFIX: usize = 16;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("EncodingAESKey must decode to 32 bytes")]
    InvalidKey,
    #[error("invalid base64: {0}")]
    Base64(String),
    #[error("ciphertext length {0} is not a whole number of blocks")]
    BlockLength(usize),
    #[error("bad padding")]
    Padding,
    #[error("plaintext is truncated")]
    Truncated,
    #[error("message is not UTF-8")]
    Utf8,
    #[error("receiver id mismatch")]
    ReceiverMismatch,
}

impl From<CryptoError> for VerificationError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::ReceiverMismatch => VerificationError::ReceiverMismatch,
            other => VerificationError::Decrypt(other.to_string()),
        }
    }
}

pub struct WeComCrypto {
    token: String,
    key: [u8; 32],
    receiver_id: String,
}

impl WeComCrypto {
    pub fn new(
        token: impl Into<String>,
        encoding_aes_key: &str,
        receiver_id: impl Into<String>,
    ) -> Result<Self, CryptoError> {
        let decoded = LENIENT_BASE64
            .decode(format!("{}=", encoding_aes_key.trim()))
            .map_err(|err| CryptoError::Base64(err.to_string()))?;
        let key: [u8; 32] = decoded.try_into().map_err(|_| CryptoError::InvalidKey)?;

        Ok(Self {
            token: token.into(),
            key,
            receiver_id: receiver_id.into(),
        })
    }

    /// Hex SHA1 over the sorted concatenation of token, timestamp, nonce
    /// and ciphertext.
    pub fn signature(&self, timestamp: &str, nonce: &str, encrypted: &str) -> String {
        let mut parts = [self.token.as_str(), timestamp, nonce, encrypted];
        parts.sort_unstable();

        let mut hasher = Sha1::new();
        for part in parts {
            hasher.update(part.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    pub fn verify_signature(
        &self,
        signature: &str,
        timestamp: &str,
        nonce: &str,
        encrypted: &str,
    ) -> bool {
        let expected = self.signature(timestamp, nonce, encrypted);
        expected
            .as_bytes()
            .ct_eq(signature.to_ascii_lowercase().as_bytes())
            .into()
    }

    /// Decrypt a base64 ciphertext and return the embedded message.
    pub fn decrypt(&self, encrypted: &str) -> Result<String, CryptoError> {
        let mut buf = BASE64
            .decode(encrypted.trim())
            .map_err(|err| CryptoError::Base64(err.to_string()))?;
        if buf.is_empty() || buf.len() % 16 != 0 {
            return Err(CryptoError::BlockLength(buf.len()));
        }

        let cipher = Aes256CbcDec::new_from_slices(&self.key, &self.key[..16])
            .map_err(|_| CryptoError::InvalidKey)?;
        let plain = cipher
            .decrypt_padded_mut::<NoPadding>(&mut buf)
            .map_err(|_| CryptoError::Padding)?;
        let plain = pkcs7_unpad(plain)?;

        if plain.len() < RANDOM_PREFIX + 4 {
            return Err(CryptoError::Truncated);
        }
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&plain[RANDOM_PREFIX..RANDOM_PREFIX + 4]);
        let msg_len = u32::from_be_bytes(len_bytes) as usize;

        let msg_start = RANDOM_PREFIX + 4;
        let msg_end = msg_start
            .checked_add(msg_len)
            .filter(|end| *end <= plain.len())
            .ok_or(CryptoError::Truncated)?;

        let receiver = &plain[msg_end..];
        if !self.receiver_id.is_empty() && receiver != self.receiver_id.as_bytes() {
            return Err(CryptoError::ReceiverMismatch);
        }

        String::from_utf8(plain[msg_start..msg_end].to_vec()).map_err(|_| CryptoError::Utf8)
    }
}

#[cfg(test)]
impl WeComCrypto {
    /// Encrypt `message` for this receiver, the way the platform does.
    pub fn encrypt(&self, message: &str) -> Result<String, CryptoError> {
        use aes::cipher::BlockEncryptMut;

        let random: [u8; RANDOM_PREFIX] = rand::random();
        let msg_len = u32::try_from(message.len()).map_err(|_| CryptoError::Truncated)?;

        let mut buf = Vec::with_capacity(RANDOM_PREFIX + 4 + message.len() + PAD_BLOCK);
        buf.extend_from_slice(&random);
        buf.extend_from_slice(&msg_len.to_be_bytes());
        buf.extend_from_slice(message.as_bytes());
        buf.extend_from_slice(self.receiver_id.as_bytes());
        pkcs7_pad(&mut buf);

        let len = buf.len();
        let cipher = Aes256CbcEnc::new_from_slices(&self.key, &self.key[..16])
            .map_err(|_| CryptoError::InvalidKey)?;
        let encrypted = cipher
            .encrypt_padded_mut::<NoPadding>(&mut buf, len)
            .map_err(|_| CryptoError::Padding)?;
        Ok(BASE64.encode(encrypted))
    }
}

#[cfg(test)]
fn pkcs7_pad(buf: &mut Vec<u8>) {
    let pad = PAD_BLOCK - buf.len() % PAD_BLOCK;
    buf.extend(std::iter::repeat(pad as u8).take(pad));
}

fn pkcs7_unpad(buf: &[u8]) -> Result<&[u8], CryptoError> {
    let pad = *buf.last().ok_or(CryptoError::Padding)? as usize;
    if pad == 0 || pad > PAD_BLOCK || pad > buf.len() {
        return Err(CryptoError::Padding);
    }
    Ok(&buf[..buf.len() - pad])
}
