//! QR credential codec: Base64 text → AES-128-ECB ciphertext → plaintext.
//!
//! Payload format: the QR symbol carries Base64 text. Decoded, it is a whole
//! number of 16-byte AES blocks, each encrypted independently (ECB) with the
//! terminal's shared 128-bit key. There is no integrity check, so corrupted
//! ciphertext decrypts to garbage rather than failing.
//!
//! The codec does not strip padding; see [`Plaintext::credential_bytes`].

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, KeyInit};
use aes::Aes128;
use base64::engine::general_purpose::STANDARD;
use base64::{DecodeSliceError, Engine};
use heapless::Vec;

/// AES block size in bytes.
pub const BLOCK_SIZE: usize = 16;
/// Decode buffer bound for one credential.
pub const MAX_CIPHERTEXT_LEN: usize = 128;
/// AES-128 key length in bytes.
pub const KEY_LEN: usize = 16;

// Base64 length estimates overshoot by up to two bytes; decode into a little
// slack so an exactly-full payload is not rejected.
const DECODE_SCRATCH_LEN: usize = MAX_CIPHERTEXT_LEN + 3;

/// Handling of a decoded length that is not a multiple of [`BLOCK_SIZE`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockMode {
    /// Drop the trailing partial block and decrypt the rest.
    Lenient,
    /// Reject the payload.
    Strict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("credential is not valid base64")]
    Base64Invalid,
    #[error("credential decodes to more than {MAX_CIPHERTEXT_LEN} bytes")]
    Overflow,
    #[error("ciphertext length {0} is not a multiple of {BLOCK_SIZE}")]
    UnalignedCiphertext(usize),
    #[error("credential holds no complete cipher block")]
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("AES key must be {KEY_LEN} bytes, got {0}")]
pub struct InvalidKeyLength(pub usize);

/// Decrypted credential bytes, exactly as long as the decrypted ciphertext.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Plaintext {
    bytes: Vec<u8, MAX_CIPHERTEXT_LEN>,
}

impl Plaintext {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Plaintext with trailing NUL fill or PKCS#7 padding removed.
    ///
    /// Credentials are printable text, so a final byte in 1..=16 repeated that
    /// many times can only be padding.
    pub fn credential_bytes(&self) -> &[u8] {
        let mut bytes: &[u8] = &self.bytes;
        if let Some(&last) = bytes.last() {
            let pad = last as usize;
            if (1..=BLOCK_SIZE).contains(&pad)
                && pad <= bytes.len()
                && bytes[bytes.len() - pad..].iter().all(|&b| b == last)
            {
                bytes = &bytes[..bytes.len() - pad];
            }
        }
        while let Some((&0, rest)) = bytes.split_last() {
            bytes = rest;
        }
        bytes
    }
}

/// Stateless QR credential decoder holding the shared key.
#[derive(Clone)]
pub struct CipherCodec {
    cipher: Aes128,
    mode: BlockMode,
}

impl core::fmt::Debug for CipherCodec {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        // Never print key material.
        f.debug_struct("CipherCodec").field("mode", &self.mode).finish_non_exhaustive()
    }
}

impl CipherCodec {
    pub fn new(key: &[u8; KEY_LEN], mode: BlockMode) -> Self {
        Self {
            cipher: Aes128::new(GenericArray::from_slice(key)),
            mode,
        }
    }

    /// Build a codec from an ASCII key such as the compile-time `TERMINAL_AES_KEY`.
    pub fn from_ascii_key(key: &str, mode: BlockMode) -> Result<Self, InvalidKeyLength> {
        let key: &[u8; KEY_LEN] = key
            .as_bytes()
            .try_into()
            .map_err(|_| InvalidKeyLength(key.len()))?;
        Ok(Self::new(key, mode))
    }

    pub fn mode(&self) -> BlockMode {
        self.mode
    }

    /// Decode a scanned QR text into the decrypted credential.
    pub fn decode_credential(&self, raw_text: &str) -> Result<Plaintext, DecodeError> {
        let mut scratch = [0u8; DECODE_SCRATCH_LEN];
        let decoded_len = match STANDARD.decode_slice(raw_text.trim().as_bytes(), &mut scratch) {
            Ok(len) => len,
            Err(DecodeSliceError::OutputSliceTooSmall) => return Err(DecodeError::Overflow),
            Err(DecodeSliceError::DecodeError(e)) => {
                log::warn!("cipher: base64 decode failed: {:?}", e);
                return Err(DecodeError::Base64Invalid);
            }
        };
        if decoded_len > MAX_CIPHERTEXT_LEN {
            return Err(DecodeError::Overflow);
        }

        let aligned_len = decoded_len - decoded_len % BLOCK_SIZE;
        if aligned_len != decoded_len {
            match self.mode {
                BlockMode::Strict => return Err(DecodeError::UnalignedCiphertext(decoded_len)),
                BlockMode::Lenient => log::warn!(
                    "cipher: dropping {} trailing bytes of partial block",
                    decoded_len - aligned_len
                ),
            }
        }
        if aligned_len == 0 {
            return Err(DecodeError::Empty);
        }

        let mut bytes = Vec::new();
        for chunk in scratch[..aligned_len].chunks_exact(BLOCK_SIZE) {
            let mut block = GenericArray::clone_from_slice(chunk);
            self.cipher.decrypt_block(&mut block);
            // Capacity is MAX_CIPHERTEXT_LEN and aligned_len never exceeds it.
            let _ = bytes.extend_from_slice(&block);
        }
        Ok(Plaintext { bytes })
    }
}
