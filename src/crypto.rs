//! Payload encryption for the hub command channel.
//! AES-128 in CBC mode with the vendor's fixed IV and zero-byte padding.

use crate::error::{BroadlinkError, Result};
use aes::Aes128;
use cipher::generic_array::GenericArray;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};

type CbcEncryptor = cbc::Encryptor<Aes128>;
type CbcDecryptor = cbc::Decryptor<Aes128>;

/// Cipher block size in bytes.
pub const BLOCK_SIZE: usize = 16;

/// Key every device accepts before the authentication exchange.
pub const DEFAULT_KEY: [u8; 16] = [
    0x09, 0x76, 0x28, 0x34, 0x3f, 0xe9, 0x9e, 0x23, 0x76, 0x5c, 0x15, 0x13, 0xac, 0xcf, 0x8b, 0x02,
];

/// Fixed initialization vector shared by all devices.
pub const FIXED_IV: [u8; 16] = [
    0x56, 0x2e, 0x17, 0x99, 0x6d, 0x09, 0x3d, 0x28, 0xdd, 0xb3, 0xba, 0x69, 0x5a, 0x2e, 0x6f, 0x58,
];

/// Number of filler bytes needed to bring `len` up to a whole block.
pub fn padding_len(len: usize) -> usize {
    (BLOCK_SIZE - len % BLOCK_SIZE) % BLOCK_SIZE
}

/// BroadlinkCipher holds one 16-byte session key.
pub struct BroadlinkCipher {
    key: [u8; 16],
}

impl BroadlinkCipher {
    /// Create a new cipher with a 16-byte key.
    pub fn new(key: &[u8]) -> Result<Self> {
        let key: [u8; 16] = key.try_into().map_err(|_| {
            BroadlinkError::InvalidArgument(format!(
                "encryption key must be {} bytes, got {}",
                BLOCK_SIZE,
                key.len()
            ))
        })?;
        Ok(Self { key })
    }

    /// Encrypt data, padding it with zero bytes to the block size.
    pub fn encrypt(&self, data: &[u8]) -> Vec<u8> {
        let mut buf = data.to_vec();
        buf.resize(data.len() + padding_len(data.len()), 0);

        let mut encryptor = CbcEncryptor::new(&self.key.into(), &FIXED_IV.into());
        for chunk in buf.chunks_mut(BLOCK_SIZE) {
            encryptor.encrypt_block_mut(GenericArray::from_mut_slice(chunk));
        }
        buf
    }

    /// Decrypt data. Padding is left in place; callers strip it when they know
    /// the original length.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if !data.len().is_multiple_of(BLOCK_SIZE) {
            return Err(BroadlinkError::InvalidPacket(format!(
                "encrypted body of {} bytes is not block aligned",
                data.len()
            )));
        }

        let mut buf = data.to_vec();
        let mut decryptor = CbcDecryptor::new(&self.key.into(), &FIXED_IV.into());
        for chunk in buf.chunks_mut(BLOCK_SIZE) {
            decryptor.decrypt_block_mut(GenericArray::from_mut_slice(chunk));
        }
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_short_keys() {
        assert!(BroadlinkCipher::new(&[0u8; 8]).is_err());
    }

    #[test]
    fn pads_to_block_size_and_restores_plaintext() {
        let cipher = BroadlinkCipher::new(&DEFAULT_KEY).unwrap();
        let data = b"relay state query";
        let encrypted = cipher.encrypt(data);
        assert_eq!(encrypted.len(), 32);

        let decrypted = cipher.decrypt(&encrypted).unwrap();
        assert_eq!(&decrypted[..data.len()], data);
        assert!(decrypted[data.len()..].iter().all(|&b| b == 0));
    }

    #[test]
    fn chains_blocks() {
        // Identical plaintext blocks must not produce identical ciphertext in CBC.
        let cipher = BroadlinkCipher::new(&DEFAULT_KEY).unwrap();
        let encrypted = cipher.encrypt(&[0xAB; 32]);
        assert_ne!(encrypted[..16], encrypted[16..]);
    }

    #[test]
    fn first_block_is_aes_of_plaintext_xor_iv() {
        use cipher::{BlockEncrypt, KeyInit};

        let cipher = BroadlinkCipher::new(&DEFAULT_KEY).unwrap();
        let encrypted = cipher.encrypt(&[0x42; 16]);

        let mut block = [0x42u8; 16];
        for (b, iv) in block.iter_mut().zip(FIXED_IV.iter()) {
            *b ^= iv;
        }
        let raw = Aes128::new(&DEFAULT_KEY.into());
        raw.encrypt_block(GenericArray::from_mut_slice(&mut block));
        assert_eq!(encrypted, block);
    }

    #[test]
    fn wrong_key_yields_garbage_not_error() {
        let cipher = BroadlinkCipher::new(&DEFAULT_KEY).unwrap();
        let other = BroadlinkCipher::new(&[7u8; 16]).unwrap();
        let encrypted = cipher.encrypt(&[1u8; 16]);
        let decrypted = other.decrypt(&encrypted).unwrap();
        assert_ne!(decrypted, vec![1u8; 16]);
    }

    #[test]
    fn unaligned_ciphertext_is_rejected() {
        let cipher = BroadlinkCipher::new(&DEFAULT_KEY).unwrap();
        assert!(cipher.decrypt(&[0u8; 15]).is_err());
    }
}
