//! Block ciphers used for the encrypted payload

use crate::error::{Error, Result};
use aes::Aes256;
use cipher::block_padding::Pkcs7;
use cipher::{BlockDecryptMut, BlockEncryptMut, InnerIvInit, KeyInit, KeyIvInit, StreamCipher};
use twofish::Twofish;
use uuid::{uuid, Uuid};

pub const CIPHER_AES256: Uuid = uuid!("31c1f2e6-bf71-4350-be58-05216afc5aff");
pub const CIPHER_TWOFISH: Uuid = uuid!("ad68f29f-576f-4bb9-a36a-d47af965346c");
pub const CIPHER_CHACHA20: Uuid = uuid!("d6038a2b-8b6f-4cb5-a524-339a31dbb59a");

/// The cipher protecting the database payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataCipher {
    #[default]
    Aes256,
    Twofish,
    /// KDBX 4 only
    ChaCha20,
}

impl DataCipher {
    pub fn from_uuid(uuid: &Uuid) -> Result<Self> {
        match *uuid {
            CIPHER_AES256 => Ok(DataCipher::Aes256),
            CIPHER_TWOFISH => Ok(DataCipher::Twofish),
            CIPHER_CHACHA20 => Ok(DataCipher::ChaCha20),
            other => Err(Error::UnsupportedCipher(other.to_string())),
        }
    }

    pub fn uuid(&self) -> Uuid {
        match self {
            DataCipher::Aes256 => CIPHER_AES256,
            DataCipher::Twofish => CIPHER_TWOFISH,
            DataCipher::ChaCha20 => CIPHER_CHACHA20,
        }
    }

    pub fn iv_len(&self) -> usize {
        match self {
            DataCipher::ChaCha20 => 12,
            _ => 16,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DataCipher::Aes256 => "AES-256",
            DataCipher::Twofish => "Twofish",
            DataCipher::ChaCha20 => "ChaCha20",
        }
    }

    /// Encrypt `plain`; block ciphers run in CBC mode with PKCS#7 padding
    pub fn encrypt(&self, key: &[u8; 32], iv: &[u8], plain: &[u8]) -> Result<Vec<u8>> {
        match self {
            DataCipher::Aes256 => {
                let enc = cbc::Encryptor::<Aes256>::new_from_slices(key, iv)
                    .map_err(|_| Error::InvalidHeader("AES init failed".to_string()))?;
                Ok(enc.encrypt_padded_vec_mut::<Pkcs7>(plain))
            }
            DataCipher::Twofish => {
                let tf = Twofish::new_from_slice(key)
                    .map_err(|_| Error::InvalidHeader("Twofish init failed".to_string()))?;
                let enc = cbc::Encryptor::<Twofish>::inner_iv_slice_init(tf, iv)
                    .map_err(|_| Error::InvalidHeader("Twofish IV has wrong length".to_string()))?;
                Ok(enc.encrypt_padded_vec_mut::<Pkcs7>(plain))
            }
            DataCipher::ChaCha20 => {
                let mut out = plain.to_vec();
                chacha(key, iv)?.apply_keystream(&mut out);
                Ok(out)
            }
        }
    }

    /// Decrypt `data`. A padding failure is indistinguishable from a wrong key.
    pub fn decrypt(&self, key: &[u8; 32], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        match self {
            DataCipher::Aes256 => {
                let dec = cbc::Decryptor::<Aes256>::new_from_slices(key, iv)
                    .map_err(|_| Error::InvalidHeader("AES init failed".to_string()))?;
                dec.decrypt_padded_vec_mut::<Pkcs7>(data)
                    .map_err(|_| Error::WrongKeyOrCorruptFile)
            }
            DataCipher::Twofish => {
                let tf = Twofish::new_from_slice(key)
                    .map_err(|_| Error::InvalidHeader("Twofish init failed".to_string()))?;
                let dec = cbc::Decryptor::<Twofish>::inner_iv_slice_init(tf, iv)
                    .map_err(|_| Error::InvalidHeader("Twofish IV has wrong length".to_string()))?;
                dec.decrypt_padded_vec_mut::<Pkcs7>(data)
                    .map_err(|_| Error::WrongKeyOrCorruptFile)
            }
            DataCipher::ChaCha20 => {
                let mut out = data.to_vec();
                chacha(key, iv)?.apply_keystream(&mut out);
                Ok(out)
            }
        }
    }
}

fn chacha(key: &[u8; 32], iv: &[u8]) -> Result<chacha20::ChaCha20> {
    chacha20::ChaCha20::new_from_slices(key, iv)
        .map_err(|_| Error::InvalidHeader("ChaCha20 nonce must be 12 bytes".to_string()))
}
