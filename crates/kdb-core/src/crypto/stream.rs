//! Inner random streams used to obfuscate protected XML values
//!
//! A single stream instance covers the whole document, so callers must feed it
//! values in exactly the order they appear in the XML.

use crate::crypto::{sha256, sha512};
use crate::error::{Error, Result};
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use salsa20::Salsa20;
use zeroize::{Zeroize, ZeroizeOnDrop};

const SALSA20_NONCE: [u8; 8] = [0xE8, 0x30, 0x09, 0x4B, 0x97, 0x20, 0x5D, 0x2A];

/// Algorithm id as stored in the header / inner header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InnerStreamAlgorithm {
    None,
    ArcFourVariant,
    Salsa20,
    ChaCha20,
}

impl InnerStreamAlgorithm {
    pub fn from_id(id: u32) -> Result<Self> {
        match id {
            0 => Ok(Self::None),
            1 => Ok(Self::ArcFourVariant),
            2 => Ok(Self::Salsa20),
            3 => Ok(Self::ChaCha20),
            other => Err(Error::InvalidHeader(format!(
                "Unknown inner random stream id {}",
                other
            ))),
        }
    }

    pub fn id(&self) -> u32 {
        match self {
            Self::None => 0,
            Self::ArcFourVariant => 1,
            Self::Salsa20 => 2,
            Self::ChaCha20 => 3,
        }
    }
}

/// A running keystream over the protected values of one document
pub enum InnerStream {
    None,
    ArcFour(ArcFourVariant),
    Salsa20(Box<Salsa20>),
    ChaCha20(Box<ChaCha20>),
}

impl InnerStream {
    pub fn new(algorithm: InnerStreamAlgorithm, key: &[u8]) -> Result<Self> {
        match algorithm {
            InnerStreamAlgorithm::None => Ok(InnerStream::None),
            InnerStreamAlgorithm::ArcFourVariant => {
                if key.is_empty() {
                    return Err(Error::InvalidHeader("Empty inner stream key".to_string()));
                }
                Ok(InnerStream::ArcFour(ArcFourVariant::new(key)))
            }
            InnerStreamAlgorithm::Salsa20 => {
                let key = sha256(&[key]);
                Ok(InnerStream::Salsa20(Box::new(Salsa20::new(
                    &key.into(),
                    &SALSA20_NONCE.into(),
                ))))
            }
            InnerStreamAlgorithm::ChaCha20 => {
                let hash = sha512(&[key]);
                let key: [u8; 32] = hash[0..32]
                    .try_into()
                    .map_err(|_| Error::InvalidHeader("Invalid key length".to_string()))?;
                let nonce: [u8; 12] = hash[32..44]
                    .try_into()
                    .map_err(|_| Error::InvalidHeader("Invalid nonce length".to_string()))?;
                Ok(InnerStream::ChaCha20(Box::new(ChaCha20::new(
                    &key.into(),
                    &nonce.into(),
                ))))
            }
        }
    }

    /// XOR `data` with the next `data.len()` keystream bytes
    pub fn process(&mut self, data: &mut [u8]) {
        match self {
            InnerStream::None => {}
            InnerStream::ArcFour(rc4) => rc4.apply_keystream(data),
            InnerStream::Salsa20(s) => s.apply_keystream(data),
            InnerStream::ChaCha20(c) => c.apply_keystream(data),
        }
    }
}

/// RC4 with the first 512 keystream bytes thrown away
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct ArcFourVariant {
    state: [u8; 256],
    i: u8,
    j: u8,
}

impl ArcFourVariant {
    pub fn new(key: &[u8]) -> Self {
        Self::with_discard(key, 512)
    }

    fn with_discard(key: &[u8], discard: usize) -> Self {
        let mut state = [0u8; 256];
        for (i, s) in state.iter_mut().enumerate() {
            *s = i as u8;
        }
        let mut j: u8 = 0;
        for i in 0..256 {
            j = j.wrapping_add(state[i]).wrapping_add(key[i % key.len()]);
            state.swap(i, j as usize);
        }
        let mut rc4 = Self { state, i: 0, j: 0 };
        let mut skipped = vec![0u8; discard];
        rc4.apply_keystream(&mut skipped);
        rc4
    }

    pub fn apply_keystream(&mut self, data: &mut [u8]) {
        for byte in data.iter_mut() {
            self.i = self.i.wrapping_add(1);
            self.j = self.j.wrapping_add(self.state[self.i as usize]);
            self.state.swap(self.i as usize, self.j as usize);
            let idx = self.state[self.i as usize].wrapping_add(self.state[self.j as usize]);
            *byte ^= self.state[idx as usize];
        }
    }
}
