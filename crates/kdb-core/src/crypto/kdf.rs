//! Key transformation: the deliberately slow step between the composite key
//! and the final encryption key.

use crate::crypto::{random_vec, sha256};
use crate::error::{Error, Result};
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes256Enc;
use argon2::{Algorithm, Argon2, Params, Version};
use uuid::{uuid, Uuid};
use zeroize::Zeroize;

pub const KDF_AES: Uuid = uuid!("c9d9f39a-628a-4460-bf74-0d08c18a4fea");
pub const KDF_ARGON2D: Uuid = uuid!("ef636ddf-8c29-444b-91f7-a9a403e30a0c");
pub const KDF_ARGON2ID: Uuid = uuid!("9e298b19-56db-4773-b23d-fc3ec6f0a1e6");

/// Rounds between two progress reports of the AES transform
const PROGRESS_CHUNK: u64 = 10_000;

pub const DEFAULT_KDBX_ROUNDS: u64 = 6000;
pub const DEFAULT_KDB_ROUNDS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Argon2Variant {
    Argon2d,
    Argon2id,
}

/// Parameters of the key transformation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KdfParameters {
    Aes {
        rounds: u64,
        seed: Vec<u8>,
    },
    Argon2 {
        variant: Argon2Variant,
        salt: Vec<u8>,
        /// Memory cost in bytes
        memory: u64,
        iterations: u64,
        parallelism: u32,
        version: u32,
    },
}

impl Default for KdfParameters {
    fn default() -> Self {
        KdfParameters::Aes {
            rounds: DEFAULT_KDBX_ROUNDS,
            seed: random_vec(32),
        }
    }
}

impl KdfParameters {
    pub fn aes(rounds: u64) -> Self {
        KdfParameters::Aes {
            rounds,
            seed: random_vec(32),
        }
    }

    /// Argon2d with the parameters KeePass proposes for new databases
    pub fn argon2_default() -> Self {
        KdfParameters::Argon2 {
            variant: Argon2Variant::Argon2d,
            salt: random_vec(32),
            memory: 64 * 1024 * 1024,
            iterations: 2,
            parallelism: 2,
            version: 0x13,
        }
    }

    pub fn uuid(&self) -> Uuid {
        match self {
            KdfParameters::Aes { .. } => KDF_AES,
            KdfParameters::Argon2 {
                variant: Argon2Variant::Argon2d,
                ..
            } => KDF_ARGON2D,
            KdfParameters::Argon2 {
                variant: Argon2Variant::Argon2id,
                ..
            } => KDF_ARGON2ID,
        }
    }

    /// Work factor shown to users: rounds for AES, iterations for Argon2
    pub fn rounds(&self) -> u64 {
        match self {
            KdfParameters::Aes { rounds, .. } => *rounds,
            KdfParameters::Argon2 { iterations, .. } => *iterations,
        }
    }

    /// Draw a fresh seed or salt; called on every save
    pub fn randomize(&mut self) {
        match self {
            KdfParameters::Aes { seed, .. } => *seed = random_vec(32),
            KdfParameters::Argon2 { salt, .. } => *salt = random_vec(salt.len().max(16)),
        }
    }

    /// Transform the composite key.
    ///
    /// `progress` receives `(done, total)` while the AES rounds run.
    pub fn derive(
        &self,
        composite: &[u8; 32],
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<[u8; 32]> {
        match self {
            KdfParameters::Aes { rounds, seed } => {
                let seed: &[u8; 32] = seed.as_slice().try_into().map_err(|_| {
                    Error::InvalidHeader(format!("Transform seed must be 32 bytes, got {}", seed.len()))
                })?;
                Ok(aes_transform(seed, composite, *rounds, progress))
            }
            KdfParameters::Argon2 {
                variant,
                salt,
                memory,
                iterations,
                parallelism,
                version,
            } => {
                progress(0, 1);
                let out = argon2_transform(
                    *variant,
                    salt,
                    *memory,
                    *iterations,
                    *parallelism,
                    *version,
                    composite,
                )?;
                progress(1, 1);
                Ok(out)
            }
        }
    }
}

/// AES-ECB encrypt both halves of `key` with `seed`, `rounds` times, then SHA-256.
pub fn aes_transform(
    seed: &[u8; 32],
    key: &[u8; 32],
    rounds: u64,
    progress: &mut dyn FnMut(u64, u64),
) -> [u8; 32] {
    let cipher = Aes256Enc::new(GenericArray::from_slice(seed));
    let mut blocks = [
        GenericArray::clone_from_slice(&key[..16]),
        GenericArray::clone_from_slice(&key[16..]),
    ];

    let mut done = 0u64;
    while done < rounds {
        let chunk = PROGRESS_CHUNK.min(rounds - done);
        for _ in 0..chunk {
            cipher.encrypt_blocks(&mut blocks);
        }
        done += chunk;
        progress(done, rounds);
    }

    let mut transformed = [0u8; 32];
    transformed[..16].copy_from_slice(&blocks[0]);
    transformed[16..].copy_from_slice(&blocks[1]);
    let out = sha256(&[&transformed]);
    transformed.zeroize();
    blocks[0].as_mut_slice().zeroize();
    blocks[1].as_mut_slice().zeroize();
    out
}

fn argon2_transform(
    variant: Argon2Variant,
    salt: &[u8],
    memory: u64,
    iterations: u64,
    parallelism: u32,
    version: u32,
    composite: &[u8; 32],
) -> Result<[u8; 32]> {
    let algorithm = match variant {
        Argon2Variant::Argon2d => Algorithm::Argon2d,
        Argon2Variant::Argon2id => Algorithm::Argon2id,
    };
    let version = match version {
        0x10 => Version::V0x10,
        0x13 => Version::V0x13,
        other => return Err(Error::UnsupportedKdf(format!("Argon2 version {:#x}", other))),
    };
    let memory_kib = u32::try_from(memory / 1024)
        .map_err(|_| Error::UnsupportedKdf("Argon2 memory cost too large".to_string()))?;
    let iterations = u32::try_from(iterations)
        .map_err(|_| Error::UnsupportedKdf("Argon2 iteration count too large".to_string()))?;
    let params = Params::new(memory_kib, iterations, parallelism, Some(32))
        .map_err(|e| Error::UnsupportedKdf(format!("Invalid Argon2 parameters: {}", e)))?;

    let mut out = [0u8; 32];
    Argon2::new(algorithm, version, params)
        .hash_password_into(composite, salt, &mut out)
        .map_err(|e| Error::UnsupportedKdf(format!("Argon2 failed: {}", e)))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_progress() -> impl FnMut(u64, u64) {
        |_, _| {}
    }

    #[test]
    fn test_zero_rounds_is_plain_hash() {
        let seed = [1u8; 32];
        let key = [2u8; 32];
        let out = aes_transform(&seed, &key, 0, &mut no_progress());
        assert_eq!(out, sha256(&[&key]));
    }

    #[test]
    fn test_transform_is_deterministic() {
        let seed = [0xA5u8; 32];
        let key = [0x3Cu8; 32];
        for rounds in [0u64, 1, 25_000] {
            let a = aes_transform(&seed, &key, rounds, &mut no_progress());
            let b = aes_transform(&seed, &key, rounds, &mut no_progress());
            assert_eq!(a, b, "rounds = {}", rounds);
        }
        let one = aes_transform(&seed, &key, 1, &mut no_progress());
        let two = aes_transform(&seed, &key, 2, &mut no_progress());
        assert_ne!(one, two);
    }

    #[test]
    fn test_one_round_matches_single_block_encryption() {
        let seed = [4u8; 32];
        let key = [6u8; 32];
        let cipher = Aes256Enc::new(GenericArray::from_slice(&seed));
        let mut block = GenericArray::clone_from_slice(&key[..16]);
        cipher.encrypt_block(&mut block);
        let mut expected = [0u8; 32];
        expected[..16].copy_from_slice(&block);
        expected[16..].copy_from_slice(&block);

        assert_eq!(
            aes_transform(&seed, &key, 1, &mut no_progress()),
            sha256(&[&expected])
        );
    }

    #[test]
    fn test_progress_reaches_total() {
        let mut last = (0, 0);
        aes_transform(&[0u8; 32], &[0u8; 32], 25_000, &mut |done, total| last = (done, total));
        assert_eq!(last, (25_000, 25_000));
    }

    #[test]
    fn test_bad_seed_length() {
        let params = KdfParameters::Aes {
            rounds: 1,
            seed: vec![0u8; 16],
        };
        assert!(params.derive(&[0u8; 32], &mut no_progress()).is_err());
    }

    #[test]
    fn test_argon2_small_params() {
        let params = KdfParameters::Argon2 {
            variant: Argon2Variant::Argon2id,
            salt: vec![1u8; 16],
            memory: 64 * 1024,
            iterations: 1,
            parallelism: 1,
            version: 0x13,
        };
        let a = params.derive(&[9u8; 32], &mut no_progress()).unwrap();
        let b = params.derive(&[9u8; 32], &mut no_progress()).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, [0u8; 32]);
    }
}
