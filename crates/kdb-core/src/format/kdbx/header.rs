//! KDBX outer header: signatures, version and the type-length-value fields

use super::variant::{Variant, VariantDictionary};
use crate::crypto::cipher::DataCipher;
use crate::crypto::kdf::{Argon2Variant, KdfParameters, KDF_AES, KDF_ARGON2D, KDF_ARGON2ID};
use crate::crypto::stream::InnerStreamAlgorithm;
use crate::database::{Compression, KdbxVersion};
use crate::error::{Error, Result};
use crate::format::{ByteReader, KDBX_PRERELEASE_SIGNATURE_2, KDBX_SIGNATURE_2, SIGNATURE_1};
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use tracing::debug;
use uuid::Uuid;

pub const VERSION_31: u32 = 0x0003_0001;
pub const VERSION_40: u32 = 0x0004_0000;
const VERSION_MAJOR_MASK: u32 = 0xFFFF_0000;

const END: u8 = 0;
const COMMENT: u8 = 1;
const CIPHER_ID: u8 = 2;
const COMPRESSION_FLAGS: u8 = 3;
const MASTER_SEED: u8 = 4;
const TRANSFORM_SEED: u8 = 5;
const TRANSFORM_ROUNDS: u8 = 6;
const ENCRYPTION_IV: u8 = 7;
const PROTECTED_STREAM_KEY: u8 = 8;
const STREAM_START_BYTES: u8 = 9;
const INNER_RANDOM_STREAM_ID: u8 = 10;
const KDF_PARAMETERS: u8 = 11;
const PUBLIC_CUSTOM_DATA: u8 = 12;

const END_OF_HEADER: &[u8] = b"\r\n\r\n";

// VariantDictionary keys of the KDF parameters
const KDF_UUID_KEY: &str = "$UUID";
const AES_ROUNDS: &str = "R";
const AES_SEED: &str = "S";
const ARGON2_SALT: &str = "S";
const ARGON2_PARALLELISM: &str = "P";
const ARGON2_MEMORY: &str = "M";
const ARGON2_ITERATIONS: &str = "I";
const ARGON2_VERSION: &str = "V";

/// The decoded outer header
#[derive(Debug, Clone)]
pub struct KdbxHeader {
    pub version: KdbxVersion,
    pub cipher: DataCipher,
    pub compression: Compression,
    pub master_seed: [u8; 32],
    pub encryption_iv: Vec<u8>,
    pub kdf: KdfParameters,
    /// 3.x: inner stream settings and the plaintext canary
    pub protected_stream_key: Vec<u8>,
    pub stream_start_bytes: Vec<u8>,
    pub inner_stream: Option<InnerStreamAlgorithm>,
    /// 4.x: opaque VariantDictionary kept for re-saving
    pub public_custom_data: Option<Vec<u8>>,
}

/// Field values gathered before the version decides what is required
#[derive(Default)]
struct RawFields {
    cipher: Option<DataCipher>,
    compression: Option<Compression>,
    master_seed: Option<Vec<u8>>,
    transform_seed: Option<Vec<u8>>,
    transform_rounds: Option<u64>,
    encryption_iv: Option<Vec<u8>>,
    protected_stream_key: Option<Vec<u8>>,
    stream_start_bytes: Option<Vec<u8>>,
    inner_stream: Option<InnerStreamAlgorithm>,
    kdf: Option<KdfParameters>,
    public_custom_data: Option<Vec<u8>>,
}

fn missing(what: &str) -> Error {
    Error::InvalidHeader(format!("Missing header field: {}", what))
}

impl KdbxHeader {
    /// Parse the header and return it with its length in bytes
    pub fn parse(data: &[u8]) -> Result<(Self, usize)> {
        let mut r = ByteReader::new(data);
        let sig1 = r.u32("signature")?;
        let sig2 = r.u32("signature")?;
        if sig1 != SIGNATURE_1
            || (sig2 != KDBX_SIGNATURE_2 && sig2 != KDBX_PRERELEASE_SIGNATURE_2)
        {
            return Err(Error::InvalidHeader(format!(
                "Not a KDBX file: {:08x} {:08x}",
                sig1, sig2
            )));
        }

        let raw_version = r.u32("version")?;
        let major = raw_version & VERSION_MAJOR_MASK;
        if major > VERSION_40 & VERSION_MAJOR_MASK {
            return Err(Error::InvalidVersion(raw_version));
        }
        let version = if major >= VERSION_40 & VERSION_MAJOR_MASK {
            KdbxVersion::Kdbx40
        } else {
            KdbxVersion::Kdbx31
        };

        let mut fields = RawFields::default();
        loop {
            let id = r.u8("header field id")?;
            let len = match version {
                KdbxVersion::Kdbx31 => r.u16("header field length")? as usize,
                KdbxVersion::Kdbx40 => r.u32("header field length")? as usize,
            };
            let value = r.take(len, "header field")?;
            if id == END {
                break;
            }
            fields.read(id, value)?;
        }
        let end = r.position();
        debug!("KDBX header: version {:#010x}, {} bytes", raw_version, end);

        Ok((fields.finish(version)?, end))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.write_u32::<LittleEndian>(SIGNATURE_1)?;
        out.write_u32::<LittleEndian>(KDBX_SIGNATURE_2)?;
        out.write_u32::<LittleEndian>(match self.version {
            KdbxVersion::Kdbx31 => VERSION_31,
            KdbxVersion::Kdbx40 => VERSION_40,
        })?;

        let compression: u32 = match self.compression {
            Compression::None => 0,
            Compression::Gzip => 1,
        };
        self.field(&mut out, CIPHER_ID, self.cipher.uuid().as_bytes())?;
        self.field(&mut out, COMPRESSION_FLAGS, &compression.to_le_bytes())?;
        self.field(&mut out, MASTER_SEED, &self.master_seed)?;
        match self.version {
            KdbxVersion::Kdbx31 => {
                let KdfParameters::Aes { rounds, seed } = &self.kdf else {
                    return Err(Error::UnsupportedKdf(
                        "KDBX 3.1 requires AES-KDF".to_string(),
                    ));
                };
                self.field(&mut out, TRANSFORM_SEED, seed)?;
                self.field(&mut out, TRANSFORM_ROUNDS, &rounds.to_le_bytes())?;
                self.field(&mut out, ENCRYPTION_IV, &self.encryption_iv)?;
                self.field(&mut out, PROTECTED_STREAM_KEY, &self.protected_stream_key)?;
                self.field(&mut out, STREAM_START_BYTES, &self.stream_start_bytes)?;
                let stream_id = self
                    .inner_stream
                    .ok_or_else(|| missing("inner random stream id"))?
                    .id();
                self.field(&mut out, INNER_RANDOM_STREAM_ID, &stream_id.to_le_bytes())?;
            }
            KdbxVersion::Kdbx40 => {
                self.field(&mut out, ENCRYPTION_IV, &self.encryption_iv)?;
                let kdf = kdf_to_dictionary(&self.kdf).to_bytes()?;
                self.field(&mut out, KDF_PARAMETERS, &kdf)?;
                if let Some(custom) = &self.public_custom_data {
                    self.field(&mut out, PUBLIC_CUSTOM_DATA, custom)?;
                }
            }
        }
        self.field(&mut out, END, END_OF_HEADER)?;
        Ok(out)
    }

    fn field(&self, out: &mut Vec<u8>, id: u8, value: &[u8]) -> Result<()> {
        out.write_u8(id)?;
        match self.version {
            KdbxVersion::Kdbx31 => {
                let len = u16::try_from(value.len()).map_err(|_| {
                    Error::InvalidHeader(format!("Header field {} is too long", id))
                })?;
                out.write_u16::<LittleEndian>(len)?;
            }
            KdbxVersion::Kdbx40 => out.write_u32::<LittleEndian>(value.len() as u32)?,
        }
        out.extend_from_slice(value);
        Ok(())
    }
}

impl RawFields {
    fn read(&mut self, id: u8, value: &[u8]) -> Result<()> {
        match id {
            COMMENT => {}
            CIPHER_ID => {
                let uuid = Uuid::from_slice(value)
                    .map_err(|_| Error::InvalidHeader("Cipher id is not a UUID".to_string()))?;
                self.cipher = Some(DataCipher::from_uuid(&uuid)?);
            }
            COMPRESSION_FLAGS => {
                self.compression = Some(match read_u32(value, "compression flags")? {
                    0 => Compression::None,
                    1 => Compression::Gzip,
                    other => {
                        return Err(Error::InvalidHeader(format!(
                            "Unknown compression algorithm {}",
                            other
                        )))
                    }
                });
            }
            MASTER_SEED => self.master_seed = Some(value.to_vec()),
            TRANSFORM_SEED => self.transform_seed = Some(value.to_vec()),
            TRANSFORM_ROUNDS => {
                if value.len() != 8 {
                    return Err(Error::InvalidHeader("Transform rounds must be 8 bytes".to_string()));
                }
                self.transform_rounds = Some(LittleEndian::read_u64(value));
            }
            ENCRYPTION_IV => self.encryption_iv = Some(value.to_vec()),
            PROTECTED_STREAM_KEY => self.protected_stream_key = Some(value.to_vec()),
            STREAM_START_BYTES => self.stream_start_bytes = Some(value.to_vec()),
            INNER_RANDOM_STREAM_ID => {
                let id = read_u32(value, "inner random stream id")?;
                self.inner_stream = Some(InnerStreamAlgorithm::from_id(id)?);
            }
            KDF_PARAMETERS => {
                self.kdf = Some(kdf_from_dictionary(&VariantDictionary::parse(value)?)?);
            }
            PUBLIC_CUSTOM_DATA => self.public_custom_data = Some(value.to_vec()),
            other => {
                return Err(Error::InvalidHeader(format!(
                    "Unknown header field id {}",
                    other
                )))
            }
        }
        Ok(())
    }

    fn finish(self, version: KdbxVersion) -> Result<KdbxHeader> {
        let cipher = self.cipher.ok_or_else(|| missing("cipher id"))?;
        let master_seed: [u8; 32] = self
            .master_seed
            .ok_or_else(|| missing("master seed"))?
            .try_into()
            .map_err(|_| Error::InvalidHeader("Master seed must be 32 bytes".to_string()))?;
        let encryption_iv = self.encryption_iv.ok_or_else(|| missing("encryption IV"))?;
        if encryption_iv.len() != cipher.iv_len() {
            return Err(Error::InvalidHeader(format!(
                "{} needs a {}-byte IV, found {}",
                cipher.name(),
                cipher.iv_len(),
                encryption_iv.len()
            )));
        }

        let kdf = match version {
            KdbxVersion::Kdbx31 => KdfParameters::Aes {
                rounds: self.transform_rounds.ok_or_else(|| missing("transform rounds"))?,
                seed: self.transform_seed.ok_or_else(|| missing("transform seed"))?,
            },
            KdbxVersion::Kdbx40 => self.kdf.ok_or_else(|| missing("KDF parameters"))?,
        };
        let (protected_stream_key, stream_start_bytes) = match version {
            KdbxVersion::Kdbx31 => (
                self.protected_stream_key
                    .ok_or_else(|| missing("protected stream key"))?,
                self.stream_start_bytes
                    .ok_or_else(|| missing("stream start bytes"))?,
            ),
            KdbxVersion::Kdbx40 => (Vec::new(), Vec::new()),
        };
        if version == KdbxVersion::Kdbx31 && self.inner_stream.is_none() {
            return Err(missing("inner random stream id"));
        }

        Ok(KdbxHeader {
            version,
            cipher,
            compression: self.compression.unwrap_or(Compression::None),
            master_seed,
            encryption_iv,
            kdf,
            protected_stream_key,
            stream_start_bytes,
            inner_stream: self.inner_stream,
            public_custom_data: self.public_custom_data,
        })
    }
}

fn read_u32(value: &[u8], what: &str) -> Result<u32> {
    if value.len() != 4 {
        return Err(Error::InvalidHeader(format!("{} must be 4 bytes", what)));
    }
    Ok(LittleEndian::read_u32(value))
}

pub fn kdf_from_dictionary(dict: &VariantDictionary) -> Result<KdfParameters> {
    let uuid = dict
        .get_bytes(KDF_UUID_KEY)
        .and_then(|b| Uuid::from_slice(b).ok())
        .ok_or_else(|| Error::InvalidHeader("KDF parameters have no UUID".to_string()))?;
    let required = |key: &str| Error::InvalidHeader(format!("KDF parameter '{}' is missing", key));

    if uuid == KDF_AES {
        return Ok(KdfParameters::Aes {
            rounds: dict.get_u64(AES_ROUNDS).ok_or_else(|| required(AES_ROUNDS))?,
            seed: dict
                .get_bytes(AES_SEED)
                .ok_or_else(|| required(AES_SEED))?
                .to_vec(),
        });
    }
    let variant = if uuid == KDF_ARGON2D {
        Argon2Variant::Argon2d
    } else if uuid == KDF_ARGON2ID {
        Argon2Variant::Argon2id
    } else {
        return Err(Error::UnsupportedKdf(uuid.to_string()));
    };
    Ok(KdfParameters::Argon2 {
        variant,
        salt: dict
            .get_bytes(ARGON2_SALT)
            .ok_or_else(|| required(ARGON2_SALT))?
            .to_vec(),
        memory: dict.get_u64(ARGON2_MEMORY).ok_or_else(|| required(ARGON2_MEMORY))?,
        iterations: dict
            .get_u64(ARGON2_ITERATIONS)
            .ok_or_else(|| required(ARGON2_ITERATIONS))?,
        parallelism: dict.get_u32(ARGON2_PARALLELISM).unwrap_or(1),
        version: dict.get_u32(ARGON2_VERSION).unwrap_or(0x13),
    })
}

pub fn kdf_to_dictionary(kdf: &KdfParameters) -> VariantDictionary {
    let mut dict = VariantDictionary::new();
    dict.set(KDF_UUID_KEY, Variant::Bytes(kdf.uuid().as_bytes().to_vec()));
    match kdf {
        KdfParameters::Aes { rounds, seed } => {
            dict.set(AES_ROUNDS, Variant::UInt64(*rounds));
            dict.set(AES_SEED, Variant::Bytes(seed.clone()));
        }
        KdfParameters::Argon2 {
            salt,
            memory,
            iterations,
            parallelism,
            version,
            ..
        } => {
            dict.set(ARGON2_SALT, Variant::Bytes(salt.clone()));
            dict.set(ARGON2_PARALLELISM, Variant::UInt32(*parallelism));
            dict.set(ARGON2_MEMORY, Variant::UInt64(*memory));
            dict.set(ARGON2_ITERATIONS, Variant::UInt64(*iterations));
            dict.set(ARGON2_VERSION, Variant::UInt32(*version));
        }
    }
    dict
}
