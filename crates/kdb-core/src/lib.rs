//! kdb-core - Read, edit and write KeePass password databases
//!
//! Supports KeePass 1.x `.kdb` files and KeePass 2.x `.kdbx` files (3.1 and
//! 4.0). A loaded [`Database`] keeps its groups and entries in memory, with
//! sensitive strings masked until revealed, and writes itself back in the
//! format it was read from.

mod binary_pool;
pub mod crypto;
mod database;
mod dirty;
mod entry;
mod error;
mod format;
mod group;
mod icons;
mod key;
mod meta;
mod persist;
mod progress;
mod protected;
mod search;
mod times;

pub use database::{
    Compression, CryptoSettings, Database, DatabaseFormat, DatabaseMetadata, GroupTreeNode,
    KdbxVersion, NewDatabase, KDB_ROOT_NAME, RECYCLE_BIN_NAME,
};
pub use entry::{AutoType, Entry, EntryBuilder, STANDARD_FIELDS};
pub use error::{Error, ErrorKind, KeyFileProblem, Result};
pub use group::{Group, GroupBuilder};
pub use icons::{CustomIcon, IconRef};
pub use key::Credentials;
pub use meta::{DeletedObject, MemoryProtection, Meta};
pub use persist::SaveOptions;
pub use progress::{NoProgress, ProgressListener, ProgressStatus, TaskResult};
pub use protected::{ProtectedBinary, ProtectedString};
pub use search::SearchParameters;
pub use times::Times;

pub use crypto::cipher::DataCipher;
pub use crypto::kdf::{Argon2Variant, KdfParameters};

// Re-export types that users might need
pub use uuid::Uuid;
