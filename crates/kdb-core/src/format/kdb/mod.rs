//! KeePass 1.x `.kdb` files: a fixed header followed by an encrypted flat
//! list of group and entry records

mod date;
mod header;
mod reader;
mod writer;

pub(crate) use reader::read;
pub(crate) use writer::write;

/// Terminates a record and, inside the extension block, the block itself
pub(crate) const FIELD_END: u16 = 0xFFFF;

/// Extension block record carrying the header digest
pub(crate) const EXT_HEADER_HASH: u16 = 0x0001;
/// Extension block record carrying random padding
pub(crate) const EXT_RANDOM_SEED: u16 = 0x0002;

pub(crate) mod group_field {
    pub const EXT_DATA: u16 = 0x0000;
    pub const ID: u16 = 0x0001;
    pub const NAME: u16 = 0x0002;
    pub const CREATION: u16 = 0x0003;
    pub const MODIFICATION: u16 = 0x0004;
    pub const ACCESS: u16 = 0x0005;
    pub const EXPIRY: u16 = 0x0006;
    pub const ICON: u16 = 0x0007;
    pub const LEVEL: u16 = 0x0008;
    pub const FLAGS: u16 = 0x0009;
}

pub(crate) mod entry_field {
    pub const UUID: u16 = 0x0001;
    pub const GROUP_ID: u16 = 0x0002;
    pub const ICON: u16 = 0x0003;
    pub const TITLE: u16 = 0x0004;
    pub const URL: u16 = 0x0005;
    pub const USERNAME: u16 = 0x0006;
    pub const PASSWORD: u16 = 0x0007;
    pub const NOTES: u16 = 0x0008;
    pub const CREATION: u16 = 0x0009;
    pub const MODIFICATION: u16 = 0x000A;
    pub const ACCESS: u16 = 0x000B;
    pub const EXPIRY: u16 = 0x000C;
    pub const BINARY_DESC: u16 = 0x000D;
    pub const BINARY_DATA: u16 = 0x000E;
}
