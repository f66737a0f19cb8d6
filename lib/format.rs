//! On-disk formats: item keys and the fixed-layout inode record.
//!
//! Everything in this module is pure layout — no I/O, no locking. The
//! encodings are wire/disk-exact: field widths, field order, and byte
//! order are part of the volume format and must not change without
//! bumping [`FORMAT_VERSION`].

use zerocopy::byteorder::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::EngineError;

/// Interoperability version of the persistent layout, recorded in the
/// volume header. Implementations refuse volumes with a different version.
pub const FORMAT_VERSION: u16 = 1;

/// The root directory's inode number. Orphan scanning starts past it.
pub const ROOT_INO: u64 = 1;

/// Data block geometry used for truncate boundaries.
pub const BLOCK_SHIFT: u32 = 12;
/// Bytes per data block.
pub const BLOCK_SIZE: u64 = 1 << BLOCK_SHIFT;

/// Key zone holding per-inode filesystem items (the inode record).
pub const FS_ZONE: u8 = 1;
/// Key zone holding the inode index items.
pub const INODE_INDEX_ZONE: u8 = 2;
/// Key zone holding orphan markers.
pub const ORPHAN_ZONE: u8 = 3;

/// Item type of the inode record within [`FS_ZONE`].
pub const INODE_TYPE: u8 = 1;
/// Item type of the meta-sequence index within [`INODE_INDEX_ZONE`].
pub const META_SEQ_TYPE: u8 = 1;
/// Item type of the data-sequence index within [`INODE_INDEX_ZONE`].
pub const DATA_SEQ_TYPE: u8 = 2;
/// Item type of orphan markers within [`ORPHAN_ZONE`].
pub const ORPHAN_TYPE: u8 = 1;

/// File-type bits of `mode`, matching the traditional unix encoding so
/// records interoperate with the OS-facing layers.
pub const MODE_FMT: u32 = 0o170000;
/// Regular file.
pub const MODE_REG: u32 = 0o100000;
/// Directory.
pub const MODE_DIR: u32 = 0o040000;
/// Symbolic link.
pub const MODE_LNK: u32 = 0o120000;

/// Broad inode classification derived from the mode bits.
///
/// The index manager only distinguishes regular files (which carry a
/// data-sequence index) from everything else, and final deletion only
/// distinguishes files (content extents) and symlinks (target storage).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InodeKind {
    /// A regular file.
    File,
    /// A directory.
    Directory,
    /// A symbolic link.
    Symlink,
    /// Device nodes, sockets, fifos.
    Special,
}

impl InodeKind {
    /// Classify a raw mode value.
    #[must_use]
    pub fn from_mode(mode: u32) -> Self {
        match mode & MODE_FMT {
            MODE_REG => Self::File,
            MODE_DIR => Self::Directory,
            MODE_LNK => Self::Symlink,
            _ => Self::Special,
        }
    }
}

/// Encoded length of an [`ItemKey`].
pub const ITEM_KEY_LEN: usize = 22;

/// A key in the ordered item store: `(zone, type, major, minor, ino)`.
///
/// The derived ordering is exactly the field declaration order, which is
/// also the order of the big-endian byte encoding, so memcmp over encoded
/// keys agrees with `Ord` over decoded ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ItemKey {
    /// Coarse namespace separating record, index, and orphan items.
    pub zone: u8,
    /// Item type within the zone.
    pub item_type: u8,
    /// Primary ordering value (the indexed sequence for index items).
    pub major: u64,
    /// Secondary ordering value, zero for all current item types.
    pub minor: u32,
    /// The owning inode number.
    pub ino: u64,
}

impl ItemKey {
    /// Key of the inode record for `ino`.
    #[must_use]
    pub fn inode(ino: u64) -> Self {
        Self {
            zone: FS_ZONE,
            item_type: INODE_TYPE,
            major: 0,
            minor: 0,
            ino,
        }
    }

    /// Key of an index item.
    #[must_use]
    pub fn index(item_type: u8, major: u64, minor: u32, ino: u64) -> Self {
        Self {
            zone: INODE_INDEX_ZONE,
            item_type,
            major,
            minor,
            ino,
        }
    }

    /// Key of the orphan marker for `ino`.
    #[must_use]
    pub fn orphan(ino: u64) -> Self {
        Self {
            zone: ORPHAN_ZONE,
            item_type: ORPHAN_TYPE,
            major: 0,
            minor: 0,
            ino,
        }
    }

    /// Big-endian, order-preserving byte encoding.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; ITEM_KEY_LEN] {
        let mut buf = [0u8; ITEM_KEY_LEN];
        buf[0] = self.zone;
        buf[1] = self.item_type;
        buf[2..10].copy_from_slice(&self.major.to_be_bytes());
        buf[10..14].copy_from_slice(&self.minor.to_be_bytes());
        buf[14..22].copy_from_slice(&self.ino.to_be_bytes());
        buf
    }

    /// Decode a key previously produced by [`to_bytes`](Self::to_bytes).
    pub fn from_bytes(buf: &[u8]) -> Result<Self, EngineError> {
        if buf.len() != ITEM_KEY_LEN {
            return Err(EngineError::Corruption(format!(
                "item key length {} != {ITEM_KEY_LEN}",
                buf.len()
            )));
        }
        let mut major = [0u8; 8];
        let mut minor = [0u8; 4];
        let mut ino = [0u8; 8];
        major.copy_from_slice(&buf[2..10]);
        minor.copy_from_slice(&buf[10..14]);
        ino.copy_from_slice(&buf[14..22]);
        Ok(Self {
            zone: buf[0],
            item_type: buf[1],
            major: u64::from_be_bytes(major),
            minor: u32::from_be_bytes(minor),
            ino: u64::from_be_bytes(ino),
        })
    }
}

/// A second/nanosecond timestamp as stored in the inode record.
///
/// The padding word keeps the on-disk struct free of implicit padding and
/// is always zero so encoded records are byte-reproducible.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RecordTime {
    /// Seconds since the unix epoch.
    pub sec: U64,
    /// Nanoseconds within the second.
    pub nsec: U32,
    /// Reserved, always zero.
    pub pad: U32,
}

impl RecordTime {
    /// Build from a plain `(sec, nsec)` pair, zeroing the padding.
    #[must_use]
    pub fn new(sec: u64, nsec: u32) -> Self {
        Self {
            sec: U64::new(sec),
            nsec: U32::new(nsec),
            pad: U32::new(0),
        }
    }
}

/// Encoded length of an [`InodeRecord`].
pub const INODE_RECORD_SIZE: usize = size_of::<InodeRecord>();

/// The fixed-layout persistent inode record, keyed by [`ItemKey::inode`].
///
/// Every field of the in-memory handle that is not purely derived lives
/// here. All integers are little-endian; the layout has no implicit
/// padding and all explicit padding is zero.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct InodeRecord {
    /// File size in bytes.
    pub size: U64,
    /// Transaction sequence of the last metadata change.
    pub meta_seq: U64,
    /// Transaction sequence of the last content change.
    pub data_seq: U64,
    /// Counter bumped whenever file content is replaced.
    pub data_version: U64,
    /// Content blocks resident locally.
    pub online_blocks: U64,
    /// Content blocks evicted to archive, pending recall before read.
    pub offline_blocks: U64,
    /// Directory-entry cursor, maintained by the directory subsystem.
    pub next_readdir_pos: U64,
    /// Extended-attribute id cursor, maintained by the xattr subsystem.
    pub next_xattr_id: U64,
    /// Link count.
    pub nlink: U32,
    /// Owner.
    pub uid: U32,
    /// Group.
    pub gid: U32,
    /// File type and permission bits.
    pub mode: U32,
    /// Device number for special files.
    pub rdev: U32,
    /// Status flags, see [`crate::inode::InodeFlags`].
    pub flags: U32,
    /// Access time.
    pub atime: RecordTime,
    /// Modification time.
    pub mtime: RecordTime,
    /// Attribute-change time.
    pub ctime: RecordTime,
    /// Creation time.
    pub crtime: RecordTime,
}

impl InodeRecord {
    /// Encode into the on-disk byte representation.
    #[must_use]
    pub fn encode(&self) -> [u8; INODE_RECORD_SIZE] {
        let mut buf = [0u8; INODE_RECORD_SIZE];
        buf.copy_from_slice(self.as_bytes());
        buf
    }

    /// Decode a record, verifying the length.
    pub fn decode(buf: &[u8]) -> Result<Self, EngineError> {
        Self::read_from_bytes(buf).map_err(|_| {
            EngineError::Corruption(format!(
                "inode record length {} != {INODE_RECORD_SIZE}",
                buf.len()
            ))
        })
    }

    /// The inode kind encoded in `mode`.
    #[must_use]
    pub fn kind(&self) -> InodeKind {
        InodeKind::from_mode(self.mode.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_layout_is_stable() {
        // 8 u64 + 6 u32 + 4 timestamps of 16 bytes.
        assert_eq!(INODE_RECORD_SIZE, 64 + 24 + 64);
    }

    #[test]
    fn key_bytes_preserve_ordering() {
        let keys = [
            ItemKey::inode(1),
            ItemKey::inode(2),
            ItemKey::index(META_SEQ_TYPE, 5, 0, 100),
            ItemKey::index(META_SEQ_TYPE, 6, 0, 7),
            ItemKey::index(DATA_SEQ_TYPE, 1, 0, 100),
            ItemKey::orphan(100),
        ];
        for a in &keys {
            for b in &keys {
                assert_eq!(
                    a.cmp(b),
                    a.to_bytes().cmp(&b.to_bytes()),
                    "struct and byte ordering disagree for {a:?} vs {b:?}"
                );
            }
        }
    }

    #[test]
    fn key_roundtrip() {
        let key = ItemKey::index(DATA_SEQ_TYPE, u64::MAX - 3, 9, 0xdead_beef);
        assert_eq!(ItemKey::from_bytes(&key.to_bytes()).unwrap(), key);
    }

    #[test]
    fn timestamps_zero_their_padding() {
        let t = RecordTime::new(u64::MAX, u32::MAX);
        assert_eq!(t.pad.get(), 0);
    }
}
