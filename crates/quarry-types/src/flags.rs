//! Flag sets for the engine-facing VFS contract.
//!
//! Bit values match the embedded engine's public interface so status and
//! flag integers can cross the boundary unchanged.

bitflags::bitflags! {
    /// Flags passed to `Vfs::open`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VfsOpenFlags: u32 {
        const READONLY      = 0x0000_0001;
        const READWRITE     = 0x0000_0002;
        const CREATE        = 0x0000_0004;
        const DELETEONCLOSE = 0x0000_0008;
        const EXCLUSIVE     = 0x0000_0010;
        const MAIN_DB       = 0x0000_0100;
        const TEMP_DB       = 0x0000_0200;
        const TRANSIENT_DB  = 0x0000_0400;
        const MAIN_JOURNAL  = 0x0000_0800;
        const TEMP_JOURNAL  = 0x0000_1000;
    }
}

impl VfsOpenFlags {
    /// Whether the flags describe a (synthesized) rollback-journal file.
    #[must_use]
    pub const fn is_journal(self) -> bool {
        self.intersects(Self::MAIN_JOURNAL.union(Self::TEMP_JOURNAL))
    }
}

bitflags::bitflags! {
    /// Flags passed to `Vfs::access`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessFlags: u32 {
        const EXISTS    = 0x01;
        const READWRITE = 0x02;
        const READ      = 0x04;
    }
}

bitflags::bitflags! {
    /// Flags passed to `VfsFile::sync`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SyncFlags: u32 {
        const NORMAL   = 0x0000_0002;
        const FULL     = 0x0000_0003;
        const DATAONLY = 0x0000_0010;
    }
}

bitflags::bitflags! {
    /// Device-characteristic bits reported by `VfsFile::device_characteristics`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceCharacteristics: u32 {
        const SAFE_APPEND          = 0x0000_0200;
        const SEQUENTIAL           = 0x0000_0400;
        const UNDELETABLE_WHEN_OPEN = 0x0000_0800;
    }
}
