use quarry_error::Result;
use quarry_types::LockLevel;
use quarry_types::cx::Cx;
use quarry_types::flags::{AccessFlags, DeviceCharacteristics, SyncFlags, VfsOpenFlags};

/// A virtual filesystem implementation.
///
/// This trait abstracts all file system operations the engine performs.
/// Names are engine-supplied path strings; implementations canonicalize them
/// (see [`crate::canonical_path`]), so relative and absolute forms address
/// the same file.
pub trait Vfs: Send + Sync {
    /// The file handle type produced by this VFS.
    type File: VfsFile;

    /// The name of this VFS.
    fn name(&self) -> &'static str;

    /// Open a file.
    ///
    /// `name` is `None` for temporary files that should be auto-named.
    /// `flags` describes what kind of file (main DB, journal, etc.) and how
    /// to open it (create, read-write, delete-on-close).
    ///
    /// Returns the opened file and the flags that were actually used (the
    /// VFS may add flags like `READWRITE` when `CREATE` is specified).
    fn open(
        &self,
        cx: &Cx,
        name: Option<&str>,
        flags: VfsOpenFlags,
    ) -> Result<(Self::File, VfsOpenFlags)>;

    /// Delete a file.
    ///
    /// If `sync_dir` is true, the deletion is awaited through the store's
    /// durability machinery before returning.
    fn delete(&self, cx: &Cx, name: &str, sync_dir: bool) -> Result<()>;

    /// Check file access.
    ///
    /// Returns true if the file at `name` satisfies the access check
    /// described by `flags`.
    fn access(&self, cx: &Cx, name: &str, flags: AccessFlags) -> Result<bool>;

    /// Resolve a potentially relative name into its canonical `/name` form.
    fn full_pathname(&self, cx: &Cx, name: &str) -> Result<String>;
}

/// A file handle opened by a VFS.
pub trait VfsFile: Send + Sync {
    /// Close the file.
    ///
    /// After this call, the file handle should not be used.
    fn close(&mut self, cx: &Cx) -> Result<()>;

    /// Read `buf.len()` bytes starting at byte offset `offset`.
    ///
    /// Returns the number of bytes actually read. If fewer bytes are read
    /// than requested (short read), the remaining bytes in `buf` are zeroed.
    fn read(&mut self, cx: &Cx, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Write `buf` starting at byte offset `offset`.
    fn write(&mut self, cx: &Cx, buf: &[u8], offset: u64) -> Result<()>;

    /// Resize the file to `size` bytes. Shrinking discards the tail;
    /// growing extends the logical size without allocating anything.
    fn truncate(&mut self, cx: &Cx, size: u64) -> Result<()>;

    /// Sync the file contents to stable storage.
    fn sync(&mut self, cx: &Cx, flags: SyncFlags) -> Result<()>;

    /// Return the current file size in bytes.
    fn file_size(&self, cx: &Cx) -> Result<u64>;

    /// Acquire a file lock at the given level.
    ///
    /// Five-level locking: None < Shared < Reserved < Pending < Exclusive.
    /// Returns `Busy` when the escalation cannot complete without blocking.
    fn lock(&mut self, cx: &Cx, level: LockLevel) -> Result<()>;

    /// Release the file lock down to the given level. Never upgrades.
    fn unlock(&mut self, cx: &Cx, level: LockLevel) -> Result<()>;

    /// Check if a RESERVED or higher lock is held on this file.
    fn check_reserved_lock(&self, cx: &Cx) -> Result<bool>;

    /// Return the sector size for this file.
    fn sector_size(&self) -> u32 {
        4096
    }

    /// Return device characteristics flags.
    fn device_characteristics(&self) -> DeviceCharacteristics {
        DeviceCharacteristics::empty()
    }
}
