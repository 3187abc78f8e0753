//! Per-process file-descriptor table.
//!
//! A descriptor is a pointer into a fixed 32-slot array: inode number, a
//! position, an access mode, and a type tag selecting which ops apply. A
//! regular file's shared state lives behind an `Arc<Mutex<_>>`; `dup`/`dup2`
//! clone that pointer and let `Arc`'s strong count act as the refcount, so
//! the underlying file is only dropped once every descriptor pointing at it
//! is closed.

use alloc::sync::Arc;
use spin::Mutex;

/// Number of descriptor slots per process.
pub const NUM_FDS: usize = 32;

/// close-on-exec
pub const FD_CLOEXEC: u32 = 1;

/// An open regular file: inode, mount, position, and the flags it was
/// opened with.
#[derive(Debug)]
pub struct RegularFile {
    pub inode_num: u64,
    pub mount_id: usize,
    pub position: u64,
    pub flags: u32,
}

/// What a descriptor slot refers to.
#[derive(Clone)]
pub enum FdKind {
    /// stdin/stdout/stderr-style console descriptor; carries the logical
    /// fd number (0/1/2) so stat/ioctl can tell them apart.
    StdIo(u32),
    RegularFile(Arc<Mutex<RegularFile>>),
    /// A directory opened for `getdents64`; carries its inode number.
    Directory(u64),
}

/// One occupied slot in a process's descriptor table.
#[derive(Clone)]
pub struct FdEntry {
    pub kind: FdKind,
    pub flags: u32,
}

/// Fixed-width per-process descriptor table.
#[derive(Clone)]
pub struct FdTable {
    slots: [Option<FdEntry>; NUM_FDS],
}

impl FdTable {
    /// A fresh table with stdin/stdout/stderr wired up.
    pub fn new() -> Self {
        let mut table = Self {
            slots: core::array::from_fn(|_| None),
        };
        table.slots[0] = Some(FdEntry { kind: FdKind::StdIo(0), flags: 0 });
        table.slots[1] = Some(FdEntry { kind: FdKind::StdIo(1), flags: 0 });
        table.slots[2] = Some(FdEntry { kind: FdKind::StdIo(2), flags: 0 });
        table
    }

    /// Allocate the lowest free slot for `kind`.
    pub fn alloc(&mut self, kind: FdKind) -> Result<i32, ()> {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(FdEntry { kind, flags: 0 });
                return Ok(i as i32);
            }
        }
        Err(())
    }

    fn index(fd: i32) -> Option<usize> {
        if fd < 0 || fd as usize >= NUM_FDS {
            None
        } else {
            Some(fd as usize)
        }
    }

    pub fn get(&self, fd: i32) -> Option<&FdEntry> {
        self.slots[Self::index(fd)?].as_ref()
    }

    pub fn get_mut(&mut self, fd: i32) -> Option<&mut FdEntry> {
        self.slots[Self::index(fd)?].as_mut()
    }

    /// Close `fd`, returning its slot to the pool. The underlying file (if
    /// any) is only actually released once every `Arc` pointing at it is
    /// gone.
    pub fn close(&mut self, fd: i32) -> Result<(), ()> {
        let idx = Self::index(fd).ok_or(())?;
        if self.slots[idx].take().is_none() {
            return Err(());
        }
        Ok(())
    }

    /// Duplicate `old_fd` onto the lowest free slot.
    pub fn dup(&mut self, old_fd: i32) -> Result<i32, ()> {
        let entry = self.get(old_fd).cloned().ok_or(())?;
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(entry);
                return Ok(i as i32);
            }
        }
        Err(())
    }

    /// Duplicate `old_fd` onto exactly `new_fd`, closing whatever was there.
    pub fn dup2(&mut self, old_fd: i32, new_fd: i32) -> Result<i32, ()> {
        if old_fd == new_fd {
            return self.get(old_fd).map(|_| new_fd).ok_or(());
        }
        let entry = self.get(old_fd).cloned().ok_or(())?;
        let idx = Self::index(new_fd).ok_or(())?;
        self.slots[idx] = Some(entry);
        Ok(new_fd)
    }

    /// Duplicate `old_fd` onto the lowest free slot at or above `min_fd`.
    pub fn dup_min(&mut self, old_fd: i32, min_fd: i32) -> Result<i32, ()> {
        let entry = self.get(old_fd).cloned().ok_or(())?;
        let start = Self::index(min_fd).ok_or(())?;
        for (i, slot) in self.slots.iter_mut().enumerate().skip(start) {
            if slot.is_none() {
                *slot = Some(entry);
                return Ok(i as i32);
            }
        }
        Err(())
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}
