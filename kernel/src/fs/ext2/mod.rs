//! ext2 filesystem implementation
//!
//! The Second Extended Filesystem (ext2) is a classic Linux filesystem.
//! This module provides structures and functions for parsing ext2 filesystems.

pub mod superblock;
pub mod block_group;
pub mod dir;
pub mod inode;
pub mod file;

pub use superblock::*;
pub use block_group::*;
pub use dir::*;
pub use inode::*;
pub use file::*;

use crate::block::ata_pio::AtaPioPartition;
use alloc::vec::Vec;
use spin::Mutex;

/// A mounted ext2 filesystem instance
///
/// Holds the superblock, block group descriptors, and a reference
/// to the underlying block device for filesystem operations.
pub struct Ext2Fs {
    /// The filesystem superblock
    pub superblock: Ext2Superblock,
    /// Block group descriptors
    pub block_groups: Vec<Ext2BlockGroupDesc>,
    /// The underlying block device
    pub device: &'static AtaPioPartition,
    /// Mount ID for VFS integration
    pub mount_id: usize,
}

impl Ext2Fs {
    /// Create a new ext2 filesystem instance from a block device
    ///
    /// Reads and validates the superblock and block group descriptors.
    pub fn new(device: &'static AtaPioPartition, mount_id: usize) -> Result<Self, &'static str> {
        // Read the superblock
        let superblock = Ext2Superblock::read_from(device)
            .map_err(|_| "Failed to read ext2 superblock")?;

        if !superblock.is_valid() {
            return Err("Invalid ext2 magic number");
        }

        // Read block group descriptors
        let block_groups = Ext2BlockGroupDesc::read_table(device, &superblock)
            .map_err(|_| "Failed to read block group descriptors")?;

        Ok(Self {
            superblock,
            block_groups,
            device,
            mount_id,
        })
    }

    /// Read an inode from the filesystem
    pub fn read_inode(&self, inode_num: u32) -> Result<Ext2Inode, &'static str> {
        Ext2Inode::read_from(
            self.device,
            inode_num,
            &self.superblock,
            &self.block_groups,
        )
        .map_err(|_| "Failed to read inode")
    }

    /// Read directory entries from an inode
    ///
    /// Returns the raw directory data for parsing with DirReader.
    pub fn read_directory(&self, inode: &Ext2Inode) -> Result<Vec<u8>, &'static str> {
        if !inode.is_dir() {
            return Err("Not a directory");
        }
        read_file(self.device, inode, &self.superblock)
            .map_err(|_| "Failed to read directory data")
    }

    /// Look up a path component in a directory
    ///
    /// Returns the inode number of the matching entry, or None if not found.
    pub fn lookup_in_dir(&self, dir_inode: &Ext2Inode, name: &str) -> Result<Option<u32>, &'static str> {
        let dir_data = self.read_directory(dir_inode)?;
        Ok(find_entry(&dir_data, name).map(|entry| entry.inode))
    }

    /// Resolve a path to an inode number
    ///
    /// Walks the directory tree from root, looking up each path component.
    /// Supports absolute paths starting with "/".
    pub fn resolve_path(&self, path: &str) -> Result<u32, &'static str> {
        // Must start with "/"
        if !path.starts_with('/') {
            return Err("Path must be absolute");
        }

        // Start at root inode (always inode 2 in ext2)
        let mut current_inode_num = EXT2_ROOT_INO;

        // Split path into components, skipping empty parts
        for component in path.split('/').filter(|s| !s.is_empty()) {
            // Read the current directory inode
            let current_inode = self.read_inode(current_inode_num)?;

            // Make sure it's a directory
            if !current_inode.is_dir() {
                return Err("Not a directory in path");
            }

            // Look up the component in this directory
            match self.lookup_in_dir(&current_inode, component)? {
                Some(inode_num) => {
                    current_inode_num = inode_num;
                }
                None => {
                    return Err("Path component not found");
                }
            }
        }

        Ok(current_inode_num)
    }

    /// Read file content from an inode
    pub fn read_file_content(&self, inode: &Ext2Inode) -> Result<Vec<u8>, &'static str> {
        read_file(self.device, inode, &self.superblock)
            .map_err(|_| "Failed to read file content")
    }

    /// Read a range of file content from an inode
    pub fn read_file_range(
        &self,
        inode: &Ext2Inode,
        offset: u64,
        length: usize,
    ) -> Result<Vec<u8>, &'static str> {
        read_file_range(self.device, inode, &self.superblock, offset, length)
            .map_err(|_| "Failed to read file range")
    }

    /// Write `data` into a file's content at `offset`, allocating blocks and
    /// growing the file as needed.
    pub fn write_file_content(
        &mut self,
        inode_num: u32,
        offset: u64,
        data: &[u8],
    ) -> Result<usize, &'static str> {
        let mut inode = self.read_inode(inode_num)?;
        file::write_file_range(
            self.device,
            &mut inode,
            inode_num,
            &self.superblock,
            &mut self.block_groups,
            offset,
            data,
        )
    }

    /// Shrink or grow a file to `new_size`.
    pub fn truncate(&mut self, inode_num: u32, new_size: u64) -> Result<(), &'static str> {
        let mut inode = self.read_inode(inode_num)?;
        file::truncate_file(
            self.device,
            &mut inode,
            inode_num,
            &self.superblock,
            &mut self.block_groups,
            new_size,
        )
    }

    /// Create a new regular file named `name` inside the directory
    /// `parent_inode_num`. Returns the new file's inode number.
    pub fn create_file(&mut self, parent_inode_num: u32, name: &str, mode: u16) -> Result<u32, &'static str> {
        let mut parent_inode = self.read_inode(parent_inode_num)?;
        if !parent_inode.is_dir() {
            return Err("Parent is not a directory");
        }
        if self.lookup_in_dir(&parent_inode, name)?.is_some() {
            return Err("File already exists");
        }

        let new_inode_num = allocate_inode(self.device, &self.superblock, &mut self.block_groups)?;
        let new_inode = Ext2Inode::new_regular_file(mode);
        new_inode
            .write_to(self.device, new_inode_num, &self.superblock, &mut self.block_groups)
            .map_err(|_| "Failed to write new inode")?;

        self.link_entry(&mut parent_inode, parent_inode_num, name, new_inode_num, dir::EXT2_FT_REG_FILE)?;

        Ok(new_inode_num)
    }

    /// Create a new directory named `name` inside `parent_inode_num`.
    /// Returns the new directory's inode number.
    pub fn mkdir(&mut self, parent_inode_num: u32, name: &str, mode: u16) -> Result<u32, &'static str> {
        let mut parent_inode = self.read_inode(parent_inode_num)?;
        if !parent_inode.is_dir() {
            return Err("Parent is not a directory");
        }
        if self.lookup_in_dir(&parent_inode, name)?.is_some() {
            return Err("Entry already exists");
        }

        let new_inode_num = allocate_inode(self.device, &self.superblock, &mut self.block_groups)?;
        let mut new_inode = Ext2Inode::new_directory(mode);

        let block_size = self.superblock.block_size();
        let data_block = allocate_block(self.device, &self.superblock, &mut self.block_groups)?;
        let mut block_buf = alloc::vec![0u8; block_size];
        dir::init_directory_block(&mut block_buf, new_inode_num, parent_inode_num);
        file::write_ext2_block(self.device, data_block, block_size, &block_buf)
            .map_err(|_| "Failed to write new directory block")?;

        set_direct_block(&mut new_inode, 0, data_block)?;
        new_inode.i_size = block_size as u32;
        new_inode
            .write_to(self.device, new_inode_num, &self.superblock, &mut self.block_groups)
            .map_err(|_| "Failed to write new directory inode")?;

        self.link_entry(&mut parent_inode, parent_inode_num, name, new_inode_num, dir::EXT2_FT_DIR)?;
        increment_inode_links(self.device, parent_inode_num, &self.superblock, &mut self.block_groups)
            .map_err(|_| "Failed to bump parent link count")?;

        Ok(new_inode_num)
    }

    /// Remove the directory entry `name` from `parent_inode_num` and drop
    /// the target's link count, freeing its resources once it hits zero.
    pub fn unlink(&mut self, parent_inode_num: u32, name: &str) -> Result<(), &'static str> {
        let parent_inode = self.read_inode(parent_inode_num)?;
        let target_inode_num = self
            .lookup_in_dir(&parent_inode, name)?
            .ok_or("No such file or directory")?;

        self.unlink_entry(parent_inode_num, name)?;
        decrement_inode_links(self.device, target_inode_num, &self.superblock, &mut self.block_groups)
            .map_err(|_| "Failed to drop link count")?;

        Ok(())
    }

    /// Move/rename `name` from one directory to another, keeping the same
    /// inode. Fails if the destination name already exists.
    pub fn rename(
        &mut self,
        old_parent_inode_num: u32,
        old_name: &str,
        new_parent_inode_num: u32,
        new_name: &str,
    ) -> Result<(), &'static str> {
        let old_parent_inode = self.read_inode(old_parent_inode_num)?;
        let target_inode_num = self
            .lookup_in_dir(&old_parent_inode, old_name)?
            .ok_or("No such file or directory")?;

        let mut new_parent_inode = self.read_inode(new_parent_inode_num)?;
        if !new_parent_inode.is_dir() {
            return Err("Destination is not a directory");
        }
        if self.lookup_in_dir(&new_parent_inode, new_name)?.is_some() {
            return Err("Destination already exists");
        }

        let target_inode = self.read_inode(target_inode_num)?;
        let file_type = if target_inode.is_dir() {
            dir::EXT2_FT_DIR
        } else if target_inode.is_symlink() {
            dir::EXT2_FT_SYMLINK
        } else {
            dir::EXT2_FT_REG_FILE
        };

        self.link_entry(&mut new_parent_inode, new_parent_inode_num, new_name, target_inode_num, file_type)?;
        self.unlink_entry(old_parent_inode_num, old_name)?;

        Ok(())
    }

    /// Insert a directory entry into `dir_inode`, growing the directory by
    /// one direct block if none of its existing blocks have room.
    fn link_entry(
        &mut self,
        dir_inode: &mut Ext2Inode,
        dir_inode_num: u32,
        name: &str,
        target_inode_num: u32,
        file_type: u8,
    ) -> Result<(), &'static str> {
        let block_size = self.superblock.block_size();
        let num_blocks = ((dir_inode.size() as usize + block_size - 1) / block_size) as u32;

        for logical_block in 0..num_blocks {
            let physical_block = get_block_num(self.device, dir_inode, &self.superblock, logical_block)
                .map_err(|_| "Failed to read directory block pointer")?
                .ok_or("Directory has an unexpected sparse hole")?;

            let mut block_buf = alloc::vec![0u8; block_size];
            file::read_ext2_block(self.device, physical_block, block_size, &mut block_buf)
                .map_err(|_| "Failed to read directory block")?;

            if dir::insert_entry_in_block(&mut block_buf, target_inode_num, name, file_type) {
                file::write_ext2_block(self.device, physical_block, block_size, &block_buf)
                    .map_err(|_| "Failed to write directory block")?;
                return Ok(());
            }
        }

        // No existing block had room: allocate a fresh one, laid out as one
        // big tombstone entry, then reuse that tombstone for the new entry.
        let new_block = allocate_block(self.device, &self.superblock, &mut self.block_groups)?;
        let mut block_buf = alloc::vec![0u8; block_size];
        block_buf[4..6].copy_from_slice(&(block_size as u16).to_le_bytes());
        dir::insert_entry_in_block(&mut block_buf, target_inode_num, name, file_type);
        file::write_ext2_block(self.device, new_block, block_size, &block_buf)
            .map_err(|_| "Failed to write new directory block")?;

        set_direct_block(dir_inode, num_blocks, new_block)?;

        let new_size = (num_blocks as u64 + 1) * block_size as u64;
        dir_inode.i_size = new_size as u32;
        dir_inode.update_timestamps(false, true, true);
        dir_inode
            .write_to(self.device, dir_inode_num, &self.superblock, &mut self.block_groups)
            .map_err(|_| "Failed to write directory inode")?;

        Ok(())
    }

    /// Remove a directory entry by name, turning its slot into a tombstone.
    fn unlink_entry(&mut self, dir_inode_num: u32, name: &str) -> Result<(), &'static str> {
        let dir_inode = self.read_inode(dir_inode_num)?;
        let block_size = self.superblock.block_size();
        let num_blocks = ((dir_inode.size() as usize + block_size - 1) / block_size) as u32;

        for logical_block in 0..num_blocks {
            let physical_block = get_block_num(self.device, &dir_inode, &self.superblock, logical_block)
                .map_err(|_| "Failed to read directory block pointer")?
                .ok_or("Directory has an unexpected sparse hole")?;

            let mut block_buf = alloc::vec![0u8; block_size];
            file::read_ext2_block(self.device, physical_block, block_size, &mut block_buf)
                .map_err(|_| "Failed to read directory block")?;

            if dir::remove_entry_in_block(&mut block_buf, name).is_some() {
                file::write_ext2_block(self.device, physical_block, block_size, &block_buf)
                    .map_err(|_| "Failed to write directory block")?;
                return Ok(());
            }
        }

        Err("No such file or directory")
    }
}

/// Point a directory inode's logical block at `physical_block`. Only the
/// direct block range is supported, matching the rest of the write path.
fn set_direct_block(inode: &mut Ext2Inode, logical_block: u32, physical_block: u32) -> Result<(), &'static str> {
    if logical_block >= 12 {
        return Err("Directory growth beyond direct blocks is not supported");
    }
    let mut i_block = unsafe { core::ptr::read_unaligned(core::ptr::addr_of!(inode.i_block)) };
    i_block[logical_block as usize] = physical_block;
    unsafe { core::ptr::write_unaligned(core::ptr::addr_of_mut!(inode.i_block), i_block) };
    Ok(())
}

/// Global mounted ext2 root filesystem
static ROOT_EXT2: Mutex<Option<Ext2Fs>> = Mutex::new(None);

/// Initialize the root ext2 filesystem
///
/// Mounts the primary ATA PIO partition as the root filesystem. This should
/// be called during kernel initialization after `block::ata_pio::init()`.
pub fn init_root_fs() -> Result<(), &'static str> {
    let device = crate::block::ata_pio::root_partition()
        .ok_or("No ATA PIO root partition available")?;

    // Register with VFS mount system
    let mount_id = crate::fs::vfs::mount("/", "ext2");

    // Create the ext2 filesystem instance
    let fs = Ext2Fs::new(device, mount_id)?;

    // Read packed struct fields safely before logging
    let blocks_count = unsafe {
        core::ptr::read_unaligned(core::ptr::addr_of!(fs.superblock.s_blocks_count))
    };
    let inodes_count = unsafe {
        core::ptr::read_unaligned(core::ptr::addr_of!(fs.superblock.s_inodes_count))
    };
    log::info!(
        "ext2: Mounted root filesystem - {} blocks, {} inodes, block size {}",
        blocks_count,
        inodes_count,
        fs.superblock.block_size()
    );

    // Store globally
    *ROOT_EXT2.lock() = Some(fs);

    Ok(())
}

/// Access the root ext2 filesystem
///
/// Returns None if the filesystem hasn't been initialized yet.
pub fn root_fs() -> spin::MutexGuard<'static, Option<Ext2Fs>> {
    ROOT_EXT2.lock()
}

/// Check if the root filesystem is mounted
pub fn is_mounted() -> bool {
    ROOT_EXT2.lock().is_some()
}
