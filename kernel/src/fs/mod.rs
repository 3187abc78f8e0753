//! Filesystem abstraction layer
//!
//! Provides support for various filesystem types including ext2 and devfs.
//! `ext2::init_root_fs()` mounts the root filesystem during boot, before
//! `sys_open()` and friends become reachable.

#![allow(dead_code)]

pub mod devfs;
pub mod ext2;
pub mod vfs;
