//! ATA PIO (LBA28, primary master) block device, with GPT partition lookup.
//!
//! Ports follow the legacy ISA convention: 0x1F0-0x1F7 (data, error/features,
//! sector count, LBA low/mid/high, drive/head, status/command).

use super::{BlockDevice, BlockError};
use alloc::vec;
use alloc::vec::Vec;
use conquer_once::spin::OnceCell;
use spin::Mutex;
use x86_64::instructions::port::Port;

const DATA: u16 = 0x1F0;
const SECTOR_COUNT: u16 = 0x1F2;
const LBA_LOW: u16 = 0x1F3;
const LBA_MID: u16 = 0x1F4;
const LBA_HIGH: u16 = 0x1F5;
const DRIVE_HEAD: u16 = 0x1F6;
const STATUS_COMMAND: u16 = 0x1F7;

const CMD_READ_SECTORS: u8 = 0x20;
const CMD_WRITE_SECTORS: u8 = 0x30;
const CMD_CACHE_FLUSH: u8 = 0xE7;

const STATUS_ERR: u8 = 1 << 0;
const STATUS_DRQ: u8 = 1 << 3;
const STATUS_BSY: u8 = 1 << 7;

pub const SECTOR_SIZE: usize = 512;

/// Primary master ATA PIO disk, addressed directly by LBA.
pub struct AtaPioDisk {
    ports: Mutex<AtaPorts>,
}

struct AtaPorts {
    data: Port<u16>,
    sector_count: Port<u8>,
    lba_low: Port<u8>,
    lba_mid: Port<u8>,
    lba_high: Port<u8>,
    drive_head: Port<u8>,
    status_command: Port<u8>,
}

impl AtaPorts {
    fn wait_not_busy(&mut self) -> Result<(), BlockError> {
        for _ in 0..1_000_000u32 {
            if unsafe { self.status_command.read() } & STATUS_BSY == 0 {
                return Ok(());
            }
        }
        Err(BlockError::Timeout)
    }

    fn wait_drq(&mut self) -> Result<(), BlockError> {
        for _ in 0..1_000_000u32 {
            let status = unsafe { self.status_command.read() };
            if status & STATUS_ERR != 0 {
                return Err(BlockError::IoError);
            }
            if status & STATUS_DRQ != 0 {
                return Ok(());
            }
        }
        Err(BlockError::Timeout)
    }

    fn setup_lba28(&mut self, lba: u32, sector_count: u8) {
        unsafe {
            self.drive_head.write(0xE0 | ((lba >> 24) & 0x0F) as u8);
            self.sector_count.write(sector_count);
            self.lba_low.write((lba & 0xFF) as u8);
            self.lba_mid.write(((lba >> 8) & 0xFF) as u8);
            self.lba_high.write(((lba >> 16) & 0xFF) as u8);
        }
    }

    fn read_sector(&mut self, lba: u32, buf: &mut [u16]) -> Result<(), BlockError> {
        self.wait_not_busy()?;
        self.setup_lba28(lba, 1);
        unsafe {
            self.status_command.write(CMD_READ_SECTORS);
        }
        self.wait_drq()?;
        for word in buf.iter_mut().take(SECTOR_SIZE / 2) {
            *word = unsafe { self.data.read() };
        }
        Ok(())
    }

    fn write_sector(&mut self, lba: u32, buf: &[u16]) -> Result<(), BlockError> {
        self.wait_not_busy()?;
        self.setup_lba28(lba, 1);
        unsafe {
            self.status_command.write(CMD_WRITE_SECTORS);
        }
        self.wait_drq()?;
        for &word in buf.iter().take(SECTOR_SIZE / 2) {
            unsafe {
                self.data.write(word);
            }
        }
        self.wait_not_busy()?;
        unsafe {
            self.status_command.write(CMD_CACHE_FLUSH);
        }
        self.wait_not_busy()
    }
}

impl AtaPioDisk {
    fn new() -> Self {
        Self {
            ports: Mutex::new(AtaPorts {
                data: Port::new(DATA),
                sector_count: Port::new(SECTOR_COUNT),
                lba_low: Port::new(LBA_LOW),
                lba_mid: Port::new(LBA_MID),
                lba_high: Port::new(LBA_HIGH),
                drive_head: Port::new(DRIVE_HEAD),
                status_command: Port::new(STATUS_COMMAND),
            }),
        }
    }

    /// Read `count` consecutive 512-byte sectors starting at `lba`.
    pub fn read_sectors(&self, lba: u64, count: u32) -> Result<Vec<u8>, BlockError> {
        let mut out = vec![0u8; count as usize * SECTOR_SIZE];
        let mut ports = self.ports.lock();
        for i in 0..count {
            let mut words = [0u16; SECTOR_SIZE / 2];
            ports.read_sector(lba as u32 + i, &mut words)?;
            let offset = i as usize * SECTOR_SIZE;
            for (j, word) in words.iter().enumerate() {
                out[offset + j * 2] = (*word & 0xFF) as u8;
                out[offset + j * 2 + 1] = (*word >> 8) as u8;
            }
        }
        Ok(out)
    }

    /// Write `count` consecutive 512-byte sectors starting at `lba`.
    pub fn write_sectors(&self, lba: u64, count: u32, buf: &[u8]) -> Result<(), BlockError> {
        if buf.len() < count as usize * SECTOR_SIZE {
            return Err(BlockError::OutOfBounds);
        }
        let mut ports = self.ports.lock();
        for i in 0..count {
            let mut words = [0u16; SECTOR_SIZE / 2];
            let offset = i as usize * SECTOR_SIZE;
            for (j, word) in words.iter_mut().enumerate() {
                *word = buf[offset + j * 2] as u16 | ((buf[offset + j * 2 + 1] as u16) << 8);
            }
            ports.write_sector(lba as u32 + i, &words)?;
        }
        Ok(())
    }
}

/// GPT partition table entry, trimmed to the fields the mount path needs.
#[derive(Debug, Clone, Copy)]
pub struct GptEntry {
    pub first_lba: u64,
    pub last_lba: u64,
}

const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";

/// Read the GPT header (LBA 1) and entry array (LBA 2+), returning
/// partition index 1 (the first usable partition).
pub fn read_first_partition(disk: &AtaPioDisk) -> Result<GptEntry, BlockError> {
    let header = disk.read_sectors(1, 1)?;
    if &header[0..8] != GPT_SIGNATURE {
        return Err(BlockError::IoError);
    }
    let entry_lba = u64::from_le_bytes(header[72..80].try_into().unwrap());
    let entry_size = u32::from_le_bytes(header[84..88].try_into().unwrap()) as usize;
    let entries_sector = disk.read_sectors(entry_lba, 1)?;
    if entry_size > entries_sector.len() {
        return Err(BlockError::IoError);
    }
    let entry = &entries_sector[0..entry_size];
    let first_lba = u64::from_le_bytes(entry[32..40].try_into().unwrap());
    let last_lba = u64::from_le_bytes(entry[40..48].try_into().unwrap());
    Ok(GptEntry { first_lba, last_lba })
}

/// Block device view of a single GPT partition, offsetting every request by
/// the partition's starting LBA.
pub struct AtaPioPartition {
    disk: &'static AtaPioDisk,
    start_lba: u64,
    num_blocks: u64,
}

impl BlockDevice for AtaPioPartition {
    fn read_block(&self, block_num: u64, buf: &mut [u8]) -> Result<(), BlockError> {
        if block_num >= self.num_blocks {
            return Err(BlockError::OutOfBounds);
        }
        let sectors_per_block = (buf.len() / SECTOR_SIZE).max(1) as u32;
        let data = self.disk.read_sectors(
            self.start_lba + block_num * sectors_per_block as u64,
            sectors_per_block,
        )?;
        buf[..data.len()].copy_from_slice(&data);
        Ok(())
    }

    fn write_block(&self, block_num: u64, buf: &[u8]) -> Result<(), BlockError> {
        if block_num >= self.num_blocks {
            return Err(BlockError::OutOfBounds);
        }
        let sectors_per_block = (buf.len() / SECTOR_SIZE).max(1) as u32;
        self.disk.write_sectors(
            self.start_lba + block_num * sectors_per_block as u64,
            sectors_per_block,
            buf,
        )
    }

    fn block_size(&self) -> usize {
        SECTOR_SIZE
    }

    fn num_blocks(&self) -> u64 {
        self.num_blocks
    }

    fn flush(&self) -> Result<(), BlockError> {
        Ok(())
    }
}

static DISK: OnceCell<AtaPioDisk> = OnceCell::uninit();
static PARTITION: OnceCell<AtaPioPartition> = OnceCell::uninit();

/// Probe the primary ATA disk and register its first GPT partition as the
/// root block device. Must run after interrupts are up (PIO polling needs a
/// working IDT for the rare spurious exception) and before ext2 mount.
pub fn init() -> Result<(), &'static str> {
    let disk = DISK.get_or_init(AtaPioDisk::new);
    let entry = read_first_partition(disk).map_err(|_| "no GPT partition table found")?;
    let num_blocks = (entry.last_lba - entry.first_lba + 1) * SECTOR_SIZE as u64 / SECTOR_SIZE as u64;
    PARTITION.init_once(|| AtaPioPartition {
        disk,
        start_lba: entry.first_lba,
        num_blocks,
    });
    log::info!(
        "ata_pio: root partition at LBA {}..={} ({} sectors)",
        entry.first_lba,
        entry.last_lba,
        num_blocks
    );
    Ok(())
}

/// The registered root partition, once `init` has run.
pub fn root_partition() -> Option<&'static AtaPioPartition> {
    PARTITION.get()
}
