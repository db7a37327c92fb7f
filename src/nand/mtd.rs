//! NAND abstraction layer implementation over the Linux MTD subsystem (read-only)

use super::{Nand, NandBlock, NandLayout};
use crate::ubi::ReadStatus;

use anyhow::{bail, ensure};

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::mem::MaybeUninit;
use std::os::{fd::AsRawFd, unix::fs::FileExt};
use std::path::Path;

/// NAND flash that wraps an open /dev/mtdX file
#[derive(Debug)]
pub struct MtdNand {
    file: File,
    layout: NandLayout,
}

impl MtdNand {
    /// Open an `mtd` device, by path (e.g. "/dev/mtd0")
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let file = File::options().read(true).open(path)?;
        let layout = unsafe {
            let mut info = MaybeUninit::<ioctl::mtd_info_user>::uninit();
            ioctl::memgetinfo(file.as_raw_fd(), info.as_mut_ptr())?;
            info.assume_init()
        }
        .try_into()?;

        Ok(Self { file, layout })
    }

    /// Open an `mtd` device by its name, by searching `/proc/mtd`
    pub fn open_named(name: &str) -> anyhow::Result<Self> {
        // Put `name` in quotes
        let name = format!("\"{name}\"");

        let proc_mtd = File::open("/proc/mtd")?;
        let proc_mtd = BufReader::new(proc_mtd);
        for line in proc_mtd.lines() {
            let line = line?;
            if line.contains(&name) {
                if let Some(mtd_dev) = line.split(':').next() {
                    return Self::open(Path::new("/dev").join(mtd_dev));
                }
            }
        }

        bail!("MTD device {name} could not be found");
    }

    /// Snapshot the device's ECC counters, which only ever grow
    fn ecc_stats(&self) -> anyhow::Result<ioctl::mtd_ecc_stats> {
        let stats = unsafe {
            let mut stats = MaybeUninit::<ioctl::mtd_ecc_stats>::uninit();
            ioctl::eccgetstats(self.file.as_raw_fd(), stats.as_mut_ptr())?;
            stats.assume_init()
        };
        Ok(stats)
    }
}

impl Nand for MtdNand {
    type Block<'a> = MtdBlock<'a>;

    fn block(&mut self, index: u32) -> anyhow::Result<Option<MtdBlock<'_>>> {
        ensure!(index < self.layout.blocks, "block {index} out of range");

        let block_base = self.layout.block_size() as u64 * u64::from(index);
        let bad = unsafe { ioctl::memgetbadblock(self.file.as_raw_fd(), &block_base)? };
        if bad == 0 {
            Ok(Some(MtdBlock { nand: self, index }))
        } else {
            Ok(None)
        }
    }

    fn get_layout(&self) -> NandLayout {
        self.layout
    }
}

pub struct MtdBlock<'a> {
    nand: &'a MtdNand,
    index: u32,
}

impl MtdBlock<'_> {
    /// Compute the offset of the first byte of this block
    fn base(&self) -> u64 {
        self.nand.layout.block_size() as u64 * u64::from(self.index)
    }

    /// Ensure that the byte count and starting page range is valid, and compute the /dev/mtdX
    /// offset for the page
    fn offset_for(&self, start_page: u32, bytes: usize) -> anyhow::Result<u64> {
        ensure!(
            bytes % self.page_size() == 0,
            "buffer not multiple of page size"
        );

        let end_page = start_page + (bytes / self.page_size()) as u32;
        ensure!(
            end_page <= self.page_count(),
            "block {0}, page range {start_page}..{end_page} out of bounds",
            self.index
        );

        Ok(self.base() + (self.page_size() as u64) * u64::from(start_page))
    }
}

impl NandBlock for MtdBlock<'_> {
    fn page_count(&self) -> u32 {
        self.nand.layout.pages_per_block
    }
    fn page_size(&self) -> usize {
        self.nand.layout.bytes_per_page
    }
    fn read(&self, start_page: u32, content: &mut [u8]) -> anyhow::Result<()> {
        let offset = self.offset_for(start_page, content.len())?;
        Ok(self.nand.file.read_exact_at(content, offset)?)
    }

    /// The kernel hides corrected bitflips from `read()`; they only show in the ECC counters
    fn read_ecc(&self, start_page: u32, content: &mut [u8]) -> anyhow::Result<ReadStatus> {
        let before = self.nand.ecc_stats()?;
        self.read(start_page, content)?;
        let after = self.nand.ecc_stats()?;

        ensure!(
            after.failed == before.failed,
            "uncorrectable ECC error in block {}",
            self.index
        );
        if after.corrected != before.corrected {
            return Ok(ReadStatus::Bitflips);
        }
        Ok(ReadStatus::Clean)
    }
}

mod ioctl {
    //! The private ioctls for interfacing with MTD devices

    use super::NandLayout;

    use anyhow::ensure;
    use nix::{ioctl_read, ioctl_write_ptr};

    const MTD_IOC_MAGIC: u8 = b'M';

    #[repr(C)]
    pub struct mtd_info_user {
        pub r#type: u8,
        pub flags: u32,
        pub size: u32,
        pub erasesize: u32,
        pub writesize: u32,
        pub oobsize: u32,
        pub padding: u64,
    }
    ioctl_read!(memgetinfo, MTD_IOC_MAGIC, 1, mtd_info_user);

    impl TryInto<NandLayout> for mtd_info_user {
        type Error = anyhow::Error;

        fn try_into(mut self) -> anyhow::Result<NandLayout> {
            if self.writesize == 1 {
                // Hack for debugging on mtdram devices
                self.writesize = 64;
            }

            ensure!(
                self.size % self.erasesize == 0,
                "MTD size not multiple of erasesize"
            );
            ensure!(
                self.erasesize % self.writesize == 0,
                "MTD erasesize not multiple of writesize"
            );

            let blocks = self.size / self.erasesize;
            let pages_per_block = self.erasesize / self.writesize;
            let bytes_per_page = self.writesize as usize;

            Ok(NandLayout {
                blocks,
                pages_per_block,
                bytes_per_page,
            })
        }
    }

    ioctl_write_ptr!(memgetbadblock, MTD_IOC_MAGIC, 11, u64);

    #[repr(C)]
    pub struct mtd_ecc_stats {
        pub corrected: u32,
        pub failed: u32,
        pub badblocks: u32,
        pub bbtblocks: u32,
    }
    ioctl_read!(eccgetstats, MTD_IOC_MAGIC, 18, mtd_ecc_stats);
}
