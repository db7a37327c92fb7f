//! This module implements attaching through a fastmap: a snapshot of the EBA tables that UBI
//! writes to a few PEBs near the start of the flash, so that not every PEB has to be read.
//!
//! The snapshot is staged into one buffer and walked front to back:
//!
//! ```text
//! super-block | header | pool | WL pool | EC lists | (volume header, EBA table) * vol_count
//! ```
//!
//! Nothing in it is trusted without checking: every PEB it assigns to a volume is classified
//! anyway, and the PEBs of both pools are rescanned in full.

use bytes::Buf;
use deku::prelude::*;

use super::attach::UbiAttach;
use super::error::{Result, UbiError};
use super::headers::{FM_DATA_VOLUME_ID, FM_SB_VOLUME_ID, UBI_CRC};
use super::scan::{PebStatus, ScanEvent};
use super::PebIo;

/// Only the first PEBs of the flash are searched for a fastmap anchor
pub const FM_MAX_START: u32 = 64;

/// The maximum number of PEBs one fastmap may span
pub const FM_MAX_BLOCKS: u32 = 32;

/// The maximum number of PEBs in either fastmap pool
pub const FM_MAX_POOL_SIZE: usize = 256;

pub(super) const FM_FMT_VERSION: u8 = 1;
pub(super) const FM_SB_MAGIC: u32 = 0x7B11_D69F;
pub(super) const FM_HDR_MAGIC: u32 = 0xD4B8_2EF7;
pub(super) const FM_VHDR_MAGIC: u32 = 0xFA37_0ED1;
pub(super) const FM_POOL_MAGIC: u32 = 0x67AF_4D08;
pub(super) const FM_EBA_MAGIC: u32 = 0xF0C0_40A8;

/// UBI reserves space for this many volume headers, whether or not they exist
const FM_MAX_VOLUMES: usize = 128;

/// Offset of `data_crc` within the super-block
pub(super) const FM_SB_DATA_CRC: std::ops::Range<usize> = 8..12;

/// A fixed-size structure found in the fastmap
pub(super) trait FmStruct {
    const SIZE: usize;
    const NAME: &'static str;
}

/// The fastmap super-block, at the start of the anchor PEB's LEB
#[derive(Debug, Clone, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub(super) struct FmSb {
    pub magic: u32,
    pub version: u8,
    pub padding1: [u8; 3],
    pub data_crc: u32,
    pub used_blocks: u32,
    pub block_loc: [u32; FM_MAX_BLOCKS as usize],
    pub block_ec: [u32; FM_MAX_BLOCKS as usize],
    pub sqnum: u64,
    pub padding2: [u8; 32],
}

impl FmStruct for FmSb {
    const SIZE: usize = 312;
    const NAME: &'static str = "super-block";
}

#[derive(Debug, Clone, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub(super) struct FmHdr {
    pub magic: u32,
    pub free_peb_count: u32,
    pub used_peb_count: u32,
    pub scrub_peb_count: u32,
    pub bad_peb_count: u32,
    pub erase_peb_count: u32,
    pub vol_count: u32,
    pub padding: [u8; 4],
}

impl FmStruct for FmHdr {
    const SIZE: usize = 32;
    const NAME: &'static str = "header";
}

/// A pool of PEBs that UBI may have written to since the fastmap was written
#[derive(Debug, Clone, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub(super) struct FmScanPool {
    pub magic: u32,
    pub size: u16,
    pub max_size: u16,
    pub pebs: [u32; FM_MAX_POOL_SIZE],
    pub padding: [u32; 4],
}

impl FmStruct for FmScanPool {
    const SIZE: usize = 1048;
    const NAME: &'static str = "pool";
}

#[derive(Debug, Clone, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub(super) struct FmEc {
    pub pnum: u32,
    pub ec: u32,
}

impl FmStruct for FmEc {
    const SIZE: usize = 8;
    const NAME: &'static str = "EC entry";
}

#[derive(Debug, Clone, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub(super) struct FmVolHdr {
    pub magic: u32,
    pub vol_id: u32,
    pub vol_type: u8,
    pub padding1: [u8; 3],
    pub data_pad: u32,
    pub used_ebs: u32,
    pub last_eb_bytes: u32,
    pub padding2: [u8; 8],
}

impl FmStruct for FmVolHdr {
    const SIZE: usize = 32;
    const NAME: &'static str = "volume header";
}

/// The fixed part of an EBA table; `reserved_pebs` PEB numbers follow it
#[derive(Debug, Clone, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub(super) struct FmEba {
    pub magic: u32,
    pub reserved_pebs: u32,
}

impl FmStruct for FmEba {
    const SIZE: usize = 8;
    const NAME: &'static str = "EBA table";
}

/// Compute the size of the fastmap of a flash with `peb_count` PEBs, in whole LEBs
pub fn fm_size(peb_count: u32, leb_size: u32) -> usize {
    let peb_count = peb_count as usize;
    let size = FmSb::SIZE
        + FmHdr::SIZE
        + 2 * FmScanPool::SIZE
        + peb_count * FmEc::SIZE
        + FmEba::SIZE
        + peb_count * std::mem::size_of::<u32>()
        + FmVolHdr::SIZE * FM_MAX_VOLUMES;

    let leb_size = (leb_size as usize).max(1);
    size.div_ceil(leb_size) * leb_size
}

/// A bounds-checked view of `count` big-endian `u32`s
#[derive(Debug, Clone, Copy)]
pub(super) struct BeU32View<'a> {
    bytes: &'a [u8],
}

impl<'a> BeU32View<'a> {
    const STRIDE: usize = std::mem::size_of::<u32>();

    pub fn new(bytes: &'a [u8], count: usize) -> Option<Self> {
        let bytes = bytes.get(..count.checked_mul(Self::STRIDE)?)?;
        Some(Self { bytes })
    }

    pub fn len(&self) -> usize {
        self.bytes.len() / Self::STRIDE
    }

    pub fn get(&self, index: usize) -> Option<u32> {
        let start = index.checked_mul(Self::STRIDE)?;
        let mut entry = self.bytes.get(start..)?.get(..Self::STRIDE)?;
        Some(entry.get_u32())
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + 'a {
        self.bytes
            .chunks_exact(Self::STRIDE)
            .map(|mut entry| entry.get_u32())
    }
}

/// Walks the staged fastmap front to back. Every step must leave some of the fastmap unread.
struct FmCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FmCursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn advance(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        let start = self.pos;
        let end = start
            .checked_add(len)
            .filter(|&end| end < self.buf.len())
            .ok_or_else(|| UbiError::bad_fastmap(format!("fastmap too short for {what}")))?;
        self.pos = end;
        Ok(&self.buf[start..end])
    }

    fn take<T: FmStruct + DekuContainerRead<'a>>(&mut self) -> Result<T> {
        let bytes = self.advance(T::SIZE, T::NAME)?;
        let (_, value) = T::from_bytes((bytes, 0))
            .map_err(|e| UbiError::bad_fastmap(format!("unparseable {}: {e}", T::NAME)))?;
        Ok(value)
    }

    fn skip<T: FmStruct>(&mut self, count: u32) -> Result<()> {
        (0..count).try_for_each(|_| self.advance(T::SIZE, T::NAME).map(drop))
    }

    /// Take an EBA table, along with the PEB numbers following it
    fn take_eba(&mut self) -> Result<(FmEba, BeU32View<'a>)> {
        let rest = self.buf.get(self.pos..).unwrap_or_default();
        let (_, eba) = FmEba::from_bytes((rest, 0))
            .map_err(|e| UbiError::bad_fastmap(format!("unparseable EBA table: {e}")))?;

        let count = eba.reserved_pebs as usize;
        let len = count
            .checked_mul(BeU32View::STRIDE)
            .and_then(|len| len.checked_add(FmEba::SIZE))
            .ok_or_else(|| UbiError::bad_fastmap("EBA table too large"))?;
        let bytes = self.advance(len, FmEba::NAME)?;

        let pebs = BeU32View::new(&bytes[FmEba::SIZE..], count)
            .ok_or_else(|| UbiError::bad_fastmap("EBA table truncated"))?;
        Ok((eba, pebs))
    }
}

fn check_magic(what: &str, magic: u32, expected: u32) -> Result<()> {
    if magic != expected {
        return Err(UbiError::bad_fastmap(format!(
            "bad fastmap {what} magic: {magic:#x}, expected: {expected:#x}"
        )));
    }
    Ok(())
}

impl<I: PebIo> UbiAttach<I> {
    /// Attach through the fastmap anchored at PEB `anchor`. On failure the state may hold partial
    /// volume information, which the caller must throw away.
    pub(super) fn scan_fastmap(&mut self, anchor: u32) -> Result<()> {
        let result = self.stage_fastmap(anchor).and_then(|()| {
            // Take the staging buffer out of `self` while the PEBs it names are classified
            let buf = std::mem::take(&mut self.fm_buf);
            let result = self.attach_fastmap(&buf);
            self.fm_buf = buf;
            result
        });

        match result {
            Ok(()) => {
                self.fm_anchor = Some(anchor);
                log::info!(
                    "UBI: attached by fastmap {} MiB {} blocks",
                    (u64::from(self.geometry.peb_size) * u64::from(self.peb_count)) >> 20,
                    self.peb_count
                );
                Ok(())
            }
            Err(e) => {
                log::error!("UBI error: Attach by fastmap failed, doing a full scan!");
                Err(e)
            }
        }
    }

    /// Validate the super-block and read the blocks it names into `fm_buf`, checking the CRC
    fn stage_fastmap(&mut self, anchor: u32) -> Result<()> {
        let mut sb_bytes = [0u8; FmSb::SIZE];
        self.flash
            .read(anchor, self.geometry.leb_start, &mut sb_bytes)
            .map_err(|e| UbiError::bad_fastmap(format!("unable to read super-block: {e:#}")))?;
        let (_, sb) = FmSb::from_bytes((&sb_bytes[..], 0))
            .map_err(|e| UbiError::bad_fastmap(format!("unparseable super-block: {e}")))?;

        check_magic("super-block", sb.magic, FM_SB_MAGIC)?;
        if sb.version != FM_FMT_VERSION {
            return Err(UbiError::bad_fastmap(format!(
                "bad fastmap version: {}, expected: {FM_FMT_VERSION}",
                sb.version
            )));
        }
        if !(1..=FM_MAX_BLOCKS).contains(&sb.used_blocks) {
            return Err(UbiError::bad_fastmap(format!(
                "number of fastmap blocks is invalid: {}",
                sb.used_blocks
            )));
        }

        let leb_size = self.leb_size as usize;
        let size = leb_size * sb.used_blocks as usize;
        if size != self.fm_size {
            return Err(UbiError::bad_fastmap(format!(
                "bad fastmap size: {size}, expected: {}",
                self.fm_size
            )));
        }

        for (i, &pnum) in sb.block_loc[..sb.used_blocks as usize].iter().enumerate() {
            if pnum >= self.peb_count || self.classify(pnum).ok() != Some(PebStatus::Ok) {
                return Err(UbiError::bad_fastmap(format!(
                    "unable to read fastmap block# {i} (PEB: {pnum})"
                )));
            }

            let expected = if i == 0 { FM_SB_VOLUME_ID } else { FM_DATA_VOLUME_ID };
            let vol_id = self.header(pnum).map(|vid| vid.vol_id);
            if vol_id != Some(expected) {
                return Err(UbiError::bad_fastmap(format!(
                    "bad fastmap block# {i} vol_id: {vol_id:?}, expected: {expected:#x}"
                )));
            }

            let block = &mut self.fm_buf[i * leb_size..][..leb_size];
            self.flash
                .read(pnum, self.geometry.leb_start, block)
                .map_err(|e| {
                    UbiError::bad_fastmap(format!(
                        "unable to read fastmap block# {i} (PEB: {pnum}): {e:#}"
                    ))
                })?;
        }

        let mut crc_field = &self.fm_buf[FM_SB_DATA_CRC];
        let stored = crc_field.get_u32();
        self.fm_buf[FM_SB_DATA_CRC].fill(0);
        let crc = UBI_CRC.checksum(&self.fm_buf[..size]);
        if crc != stored {
            return Err(UbiError::bad_fastmap(format!(
                "fastmap data CRC is invalid: should be {stored:#x}, calc: {crc:#x}"
            )));
        }

        Ok(())
    }

    /// Walk the staged fastmap: collect the used PEBs, assign the PEBs of every volume's EBA
    /// table, then rescan both pools.
    fn attach_fastmap(&mut self, buf: &[u8]) -> Result<()> {
        let mut cursor = FmCursor::new(&buf[..self.fm_size]);
        self.fm_used.clear_all();

        cursor.take::<FmSb>()?;
        let hdr: FmHdr = cursor.take()?;
        check_magic("header", hdr.magic, FM_HDR_MAGIC)?;

        let pool1: FmScanPool = cursor.take()?;
        check_magic("pool", pool1.magic, FM_POOL_MAGIC)?;
        let pool2: FmScanPool = cursor.take()?;
        check_magic("WL pool", pool2.magic, FM_POOL_MAGIC)?;

        for pool in [&pool1, &pool2] {
            if usize::from(pool.size) > FM_MAX_POOL_SIZE
                || usize::from(pool.max_size) > FM_MAX_POOL_SIZE
            {
                return Err(UbiError::bad_fastmap(format!(
                    "bad pool size: {}, max {}",
                    pool.size, pool.max_size
                )));
            }
        }

        cursor.skip::<FmEc>(hdr.free_peb_count)?;
        for _ in 0..hdr.used_peb_count {
            let ec: FmEc = cursor.take()?;
            if ec.pnum >= self.peb_count {
                return Err(UbiError::bad_fastmap(format!(
                    "used PEB {} beyond PEB count",
                    ec.pnum
                )));
            }
            self.fm_used.set(ec.pnum as usize)?;
        }
        cursor.skip::<FmEc>(hdr.scrub_peb_count)?;
        cursor.skip::<FmEc>(hdr.erase_peb_count)?;

        for _ in 0..hdr.vol_count {
            let vhdr: FmVolHdr = cursor.take()?;
            check_magic("vol header", vhdr.magic, FM_VHDR_MAGIC)?;

            let (eba, pebs) = cursor.take_eba()?;
            check_magic("EBA header", eba.magic, FM_EBA_MAGIC)?;
            self.assign_eba(&vhdr, pebs)?;
        }

        for (what, pool) in [("pool", &pool1), ("WL pool", &pool2)] {
            self.scan_pool(what, &pool.pebs[..usize::from(pool.size)])?;
        }

        Ok(())
    }

    /// Check and assign every used PEB in one volume's EBA table
    fn assign_eba(&mut self, vhdr: &FmVolHdr, pebs: BeU32View<'_>) -> Result<()> {
        let (vol_id, used) = (vhdr.vol_id, vhdr.used_ebs);
        log::debug!(
            "UBI: fastmap vol {vol_id:#x} used {used} reserved {}",
            pebs.len()
        );

        for (lnum, pnum) in (0u32..).zip(pebs.iter()) {
            // Unmapped
            if (pnum as i32) < 0 {
                continue;
            }
            if !matches!(self.fm_used.clear(pnum as usize), Ok(true)) {
                continue;
            }
            // Reserved, but not part of the volume's data
            if lnum >= used {
                continue;
            }

            self.fm_pebs += 1;
            if let Err(e) = self.assign_fastmap_peb(pnum, vol_id, lnum) {
                // Static volumes are sometimes recorded with one LEB more than was written
                if lnum + 1 != used {
                    return Err(UbiError::bad_fastmap(format!(
                        "vol {vol_id:#x} LEB {lnum} PEB {pnum}: {e}"
                    )));
                }
                log::debug!("UBI: fastmap vol {vol_id:#x}: ignoring empty LEB {lnum} of {used}");
            }
        }

        Ok(())
    }

    /// Confirm that a PEB really holds the LEB the fastmap says it does, and take it
    fn assign_fastmap_peb(&mut self, pnum: u32, vol_id: u32, lnum: u32) -> Result<()> {
        self.check_pnum(pnum)?;
        match self.classify(pnum)? {
            PebStatus::Ok => (),
            _ => return Err(UbiError::BadHeader { pnum }),
        }

        match self.header(pnum) {
            Some(vid) if vid.vol_id == vol_id && vid.lnum == lnum => (),
            _ => return Err(UbiError::BadHeader { pnum }),
        }

        match self.scan_peb(pnum)? {
            ScanEvent::Consumed => Ok(()),
            _ => Err(UbiError::BadHeader { pnum }),
        }
    }

    /// Rescan the PEBs of a pool; these may hold newer copies of LEBs than the EBA tables say
    fn scan_pool(&mut self, what: &str, pebs: &[u32]) -> Result<()> {
        log::debug!("UBI: scanning {what} of size {}", pebs.len());

        for &pnum in pebs {
            if pnum >= self.peb_count {
                return Err(UbiError::bad_fastmap(format!(
                    "bad PEB {pnum} in fastmap {what}"
                )));
            }

            // Failures are fine here, the loader looks for replacements
            if let Err(e) = self.scan_peb(pnum) {
                log::debug!("UBI: ignoring {what} PEB {pnum}: {e}");
            }
        }

        Ok(())
    }
}
