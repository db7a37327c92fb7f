//! Loading static volumes: walking their LEBs in order, checking the data CRC of each, and
//! looking for a replacement copy wherever a mapped PEB turns out to be unusable.

use std::fmt;
use std::str::FromStr;

use super::attach::UbiAttach;
use super::error::{Result, UbiError};
use super::headers::{VolType, UBI_CRC};
use super::scan::PebStatus;
use super::{PebIo, VOL_IDS};

/// Identifies the LEB held in the cache, and the data it was loaded with
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct CacheTag {
    vol_id: u32,
    lnum: u32,
    len: u32,
    crc: u32,
}

/// The single LEB-sized cache buffer, so that reading a volume piecewise does not read (and
/// CRC-check) the same LEB over and over.
#[derive(Debug)]
pub(super) struct LebCache {
    tag: Option<CacheTag>,
    pub(super) data: Box<[u8]>,
}

impl LebCache {
    pub fn new(leb_size: usize) -> Self {
        Self {
            tag: None,
            data: vec![0; leb_size].into_boxed_slice(),
        }
    }

    pub fn invalidate(&mut self) {
        self.tag = None;
    }
}

/// Selects a volume, by id or by its name in the volume table
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VolumeSelector {
    Id(u32),
    Name(String),
}

/// Anything that parses as a number is an id, everything else is a name
impl FromStr for VolumeSelector {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(s.parse()
            .map_or_else(|_| Self::Name(s.to_string()), Self::Id))
    }
}

impl From<u32> for VolumeSelector {
    fn from(value: u32) -> Self {
        Self::Id(value)
    }
}

impl From<&str> for VolumeSelector {
    fn from(value: &str) -> Self {
        Self::Name(value.to_string())
    }
}

impl fmt::Display for VolumeSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "#{id}"),
            Self::Name(name) => write!(f, "\"{name}\""),
        }
    }
}

/// What loading (part of) one LEB produced
#[derive(Debug, Copy, Clone)]
struct BlockRead {
    /// The amount of data held by the LEB
    data_len: u32,

    /// The number of bytes copied out of it
    copied: usize,
}

impl<I: PebIo> UbiAttach<I> {
    /// Turn a selector into a tracked volume id
    fn resolve(&self, volume: &VolumeSelector) -> Result<u32> {
        match volume {
            &VolumeSelector::Id(vol_id) if vol_id < VOL_IDS => Ok(vol_id),
            VolumeSelector::Id(vol_id) => Err(UbiError::ParamInvalid(format!(
                "volume id {vol_id} is not below {VOL_IDS}"
            ))),
            VolumeSelector::Name(name) => self
                .vtbl
                .get()?
                .and_then(|table| table.find(name))
                .ok_or_else(|| {
                    log::error!("UBI error: No volume named {name} could be found");
                    UbiError::VolumeNotFound(name.clone())
                }),
        }
    }

    /// Get the size of a volume's data, in bytes. This walks every LEB of the volume without
    /// reading their data; the result is kept for later calls.
    pub fn get_volume_size(&mut self, volume: &VolumeSelector) -> Result<u32> {
        let vol_id = self.resolve(volume)?;

        if let Some(size) = self.sizes[vol_id as usize] {
            return Ok(size);
        }

        let size = self.load(vol_id, None, 0)?;
        let size = u32::try_from(size)
            .map_err(|_| UbiError::ParamInvalid(format!("volume {vol_id} too large")))?;
        self.sizes[vol_id as usize] = Some(size);

        log::info!("UBI: Volume {volume} (Id #{vol_id}) size is {size} bytes");
        Ok(size)
    }

    /// Copy `dest.len()` bytes of a volume's data, starting `offset` bytes in, into `dest`.
    /// Returns the number of bytes copied, which is short if the volume ends first.
    ///
    /// Without `dest`, nothing is copied and the size of the whole volume is returned.
    ///
    /// On failure, the content of `dest` is unspecified.
    pub fn load_volume(
        &mut self,
        volume: &VolumeSelector,
        dest: Option<&mut [u8]>,
        offset: u32,
    ) -> Result<usize> {
        let vol_id = self.resolve(volume)?;
        log::debug!("UBI: loading volume {volume} (Id #{vol_id})");

        self.load(vol_id, dest, offset).map_err(|e| {
            log::warn!("UBI warning: failed to load volume {volume}: {e}");
            e
        })
    }

    fn load(&mut self, vol_id: u32, mut dest: Option<&mut [u8]>, offset: u32) -> Result<usize> {
        let last = self.volinfo[vol_id as usize].last_block + 1;
        let wanted = dest.as_ref().map(|dest| dest.len());

        // Offset into the volume of the current LEB's data
        let mut doff = 0u64;
        let mut lenread = 0usize;

        for lnum in 0..last {
            let block_dest = dest.as_deref_mut().map(|dest| &mut dest[lenread..]);
            let skip = match block_dest {
                Some(_) if doff < u64::from(offset) => u64::from(offset) - doff,
                _ => 0,
            };
            let skip = u32::try_from(skip).unwrap_or(u32::MAX);

            let read = self.load_block(block_dest, vol_id, lnum, last, skip)?;

            match wanted {
                Some(wanted) => {
                    lenread += read.copied;
                    doff += u64::from(read.data_len);
                    if lenread == wanted {
                        break;
                    }
                }
                None => lenread += read.data_len as usize,
            }
        }

        Ok(lenread)
    }

    /// Load LEB `lnum` of a volume of `last` LEBs, copying from `skip` bytes into its data
    fn load_block(
        &mut self,
        mut dest: Option<&mut [u8]>,
        vol_id: u32,
        lnum: u32,
        last: u32,
        skip: u32,
    ) -> Result<BlockRead> {
        // Every failed attempt marks a PEB corrupt or unmaps the LEB, so this always ends
        for _ in 0..=self.peb_count {
            let vi = &self.volinfo[vol_id as usize];
            if !vi.found.test(lnum as usize) {
                log::warn!("UBI warning: LEB {lnum} of {last} is missing");
                return Err(UbiError::LebMissing { vol_id, lnum });
            }

            let pnum = vi.lebs_to_pebs[lnum as usize];
            log::debug!("UBI: load vol {vol_id} LEB {lnum} PEB {pnum}");
            if let Err(e) = self.check_pnum(pnum) {
                log::warn!("UBI warning: corrupted mapping block {lnum} PEB {pnum}");
                return Err(e);
            }

            if let Some(read) = self.read_block(pnum, dest.as_deref_mut(), vol_id, lnum, last, skip)? {
                return Ok(read);
            }

            self.find_replacement(vol_id, lnum)?;
        }

        Err(UbiError::LebMissing { vol_id, lnum })
    }

    /// Try one PEB for a LEB; None means another one has to be found
    fn read_block(
        &mut self,
        pnum: u32,
        dest: Option<&mut [u8]>,
        vol_id: u32,
        lnum: u32,
        last: u32,
        skip: u32,
    ) -> Result<Option<BlockRead>> {
        let index = pnum as usize;
        if self.corrupt.test(index) {
            return Ok(None);
        }

        if !self.scanned.test(index) {
            log::warn!("UBI warning: vol {vol_id} LEB {lnum} PEB {pnum} not yet scanned");
            if self.rescan_matching(pnum, vol_id, lnum).is_err() {
                return Ok(None);
            }
        }

        let vid = match self.blockinfo[index] {
            Some(vid) if vid.vol_id == vol_id && vid.lnum == lnum => vid,
            _ => return Ok(None),
        };

        if vid.used_ebs != last {
            log::debug!(
                "UBI: block count mismatch in PEB {pnum}: used_ebs {} but {last} LEBs",
                vid.used_ebs
            );
            self.corrupt.set(index)?;
            return Ok(None);
        }

        let dlen = vid.data_size;
        if dlen as usize > self.cache.data.len() {
            log::warn!("UBI warning: vol {vol_id} LEB {lnum} PEB {pnum} data size {dlen} too large");
            self.corrupt.set(index)?;
            return Ok(None);
        }

        let dest = match dest {
            Some(dest) if skip < dlen => dest,
            _ => {
                return Ok(Some(BlockRead {
                    data_len: dlen,
                    copied: 0,
                }))
            }
        };
        let len = ((dlen - skip) as usize).min(dest.len());

        let tag = CacheTag {
            vol_id,
            lnum,
            len: dlen,
            crc: vid.data_crc,
        };
        if self.cache.tag != Some(tag) {
            log::debug!("UBI: reading vol {vol_id} LEB {lnum} from PEB {pnum}");
            self.cache.tag = None;

            let leb_start = self.geometry.leb_start;
            let data = &mut self.cache.data[..dlen as usize];
            if let Err(e) = self.flash.read(pnum, leb_start, data) {
                log::warn!("UBI warning: vol {vol_id} LEB {lnum} PEB {pnum} read failure: {e:#}");
                self.corrupt.set(index)?;
                return Ok(None);
            }

            if UBI_CRC.checksum(data) != vid.data_crc {
                log::warn!("UBI warning: vol {vol_id} LEB {lnum} PEB {pnum} data CRC failure");
                self.corrupt.set(index)?;
                return Ok(None);
            }

            self.cache.tag = Some(tag);
        }

        dest[..len].copy_from_slice(&self.cache.data[skip as usize..][..len]);
        Ok(Some(BlockRead {
            data_len: dlen,
            copied: len,
        }))
    }

    /// Unmap a LEB, then remap it to the newest usable copy anywhere on the flash, if any
    fn find_replacement(&mut self, vol_id: u32, lnum: u32) -> Result<()> {
        log::debug!("UBI: find replacement for vol {vol_id} LEB {lnum}");
        self.volinfo[vol_id as usize].found.clear(lnum as usize)?;

        let mut best: Option<(u32, u64)> = None;
        for pnum in 0..self.peb_count {
            if self.corrupt.test(pnum as usize) {
                continue;
            }
            if !self.scanned.test(pnum as usize) && self.classify(pnum)? != PebStatus::Ok {
                continue;
            }

            let Some(vid) = self.blockinfo[pnum as usize] else {
                continue;
            };
            if vid.vol_id != vol_id || vid.lnum != lnum || vid.vol_type != VolType::Static {
                continue;
            }

            if best.map_or(true, |(_, sqnum)| sqnum < vid.sqnum) {
                best = Some((pnum, vid.sqnum));
            }
        }

        if let Some((pnum, _)) = best {
            log::debug!("UBI: trying PEB {pnum} for LEB {lnum}");
            let vi = &mut self.volinfo[vol_id as usize];
            vi.found.set(lnum as usize)?;
            vi.lebs_to_pebs[lnum as usize] = pnum;
        }

        Ok(())
    }
}
