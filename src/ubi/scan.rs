//! This module contains code to classify PEBs by their VID headers, and to build the LEB-to-PEB
//! tables of the tracked volumes from them.

use super::attach::UbiAttach;
use super::error::{Result, UbiError};
use super::fastmap::FM_MAX_START;
use super::headers::*;
use super::vtbl::{VolumeTable, VtblState};
use super::{PebIo, ReadStatus, MAX_VOL_LEBS, VOL_IDS};

/// These are the states that a PEB may be classified in
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum PebStatus {
    /// The PEB carries a valid VID header, which has been recorded
    Ok,

    /// The PEB is bad, erased, or its VID header fails the magic or CRC check
    BadHeader,

    /// The PEB is erased, but its EC header marks the end of the used region of the flash
    Eof,

    /// Reading the VID header failed
    IoError,
}

/// The outcome of scanning a single PEB, as far as the scan loop is concerned
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub(super) enum ScanEvent {
    /// The header was recorded, or belongs to a volume we don't care about
    Consumed,

    /// The PEB has no usable VID header
    Rejected(PebStatus),

    /// The used region of the flash ends here
    Eof,

    /// The PEB holds a fastmap super-block, and fastmap is enabled
    Anchor,
}

impl<I: PebIo> UbiAttach<I> {
    /// Read and validate the VID header of a PEB, recording it on success.
    ///
    /// Every PEB is only read once: already-scanned PEBs report their earlier outcome.
    pub(super) fn classify(&mut self, pnum: u32) -> Result<PebStatus> {
        self.check_pnum(pnum)?;
        let index = pnum as usize;

        if self.eof.test(index) {
            return Ok(PebStatus::Eof);
        }
        if self.corrupt.test(index) {
            return Ok(PebStatus::BadHeader);
        }
        if self.scanned.set(index)? {
            return Ok(PebStatus::Ok);
        }

        if self.flash.is_bad_peb(pnum) {
            log::debug!("UBI: skipping bad PEB {pnum}");
            self.corrupt.set(index)?;
            return Ok(PebStatus::BadHeader);
        }

        let mut buf = [0u8; VID_HDR_SIZE];
        match self.flash.read(pnum, self.geometry.vid_offset, &mut buf) {
            Ok(ReadStatus::Clean) => (),
            Ok(ReadStatus::Bitflips) => {
                log::debug!("UBI: correctable bitflips in VID header of PEB {pnum}")
            }
            Err(e) => {
                log::debug!("UBI: skipping unreadable PEB {pnum}: {e:#}");
                self.corrupt.set(index)?;
                return Ok(PebStatus::IoError);
            }
        }

        if peek_magic(&buf) == Some(ERASED_MAGIC) {
            self.corrupt.set(index)?;
            if self.has_eof_marker(pnum) {
                log::info!("UBI: EOF marker found in PEB {pnum}");
                self.eof.set(index)?;
                return Ok(PebStatus::Eof);
            }
            return Ok(PebStatus::BadHeader);
        }

        let Some(vid) = Vid::decode(&buf) else {
            log::debug!(
                "UBI: bad VID header in PEB {pnum}, magic {:#010x}",
                peek_magic(&buf).unwrap_or_default()
            );
            self.corrupt.set(index)?;
            return Ok(PebStatus::BadHeader);
        };

        log::debug!(
            "UBI: PEB {pnum}: vol {:#x} LEB {} sqnum {}",
            vid.vol_id,
            vid.lnum,
            vid.sqnum
        );
        self.blockinfo[index] = Some(vid);
        Ok(PebStatus::Ok)
    }

    /// Does the (erased-looking) PEB carry the end-of-used-region marker in its EC header?
    fn has_eof_marker(&mut self, pnum: u32) -> bool {
        let mut buf = [0u8; EC_HDR_SIZE];
        match self.flash.read(pnum, 0, &mut buf) {
            Ok(_) => Ec::has_eof_marker(&buf),
            Err(e) => {
                log::debug!("UBI: unable to read EC header of PEB {pnum}: {e:#}");
                false
            }
        }
    }

    /// Classify a PEB that is expected to hold LEB `lnum` of static volume `vol_id`, e.g. because
    /// a fastmap said so. Fails unless it really does.
    pub(super) fn rescan_matching(&mut self, pnum: u32, vol_id: u32, lnum: u32) -> Result<()> {
        match self.classify(pnum)? {
            PebStatus::Ok => (),
            _ => return Err(UbiError::BadHeader { pnum }),
        }

        match self.blockinfo[pnum as usize] {
            Some(vid)
                if vid.vol_id == vol_id && vid.vol_type == VolType::Static && vid.lnum == lnum =>
            {
                Ok(())
            }
            vid => {
                log::debug!("UBI: PEB {pnum} expected vol {vol_id} LEB {lnum}, found {vid:?}");
                Err(UbiError::BadHeader { pnum })
            }
        }
    }

    /// Classify a PEB and act on its header: read a volume table, note a fastmap anchor, or file
    /// the PEB under its volume.
    pub(super) fn scan_peb(&mut self, pnum: u32) -> Result<ScanEvent> {
        match self.classify(pnum)? {
            PebStatus::Ok => (),
            PebStatus::Eof => return Ok(ScanEvent::Eof),
            status => return Ok(ScanEvent::Rejected(status)),
        }

        let Some(vid) = self.blockinfo[pnum as usize] else {
            return Ok(ScanEvent::Rejected(PebStatus::BadHeader));
        };

        match vid.vol_id {
            FM_SB_VOLUME_ID if self.fm_enabled => Ok(ScanEvent::Anchor),
            LAYOUT_VOLUME_ID if !self.vtbl.is_valid() => {
                self.read_volume_table(pnum)?;
                Ok(ScanEvent::Consumed)
            }
            vol_id if vol_id < VOL_IDS && vid.vol_type == VolType::Static => {
                self.add_peb_to_vol(pnum, &vid)?;
                Ok(ScanEvent::Consumed)
            }
            _ => Ok(ScanEvent::Consumed),
        }
    }

    /// Read the volume table from a PEB of the layout volume. A table that fails validation is
    /// remembered as such, so another copy can still be tried.
    fn read_volume_table(&mut self, pnum: u32) -> Result<()> {
        let size = VolumeTable::read_size(self.leb_size);

        // Staged in the LEB cache, which no longer holds what its tag says
        self.cache.invalidate();
        let buf = &mut self.cache.data[..size];

        if let Err(e) = self.flash.read(pnum, self.geometry.leb_start, buf) {
            log::error!("UBI error: unable to read volume table from PEB {pnum}: {e:#}");
            return Err(UbiError::Io { pnum });
        }

        match VolumeTable::parse(buf, self.leb_size, self.geometry.vid_offset) {
            Ok(table) => {
                log::debug!("UBI: volume table read from PEB {pnum}");
                self.vtbl = VtblState::Valid(table);
                Ok(())
            }
            Err(e) => {
                self.vtbl = VtblState::Invalid(e.to_string());
                Err(e)
            }
        }
    }

    /// File a PEB with a valid header under LEB `vid.lnum` of volume `vid.vol_id`, resolving a
    /// collision with the PEB already filed there in favour of the newer copy.
    pub(super) fn add_peb_to_vol(&mut self, pnum: u32, vid: &Vid) -> Result<()> {
        let (vol_id, lnum) = (vid.vol_id, vid.lnum);

        if lnum >= MAX_VOL_LEBS {
            log::warn!("UBI warning: vol {vol_id} LEB {lnum} >= {MAX_VOL_LEBS}");
            return Err(UbiError::ParamInvalid(format!(
                "LEB {lnum} of volume {vol_id} exceeds MAX_VOL_LEBS"
            )));
        }
        let vi = self
            .volinfo
            .get_mut(vol_id as usize)
            .ok_or_else(|| UbiError::ParamInvalid(format!("volume {vol_id} is not tracked")))?;

        log::debug!(
            "UBI: add PEB {pnum} to vol {vol_id} as LEB {lnum}, found {}",
            vi.found.test(lnum as usize)
        );

        if !vi.found.set(lnum as usize)? {
            vi.lebs_to_pebs[lnum as usize] = pnum;
            vi.last_block = vi.last_block.max(lnum);
            return Ok(());
        }

        let cur_pnum = vi.lebs_to_pebs[lnum as usize];
        if cur_pnum == pnum {
            return Ok(());
        }

        // The current holder may only be known from a fastmap, and be stale by now
        if !self.scanned.test(cur_pnum as usize)
            && self.rescan_matching(cur_pnum, vol_id, lnum).is_err()
        {
            self.volinfo[vol_id as usize].lebs_to_pebs[lnum as usize] = pnum;
            return Ok(());
        }

        let cur = match self.blockinfo.get(cur_pnum as usize) {
            Some(Some(cur)) if !self.corrupt.test(cur_pnum as usize) => *cur,
            _ => {
                self.volinfo[vol_id as usize].lebs_to_pebs[lnum as usize] = pnum;
                return Ok(());
            }
        };

        log::debug!(
            "UBI: vol {vol_id} LEB {lnum}: PEB {cur_pnum} sqnum {} vs PEB {pnum} sqnum {}",
            cur.sqnum,
            vid.sqnum
        );
        if cur.sqnum < vid.sqnum {
            self.volinfo[vol_id as usize].lebs_to_pebs[lnum as usize] = pnum;
        }
        Ok(())
    }

    /// Scan one PEB as part of a linear scan, where nothing but the EOF marker and a fastmap
    /// anchor can change the course of the scan
    fn scan_linear(&mut self, pnum: u32) -> ScanEvent {
        self.scan_peb(pnum).unwrap_or_else(|e| {
            log::debug!("UBI: ignoring PEB {pnum}: {e}");
            ScanEvent::Consumed
        })
    }

    /// Walk the whole partition, attaching through the first fastmap anchor found if enabled.
    pub(super) fn full_scan(&mut self) {
        let rpt = howudoin::new()
            .label("Scanning PEBs")
            .set_len(u64::from(self.peb_count));

        let mut pnum = 0;
        let anchor_window = FM_MAX_START.min(self.peb_count);

        while pnum < anchor_window {
            rpt.inc();
            match self.scan_linear(pnum) {
                ScanEvent::Eof => {
                    self.peb_count = pnum;
                    rpt.close();
                    return;
                }
                ScanEvent::Anchor => {
                    if self.scan_fastmap(pnum).is_ok() {
                        rpt.close();
                        return;
                    }

                    // Trust nothing learned so far about the volumes, and start over
                    self.fm_anchor = None;
                    self.fm_pebs = 0;
                    self.fm_enabled = false;
                    self.reset_volumes();
                    pnum = 0;
                    rpt.add_info("Attach by fastmap failed, doing a full scan");
                    break;
                }
                _ => pnum += 1,
            }
        }

        while pnum < self.peb_count {
            rpt.inc();
            if self.scan_linear(pnum) == ScanEvent::Eof {
                self.peb_count = pnum;
                break;
            }
            pnum += 1;
        }

        rpt.close();
    }
}
