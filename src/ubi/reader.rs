//! A `std::io` view of one static volume.

use std::io::{self, Read, Seek, SeekFrom};

use super::attach::UbiAttach;
use super::error::Result;
use super::load::VolumeSelector;
use super::PebIo;

impl<I: PebIo> UbiAttach<I> {
    /// Run `op`, and if it fails on a state attached through a fastmap, distrust the fastmap:
    /// rescan everything and run `op` once more.
    pub fn retry_without_fastmap<T>(
        &mut self,
        mut op: impl FnMut(&mut Self) -> Result<T>,
    ) -> Result<T> {
        match op(self) {
            Err(e) if self.fastmap_attached() => {
                log::warn!("UBI warning: {e} after fastmap attach, rescanning without fastmap");
                self.rescan(false);
                op(self)
            }
            result => result,
        }
    }
}

/// Reads a volume's data through an attach state, from a seekable position
#[derive(Debug)]
pub struct VolumeReader<'a, I> {
    ubi: &'a mut UbiAttach<I>,
    volume: VolumeSelector,
    size: u64,
    pos: u64,
}

impl<'a, I: PebIo> VolumeReader<'a, I> {
    /// Open a volume, positioned at its start. This walks the whole volume to learn its size.
    pub fn open(ubi: &'a mut UbiAttach<I>, volume: VolumeSelector) -> Result<Self> {
        let size = ubi.retry_without_fastmap(|ubi| ubi.get_volume_size(&volume))?;

        Ok(Self {
            ubi,
            volume,
            size: size.into(),
            pos: 0,
        })
    }

    /// The size of the volume's data, in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn volume(&self) -> &VolumeSelector {
        &self.volume
    }
}

impl<I: PebIo> Read for VolumeReader<'_, I> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = self.size.saturating_sub(self.pos);
        let len = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        if len == 0 {
            return Ok(0);
        }

        // pos < size, and sizes are 32-bit
        let offset = self.pos as u32;
        let dest = &mut buf[..len];
        let volume = &self.volume;
        let read = self
            .ubi
            .retry_without_fastmap(|ubi| ubi.load_volume(volume, Some(&mut *dest), offset))
            .map_err(io::Error::other)?;

        self.pos += read as u64;
        Ok(read)
    }
}

impl<I: PebIo> Seek for VolumeReader<'_, I> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let (base, delta) = match pos {
            SeekFrom::Start(pos) => (pos, 0),
            SeekFrom::End(delta) => (self.size, delta),
            SeekFrom::Current(delta) => (self.pos, delta),
        };

        self.pos = base.checked_add_signed(delta).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "invalid seek to a negative or overflowing position",
            )
        })?;
        Ok(self.pos)
    }
}
