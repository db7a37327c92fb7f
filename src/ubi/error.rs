//! The error type returned by the attach and load operations.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum UbiError {
    /// A read callback failed in a way that could not be absorbed
    #[error("I/O error reading PEB {pnum}")]
    Io { pnum: u32 },

    /// The VID header of a PEB is missing, has the wrong magic, or fails its CRC
    #[error("bad VID header in PEB {pnum}")]
    BadHeader { pnum: u32 },

    /// The fastmap could not be used; a full scan is required
    #[error("bad fastmap: {0}")]
    BadFastmap(String),

    /// No volume by this name (or id) is known
    #[error("volume {0} not found")]
    VolumeNotFound(String),

    /// A LEB of a volume is not mapped to any usable PEB
    #[error("LEB {lnum} of volume {vol_id} is missing")]
    LebMissing { vol_id: u32, lnum: u32 },

    /// A parameter or on-flash value lies outside of its permitted range
    #[error("invalid parameter: {0}")]
    ParamInvalid(String),

    /// The volume table was found but failed validation
    #[error("bad volume table: {0}")]
    BadVolumeTable(String),
}

impl UbiError {
    pub(crate) fn bad_fastmap(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        log::error!("UBI error: {reason}");
        Self::BadFastmap(reason)
    }
}

impl From<crate::util::OutOfRange> for UbiError {
    fn from(value: crate::util::OutOfRange) -> Self {
        Self::ParamInvalid(value.to_string())
    }
}

pub type Result<T, E = UbiError> = std::result::Result<T, E>;
