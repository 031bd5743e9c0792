use thiserror::Error;

/// Error type that is returned from the public api of this crate.
///
/// Failures while handling an individual PDU are not errors, they turn into a PDU status in the response.
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HapError {
    /// Malformed TLV or PDU, authentication tag mismatch or an integer of the wrong width.
    #[error("invalid data")]
    InvalidData,
    /// The output buffer was too small to hold the encoding.
    #[error("out of resources")]
    OutOfResources,
    /// Operation attempted on a session or object that is not in the correct state for it.
    #[error("invalid state")]
    InvalidState,
    /// A collaborator failed for a reason we can't classify.
    #[error("unknown error")]
    Unknown,
}

impl From<crate::tlv::TLVError> for HapError {
    fn from(e: crate::tlv::TLVError) -> HapError {
        use crate::tlv::TLVError;
        match e {
            TLVError::NotEnoughData => HapError::InvalidData,
            TLVError::MissingEntry(_) => HapError::InvalidData,
            TLVError::UnexpectedValue => HapError::InvalidData,
            TLVError::BufferOverrun => HapError::OutOfResources,
        }
    }
}

impl From<crate::InterfaceError> for HapError {
    fn from(e: crate::InterfaceError) -> HapError {
        match e {
            crate::InterfaceError::Storage => HapError::Unknown,
            _ => HapError::InvalidData,
        }
    }
}
