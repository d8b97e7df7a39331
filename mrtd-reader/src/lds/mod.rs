//! The Logical Data Structure: the elementary files on the chip and their contents.


pub mod dg1;
pub mod dg2;
pub mod sod;


use std::fmt;

use crate::mrz;


/// An elementary file with a well-known meaning.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum EfIdentifier {
    /// PACE parameters, in the master file.
    CardAccess,

    /// Signed security infos, in the master file.
    CardSecurity,

    /// Common data (LDS version and list of data groups).
    Com,

    /// The document security object.
    Sod,

    /// The machine-readable zone.
    Dg1,

    /// The encoded face.
    Dg2,
}
impl EfIdentifier {
    /// The file identifier used with SELECT.
    pub const fn file_id(&self) -> u16 {
        match self {
            Self::CardAccess => 0x011C,
            Self::CardSecurity => 0x011D,
            Self::Com => 0x011E,
            Self::Sod => 0x011D,
            Self::Dg1 => 0x0101,
            Self::Dg2 => 0x0102,
        }
    }

    /// Whether the file lives in the master file rather than in the travel document application.
    pub const fn is_in_master_file(&self) -> bool {
        matches!(self, Self::CardAccess | Self::CardSecurity)
    }

    /// The data group number, if the file is a data group.
    pub const fn data_group_number(&self) -> Option<u8> {
        match self {
            Self::Dg1 => Some(1),
            Self::Dg2 => Some(2),
            _ => None,
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Self::CardAccess => "EF.CardAccess",
            Self::CardSecurity => "EF.CardSecurity",
            Self::Com => "EF.COM",
            Self::Sod => "EF.SOD",
            Self::Dg1 => "EF.DG1",
            Self::Dg2 => "EF.DG2",
        }
    }
}
impl fmt::Display for EfIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}


/// A malformed LDS file.
#[derive(Debug)]
pub enum Error {
    /// The BER-TLV structure is broken or truncated.
    Tlv { file: EfIdentifier },

    /// A data object has a different tag than required at this position.
    UnexpectedTag { file: EfIdentifier, expected: u32, obtained: u32 },

    /// A required data object is missing.
    MissingObject { file: EfIdentifier, tag: u32 },

    /// The MRZ in DG1 is malformed.
    Mrz(mrz::Error),

    /// An ASN.1 structure could not be decoded.
    Asn1 { file: EfIdentifier, error: der::Error },

    /// The ISO/IEC 19794-5 facial record in DG2 is malformed.
    FacialRecord { reason: &'static str },

    /// The document security object lacks an element required for verification.
    MissingSodElement { element: &'static str },
}
impl Error {
    /// The file that failed to decode.
    pub fn file(&self) -> EfIdentifier {
        match self {
            Self::Tlv { file } => *file,
            Self::UnexpectedTag { file, .. } => *file,
            Self::MissingObject { file, .. } => *file,
            Self::Mrz(_) => EfIdentifier::Dg1,
            Self::Asn1 { file, .. } => *file,
            Self::FacialRecord { .. } => EfIdentifier::Dg2,
            Self::MissingSodElement { .. } => EfIdentifier::Sod,
        }
    }
}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tlv { file }
                => write!(f, "{}: invalid TLV structure", file),
            Self::UnexpectedTag { file, expected, obtained }
                => write!(f, "{}: expected tag 0x{:02X}, obtained 0x{:02X}", file, expected, obtained),
            Self::MissingObject { file, tag }
                => write!(f, "{}: data object 0x{:02X} missing", file, tag),
            Self::Mrz(e)
                => write!(f, "{}: {}", EfIdentifier::Dg1, e),
            Self::Asn1 { file, error }
                => write!(f, "{}: ASN.1 decoding failed: {}", file, error),
            Self::FacialRecord { reason }
                => write!(f, "{}: invalid facial record: {}", EfIdentifier::Dg2, reason),
            Self::MissingSodElement { element }
                => write!(f, "{}: {} missing", EfIdentifier::Sod, element),
        }
    }
}
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Mrz(e) => Some(e),
            Self::Asn1 { error, .. } => Some(error),
            _ => None,
        }
    }
}
impl From<mrz::Error> for Error {
    fn from(value: mrz::Error) -> Self { Self::Mrz(value) }
}


/// Unwraps the application template that encloses every LDS file, checking its tag.
pub(crate) fn unwrap_template(file: EfIdentifier, bytes: &[u8], expected_tag: u32) -> Result<crate::der_util::Tlv<'_>, Error> {
    let (template, _rest) = crate::der_util::parse_tlv(bytes)
        .ok_or(Error::Tlv { file })?;
    if template.tag != expected_tag {
        return Err(Error::UnexpectedTag { file, expected: expected_tag, obtained: template.tag });
    }
    Ok(template)
}
