//! Structures related to application protocol data units (APDUs).


use std::fmt;
use std::io::{self, Write};


/// Application identifier of the eMRTD application (ICAO Doc 9303 Part 10 § 3.6.2).
pub const EMRTD_APPLICATION_ID: [u8; 7] = [0xA0, 0x00, 0x00, 0x02, 0x47, 0x10, 0x01];

/// Largest offset that can be encoded in P1-P2 of READ BINARY with an even instruction byte.
pub const MAX_SHORT_READ_OFFSET: usize = 0x7FFF;


#[derive(Debug)]
pub enum WriteError {
    Io(io::Error),
    EmptyData,
    DataTooLong { maximum: usize, obtained: usize },
}
impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::EmptyData => write!(f, "data is, but must not be, empty"),
            Self::DataTooLong { maximum, obtained } => write!(f, "too much data: obtained {} bytes, expected maximum {} bytes", obtained, maximum),
        }
    }
}
impl std::error::Error for WriteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::EmptyData => None,
            Self::DataTooLong { .. } => None,
        }
    }
}
impl From<io::Error> for WriteError {
    fn from(value: io::Error) -> Self { Self::Io(value) }
}


#[derive(Clone, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct CommandHeader {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
}
impl CommandHeader {
    pub const fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self { cla, ins, p1, p2 }
    }

    pub const fn to_bytes(&self) -> [u8; 4] {
        [self.cla, self.ins, self.p1, self.p2]
    }

    pub const fn to_be_u32(&self) -> u32 {
        u32::from_be_bytes(self.to_bytes())
    }

    pub fn write_bytes<W: Write>(&self, writer: &mut W) -> Result<(), WriteError> {
        let bytes = self.to_bytes();
        writer.write_all(&bytes)?;
        Ok(())
    }
}
impl fmt::Debug for CommandHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CommandHeader {} cla: 0x{:02X}, ins: 0x{:02X}, p1: 0x{:02X}, p2: 0x{:02X} {}",
            '{', self.cla, self.ins, self.p1, self.p2, '}',
        )
    }
}

#[derive(Clone, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ResponseTrailer {
    pub sw1: u8,
    pub sw2: u8,
}
impl ResponseTrailer {
    pub const SUCCESS: Self = Self::new(0x90, 0x00);

    pub const fn new(sw1: u8, sw2: u8) -> Self {
        Self {
            sw1,
            sw2,
        }
    }

    pub const fn to_bytes(&self) -> [u8; 2] {
        [self.sw1, self.sw2]
    }

    pub const fn to_word(&self) -> u16 {
        u16::from_be_bytes([self.sw1, self.sw2])
    }

    pub const fn is_success(&self) -> bool {
        self.to_word() == 0x9000
    }

    /// Whether the card signals that the end of the file was reached before the requested number
    /// of bytes could be read (`62 82`).
    pub const fn is_end_of_file_warning(&self) -> bool {
        self.to_word() == 0x6282
    }

    /// Whether the card signals that secure messaging data objects are missing or incorrect
    /// (`69 87`, `69 88`), which is how chips complain about a broken session.
    pub const fn is_secure_messaging_failure(&self) -> bool {
        matches!(self.to_word(), 0x6987 | 0x6988)
    }

    /// The number of response bytes still waiting to be collected with GET RESPONSE (`61 XX`).
    pub const fn bytes_available(&self) -> Option<u8> {
        if self.sw1 == 0x61 { Some(self.sw2) } else { None }
    }

    /// The exact response length the card wants in Le after rejecting the command (`6C XX`).
    pub const fn exact_length(&self) -> Option<u8> {
        if self.sw1 == 0x6C { Some(self.sw2) } else { None }
    }
}
impl fmt::Debug for ResponseTrailer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResponseTrailer {} sw1: 0x{:02X}, sw2: 0x{:02X} {}", '{', self.sw1, self.sw2, '}')
    }
}


/// The body of a command APDU.
///
/// A short response length of 0 requests up to 256 bytes; an extended response length of 0
/// requests up to 65536 bytes.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Data {
    NoData,
    RequestDataShort {
        request_data: Vec<u8>,
    },
    RequestDataExtended {
        request_data: Vec<u8>,
    },
    ResponseDataShort {
        response_data_length: u8,
    },
    ResponseDataExtended {
        response_data_length: u16,
    },
    BothDataShort {
        request_data: Vec<u8>,
        response_data_length: u8,
    },
    BothDataExtended {
        request_data: Vec<u8>,
        response_data_length: u16,
    },
}
impl Data {
    pub fn response_data_length(&self) -> Option<usize> {
        fn short(le: u8) -> usize {
            if le == 0 { 256 } else { usize::from(le) }
        }
        fn extended(le: u16) -> usize {
            if le == 0 { 65536 } else { usize::from(le) }
        }

        match self {
            Self::NoData => None,
            Self::RequestDataShort { .. } => None,
            Self::RequestDataExtended { .. } => None,
            Self::ResponseDataShort { response_data_length } => Some(short(*response_data_length)),
            Self::ResponseDataExtended { response_data_length } => Some(extended(*response_data_length)),
            Self::BothDataShort { response_data_length, .. } => Some(short(*response_data_length)),
            Self::BothDataExtended { response_data_length, .. } => Some(extended(*response_data_length)),
        }
    }

    pub fn request_data(&self) -> Option<&[u8]> {
        match self {
            Self::NoData => None,
            Self::RequestDataShort { request_data } => Some(request_data.as_slice()),
            Self::RequestDataExtended { request_data } => Some(request_data.as_slice()),
            Self::ResponseDataShort { .. } => None,
            Self::ResponseDataExtended { .. } => None,
            Self::BothDataShort { request_data, .. } => Some(request_data.as_slice()),
            Self::BothDataExtended { request_data, .. } => Some(request_data.as_slice()),
        }
    }

    pub fn write_bytes<W: Write>(&self, writer: &mut W) -> Result<(), WriteError> {
        fn ensure_not_empty(request_data: &[u8]) -> Result<(), WriteError> {
            if request_data.is_empty() {
                Err(WriteError::EmptyData)
            } else {
                Ok(())
            }
        }
        fn ensure_max_length(request_data: &[u8], max_length: usize) -> Result<(), WriteError> {
            if request_data.len() > max_length {
                Err(WriteError::DataTooLong { maximum: max_length, obtained: request_data.len() })
            } else {
                Ok(())
            }
        }
        fn short_length(request_data: &[u8]) -> u8 {
            // 256 wraps around to 0x00
            (request_data.len() & 0xFF) as u8
        }
        fn extended_length(request_data: &[u8]) -> [u8; 2] {
            // 65536 wraps around to 0x0000
            ((request_data.len() & 0xFFFF) as u16).to_be_bytes()
        }

        match self {
            // "case" refers to the cases in ISO/IEC 7816-3:2006 § 12.1.3
            Data::NoData => {
                // case 1
                Ok(())
            },
            Data::RequestDataShort { request_data } => {
                // case 3S
                ensure_not_empty(request_data)?;
                ensure_max_length(request_data, 256)?;

                // [Lc] [Data]
                writer.write_all(&[short_length(request_data)])?;
                writer.write_all(request_data)?;
                Ok(())
            },
            Data::RequestDataExtended { request_data } => {
                // case 3E
                ensure_not_empty(request_data)?;
                ensure_max_length(request_data, 65536)?;
                let length_bytes = extended_length(request_data);

                // [0x00] [LcMSB] [LcLSB] [Data]
                writer.write_all(&[0x00, length_bytes[0], length_bytes[1]])?;
                writer.write_all(request_data)?;
                Ok(())
            },
            Data::ResponseDataShort { response_data_length } => {
                // case 2S
                // [Le]
                writer.write_all(&[*response_data_length])?;
                Ok(())
            },
            Data::ResponseDataExtended { response_data_length } => {
                // case 2E
                // [0x00] [LeMSB] [LeLSB]
                let length_bytes = response_data_length.to_be_bytes();
                writer.write_all(&[0x00, length_bytes[0], length_bytes[1]])?;
                Ok(())
            },
            Data::BothDataShort { request_data, response_data_length } => {
                // case 4S
                ensure_not_empty(request_data)?;
                ensure_max_length(request_data, 256)?;

                // [Lc] [Data] [Le]
                writer.write_all(&[short_length(request_data)])?;
                writer.write_all(request_data)?;
                writer.write_all(&[*response_data_length])?;
                Ok(())
            },
            Data::BothDataExtended { request_data, response_data_length } => {
                // case 4E
                ensure_not_empty(request_data)?;
                ensure_max_length(request_data, 65536)?;
                let request_length_bytes = extended_length(request_data);
                let response_length_bytes = response_data_length.to_be_bytes();

                // [0x00] [LcMSB] [LcLSB] [Data] [LeMSB] [LeLSB]
                writer.write_all(&[0x00, request_length_bytes[0], request_length_bytes[1]])?;
                writer.write_all(request_data)?;
                writer.write_all(&response_length_bytes)?;
                Ok(())
            },
        }
    }
}

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Apdu {
    pub header: CommandHeader,
    pub data: Data,
}
impl Apdu {
    pub fn write_bytes<W: Write>(&self, writer: &mut W) -> Result<(), WriteError> {
        self.header.write_bytes(writer)?;
        self.data.write_bytes(writer)?;
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, WriteError> {
        let mut bytes = Vec::new();
        self.write_bytes(&mut bytes)?;
        Ok(bytes)
    }

    /// SELECT of an application by its identifier, without requesting metadata.
    pub fn select_application(application_id: &[u8]) -> Self {
        Self {
            header: CommandHeader {
                cla: 0x00,
                ins: 0xA4, // SELECT
                p1: 0b000_001_00, // select by DF name (application identifier)
                p2: 0b0000_11_00, // return no metadata, return first or only occurrence
            },
            data: Data::RequestDataShort {
                request_data: application_id.to_vec(),
            },
        }
    }

    /// SELECT of an elementary file under the currently selected DF, without requesting metadata.
    ///
    /// Before any application has been selected, the current DF is the master file, which is where
    /// `EF.CardAccess` and `EF.CardSecurity` live.
    pub fn select_file(file_id: u16) -> Self {
        Self {
            header: CommandHeader {
                cla: 0x00,
                ins: 0xA4, // SELECT
                p1: 0b000_000_10, // select EF under current DF
                p2: 0b0000_11_00, // return no metadata, return first or only occurrence
            },
            data: Data::RequestDataShort {
                request_data: file_id.to_be_bytes().to_vec(),
            },
        }
    }

    /// READ BINARY of the currently selected file.
    ///
    /// Offsets beyond [`MAX_SHORT_READ_OFFSET`] use the odd instruction byte with the offset
    /// wrapped in a data object `0x54`; the response is then wrapped in a data object `0x53`.
    pub fn read_binary(offset: usize, length: u8) -> Self {
        if offset <= MAX_SHORT_READ_OFFSET {
            let offset_bytes = (offset as u16).to_be_bytes();
            Self {
                header: CommandHeader {
                    cla: 0x00,
                    ins: 0xB0, // READ BINARY
                    p1: offset_bytes[0],
                    p2: offset_bytes[1],
                },
                data: Data::ResponseDataShort {
                    response_data_length: length,
                },
            }
        } else {
            let mut offset_bytes = (offset as u32).to_be_bytes().to_vec();
            while offset_bytes.len() > 1 && offset_bytes[0] == 0x00 {
                offset_bytes.remove(0);
            }
            let mut request_data = vec![0x54, offset_bytes.len() as u8];
            request_data.extend(&offset_bytes);
            Self {
                header: CommandHeader {
                    cla: 0x00,
                    ins: 0xB1, // READ BINARY (odd instruction)
                    p1: 0x00,
                    p2: 0x00,
                },
                data: Data::BothDataShort {
                    request_data,
                    // the 0x53 wrapper eats into the budget
                    response_data_length: length,
                },
            }
        }
    }

    /// GET RESPONSE for data the card announced with `61 XX`.
    pub fn get_response(length: u8) -> Self {
        Self {
            header: CommandHeader {
                cla: 0x00,
                ins: 0xC0, // GET RESPONSE
                p1: 0x00,
                p2: 0x00,
            },
            data: Data::ResponseDataShort {
                response_data_length: length,
            },
        }
    }

    /// GET CHALLENGE for an 8-byte nonce.
    pub fn get_challenge() -> Self {
        Self {
            header: CommandHeader {
                cla: 0x00,
                ins: 0x84, // GET CHALLENGE
                p1: 0x00,
                p2: 0x00,
            },
            data: Data::ResponseDataShort {
                response_data_length: 8,
            },
        }
    }
}

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Response {
    pub data: Vec<u8>,
    pub trailer: ResponseTrailer,
}
impl Response {
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 2 {
            return None;
        }

        let data = bytes[..bytes.len() - 2].to_vec();
        let trailer = ResponseTrailer {
            sw1: bytes[bytes.len() - 2],
            sw2: bytes[bytes.len() - 1],
        };
        Some(Self {
            data,
            trailer,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.data.len() + 2);
        bytes.extend(&self.data);
        bytes.extend(self.trailer.to_bytes());
        bytes
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_case_encodings() {
        let select = Apdu::select_application(&EMRTD_APPLICATION_ID);
        assert_eq!(select.to_bytes().unwrap(), hex!("00 A4 04 0C 07 A0000002471001"));

        let read = Apdu::read_binary(0x0004, 0xE0);
        assert_eq!(read.to_bytes().unwrap(), hex!("00 B0 00 04 E0"));

        let challenge = Apdu::get_challenge();
        assert_eq!(challenge.to_bytes().unwrap(), hex!("00 84 00 00 08"));

        let extended = Apdu {
            header: CommandHeader::new(0x0C, 0x86, 0x00, 0x00),
            data: Data::BothDataExtended { request_data: vec![0xAA; 300], response_data_length: 0 },
        };
        let bytes = extended.to_bytes().unwrap();
        assert_eq!(&bytes[0..7], &hex!("0C 86 00 00 00 01 2C"));
        assert_eq!(&bytes[bytes.len()-2..], &hex!("00 00"));
        assert_eq!(bytes.len(), 4 + 3 + 300 + 2);
    }

    #[test]
    fn test_large_offset_uses_odd_instruction() {
        let read = Apdu::read_binary(0x8000, 0x60);
        assert_eq!(read.to_bytes().unwrap(), hex!("00 B1 00 00 04 54 02 8000 60"));
    }

    #[test]
    fn test_response_lengths() {
        assert_eq!(Data::ResponseDataShort { response_data_length: 0 }.response_data_length(), Some(256));
        assert_eq!(Data::ResponseDataExtended { response_data_length: 0 }.response_data_length(), Some(65536));
        assert_eq!(Data::BothDataShort { request_data: vec![1], response_data_length: 0xE0 }.response_data_length(), Some(0xE0));
        assert_eq!(Data::RequestDataShort { request_data: vec![1] }.response_data_length(), None);
    }

    #[test]
    fn test_empty_request_rejected() {
        let apdu = Apdu {
            header: CommandHeader::new(0x00, 0xA4, 0x02, 0x0C),
            data: Data::RequestDataShort { request_data: Vec::new() },
        };
        assert!(matches!(apdu.to_bytes(), Err(WriteError::EmptyData)));
    }

    #[test]
    fn test_response_parsing() {
        let response = Response::from_slice(&hex!("0102 6282")).unwrap();
        assert_eq!(response.data, vec![0x01, 0x02]);
        assert!(response.trailer.is_end_of_file_warning());
        assert!(!response.trailer.is_success());
        assert_eq!(response.to_bytes(), hex!("0102 6282"));
        assert!(Response::from_slice(&[0x90]).is_none());

        assert_eq!(ResponseTrailer::new(0x61, 0x10).bytes_available(), Some(0x10));
        assert_eq!(ResponseTrailer::new(0x6C, 0x20).exact_length(), Some(0x20));
        assert_eq!(ResponseTrailer::SUCCESS.exact_length(), None);
    }
}
