//! Utility functions for BER-TLV and Distinguished Encoding Rules.
//!
//! The Secure Messaging data objects and the LDS data groups use the BER-TLV layout with tags of
//! up to three bytes. Tags are represented as the big-endian integer value of their raw bytes, so
//! the DG1 MRZ tag reads as `0x5F1F` just like in the documentation.


/// Encode an ASN.1 DER primitive value length.
pub fn encode_primitive_length(output: &mut Vec<u8>, length: usize) {
    if length < 128 {
        // single-byte encoding
        output.push(length as u8);
    } else {
        // 0b1nnn_nnnn and then n additional bytes that actually specify the length
        // (big-endian)
        let length_bytes = length.to_be_bytes();
        let mut trimmed_length_slice = &length_bytes[..];
        while trimmed_length_slice[0] == 0x00 {
            trimmed_length_slice = &trimmed_length_slice[1..];
        }
        output.push(0b1000_0000 | (trimmed_length_slice.len() as u8));
        output.extend(trimmed_length_slice);
    }
}


/// Decode an ASN.1 DER primitive value length.
///
/// The length must be at the beginning of the input slice.
///
/// Returns a tuple `(length, rest)` where `rest` is the rest of the input slice once the length has
/// been removed.
pub fn try_decode_primitive_length(input: &[u8]) -> Option<(usize, &[u8])> {
    if input.len() == 0 {
        return None;
    }
    let start_byte = input[0];
    let start_lower_bits = start_byte & 0b0111_1111;
    if start_byte & 0b1000_0000 != 0 {
        // multiple bytes
        let length_byte_count: usize = start_lower_bits.into();
        if length_byte_count == 0 {
            // indefinite length; not valid in DER and never used by the LDS
            return None;
        }
        if length_byte_count > input.len() - 1 {
            // that will never fit
            return None;
        }
        let mut length: usize = 0;
        for length_byte in &input[1..1+length_byte_count] {
            let Some(multiplied) = length.checked_mul(256) else { return None };
            length = multiplied;
            let Some(added) = length.checked_add(usize::from(*length_byte)) else { return None };
            length = added;
        }
        Some((length, &input[1+length_byte_count..]))
    } else {
        let length = start_lower_bits.into();
        Some((length, &input[1..]))
    }
}


/// Decode a BER tag at the beginning of the input slice.
///
/// Returns a tuple `(tag, rest)`.
pub fn try_decode_tag(input: &[u8]) -> Option<(u32, &[u8])> {
    let first = *input.first()?;
    let mut tag = u32::from(first);
    let mut consumed = 1;
    if first & 0b0001_1111 == 0b0001_1111 {
        // subsequent bytes; the top bit marks continuation
        loop {
            let next = *input.get(consumed)?;
            consumed += 1;
            if consumed > 4 {
                return None;
            }
            tag = (tag << 8) | u32::from(next);
            if next & 0b1000_0000 == 0 {
                break;
            }
        }
    }
    Some((tag, &input[consumed..]))
}


/// A BER-TLV data object borrowed from a buffer.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Tlv<'d> {
    pub tag: u32,

    /// The raw tag and length bytes.
    pub header: &'d [u8],

    pub value: &'d [u8],
}
impl<'d> Tlv<'d> {
    /// Whether the constructed bit is set in the first tag byte.
    pub fn is_constructed(&self) -> bool {
        self.header[0] & 0b0010_0000 != 0
    }

    /// The complete encoding (tag, length and value).
    pub fn total_len(&self) -> usize {
        self.header.len() + self.value.len()
    }

    /// Parses the value of this data object as a sequence of data objects.
    pub fn children(&self) -> Option<Vec<Tlv<'d>>> {
        parse_all(self.value)
    }

    /// Finds the first direct child with the given tag.
    pub fn child(&self, tag: u32) -> Option<Tlv<'d>> {
        self.children()?
            .into_iter()
            .find(|tlv| tlv.tag == tag)
    }
}


/// Parses a single data object at the beginning of the input slice.
///
/// Returns the data object and the rest of the input slice.
pub fn parse_tlv(input: &[u8]) -> Option<(Tlv<'_>, &[u8])> {
    let (tag, after_tag) = try_decode_tag(input)?;
    let (length, after_length) = try_decode_primitive_length(after_tag)?;
    if length > after_length.len() {
        return None;
    }
    let header_len = input.len() - after_length.len();
    let tlv = Tlv {
        tag,
        header: &input[..header_len],
        value: &after_length[..length],
    };
    Some((tlv, &after_length[length..]))
}


/// Parses a sequence of concatenated data objects spanning the whole input.
///
/// Returns `None` if any data object is malformed or truncated.
pub fn parse_all(mut input: &[u8]) -> Option<Vec<Tlv<'_>>> {
    let mut ret = Vec::new();
    while !input.is_empty() {
        let (tlv, rest) = parse_tlv(input)?;
        ret.push(tlv);
        input = rest;
    }
    Some(ret)
}


/// Encodes a data object with the given tag and value, appending it to the output.
pub fn encode_tlv(output: &mut Vec<u8>, tag: u32, value: &[u8]) {
    let tag_bytes = tag.to_be_bytes();
    let mut trimmed_tag = &tag_bytes[..];
    while trimmed_tag.len() > 1 && trimmed_tag[0] == 0x00 {
        trimmed_tag = &trimmed_tag[1..];
    }
    output.extend(trimmed_tag);
    encode_primitive_length(output, value.len());
    output.extend(value);
}


/// Given the first bytes of a data object, returns the total length of the encoded object
/// (tag, length and value) if the header is complete.
pub fn total_encoded_length(header: &[u8]) -> Option<usize> {
    let (_, after_tag) = try_decode_tag(header)?;
    let (length, after_length) = try_decode_primitive_length(after_tag)?;
    let header_len = header.len() - after_length.len();
    header_len.checked_add(length)
}


#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_lengths() {
        let mut buf = Vec::new();
        encode_primitive_length(&mut buf, 0x7F);
        encode_primitive_length(&mut buf, 0x80);
        encode_primitive_length(&mut buf, 0x1234);
        assert_eq!(buf, hex!("7F 81 80 82 12 34"));

        assert_eq!(try_decode_primitive_length(&hex!("82 12 34 FF")), Some((0x1234, &[0xFF][..])));
        assert_eq!(try_decode_primitive_length(&hex!("80")), None);
        assert_eq!(try_decode_primitive_length(&hex!("83 01")), None);
    }

    #[test]
    fn test_multibyte_tags() {
        // DG1 with an MRZ object
        let dg1 = hex!("61 07 5F 1F 04 41 42 43 44");
        let (outer, rest) = parse_tlv(&dg1).unwrap();
        assert!(rest.is_empty());
        assert_eq!(outer.tag, 0x61);
        assert!(outer.is_constructed());
        let mrz = outer.child(0x5F1F).unwrap();
        assert_eq!(mrz.value, b"ABCD");
        assert_eq!(mrz.header, &hex!("5F 1F 04"));
        assert!(!mrz.is_constructed());

        assert_eq!(try_decode_tag(&hex!("7F 61 05")), Some((0x7F61, &[0x05][..])));
        assert_eq!(try_decode_tag(&hex!("5F")), None);
    }

    #[test]
    fn test_truncated_value() {
        assert_eq!(parse_tlv(&hex!("87 05 01 02")), None);
        assert_eq!(parse_all(&hex!("99 02 90 00 8E")), None);
    }

    #[test]
    fn test_encode_and_header_length() {
        let mut buf = Vec::new();
        encode_tlv(&mut buf, 0x7F49, &[0xAA; 130]);
        assert_eq!(&buf[..5], &hex!("7F 49 81 82 AA"));
        assert_eq!(total_encoded_length(&buf[..4]), Some(4 + 130));
        assert_eq!(total_encoded_length(&hex!("77 82 01")), None);
        assert_eq!(total_encoded_length(&hex!("77 82 01 00")), Some(4 + 256));
    }
}
