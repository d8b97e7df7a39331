//! Data group 2: the encoded face.
//!
//! DG2 holds a biometric information group template with one or more biometric information
//! templates. Each template carries an ISO/IEC 19794-5 facial record block (`FAC\0`) which in
//! turn contains one or more images.


use std::io::Cursor;

use crate::der_util::Tlv;
use crate::lds::{unwrap_template, EfIdentifier, Error};


const DG2_TAG: u32 = 0x75;
const GROUP_TEMPLATE_TAG: u32 = 0x7F61;
const INSTANCE_COUNT_TAG: u32 = 0x02;
const INFORMATION_TEMPLATE_TAG: u32 = 0x7F60;
const DATA_BLOCK_TAG: u32 = 0x5F2E;
const ENCIPHERED_DATA_BLOCK_TAG: u32 = 0x7F2E;

const FORMAT_IDENTIFIER: [u8; 4] = *b"FAC\0";
const GENERAL_HEADER_LEN: usize = 14;
const FACIAL_INFORMATION_LEN: usize = 20;
const FEATURE_POINT_LEN: usize = 8;
const IMAGE_INFORMATION_LEN: usize = 12;


/// The encoding of a face image.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ImageDataType {
    Jpeg,
    Jpeg2000,
    Other(u8),
}
impl From<u8> for ImageDataType {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Jpeg,
            1 => Self::Jpeg2000,
            other => Self::Other(other),
        }
    }
}


/// A single face image with the properties stored alongside it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FaceImageRecord {
    pub image_data_type: ImageDataType,
    pub width: u16,
    pub height: u16,

    /// 0 unspecified, 1 male, 2 female, 0xFF unknown.
    pub gender: u8,

    pub feature_point_count: u16,
    pub data: Vec<u8>,
}
impl FaceImageRecord {
    /// A reader over the encoded image, for handing to a decoder.
    pub fn reader(&self) -> Cursor<&[u8]> {
        Cursor::new(&self.data)
    }
}


struct ByteReader<'d> {
    data: &'d [u8],
    position: usize,
}
impl<'d> ByteReader<'d> {
    fn take(&mut self, count: usize, reason: &'static str) -> Result<&'d [u8], Error> {
        let end = self.position.checked_add(count)
            .filter(|end| *end <= self.data.len())
            .ok_or(Error::FacialRecord { reason })?;
        let slice = &self.data[self.position..end];
        self.position = end;
        Ok(slice)
    }

    fn u16(&mut self, reason: &'static str) -> Result<u16, Error> {
        let bytes = self.take(2, reason)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self, reason: &'static str) -> Result<u32, Error> {
        let bytes = self.take(4, reason)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}


/// Decodes an ISO/IEC 19794-5 facial record block into its images.
pub fn decode_facial_record(block: &[u8]) -> Result<Vec<FaceImageRecord>, Error> {
    let mut reader = ByteReader { data: block, position: 0 };
    if reader.take(4, "header truncated")? != FORMAT_IDENTIFIER {
        return Err(Error::FacialRecord { reason: "format identifier is not FAC" });
    }
    let _version = reader.take(4, "header truncated")?;
    let record_length = reader.u32("header truncated")?;
    let image_count = reader.u16("header truncated")?;
    if usize::try_from(record_length).map_or(true, |len| len < GENERAL_HEADER_LEN) {
        return Err(Error::FacialRecord { reason: "record length shorter than header" });
    }

    let mut images = Vec::with_capacity(image_count.into());
    for _ in 0..image_count {
        let image_start = reader.position;
        let block_length: usize = reader.u32("facial information truncated")?
            .try_into()
            .map_err(|_| Error::FacialRecord { reason: "facial record data length too large" })?;
        let feature_point_count = reader.u16("facial information truncated")?;
        let gender = reader.take(1, "facial information truncated")?[0];
        // eye colour, hair colour, property mask, expression, pose angle, pose uncertainty
        reader.take(FACIAL_INFORMATION_LEN - 7, "facial information truncated")?;

        let feature_points_len = usize::from(feature_point_count) * FEATURE_POINT_LEN;
        reader.take(feature_points_len, "feature points truncated")?;

        let image_information = reader.take(IMAGE_INFORMATION_LEN, "image information truncated")?;
        let image_data_type = ImageDataType::from(image_information[1]);
        let width = u16::from_be_bytes([image_information[2], image_information[3]]);
        let height = u16::from_be_bytes([image_information[4], image_information[5]]);

        let image_len = block_length
            .checked_sub(FACIAL_INFORMATION_LEN + feature_points_len + IMAGE_INFORMATION_LEN)
            .ok_or(Error::FacialRecord { reason: "facial record data length too short" })?;
        let data = reader.take(image_len, "image data truncated")?.to_vec();
        debug_assert_eq!(reader.position - image_start, block_length);

        images.push(FaceImageRecord {
            image_data_type,
            width,
            height,
            gender,
            feature_point_count,
            data,
        });
    }
    Ok(images)
}


fn information_templates<'d>(group: &Tlv<'d>) -> Result<Vec<Tlv<'d>>, Error> {
    let children = group.children()
        .ok_or(Error::Tlv { file: EfIdentifier::Dg2 })?;
    let templates: Vec<Tlv<'d>> = children.into_iter()
        .filter(|child| child.tag == INFORMATION_TEMPLATE_TAG)
        .collect();
    if templates.is_empty() {
        return Err(Error::MissingObject { file: EfIdentifier::Dg2, tag: INFORMATION_TEMPLATE_TAG });
    }
    if let Some(count) = group.child(INSTANCE_COUNT_TAG) {
        let expected = count.value.iter().fold(0usize, |acc, b| (acc << 8) | usize::from(*b));
        if expected != templates.len() {
            tracing::debug!(expected, found = templates.len(), "DG2 instance count mismatch");
        }
    }
    Ok(templates)
}


/// Decodes DG2 into all of its face images, in order of appearance.
pub fn decode(bytes: &[u8]) -> Result<Vec<FaceImageRecord>, Error> {
    let dg2 = unwrap_template(EfIdentifier::Dg2, bytes, DG2_TAG)?;
    let group = dg2.child(GROUP_TEMPLATE_TAG)
        .ok_or(Error::MissingObject { file: EfIdentifier::Dg2, tag: GROUP_TEMPLATE_TAG })?;

    let mut images = Vec::new();
    for template in information_templates(&group)? {
        let block = template.child(DATA_BLOCK_TAG)
            .or_else(|| template.child(ENCIPHERED_DATA_BLOCK_TAG))
            .ok_or(Error::MissingObject { file: EfIdentifier::Dg2, tag: DATA_BLOCK_TAG })?;
        images.extend(decode_facial_record(block.value)?);
    }
    Ok(images)
}
