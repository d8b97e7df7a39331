//! Face image extraction from DG2.


use std::fmt;
use std::io::{Cursor, Read};

use image::{DynamicImage, ImageFormat};
use image::codecs::jpeg::JpegEncoder;
use tracing::debug;

use crate::lds::dg2::{FaceImageRecord, ImageDataType};


/// Quality used when re-encoding the face image for the persisted result.
pub const JPEG_QUALITY: u8 = 90;


/// A decoder for encoded face images.
pub trait ImageCodec: Send + Sync {
    /// A short name for log messages.
    fn name(&self) -> &'static str;

    /// Decodes an image, returning `None` if this codec cannot make sense of the data.
    fn decode(&self, data: &[u8], hint: ImageDataType) -> Option<DynamicImage>;
}


/// Decodes the raster formats understood by the `image` crate (JPEG and PNG).
#[derive(Clone, Copy, Debug, Default)]
pub struct RasterCodec;
impl ImageCodec for RasterCodec {
    fn name(&self) -> &'static str { "raster" }

    fn decode(&self, data: &[u8], hint: ImageDataType) -> Option<DynamicImage> {
        let format = match hint {
            ImageDataType::Jpeg => Some(ImageFormat::Jpeg),
            // sniff the format; some issuers mislabel their images
            _ => image::guess_format(data).ok(),
        }?;
        image::load_from_memory_with_format(data, format)
            .or_else(|_| image::load_from_memory(data))
            .ok()
    }
}


/// Tries a chain of codecs on each face image record in turn.
pub struct ImageExtractor {
    codecs: Vec<Box<dyn ImageCodec>>,
}
impl ImageExtractor {
    /// An extractor that tries `primary` (typically a JPEG 2000 decoder supplied by the platform)
    /// before falling back to [`RasterCodec`].
    pub fn new(primary: Option<Box<dyn ImageCodec>>) -> Self {
        let mut codecs: Vec<Box<dyn ImageCodec>> = Vec::with_capacity(2);
        if let Some(primary) = primary {
            codecs.push(primary);
        }
        codecs.push(Box::new(RasterCodec));
        Self { codecs }
    }

    /// Returns the first face image that any codec can decode into a non-empty image.
    ///
    /// `progress` is called with the fraction of the current record streamed so far.
    pub fn extract_face_image<F: FnMut(f32)>(&self, records: &[FaceImageRecord], mut progress: F) -> Option<DynamicImage> {
        for (index, record) in records.iter().enumerate() {
            let data = stream_record(record, &mut progress);
            for codec in &self.codecs {
                match codec.decode(&data, record.image_data_type) {
                    Some(image) if image.width() > 0 && image.height() > 0 => {
                        debug!(index, codec = codec.name(), width = image.width(), height = image.height(), "face image decoded");
                        return Some(image);
                    },
                    _ => {
                        debug!(index, codec = codec.name(), data_type = ?record.image_data_type, "codec produced no image");
                    },
                }
            }
        }
        None
    }
}
impl Default for ImageExtractor {
    fn default() -> Self { Self::new(None) }
}
impl fmt::Debug for ImageExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.codecs.iter().map(|c| c.name()).collect();
        f.debug_struct("ImageExtractor")
            .field("codecs", &names)
            .finish()
    }
}


const STREAM_CHUNK: usize = 4096;

fn stream_record<F: FnMut(f32)>(record: &FaceImageRecord, progress: &mut F) -> Vec<u8> {
    let total = record.data.len();
    let mut reader: Cursor<&[u8]> = record.reader();
    let mut data = Vec::with_capacity(total);
    let mut chunk = [0u8; STREAM_CHUNK];
    loop {
        let read = match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };
        data.extend_from_slice(&chunk[..read]);
        if total > 0 {
            progress(data.len() as f32 / total as f32);
        }
    }
    data
}


/// Encodes an image as JPEG at [`JPEG_QUALITY`].
pub fn encode_jpeg(image: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    let rgb = image.to_rgb8();
    JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY)
        .encode_image(&rgb)?;
    Ok(buf)
}
