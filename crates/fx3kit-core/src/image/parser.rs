//! Firmware image validation and segmentation.
//!
//! Handles the two image layouts the boot loaders accept:
//! - Simple: a raw RAM image loaded at address 0 (FX2)
//! - Segmented: the FX3 boot image
//!
//! FX3 boot image layout:
//!
//! ```text
//! 'C' 'Y' ctl 0xB0 | {word_count: u32 LE, address: u32 LE, data[word_count * 4]}* | checksum: u32 LE
//! ```
//!
//! The last section normally has a word count of zero; its address is the
//! program entry point.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::BringupError;
use crate::protocol::constants::{
    FX2_MAX_IMAGE_SIZE, FX3_CHECKSUM_SIZE, FX3_IMAGE_HEADER_SIZE, FX3_IMAGE_SIGNATURE,
    FX3_IMAGE_TYPE, FX3_MAX_IMAGE_SIZE, FX3_SECTION_HEADER_SIZE,
};

/// Firmware image layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    /// Raw image, one segment at address 0.
    Simple,
    /// FX3 boot image with signature, sections and checksum.
    Segmented,
}

impl ImageFormat {
    /// Largest image the loader will accept for this format.
    pub fn max_size(self) -> usize {
        match self {
            ImageFormat::Simple => FX2_MAX_IMAGE_SIZE,
            ImageFormat::Segmented => FX3_MAX_IMAGE_SIZE,
        }
    }
}

/// A contiguous payload destined for one load address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareSegment<'a> {
    pub load_address: u32,
    pub payload: &'a [u8],
}

impl FirmwareSegment<'_> {
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Validate the image header and return a lazy segment iterator.
///
/// A bad signature fails here, before any segment is produced. A truncated
/// image is reported as the iterator's last item.
pub fn segments(data: &[u8], format: ImageFormat) -> Result<SegmentIter<'_>, BringupError> {
    let offset = match format {
        ImageFormat::Simple => 0,
        ImageFormat::Segmented => {
            check_signature(data)?;
            FX3_IMAGE_HEADER_SIZE
        }
    };

    Ok(SegmentIter {
        data,
        format,
        offset,
        checksum: None,
        finished: false,
    })
}

fn check_signature(data: &[u8]) -> Result<(), BringupError> {
    if data.len() < FX3_IMAGE_HEADER_SIZE {
        return Err(BringupError::CorruptImage(format!(
            "image is only {} bytes long",
            data.len()
        )));
    }
    if data[..2] != FX3_IMAGE_SIGNATURE || data[3] != FX3_IMAGE_TYPE {
        return Err(BringupError::CorruptImage(format!(
            "invalid signature {:02X} {:02X} {:02X} {:02X}",
            data[0], data[1], data[2], data[3]
        )));
    }
    Ok(())
}

/// Iterator over the segments of one image.
///
/// Single pass: once it returns `None` or an error it stays exhausted.
#[derive(Debug)]
pub struct SegmentIter<'a> {
    data: &'a [u8],
    format: ImageFormat,
    offset: usize,
    checksum: Option<u32>,
    finished: bool,
}

impl<'a> SegmentIter<'a> {
    /// Bytes consumed so far, headers and checksum included.
    pub fn consumed(&self) -> usize {
        self.offset
    }

    /// Trailing checksum, once the parser has reached it.
    pub fn checksum(&self) -> Option<u32> {
        self.checksum
    }

    fn finish(&mut self) -> Option<Result<FirmwareSegment<'a>, BringupError>> {
        self.finished = true;
        if self.offset < self.data.len() {
            Some(Err(BringupError::TruncatedImage {
                unconsumed: self.data.len() - self.offset,
                len: self.data.len(),
            }))
        } else {
            None
        }
    }

    fn next_section(&mut self) -> Option<Result<FirmwareSegment<'a>, BringupError>> {
        let remaining = self.data.len() - self.offset;

        if remaining == FX3_CHECKSUM_SIZE {
            self.checksum = Some(LittleEndian::read_u32(&self.data[self.offset..]));
            self.offset += FX3_CHECKSUM_SIZE;
            return self.finish();
        }
        if remaining < FX3_SECTION_HEADER_SIZE {
            return self.finish();
        }

        let header = &self.data[self.offset..self.offset + FX3_SECTION_HEADER_SIZE];
        let word_count = LittleEndian::read_u32(&header[0..4]) as usize;
        let load_address = LittleEndian::read_u32(&header[4..8]);
        self.offset += FX3_SECTION_HEADER_SIZE;

        let available = self.data.len() - self.offset;
        let length = match word_count.checked_mul(4) {
            Some(length) if length <= available => length,
            _ => return self.finish(),
        };

        let payload = &self.data[self.offset..self.offset + length];
        self.offset += length;
        Some(Ok(FirmwareSegment {
            load_address,
            payload,
        }))
    }
}

impl<'a> Iterator for SegmentIter<'a> {
    type Item = Result<FirmwareSegment<'a>, BringupError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        match self.format {
            ImageFormat::Simple => {
                self.finished = true;
                if self.data.is_empty() {
                    return None;
                }
                self.offset = self.data.len();
                Some(Ok(FirmwareSegment {
                    load_address: 0,
                    payload: self.data,
                }))
            }
            ImageFormat::Segmented => {
                if self.offset >= self.data.len() {
                    self.finished = true;
                    return None;
                }
                self.next_section()
            }
        }
    }
}

/// Section table of an image, for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSummary {
    /// `(load address, length)` of each segment.
    pub segments: Vec<(u32, usize)>,
    /// Stored trailing checksum (segmented images only).
    pub stored_checksum: Option<u32>,
    /// Sum of all payload words, as the FX3 boot ROM computes it.
    pub computed_checksum: u32,
    pub len: usize,
}

impl ImageSummary {
    pub fn payload_bytes(&self) -> usize {
        self.segments.iter().map(|(_, len)| len).sum()
    }

    pub fn checksum_matches(&self) -> Option<bool> {
        self.stored_checksum
            .map(|stored| stored == self.computed_checksum)
    }
}

/// Parse a whole image and summarise its segments.
pub fn inspect(data: &[u8], format: ImageFormat) -> Result<ImageSummary, BringupError> {
    let mut iter = segments(data, format)?;
    let mut summary = ImageSummary {
        segments: Vec::new(),
        stored_checksum: None,
        computed_checksum: 0,
        len: data.len(),
    };

    for segment in iter.by_ref() {
        let segment = segment?;
        summary.computed_checksum = segment
            .payload
            .chunks_exact(4)
            .map(LittleEndian::read_u32)
            .fold(summary.computed_checksum, u32::wrapping_add);
        summary
            .segments
            .push((segment.load_address, segment.payload.len()));
    }
    summary.stored_checksum = iter.checksum();

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(words: u32, addr: u32, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&words.to_le_bytes());
        out.extend_from_slice(&addr.to_le_bytes());
        out.extend_from_slice(payload);
        out
    }

    fn fx3_image(sections: &[Vec<u8>], checksum: Option<u32>) -> Vec<u8> {
        let mut image = b"CY\x1c\xb0".to_vec();
        for s in sections {
            image.extend_from_slice(s);
        }
        if let Some(c) = checksum {
            image.extend_from_slice(&c.to_le_bytes());
        }
        image
    }

    #[test]
    fn test_single_record_with_checksum() {
        let image = b"CY\x00\xb0"
            .iter()
            .copied()
            .chain(section(2, 0x1000, &[1, 2, 3, 4, 5, 6, 7, 8]))
            .chain(0xDEADBEEFu32.to_le_bytes())
            .collect::<Vec<u8>>();

        let mut iter = segments(&image, ImageFormat::Segmented).unwrap();
        let first = iter.next().unwrap().unwrap();
        assert_eq!(first.load_address, 0x1000);
        assert_eq!(first.payload, &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(iter.next().is_none());
        assert_eq!(iter.consumed(), image.len());
        assert_eq!(iter.checksum(), Some(0xDEADBEEF));
    }

    #[test]
    fn test_segments_account_for_every_byte() {
        let image = fx3_image(
            &[
                section(3, 0x4000_0000, &[0xAA; 12]),
                section(1, 0x4000_1000, &[0xBB; 4]),
                section(0, 0x4000_0000, &[]),
            ],
            Some(0),
        );

        let summary = inspect(&image, ImageFormat::Segmented).unwrap();
        let overhead = FX3_IMAGE_HEADER_SIZE + 3 * FX3_SECTION_HEADER_SIZE + FX3_CHECKSUM_SIZE;
        assert_eq!(summary.segments.len(), 3);
        assert_eq!(summary.payload_bytes() + overhead, image.len());
        assert_eq!(summary.segments[2], (0x4000_0000, 0));
    }

    #[test]
    fn test_bad_magic_is_corrupt() {
        let mut image = fx3_image(&[section(1, 0, &[0; 4])], Some(0));
        image[3] = 0xB1;
        assert!(matches!(
            segments(&image, ImageFormat::Segmented),
            Err(BringupError::CorruptImage(_))
        ));

        let mut image = fx3_image(&[], None);
        image[0] = b'X';
        assert!(matches!(
            inspect(&image, ImageFormat::Segmented),
            Err(BringupError::CorruptImage(_))
        ));
    }

    #[test]
    fn test_too_short_is_corrupt() {
        assert!(matches!(
            segments(b"CY", ImageFormat::Segmented),
            Err(BringupError::CorruptImage(_))
        ));
    }

    #[test]
    fn test_oversized_record_truncates() {
        // Declares 16 bytes but only 8 follow.
        let image = fx3_image(&[section(4, 0x100, &[0; 8])], None);
        let results: Vec<_> = segments(&image, ImageFormat::Segmented)
            .unwrap()
            .collect();

        assert_eq!(results.len(), 1);
        assert!(matches!(
            results[0],
            Err(BringupError::TruncatedImage {
                unconsumed: 8,
                ..
            })
        ));
    }

    #[test]
    fn test_oversized_record_at_end_is_accepted() {
        // The header is the last thing in the file: nothing left over.
        let image = fx3_image(&[section(1, 0x100, &[0; 4]), section(2, 0x200, &[])], None);
        let segs: Vec<_> = segments(&image, ImageFormat::Segmented)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].load_address, 0x100);
    }

    #[test]
    fn test_short_trailer_truncates() {
        let mut image = fx3_image(&[section(1, 0x100, &[0; 4])], None);
        image.extend_from_slice(&[1, 2, 3]);

        let last = segments(&image, ImageFormat::Segmented)
            .unwrap()
            .last()
            .unwrap();
        assert!(matches!(
            last,
            Err(BringupError::TruncatedImage { unconsumed: 3, .. })
        ));
    }

    #[test]
    fn test_iterator_stays_exhausted() {
        let image = fx3_image(&[section(4, 0x100, &[0; 8])], None);
        let mut iter = segments(&image, ImageFormat::Segmented).unwrap();
        assert!(iter.next().unwrap().is_err());
        assert!(iter.next().is_none());
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_simple_format_single_segment() {
        let image = vec![0x55u8; 70000];
        let segs: Vec<_> = segments(&image, ImageFormat::Simple)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].load_address, 0);
        assert_eq!(segs[0].len(), 70000);
    }

    #[test]
    fn test_simple_format_empty_image() {
        assert_eq!(segments(&[], ImageFormat::Simple).unwrap().count(), 0);
    }

    #[test]
    fn test_checksum_summary() {
        let payload: Vec<u8> = [1u32, 2, 3].iter().flat_map(|w| w.to_le_bytes()).collect();
        let image = fx3_image(&[section(3, 0x100, &payload), section(0, 0x100, &[])], Some(6));

        let summary = inspect(&image, ImageFormat::Segmented).unwrap();
        assert_eq!(summary.computed_checksum, 6);
        assert_eq!(summary.checksum_matches(), Some(true));
    }
}
