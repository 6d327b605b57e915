//! Chunked firmware upload and CPU reset control.
//!
//! Every segment is written with "A0" vendor requests of at most
//! [`FW_CHUNK_SIZE`] bytes. The target address of each chunk is split
//! across `wValue` (low half) and `wIndex` (high half).

use tracing::{debug, error, info};

use crate::error::BringupError;
use crate::events::{BringupEvent, BringupObserver};
use crate::image::{FirmwareSegment, ImageFormat, segments};
use crate::protocol::ChunkAddress;
use crate::protocol::constants::{
    CONTROL_TIMEOUT, FW_CHUNK_SIZE, FX2_CPUCS_ADDR, VENDOR_REQUEST_FIRMWARE_LOAD,
};
use crate::transport::{UsbHandle, VendorRequest};

/// One control transfer worth of firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk<'a> {
    pub address: ChunkAddress,
    pub data: &'a [u8],
}

/// Iterator over the chunks of a segment.
///
/// An empty segment still yields one zero-length chunk: on the FX3 that
/// write to the entry address is what starts the program.
#[derive(Debug)]
pub struct ChunkIter<'a> {
    segment: FirmwareSegment<'a>,
    chunk_size: usize,
    offset: usize,
    started: bool,
}

impl<'a> ChunkIter<'a> {
    pub fn new(segment: FirmwareSegment<'a>, chunk_size: usize) -> Self {
        Self {
            segment,
            chunk_size: chunk_size.max(1),
            offset: 0,
            started: false,
        }
    }

    /// Total number of transfers for this segment.
    pub fn total(&self) -> usize {
        self.segment.len().div_ceil(self.chunk_size).max(1)
    }
}

impl<'a> Iterator for ChunkIter<'a> {
    type Item = Result<Chunk<'a>, BringupError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.started && self.offset >= self.segment.len() {
            return None;
        }
        self.started = true;

        let address = match ChunkAddress::new(self.segment.load_address, self.offset) {
            Ok(address) => address,
            Err(e) => {
                self.offset = self.segment.len();
                return Some(Err(e));
            }
        };
        let len = (self.segment.len() - self.offset).min(self.chunk_size);
        let data = &self.segment.payload[self.offset..self.offset + len];
        self.offset += len;

        Some(Ok(Chunk { address, data }))
    }
}

/// Write one segment to the device. Returns the number of bytes sent.
///
/// The first failing transfer aborts the segment.
pub fn upload_segment<H, O>(
    handle: &H,
    segment: FirmwareSegment<'_>,
    observer: &O,
) -> Result<usize, BringupError>
where
    H: UsbHandle + ?Sized,
    O: BringupObserver + ?Sized,
{
    let mut sent = 0;
    for chunk in ChunkIter::new(segment, FW_CHUNK_SIZE) {
        let chunk = chunk?;
        let request = VendorRequest {
            request: VENDOR_REQUEST_FIRMWARE_LOAD,
            value: chunk.address.low,
            index: chunk.address.high,
        };

        handle
            .vendor_out(request, chunk.data, CONTROL_TIMEOUT)
            .map_err(|e| {
                error!(address = %chunk.address, "Unable to send firmware to device: {}", e);
                BringupError::TransferFailed(e.to_string())
            })?;

        sent += chunk.data.len();
        observer.on_event(&BringupEvent::ChunkUploaded {
            address: chunk.address.as_u32(),
            length: chunk.data.len(),
        });
    }
    Ok(sent)
}

/// Parse `image` and write every segment to the device.
///
/// Segments are uploaded as they are parsed, so a truncated image is only
/// detected after its valid sections have been sent.
pub fn upload_image<H, O>(
    handle: &H,
    image: &[u8],
    format: ImageFormat,
    observer: &O,
) -> Result<usize, BringupError>
where
    H: UsbHandle + ?Sized,
    O: BringupObserver + ?Sized,
{
    let mut total = 0;
    for segment in segments(image, format)? {
        let segment = segment?;
        debug!(
            address = %format!("0x{:08X}", segment.load_address),
            len = segment.len(),
            "Uploading segment"
        );
        total += upload_segment(handle, segment, observer)?;
    }

    info!(bytes = total, "Firmware upload done");
    observer.on_event(&BringupEvent::UploadComplete { bytes: total });
    Ok(total)
}

/// Hold the FX2's 8051 in reset (`asserted`) or let it run.
pub fn set_reset<H, O>(handle: &H, asserted: bool, observer: &O) -> Result<(), BringupError>
where
    H: UsbHandle + ?Sized,
    O: BringupObserver + ?Sized,
{
    observer.on_event(&BringupEvent::ResetChanged { asserted });

    let request = VendorRequest {
        request: VENDOR_REQUEST_FIRMWARE_LOAD,
        value: FX2_CPUCS_ADDR,
        index: 0,
    };
    handle
        .vendor_out(request, &[u8::from(asserted)], CONTROL_TIMEOUT)
        .map_err(|e| {
            error!("Unable to send control request: {}", e);
            BringupError::TransferFailed(e.to_string())
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullObserver;
    use crate::transport::{MockBus, MockDevice, MockHandle, UsbBus};

    fn open_mock() -> (MockBus, MockHandle) {
        let bus = MockBus::new();
        bus.add_device(MockDevice::new("1", 4, 0x04B4, 0x8613));
        let candidates = bus.list_devices().unwrap();
        let handle = bus.open(&candidates[0]).unwrap();
        (bus, handle)
    }

    #[test]
    fn test_chunk_iter_counts() {
        let data = vec![0u8; 10_000];
        let segment = FirmwareSegment {
            load_address: 0x100,
            payload: &data,
        };
        let iter = ChunkIter::new(segment, 4096);
        assert_eq!(iter.total(), 3);

        let chunks: Vec<_> = iter.collect::<Result<_, _>>().unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].address.as_u32(), 0x100);
        assert_eq!(chunks[1].address.as_u32(), 0x100 + 4096);
        assert_eq!(chunks[2].data.len(), 10_000 - 2 * 4096);
    }

    #[test]
    fn test_chunk_iter_exact_multiple() {
        let data = vec![0u8; 8192];
        let segment = FirmwareSegment {
            load_address: 0,
            payload: &data,
        };
        let chunks: Vec<_> = ChunkIter::new(segment, 4096)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].data.len(), 4096);
    }

    #[test]
    fn test_empty_segment_single_transfer() {
        let segment = FirmwareSegment {
            load_address: 0x4000_0000,
            payload: &[],
        };
        let chunks: Vec<_> = ChunkIter::new(segment, 4096)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].data.is_empty());
        assert_eq!(chunks[0].address.high, 0x4000);
    }

    #[test]
    fn test_simple_image_70000_bytes() {
        let (bus, handle) = open_mock();
        let image: Vec<u8> = (0..70000u32).map(|i| i as u8).collect();

        let sent = upload_image(&handle, &image, ImageFormat::Simple, &NullObserver).unwrap();
        assert_eq!(sent, 70000);

        let transfers = bus.transfers();
        assert_eq!(transfers.len(), 18);
        assert_eq!(transfers[17].data.len(), 70000 - 17 * 4096);
        for (i, t) in transfers.iter().enumerate() {
            let addr = (i * 4096) as u32;
            assert_eq!(t.request.request, 0xA0);
            assert_eq!(t.request.value, (addr & 0xFFFF) as u16);
            assert_eq!(t.request.index, (addr >> 16) as u16);
            assert_eq!(t.timeout, CONTROL_TIMEOUT);
        }
        // Chunk 16 is the first one past 64 KiB.
        assert_eq!(transfers[15].request.index, 0);
        assert_eq!(transfers[16].request.index, 1);
        assert_eq!(transfers[16].request.value, 0);

        let reassembled: Vec<u8> = transfers.iter().flat_map(|t| t.data.clone()).collect();
        assert_eq!(reassembled, image);
    }

    #[test]
    fn test_segmented_image_addresses() {
        let (bus, handle) = open_mock();
        let mut image = b"CY\x1c\xb0".to_vec();
        image.extend_from_slice(&2048u32.to_le_bytes()); // 8 KiB
        image.extend_from_slice(&0x4000_3000u32.to_le_bytes());
        image.extend_from_slice(&[0xEE; 8192]);
        image.extend_from_slice(&0u32.to_le_bytes());
        image.extend_from_slice(&0x4000_3000u32.to_le_bytes());
        image.extend_from_slice(&0u32.to_le_bytes());

        upload_image(&handle, &image, ImageFormat::Segmented, &NullObserver).unwrap();

        let transfers = bus.transfers();
        assert_eq!(transfers.len(), 3);
        assert_eq!((transfers[0].request.index, transfers[0].request.value), (0x4000, 0x3000));
        assert_eq!((transfers[1].request.index, transfers[1].request.value), (0x4000, 0x4000));
        assert!(transfers[2].data.is_empty());
    }

    #[test]
    fn test_transfer_failure_aborts() {
        let (bus, handle) = open_mock();
        bus.fail_transfer_at(2);
        let image = vec![0u8; 5 * 4096];

        let result = upload_image(&handle, &image, ImageFormat::Simple, &NullObserver);
        assert!(matches!(result, Err(BringupError::TransferFailed(_))));
        assert_eq!(bus.transfers().len(), 2);
    }

    #[test]
    fn test_truncated_tail_keeps_sent_sections() {
        let (bus, handle) = open_mock();
        let mut image = b"CY\x1c\xb0".to_vec();
        image.extend_from_slice(&2u32.to_le_bytes());
        image.extend_from_slice(&0x4000_0000u32.to_le_bytes());
        image.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        image.extend_from_slice(&[0xAA, 0xBB, 0xCC]);

        let result = upload_image(&handle, &image, ImageFormat::Segmented, &NullObserver);
        assert!(matches!(
            result,
            Err(BringupError::TruncatedImage { unconsumed: 3, .. })
        ));

        // Nothing is rolled back.
        let transfers = bus.transfers();
        assert_eq!(transfers.len(), 1);
        assert_eq!((transfers[0].request.index, transfers[0].request.value), (0x4000, 0));
        assert_eq!(transfers[0].data, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_corrupt_image_sends_nothing() {
        let (bus, handle) = open_mock();
        let result = upload_image(&handle, b"XY\x00\xb0", ImageFormat::Segmented, &NullObserver);
        assert!(matches!(result, Err(BringupError::CorruptImage(_))));
        assert!(bus.transfers().is_empty());
    }

    #[test]
    fn test_set_reset_payload() {
        let (bus, handle) = open_mock();
        set_reset(&handle, true, &NullObserver).unwrap();
        set_reset(&handle, false, &NullObserver).unwrap();

        let transfers = bus.transfers();
        assert_eq!(transfers[0].request.value, 0xE600);
        assert_eq!(transfers[0].request.index, 0);
        assert_eq!(transfers[0].data, vec![1]);
        assert_eq!(transfers[1].data, vec![0]);
    }

    #[test]
    fn test_set_reset_failure() {
        let (bus, handle) = open_mock();
        bus.fail_transfer_at(0);
        assert!(matches!(
            set_reset(&handle, true, &NullObserver),
            Err(BringupError::TransferFailed(_))
        ));
    }
}
