//! Shared-memory buffers and pixel formats

use lumen_protocol::{Buffer, SideChannel};
use lumen_util::{FdIdentity, LumenError, Result};
use std::fs::File;
use std::io;
use std::os::fd::{AsFd, OwnedFd};

pub const PIXEL_FORMAT_ARGB_8888: u32 = 1;
pub const PIXEL_FORMAT_XRGB_8888: u32 = 2;
pub const PIXEL_FORMAT_RGB_565: u32 = 3;

/// Formats a client may request, in order of preference
pub const SUPPORTED_PIXEL_FORMATS: [u32; 3] = [
    PIXEL_FORMAT_ARGB_8888,
    PIXEL_FORMAT_XRGB_8888,
    PIXEL_FORMAT_RGB_565,
];

pub fn bytes_per_pixel(pixel_format: u32) -> Option<u32> {
    match pixel_format {
        PIXEL_FORMAT_ARGB_8888 | PIXEL_FORMAT_XRGB_8888 => Some(4),
        PIXEL_FORMAT_RGB_565 => Some(2),
        _ => None,
    }
}

/// Largest dimension accepted for a buffer side
pub const MAX_BUFFER_DIMENSION: i32 = 16384;

/// A buffer whose pixels live in an anonymous file shared with the client
#[derive(Debug)]
pub struct ShmBuffer {
    id: i32,
    width: i32,
    height: i32,
    stride: i32,
    pixel_format: u32,
    file: File,
    identity: FdIdentity,
}

impl ShmBuffer {
    pub fn allocate(id: i32, width: i32, height: i32, pixel_format: u32) -> Result<Self> {
        let in_range = |side: i32| (1..=MAX_BUFFER_DIMENSION).contains(&side);
        if !in_range(width) || !in_range(height) {
            return Err(LumenError::invalid(format!(
                "buffer size {width}x{height} out of range"
            )));
        }
        let bpp = bytes_per_pixel(pixel_format).ok_or_else(|| {
            LumenError::invalid(format!("unsupported pixel format {pixel_format}"))
        })?;

        let stride = width * bpp as i32;
        let size = stride as u64 * height as u64;
        let file = tempfile::tempfile()
            .map_err(|e| LumenError::allocation(format!("no backing file: {e}")))?;
        file.set_len(size)
            .map_err(|e| LumenError::allocation(format!("cannot size backing file: {e}")))?;
        let identity = FdIdentity::of(&file)?;

        Ok(Self {
            id,
            width,
            height,
            stride,
            pixel_format,
            file,
            identity,
        })
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn width(&self) -> i32 {
        self.width
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    pub fn stride(&self) -> i32 {
        self.stride
    }

    pub fn pixel_format(&self) -> u32 {
        self.pixel_format
    }

    pub fn size(&self) -> u64 {
        self.stride as u64 * self.height as u64
    }

    pub fn identity(&self) -> FdIdentity {
        self.identity
    }

    /// Whether `fd` refers to this buffer's backing file
    pub fn is_backed_by(&self, fd: impl AsFd) -> bool {
        FdIdentity::of(fd).is_ok_and(|identity| identity == self.identity)
    }

    /// A new descriptor for the backing file
    pub fn share(&self) -> io::Result<OwnedFd> {
        self.file.as_fd().try_clone_to_owned()
    }

    /// Wire description of this buffer carrying one backing descriptor
    pub fn to_message(&self) -> io::Result<Buffer> {
        Ok(Buffer {
            buffer_id: self.id,
            width: self.width,
            height: self.height,
            stride: self.stride,
            side_channel: SideChannel::with_fds(vec![self.share()?]),
            error: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(PIXEL_FORMAT_ARGB_8888, 64 * 4)]
    #[case(PIXEL_FORMAT_XRGB_8888, 64 * 4)]
    #[case(PIXEL_FORMAT_RGB_565, 64 * 2)]
    fn stride_follows_format(#[case] format: u32, #[case] stride: i32) {
        let buffer = ShmBuffer::allocate(1, 64, 8, format).unwrap();
        assert_eq!(buffer.stride(), stride);
        assert_eq!(buffer.size(), stride as u64 * 8);
    }

    #[rstest]
    #[case(0, 10, PIXEL_FORMAT_ARGB_8888)]
    #[case(10, -1, PIXEL_FORMAT_ARGB_8888)]
    #[case(MAX_BUFFER_DIMENSION + 1, 1, PIXEL_FORMAT_ARGB_8888)]
    #[case(10, 10, 99)]
    fn bad_requests_are_rejected(#[case] width: i32, #[case] height: i32, #[case] format: u32) {
        assert!(matches!(
            ShmBuffer::allocate(1, width, height, format),
            Err(LumenError::InvalidParameters(_))
        ));
    }

    #[test]
    fn backing_file_has_the_buffer_size() {
        let buffer = ShmBuffer::allocate(1, 16, 16, PIXEL_FORMAT_ARGB_8888).unwrap();
        let shared = File::from(buffer.share().unwrap());
        assert_eq!(shared.metadata().unwrap().len(), buffer.size());
    }

    #[test]
    fn shared_descriptors_keep_their_identity() {
        let buffer = ShmBuffer::allocate(7, 4, 4, PIXEL_FORMAT_RGB_565).unwrap();
        let message = buffer.to_message().unwrap();
        assert_eq!(message.buffer_id, 7);
        assert_eq!(message.side_channel.declared(), 1);
        assert!(buffer.is_backed_by(&message.side_channel.fds[0]));

        let other = ShmBuffer::allocate(8, 4, 4, PIXEL_FORMAT_RGB_565).unwrap();
        assert!(!other.is_backed_by(&message.side_channel.fds[0]));
    }
}
