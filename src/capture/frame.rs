use image::{GrayImage, RgbImage};
use std::sync::{Arc, OnceLock};

/// One captured screen. Pixels are never mutated after construction, so clones
/// share the buffer and a clone observed through a lock is always complete.
#[derive(Debug, Clone)]
pub struct Frame {
    pixels: Arc<RgbImage>,
    /// Grayscale copy, computed on first use and shared by every clone
    luma: Arc<OnceLock<GrayImage>>,
}

impl Frame {
    pub fn new(pixels: RgbImage) -> Self {
        Self {
            pixels: Arc::new(pixels),
            luma: Arc::new(OnceLock::new()),
        }
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }

    pub fn pixels(&self) -> &RgbImage {
        &self.pixels
    }

    /// Converted once per captured frame, however many templates are checked.
    pub fn luma(&self) -> &GrayImage {
        self.luma
            .get_or_init(|| image::imageops::grayscale(self.pixels.as_ref()))
    }

    pub fn same_buffer(&self, other: &Frame) -> bool {
        Arc::ptr_eq(&self.pixels, &other.pixels)
    }
}

impl From<RgbImage> for Frame {
    fn from(pixels: RgbImage) -> Self {
        Frame::new(pixels)
    }
}
