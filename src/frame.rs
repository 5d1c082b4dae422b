//! Decoded frames and read-only views into them.
//!
//! - `DecodedImage`: what a decoder hands back (packed RGB24, no identity yet).
//! - `Frame`: a decoded image stamped with stream identity, sequence number and
//!   capture time by its `FrameSource`. Immutable once built.
//! - `ImageView`: a borrowed rectangular window of a frame. Engines receive
//!   this, never the frame itself.
//!
//! A frame is shared by `Arc` between the inference tasks derived from it.
//! Nothing mutates it after the source hands it off.

use anyhow::{anyhow, Result};
use std::borrow::Cow;
use std::time::{SystemTime, UNIX_EPOCH};

const RGB_CHANNELS: usize = 3;

/// Raw decoder output: packed RGB24, row-major, no padding.
#[derive(Clone, Debug)]
pub struct DecodedImage {
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl DecodedImage {
    pub fn expected_len(width: u32, height: u32) -> Option<usize> {
        (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(RGB_CHANNELS))
    }
}

/// Integer pixel rectangle in frame coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl PixelRect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width, height)
    }

    /// Intersect with a `width` x `height` frame. `None` when nothing remains.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<PixelRect> {
        if self.x >= width || self.y >= height {
            return None;
        }
        let w = self.width.min(width - self.x);
        let h = self.height.min(height - self.y);
        if w == 0 || h == 0 {
            return None;
        }
        Some(PixelRect::new(self.x, self.y, w, h))
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// One decoded frame of one stream.
pub struct Frame {
    pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub stream_id: String,
    /// Per-stream sequence number, starting at 1, never reused.
    pub sequence: u64,
    pub captured_at: SystemTime,
}

impl Frame {
    /// Stamp a decoded image. Called only by the frame source.
    pub(crate) fn new(
        stream_id: &str,
        sequence: u64,
        image: DecodedImage,
        captured_at: SystemTime,
    ) -> Result<Self> {
        let expected = DecodedImage::expected_len(image.width, image.height)
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if image.pixels.len() != expected {
            return Err(anyhow!(
                "expected {} RGB bytes for {}x{}, received {}",
                expected,
                image.width,
                image.height,
                image.pixels.len()
            ));
        }
        Ok(Self {
            pixels: image.pixels,
            width: image.width,
            height: image.height,
            stream_id: stream_id.to_string(),
            sequence,
            captured_at,
        })
    }

    /// Capture time as milliseconds since the Unix epoch.
    pub fn timestamp_ms(&self) -> u64 {
        self.captured_at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    /// View of the whole frame.
    pub fn view(&self) -> ImageView<'_> {
        ImageView {
            frame: self,
            rect: PixelRect::full(self.width, self.height),
        }
    }

    /// View of a sub-rectangle, clamped to the frame. `None` if empty.
    pub fn crop(&self, rect: PixelRect) -> Option<ImageView<'_>> {
        rect.clamp_to(self.width, self.height)
            .map(|rect| ImageView { frame: self, rect })
    }

    pub(crate) fn byte_len(&self) -> usize {
        self.pixels.len()
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("stream_id", &self.stream_id)
            .field("sequence", &self.sequence)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.byte_len())
            .finish()
    }
}

/// Read-only rectangular window of a frame.
#[derive(Clone, Copy)]
pub struct ImageView<'a> {
    frame: &'a Frame,
    rect: PixelRect,
}

impl<'a> ImageView<'a> {
    pub fn width(&self) -> u32 {
        self.rect.width
    }

    pub fn height(&self) -> u32 {
        self.rect.height
    }

    /// Top-left corner of this view in frame coordinates.
    pub fn origin(&self) -> (u32, u32) {
        (self.rect.x, self.rect.y)
    }

    pub fn rect(&self) -> PixelRect {
        self.rect
    }

    /// One row of packed RGB bytes, `y` relative to the view.
    pub fn row(&self, y: u32) -> &'a [u8] {
        let frame_row = (self.rect.y + y) as usize;
        let start = (frame_row * self.frame.width as usize + self.rect.x as usize) * RGB_CHANNELS;
        let end = start + self.rect.width as usize * RGB_CHANNELS;
        &self.frame.pixels[start..end]
    }

    /// RGB triple at (`x`, `y`) relative to the view.
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let row = self.row(y);
        let i = x as usize * RGB_CHANNELS;
        [row[i], row[i + 1], row[i + 2]]
    }

    /// Contiguous RGB bytes for the view. Borrows when the view is the whole frame.
    pub fn to_rgb(&self) -> Cow<'a, [u8]> {
        if self.rect == PixelRect::full(self.frame.width, self.frame.height) {
            return Cow::Borrowed(&self.frame.pixels);
        }
        let mut out =
            Vec::with_capacity(self.rect.width as usize * self.rect.height as usize * RGB_CHANNELS);
        for y in 0..self.rect.height {
            out.extend_from_slice(self.row(y));
        }
        Cow::Owned(out)
    }
}
