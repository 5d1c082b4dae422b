//! FFmpeg-backed network decoder.
//!
//! Opens the stream with the connection options from [`stream_options`],
//! decodes the best video track and converts every frame to packed RGB24.

use ffmpeg_next as ffmpeg;

use crate::error::SourceError;
use crate::frame::DecodedImage;

use super::decoder::{stream_options, Decoder};

pub(crate) struct FfmpegDecoder {
    url: String,
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    decoded: ffmpeg::frame::Video,
    rgb: ffmpeg::frame::Video,
    /// EOF was sent to the decoder; only buffered frames remain.
    flushing: bool,
}

fn connection(url: &str, what: &str, err: impl std::fmt::Display) -> SourceError {
    SourceError::Connection(format!("{}: {}: {}", url, what, err))
}

impl FfmpegDecoder {
    pub(crate) fn open(url: &str) -> Result<Self, SourceError> {
        ffmpeg::init().map_err(|e| connection(url, "initialize ffmpeg", e))?;

        let mut options = ffmpeg::Dictionary::new();
        for (key, value) in stream_options() {
            options.set(key, &value);
        }
        let input = ffmpeg::format::input_with_dictionary(&url, options)
            .map_err(|e| connection(url, "open input", e))?;

        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| SourceError::Connection(format!("{}: no video track", url)))?;
        let stream_index = input_stream.index();
        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .map_err(|e| connection(url, "load decoder parameters", e))?;
        let decoder = context
            .decoder()
            .video()
            .map_err(|e| connection(url, "open video decoder", e))?;

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .map_err(|e| connection(url, "create scaler", e))?;

        log::info!(
            "connected to {} (ffmpeg, {}x{})",
            url,
            decoder.width(),
            decoder.height()
        );

        Ok(Self {
            url: url.to_string(),
            input,
            stream_index,
            decoder,
            scaler,
            decoded: ffmpeg::frame::Video::empty(),
            rgb: ffmpeg::frame::Video::empty(),
            flushing: false,
        })
    }
}

impl FfmpegDecoder {
    fn convert(&mut self) -> Result<DecodedImage, SourceError> {
        self.scaler
            .run(&self.decoded, &mut self.rgb)
            .map_err(|e| SourceError::Decode(format!("{}: scale to RGB: {}", self.url, e)))?;
        frame_to_image(&self.rgb)
    }
}

impl Decoder for FfmpegDecoder {
    /// Packets are read one at a time so a failed read surfaces here instead
    /// of being retried inside the demuxer; the stall timeout bounds each read.
    fn next_frame(&mut self) -> Result<DecodedImage, SourceError> {
        loop {
            match self.decoder.receive_frame(&mut self.decoded) {
                Ok(()) => return self.convert(),
                Err(ffmpeg::Error::Eof) => return Err(SourceError::Ended),
                Err(err) if is_again(&err) => {}
                Err(err) => {
                    return Err(SourceError::Decode(format!(
                        "{}: receive frame: {}",
                        self.url, err
                    )))
                }
            }
            if self.flushing {
                return Err(SourceError::Ended);
            }

            let mut packet = ffmpeg::Packet::empty();
            match packet.read(&mut self.input) {
                Ok(()) => {
                    if packet.stream() != self.stream_index {
                        continue;
                    }
                    self.decoder.send_packet(&packet).map_err(|e| {
                        SourceError::Decode(format!("{}: send packet: {}", self.url, e))
                    })?;
                }
                Err(ffmpeg::Error::Eof) => {
                    // Flush so frames still buffered in the decoder come out.
                    self.decoder.send_eof().map_err(|e| {
                        SourceError::Decode(format!("{}: flush decoder: {}", self.url, e))
                    })?;
                    self.flushing = true;
                }
                Err(err) => return Err(read_error(&self.url, err)),
            }
        }
    }

    fn close(&mut self) {
        if !self.flushing {
            let _ = self.decoder.send_eof();
        }
        log::debug!("closed ffmpeg session for {}", self.url);
    }
}

fn is_again(err: &ffmpeg::Error) -> bool {
    matches!(err, ffmpeg::Error::Other { errno } if *errno == ffmpeg::util::error::EAGAIN)
}

/// End of input ends the session; any other read failure (stall timeout, reset,
/// I/O error) is a lost connection.
fn read_error(url: &str, err: ffmpeg::Error) -> SourceError {
    match err {
        ffmpeg::Error::Eof => SourceError::Ended,
        err => connection(url, "read packet", err),
    }
}

/// Copy an RGB24 frame into a tightly packed buffer, dropping row padding.
fn frame_to_image(frame: &ffmpeg::frame::Video) -> Result<DecodedImage, SourceError> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = width as usize * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    if stride == row_bytes {
        let len = row_bytes * height as usize;
        let pixels = data
            .get(..len)
            .ok_or_else(|| SourceError::Decode("ffmpeg frame is shorter than expected".into()))?
            .to_vec();
        return Ok(DecodedImage {
            pixels,
            width,
            height,
        });
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        pixels.extend_from_slice(
            data.get(start..start + row_bytes)
                .ok_or_else(|| SourceError::Decode("ffmpeg frame row is out of bounds".into()))?,
        );
    }
    Ok(DecodedImage {
        pixels,
        width,
        height,
    })
}
