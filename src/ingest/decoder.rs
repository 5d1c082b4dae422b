//! Decoder seam and scheme-based decoder selection.

use crate::config::StreamSettings;
use crate::error::SourceError;
use crate::frame::DecodedImage;

use super::synthetic::SyntheticDecoderFactory;

/// Transport used for RTSP sessions. TCP survives lossy links far better than UDP.
pub const RTSP_TRANSPORT: &str = "tcp";
/// Socket stall timeout, microseconds.
pub const STALL_TIMEOUT_US: u64 = 5_000_000;
/// Maximum demuxer delay, microseconds.
pub const MAX_DEMUX_DELAY_US: u64 = 500_000;
/// Regenerate missing presentation timestamps.
pub const FORMAT_FLAGS: &str = "+genpts";

/// Connection options applied to every network stream.
pub fn stream_options() -> Vec<(&'static str, String)> {
    vec![
        ("rtsp_transport", RTSP_TRANSPORT.to_string()),
        ("stimeout", STALL_TIMEOUT_US.to_string()),
        // Newer FFmpeg releases renamed `stimeout`.
        ("timeout", STALL_TIMEOUT_US.to_string()),
        ("max_delay", MAX_DEMUX_DELAY_US.to_string()),
        ("fflags", FORMAT_FLAGS.to_string()),
    ]
}

/// One open network + decode session.
///
/// `next_frame` blocks on I/O for at most the stall timeout.
pub trait Decoder {
    fn next_frame(&mut self) -> Result<DecodedImage, SourceError>;

    /// Release the session. Called at most once, before drop.
    fn close(&mut self) {}
}

/// Opens decoders for a stream. Shared by every frame source thread.
pub trait DecoderFactory: Send + Sync {
    fn open(&self, stream: &StreamSettings) -> Result<Box<dyn Decoder>, SourceError>;
}

/// Picks a decoder by URL scheme: `stub://` is synthetic, network and file
/// URLs go to FFmpeg.
#[derive(Default)]
pub struct UrlDecoderFactory {
    synthetic: SyntheticDecoderFactory,
}

impl UrlDecoderFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DecoderFactory for UrlDecoderFactory {
    fn open(&self, stream: &StreamSettings) -> Result<Box<dyn Decoder>, SourceError> {
        let scheme = stream
            .url
            .split_once("://")
            .map(|(scheme, _)| scheme.to_ascii_lowercase())
            .unwrap_or_default();
        match scheme.as_str() {
            "stub" => self.synthetic.open(stream),
            "rtsp" | "rtsps" | "http" | "https" | "file" => open_ffmpeg(stream),
            "" => Err(SourceError::Connection(format!(
                "stream url '{}' has no scheme",
                stream.url
            ))),
            other => Err(SourceError::Connection(format!(
                "unsupported stream scheme '{}'",
                other
            ))),
        }
    }
}

#[cfg(feature = "rtsp-ffmpeg")]
fn open_ffmpeg(stream: &StreamSettings) -> Result<Box<dyn Decoder>, SourceError> {
    let decoder = super::rtsp_ffmpeg::FfmpegDecoder::open(&stream.url)?;
    Ok(Box::new(decoder))
}

#[cfg(not(feature = "rtsp-ffmpeg"))]
fn open_ffmpeg(stream: &StreamSettings) -> Result<Box<dyn Decoder>, SourceError> {
    Err(SourceError::Connection(format!(
        "stream '{}': network decoding requires the rtsp-ffmpeg feature",
        stream.id
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(url: &str) -> StreamSettings {
        StreamSettings {
            id: "cam1".into(),
            url: url.into(),
        }
    }

    #[test]
    fn stub_scheme_opens_synthetic_decoder() {
        let factory = UrlDecoderFactory::new();
        let mut decoder = factory
            .open(&settings("stub://cam1?width=32&height=16&fps=0"))
            .unwrap();
        let image = decoder.next_frame().unwrap();
        assert_eq!((image.width, image.height), (32, 16));
    }

    #[test]
    fn unknown_scheme_is_a_connection_error() {
        let factory = UrlDecoderFactory::new();
        assert!(matches!(
            factory.open(&settings("gopher://cam")),
            Err(SourceError::Connection(_))
        ));
        assert!(matches!(
            factory.open(&settings("no-scheme")),
            Err(SourceError::Connection(_))
        ));
    }

    #[test]
    fn options_force_tcp_and_genpts() {
        let options = stream_options();
        assert!(options.contains(&("rtsp_transport", "tcp".to_string())));
        assert!(options.contains(&("fflags", "+genpts".to_string())));
        assert!(options.contains(&("max_delay", "500000".to_string())));
    }
}
