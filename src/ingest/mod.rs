//! Frame ingestion.
//!
//! - `FrameSource`: one per stream, owns the decode session, reconnects with
//!   backoff and feeds the dispatch queue.
//! - `Decoder` / `DecoderFactory`: the seam to the decode library.
//! - `UrlDecoderFactory`: `stub://` streams get the synthetic decoder, network
//!   and file URLs the FFmpeg one (feature: rtsp-ffmpeg).

mod decoder;
#[cfg(feature = "rtsp-ffmpeg")]
mod rtsp_ffmpeg;
mod source;
mod synthetic;

pub use decoder::{
    stream_options, Decoder, DecoderFactory, UrlDecoderFactory, FORMAT_FLAGS,
    MAX_DEMUX_DELAY_US, RTSP_TRANSPORT, STALL_TIMEOUT_US,
};
pub use source::FrameSource;
pub use synthetic::{SyntheticDecoder, SyntheticDecoderFactory, SyntheticParams};
