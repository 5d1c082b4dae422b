//! Deterministic synthetic decoder for `stub://` streams.
//!
//! Frames are black with one white square that moves a few pixels per frame,
//! which the stub engine reports as one detection. Query parameters:
//!
//! - `fail_connects=N`: the first N opens of this stream fail.
//! - `frames=N`: the stream ends after N frames in total, across reconnects.
//!   Later opens fail as if the camera were gone.
//! - `width=W`, `height=H`: frame size (default 320x240).
//! - `fps=F`: pacing, 0 for as fast as possible (default 25).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::config::StreamSettings;
use crate::error::SourceError;
use crate::frame::DecodedImage;

use super::decoder::Decoder;

const DEFAULT_WIDTH: u32 = 320;
const DEFAULT_HEIGHT: u32 = 240;
const DEFAULT_FPS: u32 = 25;

#[derive(Clone, Debug, PartialEq)]
pub struct SyntheticParams {
    pub fail_connects: u32,
    pub frames: Option<u64>,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl SyntheticParams {
    pub fn parse(raw: &str) -> Result<Self, SourceError> {
        let url = url::Url::parse(raw)
            .map_err(|e| SourceError::Connection(format!("invalid stub url '{}': {}", raw, e)))?;
        let mut params = Self {
            fail_connects: 0,
            frames: None,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            fps: DEFAULT_FPS,
        };
        for (key, value) in url.query_pairs() {
            let bad = || SourceError::Connection(format!("invalid stub parameter {}={}", key, value));
            match key.as_ref() {
                "fail_connects" => params.fail_connects = value.parse().map_err(|_| bad())?,
                "frames" => params.frames = Some(value.parse().map_err(|_| bad())?),
                "width" => params.width = value.parse().map_err(|_| bad())?,
                "height" => params.height = value.parse().map_err(|_| bad())?,
                "fps" => params.fps = value.parse().map_err(|_| bad())?,
                _ => log::debug!("ignoring unknown stub parameter '{}'", key),
            }
        }
        if params.width < 8 || params.height < 8 {
            return Err(SourceError::Connection(format!(
                "stub frames must be at least 8x8, got {}x{}",
                params.width, params.height
            )));
        }
        Ok(params)
    }
}

#[derive(Default)]
struct SessionState {
    opens: u32,
    produced: u64,
}

/// Tracks per-stream open attempts and frames produced so that failure
/// injection and frame limits hold across reconnects.
#[derive(Default)]
pub struct SyntheticDecoderFactory {
    sessions: Arc<Mutex<HashMap<String, SessionState>>>,
}

impl SyntheticDecoderFactory {
    pub fn open(&self, stream: &StreamSettings) -> Result<Box<dyn Decoder>, SourceError> {
        let params = SyntheticParams::parse(&stream.url)?;
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let state = sessions.entry(stream.id.clone()).or_default();
        state.opens += 1;
        if state.opens <= params.fail_connects {
            return Err(SourceError::Connection(format!(
                "synthetic connect failure {}/{}",
                state.opens, params.fail_connects
            )));
        }
        if params.frames.is_some_and(|limit| state.produced >= limit) {
            return Err(SourceError::Connection("synthetic stream exhausted".to_string()));
        }
        log::info!(
            "stream {}: connected to {} (synthetic {}x{})",
            stream.id,
            stream.url,
            params.width,
            params.height
        );
        Ok(Box::new(SyntheticDecoder {
            stream_id: stream.id.clone(),
            params,
            sessions: self.sessions.clone(),
            last_frame_at: None,
        }))
    }
}

pub struct SyntheticDecoder {
    stream_id: String,
    params: SyntheticParams,
    sessions: Arc<Mutex<HashMap<String, SessionState>>>,
    last_frame_at: Option<Instant>,
}

impl SyntheticDecoder {
    fn pace(&mut self) {
        if self.params.fps == 0 {
            return;
        }
        let interval = Duration::from_secs(1) / self.params.fps;
        if let Some(last) = self.last_frame_at {
            let elapsed = last.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }
        self.last_frame_at = Some(Instant::now());
    }

    fn render(&self, index: u64) -> DecodedImage {
        let (width, height) = (self.params.width, self.params.height);
        let side = (width.min(height) / 4).max(2);
        let travel = (width - side) as u64;
        let x = if travel == 0 { 0 } else { ((index * 4) % travel) as u32 };
        let y = (height - side) / 2;

        let mut pixels = vec![0u8; width as usize * height as usize * 3];
        for row in y..y + side {
            let start = (row as usize * width as usize + x as usize) * 3;
            pixels[start..start + side as usize * 3].fill(255);
        }
        DecodedImage {
            pixels,
            width,
            height,
        }
    }
}

impl Decoder for SyntheticDecoder {
    fn next_frame(&mut self) -> Result<DecodedImage, SourceError> {
        let index = {
            let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
            let state = sessions.entry(self.stream_id.clone()).or_default();
            if self.params.frames.is_some_and(|limit| state.produced >= limit) {
                return Err(SourceError::Ended);
            }
            state.produced += 1;
            state.produced - 1
        };
        self.pace();
        Ok(self.render(index))
    }

    fn close(&mut self) {
        log::debug!("stream {}: synthetic session closed", self.stream_id);
    }
}
