//! Frame encoder adapter
//!
//! Drives a black-box H.264 compressor through a narrow request/callback
//! boundary. Raw images go in through [`FrameEncoderAdapter::submit`];
//! compressed sample buffers come back on a thread the compressor owns and
//! are handed to the [`BitstreamDemuxer`] before the callback returns.

use bytes::Bytes;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::h264::BitstreamDemuxer;
use super::sink::FrameSink;
use crate::frame::Timestamp;
use crate::{Error, Result};

/// Codec profile requested from the compressor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    /// H.264 Main profile, level chosen by the encoder
    H264MainAutoLevel,
}

/// Fixed configuration handed to the compressor when a session is created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressorConfig {
    pub width: i32,
    pub height: i32,
    pub frame_rate: i32,
    pub low_latency: bool,
    pub real_time: bool,
    pub allow_frame_reordering: bool,
    pub profile: Profile,
}

/// Capture-side encoder settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderConfig {
    /// Frame width in pixels
    pub width: i32,
    /// Frame height in pixels
    pub height: i32,
    /// Target frames per second
    pub frame_rate: i32,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            frame_rate: 10,
        }
    }
}

impl From<&EncoderConfig> for CompressorConfig {
    fn from(config: &EncoderConfig) -> Self {
        Self {
            width: config.width,
            height: config.height,
            frame_rate: config.frame_rate,
            low_latency: true,
            real_time: true,
            allow_frame_reordering: false,
            profile: Profile::H264MainAutoLevel,
        }
    }
}

/// An uncompressed camera frame
#[derive(Debug, Clone)]
pub struct RawImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Bytes,
}

/// Outcome the compressor reports with each callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionStatus {
    Success,
    /// Codec-specific error code
    Failed(i32),
}

/// Per-sample attachment flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleAttachments {
    /// Set when the sample is not a sync sample (depends on earlier frames)
    pub not_sync: bool,
}

/// Out-of-band decoder configuration of a compressed stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormatDescription {
    pub sps: Vec<Vec<u8>>,
    pub pps: Vec<Vec<u8>>,
}

/// A compressed buffer as seen inside the compressor callback.
///
/// Borrows compressor-owned memory; only valid for the duration of the
/// callback.
#[derive(Debug, Clone, Copy)]
pub struct SampleBuffer<'a> {
    /// AVCC payload, `None` when the sample has no data buffer
    pub data: Option<&'a [u8]>,
    pub data_ready: bool,
    pub attachments: Option<&'a [SampleAttachments]>,
    pub format: Option<&'a FormatDescription>,
    pub pts: Timestamp,
}

/// Receives compressed output from a compression session.
///
/// May be invoked concurrently with `submit` on a thread the compressor
/// controls.
pub trait CompressionOutput: Send + Sync {
    fn on_output(&self, status: CompressionStatus, sample: Option<&SampleBuffer<'_>>);
}

/// A live compression session
pub trait CompressionSession: Send + Sync {
    /// Schedule `image` for compression. Must not wait for the output.
    fn encode_frame(&self, image: RawImage, pts: Timestamp) -> Result<()>;

    /// Tear the session down. Callbacks already in flight may still arrive.
    fn invalidate(&self);
}

/// Factory for compression sessions (the hardware or a software stand-in)
pub trait Compressor: Send + Sync {
    fn create_session(
        &self,
        config: &CompressorConfig,
        output: Arc<dyn CompressionOutput>,
    ) -> Result<Box<dyn CompressionSession>>;
}

/// Callback handler: filters unusable buffers and demuxes the rest
struct DemuxOutput {
    demuxer: BitstreamDemuxer,
    sink: Arc<dyn FrameSink>,
}

impl CompressionOutput for DemuxOutput {
    fn on_output(&self, status: CompressionStatus, sample: Option<&SampleBuffer<'_>>) {
        if let CompressionStatus::Failed(code) = status {
            warn!(code, "Compressor reported failure, dropping output");
            return;
        }
        let Some(sample) = sample else {
            warn!("Compressor returned no sample buffer");
            return;
        };
        if !sample.data_ready {
            debug!(pts = sample.pts.value, "Sample buffer not ready, dropping");
            return;
        }

        if let Err(e) = self.demuxer.demux(sample, self.sink.as_ref()) {
            warn!(pts = sample.pts.value, "Demux failed: {}", e);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Drives a [`Compressor`] and feeds its output through a demuxer into a sink.
pub struct FrameEncoderAdapter {
    config: EncoderConfig,
    compressor: Arc<dyn Compressor>,
    output: Arc<DemuxOutput>,
    session: Mutex<Option<Box<dyn CompressionSession>>>,
    frame_count: AtomicI64,
}

impl FrameEncoderAdapter {
    pub fn new(
        config: EncoderConfig,
        compressor: Arc<dyn Compressor>,
        sink: Arc<dyn FrameSink>,
    ) -> Self {
        Self {
            config,
            compressor,
            output: Arc::new(DemuxOutput {
                demuxer: BitstreamDemuxer::new(),
                sink,
            }),
            session: Mutex::new(None),
            frame_count: AtomicI64::new(0),
        }
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    pub fn demuxer(&self) -> &BitstreamDemuxer {
        &self.output.demuxer
    }

    pub fn is_started(&self) -> bool {
        lock(&self.session).is_some()
    }

    /// Frames submitted since the last `start`
    pub fn frame_count(&self) -> i64 {
        self.frame_count.load(Ordering::SeqCst)
    }

    /// Create the compression session. A no-op when already started.
    pub fn start(&self) -> Result<()> {
        let mut session = lock(&self.session);
        if session.is_some() {
            return Ok(());
        }

        let compressor_config = CompressorConfig::from(&self.config);
        let output: Arc<dyn CompressionOutput> = self.output.clone();
        let created = self
            .compressor
            .create_session(&compressor_config, output)
            .map_err(|e| match e {
                Error::EncoderUnavailable(_) => e,
                other => Error::encoder_unavailable(other.to_string()),
            })?;

        self.output.demuxer.reset();
        *session = Some(created);
        info!(
            width = self.config.width,
            height = self.config.height,
            fps = self.config.frame_rate,
            "Encoder started"
        );
        Ok(())
    }

    /// Hand one frame to the compressor. Returns once it is scheduled.
    pub fn submit(&self, image: RawImage) -> Result<()> {
        let session = lock(&self.session);
        let Some(session) = session.as_ref() else {
            return Err(Error::NotInitialized);
        };

        let count = self.frame_count.fetch_add(1, Ordering::SeqCst) + 1;
        session.encode_frame(image, Timestamp::from_frame_count(count))
    }

    /// Invalidate the session and reset the frame counter
    pub fn stop(&self) {
        let Some(session) = lock(&self.session).take() else {
            return;
        };
        session.invalidate();
        let frames = self.frame_count.swap(0, Ordering::SeqCst);
        info!(frames, "Encoder stopped");
    }
}

impl Drop for FrameEncoderAdapter {
    fn drop(&mut self) {
        self.stop();
    }
}
