//! Software stand-in for the hardware compressor
//!
//! Produces H.264-shaped AVCC output (IDR every `keyframe_interval` frames,
//! fixed SPS/PPS) so the whole pipeline runs without a camera or codec.
//! Output is delivered on a worker thread, like a real compressor.

use bytes::Bytes;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{debug, info};

use super::encoder::{
    CompressionOutput, CompressionSession, CompressionStatus, Compressor, CompressorConfig,
    FormatDescription, RawImage, SampleAttachments, SampleBuffer,
};
use crate::frame::Timestamp;
use crate::{Error, Result};

/// Main profile, level 3.0
const SPS: &[u8] = &[0x67, 0x4D, 0x00, 0x1E, 0x95, 0xA8, 0x28, 0x0F, 0x64];
const PPS: &[u8] = &[0x68, 0xEE, 0x3C, 0x80];

/// Configuration for the synthetic compressor
#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    /// Emit an IDR every N frames
    pub keyframe_interval: u32,
    /// Simulated slice size in bytes
    pub slice_size: usize,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            keyframe_interval: 30,
            slice_size: 2000,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SyntheticCompressor {
    config: SyntheticConfig,
}

impl SyntheticCompressor {
    pub fn new(config: SyntheticConfig) -> Self {
        Self { config }
    }
}

impl Compressor for SyntheticCompressor {
    fn create_session(
        &self,
        config: &CompressorConfig,
        output: Arc<dyn CompressionOutput>,
    ) -> Result<Box<dyn CompressionSession>> {
        if config.width <= 0 || config.height <= 0 || config.frame_rate <= 0 {
            return Err(Error::encoder_unavailable(format!(
                "unsupported configuration {}x{} @ {}fps",
                config.width, config.height, config.frame_rate
            )));
        }

        let (tx, rx) = std_mpsc::channel::<(RawImage, Timestamp)>();
        let synthetic = self.config.clone();
        let handle = thread::Builder::new()
            .name("synthetic-compressor".into())
            .spawn(move || run_worker(rx, output, synthetic))?;

        info!(
            width = config.width,
            height = config.height,
            fps = config.frame_rate,
            "Synthetic compressor session created"
        );

        Ok(Box::new(SyntheticSession {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(handle)),
        }))
    }
}

struct SyntheticSession {
    tx: Mutex<Option<std_mpsc::Sender<(RawImage, Timestamp)>>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl CompressionSession for SyntheticSession {
    fn encode_frame(&self, image: RawImage, pts: Timestamp) -> Result<()> {
        let tx = self.tx.lock().unwrap_or_else(|p| p.into_inner());
        match tx.as_ref() {
            Some(tx) => tx
                .send((image, pts))
                .map_err(|_| Error::encoder_unavailable("compressor worker exited")),
            None => Err(Error::NotInitialized),
        }
    }

    fn invalidate(&self) {
        // Closing the channel ends the worker after it drains queued frames
        self.tx.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = self.worker.lock().unwrap_or_else(|p| p.into_inner()).take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SyntheticSession {
    fn drop(&mut self) {
        self.invalidate();
    }
}

fn run_worker(
    rx: std_mpsc::Receiver<(RawImage, Timestamp)>,
    output: Arc<dyn CompressionOutput>,
    config: SyntheticConfig,
) {
    let format = FormatDescription {
        sps: vec![SPS.to_vec()],
        pps: vec![PPS.to_vec()],
    };
    let interval = config.keyframe_interval.max(1) as u64;
    // Reused across frames; the demuxer copies what it keeps
    let mut scratch = Vec::with_capacity(config.slice_size + 4);
    let mut frame_num = 0u64;

    while let Ok((image, pts)) = rx.recv() {
        let is_key = frame_num % interval == 0;
        fill_slice(&mut scratch, &image, frame_num, is_key, config.slice_size);

        let attachments = [SampleAttachments { not_sync: !is_key }];
        let sample = SampleBuffer {
            data: Some(&scratch),
            data_ready: true,
            attachments: Some(&attachments),
            format: Some(&format),
            pts,
        };
        output.on_output(CompressionStatus::Success, Some(&sample));

        frame_num += 1;
        if frame_num % 300 == 0 {
            debug!("Synthetic compressor: {} frames", frame_num);
        }
    }

    info!("Synthetic compressor stopped after {} frames", frame_num);
}

/// Write one AVCC-framed slice into `buf`
fn fill_slice(buf: &mut Vec<u8>, image: &RawImage, frame_num: u64, is_key: bool, size: usize) {
    let size = size.max(2);
    buf.clear();
    buf.extend_from_slice(&(size as u32).to_be_bytes());
    buf.push(if is_key { 0x65 } else { 0x41 });
    // Sample the image so the output depends on the input
    let seed = image.pixels.first().copied().unwrap_or(0) ^ (frame_num as u8);
    buf.extend((1..size).map(|i| seed.wrapping_add(i as u8)));
}

/// A moving gradient test pattern (grayscale, one byte per pixel)
pub fn test_pattern(width: u32, height: u32, frame_num: u64) -> RawImage {
    let shift = (frame_num % 256) as u8;
    let mut pixels = Vec::with_capacity((width * height) as usize);
    for y in 0..height {
        for x in 0..width {
            pixels.push((x as u8).wrapping_add(y as u8).wrapping_add(shift));
        }
    }
    RawImage {
        width,
        height,
        pixels: Bytes::from(pixels),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::encoder::{EncoderConfig, FrameEncoderAdapter};
    use crate::capture::sink::UnitCollector;
    use crate::frame::UnitKind;

    #[test]
    fn test_pattern_size() {
        let image = test_pattern(8, 4, 3);
        assert_eq!(image.pixels.len(), 32);
        assert_eq!(image.pixels[0], 3);
    }

    #[test]
    fn synthetic_pipeline_emits_gop_structure() {
        let sink = Arc::new(UnitCollector::new());
        let adapter = FrameEncoderAdapter::new(
            EncoderConfig::default(),
            Arc::new(SyntheticCompressor::new(SyntheticConfig {
                keyframe_interval: 3,
                slice_size: 64,
            })),
            sink.clone(),
        );

        adapter.start().unwrap();
        for n in 0..4 {
            adapter.submit(test_pattern(16, 16, n)).unwrap();
        }
        // Joins the worker, so every frame has been delivered
        adapter.stop();

        let kinds: Vec<_> = sink.units().iter().map(|u| u.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                UnitKind::ParameterSet,
                UnitKind::KeyFrame,
                UnitKind::DeltaFrame,
                UnitKind::DeltaFrame,
                UnitKind::ParameterSet,
                UnitKind::KeyFrame,
            ]
        );
        assert!(sink.units().iter().skip(1).all(|u| u.len() == 64 || u.kind() == UnitKind::ParameterSet));
    }

    #[test]
    fn zero_frame_rate_is_unavailable() {
        let compressor = SyntheticCompressor::default();
        let config = CompressorConfig::from(&EncoderConfig {
            frame_rate: 0,
            ..Default::default()
        });
        struct Nop;
        impl CompressionOutput for Nop {
            fn on_output(&self, _: CompressionStatus, _: Option<&SampleBuffer<'_>>) {}
        }
        assert!(matches!(
            compressor.create_session(&config, Arc::new(Nop)),
            Err(Error::EncoderUnavailable(_))
        ));
    }
}
