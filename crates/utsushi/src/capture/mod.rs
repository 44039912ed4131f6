//! Capture-side video pipeline
//!
//! - Compressor boundary and the frame encoder adapter
//! - H.264 AVCC demuxing into network units
//! - Sinks for preview, recording and tests
//! - A synthetic compressor for running without hardware

pub mod encoder;
pub mod h264;
pub mod sink;
#[cfg(feature = "test-source")]
pub mod synthetic;

pub use encoder::{
    CompressionOutput, CompressionSession, CompressionStatus, Compressor, CompressorConfig,
    EncoderConfig, FormatDescription, FrameEncoderAdapter, Profile, RawImage, SampleAttachments,
    SampleBuffer,
};
pub use h264::{split_avcc, AvccUnit, BitstreamDemuxer, DemuxStats, NalUnitType};
pub use sink::{AnnexBWriter, ChannelSink, FanoutSink, FrameSink, UnitCollector};

#[cfg(feature = "test-source")]
pub use synthetic::{test_pattern, SyntheticCompressor, SyntheticConfig};
