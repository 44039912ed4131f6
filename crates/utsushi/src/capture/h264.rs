//! H.264 bitstream demuxing
//!
//! Converts the compressor's length-prefixed (AVCC) output into typed
//! network units:
//! - Splits `[u32 BE length][payload]` sequences into NAL units
//! - Decides key frames from the sample's not-sync attachment
//! - Pulls SPS/PPS from the out-of-band format description

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, trace, warn};

use super::encoder::SampleBuffer;
use super::sink::FrameSink;
use crate::protocol::AVCC_HEADER_LENGTH;
use crate::{Error, Result};

/// NAL unit types (5 bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalUnitType {
    /// Non-IDR slice (P or B frame)
    SliceNonIdr,
    /// Slice data partition A
    SliceDataPartA,
    /// Slice data partition B
    SliceDataPartB,
    /// Slice data partition C
    SliceDataPartC,
    /// IDR slice (keyframe)
    SliceIdr,
    /// Supplemental enhancement information
    Sei,
    /// Sequence parameter set
    Sps,
    /// Picture parameter set
    Pps,
    /// Access unit delimiter
    Aud,
    /// End of sequence
    EndSeq,
    /// End of stream
    EndStream,
    /// Filler data
    Filler,
    /// Unknown/reserved
    Unknown(u8),
}

impl From<u8> for NalUnitType {
    fn from(value: u8) -> Self {
        match value & 0x1F {
            1 => NalUnitType::SliceNonIdr,
            2 => NalUnitType::SliceDataPartA,
            3 => NalUnitType::SliceDataPartB,
            4 => NalUnitType::SliceDataPartC,
            5 => NalUnitType::SliceIdr,
            6 => NalUnitType::Sei,
            7 => NalUnitType::Sps,
            8 => NalUnitType::Pps,
            9 => NalUnitType::Aud,
            10 => NalUnitType::EndSeq,
            11 => NalUnitType::EndStream,
            12 => NalUnitType::Filler,
            n => NalUnitType::Unknown(n),
        }
    }
}

impl NalUnitType {
    /// Type of a NAL unit payload, `None` for an empty payload
    pub fn of(payload: &[u8]) -> Option<Self> {
        payload.first().map(|&header| NalUnitType::from(header))
    }

    /// Check if this NAL unit type indicates a keyframe
    pub fn is_keyframe(&self) -> bool {
        matches!(self, NalUnitType::SliceIdr)
    }

    /// Check if this is a parameter set (SPS/PPS)
    pub fn is_parameter_set(&self) -> bool {
        matches!(self, NalUnitType::Sps | NalUnitType::Pps)
    }
}

/// One length-prefixed unit located inside an AVCC buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvccUnit<'a> {
    /// Offset of the length prefix
    pub offset: usize,
    pub payload: &'a [u8],
}

/// Iterator over the units of an AVCC buffer.
///
/// Stops after yielding an error for a unit whose declared length runs past
/// the end of the buffer. Trailing bytes too short for a length prefix are
/// ignored.
pub struct AvccUnits<'a> {
    data: &'a [u8],
    pos: usize,
    failed: bool,
}

/// Split an AVCC buffer into its units
pub fn split_avcc(data: &[u8]) -> AvccUnits<'_> {
    AvccUnits {
        data,
        pos: 0,
        failed: false,
    }
}

impl<'a> Iterator for AvccUnits<'a> {
    type Item = Result<AvccUnit<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        let remaining = self.data.len() - self.pos;
        if remaining < AVCC_HEADER_LENGTH {
            if remaining > 0 {
                trace!(bytes = remaining, "Discarding AVCC residual");
            }
            self.pos = self.data.len();
            return None;
        }

        let offset = self.pos;
        let header = &self.data[offset..offset + AVCC_HEADER_LENGTH];
        let declared = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let start = offset + AVCC_HEADER_LENGTH;
        let available = self.data.len() - start;

        if declared > available {
            self.failed = true;
            return Some(Err(Error::MalformedBitstream {
                offset,
                declared,
                remaining: available,
            }));
        }

        self.pos = start + declared;
        Some(Ok(AvccUnit {
            offset,
            payload: &self.data[start..start + declared],
        }))
    }
}

/// Snapshot of demuxer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DemuxStats {
    pub buffers: u64,
    pub parameter_sets: u64,
    pub key_frames: u64,
    pub delta_frames: u64,
    /// Delta units dropped because no key frame had been emitted yet
    pub dropped_before_key: u64,
    pub malformed: u64,
}

/// Turns compressor sample buffers into network units.
///
/// Re-entrant: `demux` takes `&self` and may be called from the
/// compressor's callback thread while the capture side keeps submitting.
/// Payloads are copied before delivery; nothing from the sample buffer is
/// retained after `demux` returns.
#[derive(Debug, Default)]
pub struct BitstreamDemuxer {
    keyframe_seen: AtomicBool,
    buffers: AtomicU64,
    parameter_sets: AtomicU64,
    key_frames: AtomicU64,
    delta_frames: AtomicU64,
    dropped_before_key: AtomicU64,
    malformed: AtomicU64,
}

impl BitstreamDemuxer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget that a key frame was seen; delta frames are dropped until the next one
    pub fn reset(&self) {
        self.keyframe_seen.store(false, Ordering::SeqCst);
    }

    pub fn stats(&self) -> DemuxStats {
        DemuxStats {
            buffers: self.buffers.load(Ordering::Relaxed),
            parameter_sets: self.parameter_sets.load(Ordering::Relaxed),
            key_frames: self.key_frames.load(Ordering::Relaxed),
            delta_frames: self.delta_frames.load(Ordering::Relaxed),
            dropped_before_key: self.dropped_before_key.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }

    /// Demux one sample buffer into `sink`.
    ///
    /// For a sync sample the parameter set unit is delivered right before
    /// the first IDR unit. A truncated unit stops processing of this buffer
    /// with `MalformedBitstream`; units delivered before it stand.
    ///
    /// Returns the number of units delivered.
    pub fn demux(&self, sample: &SampleBuffer<'_>, sink: &dyn FrameSink) -> Result<usize> {
        self.buffers.fetch_add(1, Ordering::Relaxed);

        let Some(data) = sample.data else {
            debug!(pts = sample.pts.value, "Sample has no data buffer, dropping");
            return Ok(0);
        };
        let Some(attachments) = sample.attachments else {
            debug!(pts = sample.pts.value, "Sample has no attachments array, dropping");
            return Ok(0);
        };

        // Absent not-sync attachment means a sync sample
        let is_sync = attachments.first().is_some_and(|a| !a.not_sync);

        let mut parameter_sets = if is_sync {
            let format = sample.format.ok_or(Error::MissingParameterSets)?;
            match (format.sps.first(), format.pps.first()) {
                (Some(sps), Some(pps)) => {
                    Some((Bytes::copy_from_slice(sps), Bytes::copy_from_slice(pps)))
                }
                _ => return Err(Error::MissingParameterSets),
            }
        } else {
            None
        };

        let mut delivered = 0;
        for unit in split_avcc(data) {
            let unit = match unit {
                Ok(unit) => unit,
                Err(e) => {
                    self.malformed.fetch_add(1, Ordering::Relaxed);
                    warn!(pts = sample.pts.value, delivered, error = %e, "Truncated AVCC buffer");
                    return Err(e);
                }
            };

            let payload = Bytes::copy_from_slice(unit.payload);
            // In a non-sync sample every unit is a delta, whatever its NAL type
            let is_idr = is_sync && NalUnitType::of(unit.payload).is_some_and(|t| t.is_keyframe());

            if is_idr {
                if let Some((sps, pps)) = parameter_sets.take() {
                    sink.on_parameter_set(sps, pps);
                    self.parameter_sets.fetch_add(1, Ordering::Relaxed);
                    delivered += 1;
                }
                if !self.keyframe_seen.swap(true, Ordering::SeqCst) {
                    debug!(pts = sample.pts.value, "First key frame");
                }
                sink.on_key_frame(payload);
                self.key_frames.fetch_add(1, Ordering::Relaxed);
                delivered += 1;
            } else if self.keyframe_seen.load(Ordering::SeqCst) {
                sink.on_delta_frame(payload);
                self.delta_frames.fetch_add(1, Ordering::Relaxed);
                delivered += 1;
            } else {
                self.dropped_before_key.fetch_add(1, Ordering::Relaxed);
                trace!(pts = sample.pts.value, len = payload.len(), "Dropping unit before first key frame");
            }
        }

        if parameter_sets.is_some() {
            debug!(pts = sample.pts.value, "Sync sample carried no IDR unit");
        }

        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::encoder::{FormatDescription, SampleAttachments};
    use crate::capture::sink::UnitCollector;
    use crate::frame::{NetworkUnit, Timestamp};

    fn avcc(units: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for unit in units {
            out.extend_from_slice(&(unit.len() as u32).to_be_bytes());
            out.extend_from_slice(unit);
        }
        out
    }

    fn format() -> FormatDescription {
        FormatDescription {
            sps: vec![vec![0x67, 0x4D, 0x00, 0x1E]],
            pps: vec![vec![0x68, 0xEE, 0x3C, 0x80]],
        }
    }

    const SYNC: [SampleAttachments; 1] = [SampleAttachments { not_sync: false }];
    const NOT_SYNC: [SampleAttachments; 1] = [SampleAttachments { not_sync: true }];

    fn sample<'a>(
        data: &'a [u8],
        attachments: &'a [SampleAttachments],
        format: Option<&'a FormatDescription>,
    ) -> SampleBuffer<'a> {
        SampleBuffer {
            data: Some(data),
            data_ready: true,
            attachments: Some(attachments),
            format,
            pts: Timestamp::from_frame_count(1),
        }
    }

    #[test]
    fn test_nal_type_parsing() {
        assert_eq!(NalUnitType::from(0x65), NalUnitType::SliceIdr);
        assert_eq!(NalUnitType::from(0x67), NalUnitType::Sps);
        assert_eq!(NalUnitType::from(0x68), NalUnitType::Pps);
        assert_eq!(NalUnitType::from(0x41), NalUnitType::SliceNonIdr);
        assert_eq!(NalUnitType::of(&[]), None);
        assert!(NalUnitType::Sps.is_parameter_set());
    }

    #[test]
    fn split_yields_units_in_order_byte_identical() {
        let units: [&[u8]; 3] = [&[0x41, 1, 2], &[0x41, 3], &[0x41, 4, 5, 6, 7]];
        let data = avcc(&units);
        let parsed: Vec<_> = split_avcc(&data).map(|u| u.unwrap().payload).collect();
        assert_eq!(parsed, units.to_vec());
    }

    #[test]
    fn split_discards_short_residual() {
        let mut data = avcc(&[&[0x41, 1]]);
        data.extend_from_slice(&[0, 0, 1]);
        assert_eq!(split_avcc(&data).count(), 1);
    }

    #[test]
    fn split_reports_truncated_unit_once() {
        let mut data = avcc(&[&[0x41, 1]]);
        data.extend_from_slice(&[0, 0, 0, 10, 0x41]);
        let results: Vec<_> = split_avcc(&data).collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        match &results[1] {
            Err(Error::MalformedBitstream {
                offset,
                declared,
                remaining,
            }) => {
                assert_eq!(*offset, 6);
                assert_eq!(*declared, 10);
                assert_eq!(*remaining, 1);
            }
            other => panic!("expected MalformedBitstream, got {:?}", other),
        }
    }

    #[test]
    fn key_frame_buffer_emits_parameter_set_then_key_frame() {
        let demuxer = BitstreamDemuxer::new();
        let sink = UnitCollector::new();
        let fmt = format();
        let data = avcc(&[&[0x65, 0x88, 0x84]]);

        let n = demuxer.demux(&sample(&data, &SYNC, Some(&fmt)), &sink).unwrap();
        assert_eq!(n, 2);
        assert_eq!(
            sink.units(),
            vec![
                NetworkUnit::ParameterSet {
                    sps: Bytes::from_static(&[0x67, 0x4D, 0x00, 0x1E]),
                    pps: Bytes::from_static(&[0x68, 0xEE, 0x3C, 0x80]),
                },
                NetworkUnit::KeyFrame {
                    payload: Bytes::from_static(&[0x65, 0x88, 0x84]),
                },
            ]
        );
    }

    #[test]
    fn parameter_set_sits_right_before_idr_when_sei_leads() {
        let demuxer = BitstreamDemuxer::new();
        let sink = UnitCollector::new();
        let fmt = format();
        let data = avcc(&[&[0x06, 0x05], &[0x65, 0x01]]);

        demuxer.demux(&sample(&data, &SYNC, Some(&fmt)), &sink).unwrap();
        let kinds: Vec<_> = sink.units().iter().map(|u| u.kind()).collect();
        use crate::frame::UnitKind::*;
        // SEI before the first key frame is dropped
        assert_eq!(kinds, vec![ParameterSet, KeyFrame]);
    }

    #[test]
    fn non_key_buffer_emits_no_parameter_set() {
        let demuxer = BitstreamDemuxer::new();
        let sink = UnitCollector::new();
        let fmt = format();
        demuxer
            .demux(&sample(&avcc(&[&[0x65, 1]]), &SYNC, Some(&fmt)), &sink)
            .unwrap();
        sink.clear();

        demuxer
            .demux(&sample(&avcc(&[&[0x41, 2]]), &NOT_SYNC, Some(&fmt)), &sink)
            .unwrap();
        assert_eq!(
            sink.units(),
            vec![NetworkUnit::DeltaFrame {
                payload: Bytes::from_static(&[0x41, 2]),
            }]
        );
    }

    #[test]
    fn delta_before_first_key_frame_is_dropped() {
        let demuxer = BitstreamDemuxer::new();
        let sink = UnitCollector::new();
        let n = demuxer
            .demux(&sample(&avcc(&[&[0x41, 2]]), &NOT_SYNC, None), &sink)
            .unwrap();
        assert_eq!(n, 0);
        assert!(sink.units().is_empty());
        assert_eq!(demuxer.stats().dropped_before_key, 1);
    }

    #[test]
    fn zero_length_unit_passes_through_as_empty_delta() {
        let demuxer = BitstreamDemuxer::new();
        let sink = UnitCollector::new();
        let fmt = format();
        let data = avcc(&[&[0x65, 1], &[]]);

        demuxer.demux(&sample(&data, &SYNC, Some(&fmt)), &sink).unwrap();
        let units = sink.units();
        assert_eq!(units.len(), 3);
        assert_eq!(
            units[2],
            NetworkUnit::DeltaFrame {
                payload: Bytes::new()
            }
        );
    }

    #[test]
    fn truncated_buffer_keeps_earlier_units_and_next_buffer_is_fine() {
        let demuxer = BitstreamDemuxer::new();
        let sink = UnitCollector::new();
        let fmt = format();
        let mut data = avcc(&[&[0x65, 1], &[0x41, 2]]);
        data.extend_from_slice(&[0, 0, 0, 50, 0x41]);

        let err = demuxer
            .demux(&sample(&data, &SYNC, Some(&fmt)), &sink)
            .unwrap_err();
        assert!(err.is_bitstream_error());
        assert_eq!(sink.units().len(), 3);
        assert_eq!(demuxer.stats().malformed, 1);

        let next = avcc(&[&[0x41, 3]]);
        assert_eq!(
            demuxer.demux(&sample(&next, &NOT_SYNC, None), &sink).unwrap(),
            1
        );
    }

    #[test]
    fn sync_sample_without_parameter_sets_fails() {
        let demuxer = BitstreamDemuxer::new();
        let sink = UnitCollector::new();
        let empty = FormatDescription::default();
        let data = avcc(&[&[0x65, 1]]);

        assert!(matches!(
            demuxer.demux(&sample(&data, &SYNC, None), &sink),
            Err(Error::MissingParameterSets)
        ));
        assert!(matches!(
            demuxer.demux(&sample(&data, &SYNC, Some(&empty)), &sink),
            Err(Error::MissingParameterSets)
        ));
        assert!(sink.units().is_empty());
    }

    #[test]
    fn missing_attachments_drops_sample() {
        let demuxer = BitstreamDemuxer::new();
        let sink = UnitCollector::new();
        let data = avcc(&[&[0x65, 1]]);
        let sample = SampleBuffer {
            data: Some(&data),
            data_ready: true,
            attachments: None,
            format: None,
            pts: Timestamp::from_frame_count(1),
        };
        assert_eq!(demuxer.demux(&sample, &sink).unwrap(), 0);
    }

    #[test]
    fn reset_requires_new_key_frame() {
        let demuxer = BitstreamDemuxer::new();
        let sink = UnitCollector::new();
        let fmt = format();
        demuxer
            .demux(&sample(&avcc(&[&[0x65, 1]]), &SYNC, Some(&fmt)), &sink)
            .unwrap();
        demuxer.reset();
        assert_eq!(
            demuxer
                .demux(&sample(&avcc(&[&[0x41, 2]]), &NOT_SYNC, None), &sink)
                .unwrap(),
            0
        );
    }
}
