//! Frame and network unit types

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::protocol::{ANNEX_B_START_CODE, REFERENCE_TIMESCALE};

/// A rational media timestamp (`value / timescale` seconds).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    pub value: i64,
    pub timescale: i32,
}

impl Timestamp {
    pub fn new(value: i64, timescale: i32) -> Self {
        Self { value, timescale }
    }

    /// Timestamp for the n-th submitted frame on the reference timescale
    pub fn from_frame_count(frame_count: i64) -> Self {
        Self::new(frame_count, REFERENCE_TIMESCALE)
    }

    pub fn as_secs_f64(&self) -> f64 {
        if self.timescale == 0 {
            return 0.0;
        }
        self.value as f64 / self.timescale as f64
    }

    /// Timestamp in microseconds, rounded toward zero
    pub fn as_micros(&self) -> i64 {
        if self.timescale == 0 {
            return 0;
        }
        (self.value as i128 * 1_000_000 / self.timescale as i128) as i64
    }
}

/// Kind tag of a [`NetworkUnit`], used on the wire and in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnitKind {
    ParameterSet,
    KeyFrame,
    DeltaFrame,
}

impl UnitKind {
    pub fn as_u8(&self) -> u8 {
        match self {
            UnitKind::ParameterSet => 0,
            UnitKind::KeyFrame => 1,
            UnitKind::DeltaFrame => 2,
        }
    }
}

impl TryFrom<u8> for UnitKind {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(UnitKind::ParameterSet),
            1 => Ok(UnitKind::KeyFrame),
            2 => Ok(UnitKind::DeltaFrame),
            v => Err(v),
        }
    }
}

/// A wire-ready unit produced by the bitstream demuxer.
///
/// Payloads are owned: they are copied out of the compressor's buffer
/// before the compressor callback returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkUnit {
    /// Decoder configuration that applies to the key frame that follows
    ParameterSet { sps: Bytes, pps: Bytes },
    /// An independently decodable frame
    KeyFrame { payload: Bytes },
    /// A frame depending on previously decoded frames
    DeltaFrame { payload: Bytes },
}

impl NetworkUnit {
    pub fn kind(&self) -> UnitKind {
        match self {
            NetworkUnit::ParameterSet { .. } => UnitKind::ParameterSet,
            NetworkUnit::KeyFrame { .. } => UnitKind::KeyFrame,
            NetworkUnit::DeltaFrame { .. } => UnitKind::DeltaFrame,
        }
    }

    /// Payload size in bytes (sps + pps for parameter sets)
    pub fn len(&self) -> usize {
        match self {
            NetworkUnit::ParameterSet { sps, pps } => sps.len() + pps.len(),
            NetworkUnit::KeyFrame { payload } | NetworkUnit::DeltaFrame { payload } => {
                payload.len()
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Serialize as an Annex-B byte stream: a start code before every NAL unit.
    ///
    /// Parameter sets expand to two NAL units (SPS then PPS).
    pub fn to_annex_b(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.len() + 2 * ANNEX_B_START_CODE.len());
        self.write_annex_b(&mut buf);
        buf.freeze()
    }

    /// Append the Annex-B form of this unit to `buf`
    pub fn write_annex_b(&self, buf: &mut BytesMut) {
        match self {
            NetworkUnit::ParameterSet { sps, pps } => {
                buf.put_slice(&ANNEX_B_START_CODE);
                buf.put_slice(sps);
                buf.put_slice(&ANNEX_B_START_CODE);
                buf.put_slice(pps);
            }
            NetworkUnit::KeyFrame { payload } | NetworkUnit::DeltaFrame { payload } => {
                buf.put_slice(&ANNEX_B_START_CODE);
                buf.put_slice(payload);
            }
        }
    }
}
