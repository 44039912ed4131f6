//! Destinations for demuxed network units

use bytes::{Bytes, BytesMut};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::frame::NetworkUnit;
use crate::Result;

/// Receives units from the [`BitstreamDemuxer`](super::BitstreamDemuxer).
///
/// Called on the compressor's callback thread, so implementations must not
/// block for long.
pub trait FrameSink: Send + Sync {
    fn on_parameter_set(&self, sps: Bytes, pps: Bytes);
    fn on_key_frame(&self, payload: Bytes);
    fn on_delta_frame(&self, payload: Bytes);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Collects every unit in emission order
#[derive(Debug, Default)]
pub struct UnitCollector {
    units: Mutex<Vec<NetworkUnit>>,
}

impl UnitCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn units(&self) -> Vec<NetworkUnit> {
        lock(&self.units).clone()
    }

    pub fn take(&self) -> Vec<NetworkUnit> {
        std::mem::take(&mut *lock(&self.units))
    }

    pub fn clear(&self) {
        lock(&self.units).clear();
    }
}

impl FrameSink for UnitCollector {
    fn on_parameter_set(&self, sps: Bytes, pps: Bytes) {
        lock(&self.units).push(NetworkUnit::ParameterSet { sps, pps });
    }

    fn on_key_frame(&self, payload: Bytes) {
        lock(&self.units).push(NetworkUnit::KeyFrame { payload });
    }

    fn on_delta_frame(&self, payload: Bytes) {
        lock(&self.units).push(NetworkUnit::DeltaFrame { payload });
    }
}

/// Forwards units into a bounded channel, dropping when it is full.
///
/// The compressor thread is never blocked by a slow network consumer.
pub struct ChannelSink {
    tx: mpsc::Sender<NetworkUnit>,
    dropped: AtomicU64,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<NetworkUnit>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Units dropped because the channel was full or closed
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn push(&self, unit: NetworkUnit) {
        if let Err(e) = self.tx.try_send(unit) {
            let n = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if n == 1 || n % 100 == 0 {
                debug!(dropped = n, "Preview channel rejected unit: {}", e);
            }
        }
    }
}

impl FrameSink for ChannelSink {
    fn on_parameter_set(&self, sps: Bytes, pps: Bytes) {
        self.push(NetworkUnit::ParameterSet { sps, pps });
    }

    fn on_key_frame(&self, payload: Bytes) {
        self.push(NetworkUnit::KeyFrame { payload });
    }

    fn on_delta_frame(&self, payload: Bytes) {
        self.push(NetworkUnit::DeltaFrame { payload });
    }
}

/// Delivers every unit to several sinks in order
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn FrameSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn FrameSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl FrameSink for FanoutSink {
    fn on_parameter_set(&self, sps: Bytes, pps: Bytes) {
        for sink in &self.sinks {
            sink.on_parameter_set(sps.clone(), pps.clone());
        }
    }

    fn on_key_frame(&self, payload: Bytes) {
        for sink in &self.sinks {
            sink.on_key_frame(payload.clone());
        }
    }

    fn on_delta_frame(&self, payload: Bytes) {
        for sink in &self.sinks {
            sink.on_delta_frame(payload.clone());
        }
    }
}

struct Recording {
    path: PathBuf,
    writer: BufWriter<File>,
    bytes: u64,
    /// Nothing is written until a parameter set arrives
    synced: bool,
}

/// Records units to a file as an Annex-B elementary stream.
///
/// Idle until [`start`](Self::start). The file begins at the first
/// parameter set after `start`, so it is decodable on its own.
#[derive(Default)]
pub struct AnnexBWriter {
    active: Mutex<Option<Recording>>,
}

impl AnnexBWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_recording(&self) -> bool {
        lock(&self.active).is_some()
    }

    /// Truncate `path` and start recording into it
    pub fn start(&self, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        let mut active = lock(&self.active);
        if let Some(previous) = active.take() {
            warn!(path = %previous.path.display(), "Recording replaced before finish");
        }
        *active = Some(Recording {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            bytes: 0,
            synced: false,
        });
        info!(path = %path.display(), "Recording to file");
        Ok(())
    }

    /// Flush and close the file; returns bytes written, 0 when idle
    pub fn finish(&self) -> Result<u64> {
        let Some(mut recording) = lock(&self.active).take() else {
            return Ok(0);
        };
        recording.writer.flush()?;
        recording.writer.get_ref().sync_all()?;
        info!(
            path = %recording.path.display(),
            bytes = recording.bytes,
            "Recording finished"
        );
        Ok(recording.bytes)
    }

    fn write(&self, unit: NetworkUnit) {
        let mut active = lock(&self.active);
        let Some(recording) = active.as_mut() else {
            return;
        };
        if !recording.synced {
            if !matches!(unit, NetworkUnit::ParameterSet { .. }) {
                return;
            }
            recording.synced = true;
        }

        let mut buf = BytesMut::with_capacity(unit.len() + 8);
        unit.write_annex_b(&mut buf);
        match recording.writer.write_all(&buf) {
            Ok(()) => recording.bytes += buf.len() as u64,
            Err(e) => {
                warn!(path = %recording.path.display(), "Recording write failed, stopping: {}", e);
                *active = None;
            }
        }
    }
}

impl FrameSink for AnnexBWriter {
    fn on_parameter_set(&self, sps: Bytes, pps: Bytes) {
        self.write(NetworkUnit::ParameterSet { sps, pps });
    }

    fn on_key_frame(&self, payload: Bytes) {
        self.write(NetworkUnit::KeyFrame { payload });
    }

    fn on_delta_frame(&self, payload: Bytes) {
        self.write(NetworkUnit::DeltaFrame { payload });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fanout_preserves_order_for_each_sink() {
        let a = Arc::new(UnitCollector::new());
        let b = Arc::new(UnitCollector::new());
        let fanout = FanoutSink::new().with(a.clone()).with(b.clone());

        fanout.on_parameter_set(Bytes::from_static(&[0x67]), Bytes::from_static(&[0x68]));
        fanout.on_key_frame(Bytes::from_static(&[0x65]));
        fanout.on_delta_frame(Bytes::from_static(&[0x41]));

        assert_eq!(a.units(), b.units());
        assert_eq!(a.take().len(), 3);
        assert!(a.units().is_empty());
    }

    #[tokio::test]
    async fn channel_sink_drops_when_full() {
        let (sink, mut rx) = ChannelSink::new(1);
        sink.on_key_frame(Bytes::from_static(&[1]));
        sink.on_delta_frame(Bytes::from_static(&[2]));
        assert_eq!(sink.dropped(), 1);
        assert_eq!(
            rx.recv().await,
            Some(NetworkUnit::KeyFrame {
                payload: Bytes::from_static(&[1])
            })
        );
    }

    #[test]
    fn annex_b_writer_starts_at_parameter_set() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.h264");
        let writer = AnnexBWriter::new();

        // Idle writer ignores units
        writer.on_key_frame(Bytes::from_static(&[0x65]));
        assert_eq!(writer.finish().unwrap(), 0);

        writer.start(&path).unwrap();
        assert!(writer.is_recording());
        writer.on_delta_frame(Bytes::from_static(&[0x41, 0x00]));
        writer.on_parameter_set(Bytes::from_static(&[0x67]), Bytes::from_static(&[0x68]));
        writer.on_key_frame(Bytes::from_static(&[0x65, 0x01]));
        let written = writer.finish().unwrap();
        assert!(!writer.is_recording());

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(written, bytes.len() as u64);
        assert_eq!(
            bytes,
            vec![0, 0, 0, 1, 0x67, 0, 0, 0, 1, 0x68, 0, 0, 0, 1, 0x65, 0x01]
        );
    }
}
