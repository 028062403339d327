use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::Context;
use chrono::{DateTime, Local};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::protocol::message_kind::MessageKind;

/// What a record is about: a wire message, or a synthetic event the
///  collector fabricated locally (a device going silent).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RecordKind {
    Wire(MessageKind),
    /// stamped by the liveness sweep; never appears on the wire
    TimeoutSynthetic,
}

impl RecordKind {
    pub fn name(self) -> &'static str {
        match self {
            RecordKind::Wire(kind) => kind.wire_name(),
            RecordKind::TimeoutSynthetic => "TIMEOUT",
        }
    }
}

/// One processed observation, as handed to the log sink. Short-lived: the
///  sink either queues it for the writer or drops it.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub kind: RecordKind,
    pub device_id: u16,
    pub sequence: u16,
    /// base time + offset as announced by the device; falls back to the
    ///  arrival time when the device has not synced yet
    pub device_timestamp: SystemTime,
    pub arrival_time: SystemTime,
    /// the reconstructed absolute value, where the message carries one
    pub value: Option<i16>,
    pub duplicate: bool,
    pub gap: bool,
    pub delayed: bool,
    /// data arrived before any TIME_SYNC, so the device timestamp is a fallback
    pub pre_sync: bool,
    /// e.g. a delta before the first keyframe
    pub protocol_violation: bool,
    /// per-datagram processing latency; batch entries share their datagram's
    pub cpu_time_ms: f64,
}

/// Producer half of the record queue. The receive path calls [RecordSink::try_emit]
///  and never blocks: when the writer cannot keep up, records are dropped
///  and counted instead.
#[derive(Clone)]
pub struct RecordSink {
    tx: mpsc::Sender<Record>,
    overflow: Arc<AtomicU64>,
}

impl RecordSink {
    pub fn try_emit(&self, record: Record) {
        if self.tx.try_send(record).is_err() {
            self.overflow.fetch_add(1, Ordering::Relaxed);
            debug!("record queue full - dropping record");
        }
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflow.load(Ordering::Relaxed)
    }
}

pub fn record_channel(capacity: usize) -> (RecordSink, mpsc::Receiver<Record>) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        RecordSink {
            tx,
            overflow: Arc::new(AtomicU64::new(0)),
        },
        rx,
    )
}

/// Appends records to a timestamped CSV file, one row per observation, in
///  arrival order. Consumers that want a time-sorted view sort on read; this
///  writer stays a plain append so the drain loop never stalls on sorting.
pub struct CsvRecordWriter {
    out: BufWriter<File>,
    path: PathBuf,
}

impl CsvRecordWriter {
    const HEADER: &'static str = "device_id,seq,kind,device_timestamp,arrival_time,value,\
                                  duplicate_flag,gap_flag,delayed_flag,pre_sync_flag,\
                                  violation_flag,cpu_time_ms";

    pub fn create(directory: &Path) -> anyhow::Result<CsvRecordWriter> {
        fs::create_dir_all(directory)
            .with_context(|| format!("cannot create log directory {:?}", directory))?;

        let path = directory.join(format!(
            "telemetry_log_{}.csv",
            Local::now().format("%Y-%m-%d_%H-%M-%S")
        ));
        let file = File::create(&path)
            .with_context(|| format!("cannot create log file {:?}", path))?;

        let mut out = BufWriter::new(file);
        writeln!(out, "{}", Self::HEADER)?;
        out.flush()?;

        info!("record log active, writing to {:?}", path);
        Ok(CsvRecordWriter { out, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_record(&mut self, record: &Record) -> std::io::Result<()> {
        let value = match record.value {
            Some(v) => v.to_string(),
            None => String::new(),
        };
        writeln!(
            self.out,
            "{},{},{},{},{},{},{},{},{},{},{},{:.3}",
            record.device_id,
            record.sequence,
            record.kind.name(),
            format_local(record.device_timestamp),
            format_local(record.arrival_time),
            value,
            record.duplicate as u8,
            record.gap as u8,
            record.delayed as u8,
            record.pre_sync as u8,
            record.protocol_violation as u8,
            record.cpu_time_ms,
        )?;
        self.out.flush()
    }

    /// Drains the record queue until every sink is dropped, then flushes.
    ///  Run as its own task so file I/O stays off the receive path.
    pub async fn drain(mut self, mut rx: mpsc::Receiver<Record>) {
        while let Some(record) = rx.recv().await {
            if let Err(e) = self.write_record(&record) {
                error!("failed to write record: {}", e);
            }
        }
        if let Err(e) = self.out.flush() {
            error!("failed to flush record log: {}", e);
        }
        debug!("record log writer finished");
    }
}

fn format_local(t: SystemTime) -> String {
    DateTime::<Local>::from(t)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}
