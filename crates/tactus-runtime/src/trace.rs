//! Binary execution tracing.
//!
//! When a trace path is configured, the runtime appends fixed-layout
//! records describing reaction execution, scheduling calls, worker
//! waits, and tag advancement. The file layout is:
//!
//! ```text
//! Header: start_time (i64 LE), table size N (i32 LE),
//!         then N entries of { object id (u64 LE), NUL-terminated ASCII description }.
//! Body:   frames of { record count (i32 LE), count * record }.
//! record: { event (i32), object (u64), src (i32), dst (i32),
//!           logical_time (i64), microstep (u32), physical_time (i64),
//!           trigger (u64), extra_delay (i64) }  -- all little endian
//! ```
//!
//! Records buffer in memory and flush as one frame when the buffer
//! fills or the tracer shuts down, so tracing stays off the reaction
//! hot path except for a short buffer append.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::tag::{Interval, Tag, TimePoint};

/// Records per frame before a flush is forced.
const FRAME_CAPACITY: usize = 2048;

/// Trace event kinds, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum TraceEvent {
    ReactionStarts = 0,
    ReactionEnds = 1,
    ReactionDeadlineMissed = 2,
    ScheduleCalled = 3,
    UserEvent = 4,
    UserValue = 5,
    WorkerWaitStarts = 6,
    WorkerWaitEnds = 7,
    SchedulerAdvancingTimeStarts = 8,
    SchedulerAdvancingTimeEnds = 9,
    FederatedSend = 10,
    FederatedReceive = 11,
}

/// Human-readable names, indexed by the wire value.
pub const TRACE_EVENT_NAMES: [&str; 12] = [
    "Reaction starts",
    "Reaction ends",
    "Reaction deadline missed",
    "Schedule called",
    "User-defined event",
    "User-defined valued event",
    "Worker wait starts",
    "Worker wait ends",
    "Scheduler advancing time starts",
    "Scheduler advancing time ends",
    "Federated send",
    "Federated receive",
];

/// One fixed-layout trace record.
#[derive(Debug, Clone, Copy)]
pub struct TraceRecord {
    pub event: TraceEvent,
    /// Registered object this record is about (reaction, trigger, user
    /// event), or 0.
    pub object: u64,
    /// Source id (worker index), or -1.
    pub src: i32,
    /// Destination id (reaction index), or -1.
    pub dst: i32,
    /// Logical tag at record time.
    pub tag: Tag,
    /// Physical clock reading at record time.
    pub physical_time: TimePoint,
    /// Trigger object involved, or 0.
    pub trigger: u64,
    pub extra_delay: Interval,
}

impl TraceRecord {
    fn write_to(&self, out: &mut impl Write) -> std::io::Result<()> {
        out.write_all(&(self.event as i32).to_le_bytes())?;
        out.write_all(&self.object.to_le_bytes())?;
        out.write_all(&self.src.to_le_bytes())?;
        out.write_all(&self.dst.to_le_bytes())?;
        out.write_all(&self.tag.time.to_le_bytes())?;
        out.write_all(&self.tag.microstep.to_le_bytes())?;
        out.write_all(&self.physical_time.to_le_bytes())?;
        out.write_all(&self.trigger.to_le_bytes())?;
        out.write_all(&self.extra_delay.to_le_bytes())?;
        Ok(())
    }
}

struct TracerInner {
    writer: BufWriter<File>,
    buffer: Vec<TraceRecord>,
}

/// Buffered binary trace writer.
pub struct Tracer {
    inner: Mutex<TracerInner>,
}

impl Tracer {
    /// Create the trace file and write its header.
    ///
    /// `objects` maps stable object ids to descriptions; iteration
    /// order is the table order in the file.
    pub fn create(
        path: &Path,
        start_time: TimePoint,
        objects: &IndexMap<u64, String>,
    ) -> std::io::Result<Tracer> {
        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_all(&start_time.to_le_bytes())?;
        writer.write_all(&(objects.len() as i32).to_le_bytes())?;
        for (id, description) in objects {
            writer.write_all(&id.to_le_bytes())?;
            writer.write_all(description.as_bytes())?;
            writer.write_all(&[0])?;
        }
        debug!(path = %path.display(), objects = objects.len(), "trace file created");
        Ok(Tracer {
            inner: Mutex::new(TracerInner {
                writer,
                buffer: Vec::with_capacity(FRAME_CAPACITY),
            }),
        })
    }

    /// Append one record, flushing a full frame if needed.
    pub fn record(&self, record: TraceRecord) {
        let mut inner = self.inner.lock();
        inner.buffer.push(record);
        if inner.buffer.len() >= FRAME_CAPACITY {
            // Flush failures only degrade the trace, never the program.
            let _ = Self::flush_frame(&mut inner);
        }
    }

    /// Flush any buffered records and sync the writer.
    pub fn shutdown(&self) -> std::io::Result<()> {
        let mut inner = self.inner.lock();
        Self::flush_frame(&mut inner)?;
        inner.writer.flush()
    }

    fn flush_frame(inner: &mut TracerInner) -> std::io::Result<()> {
        if inner.buffer.is_empty() {
            return Ok(());
        }
        let count = inner.buffer.len() as i32;
        inner.writer.write_all(&count.to_le_bytes())?;
        for i in 0..inner.buffer.len() {
            let record = inner.buffer[i];
            record.write_to(&mut inner.writer)?;
        }
        inner.buffer.clear();
        Ok(())
    }
}
