//! Server statistics
//!
//! Counters are owned by a single consumer task; every other component
//! holds a cloneable [`StatsHandle`] and emits events into a bounded
//! mailbox. When the mailbox is full the emitter awaits until there is
//! room — events are never dropped. Snapshots are served on demand
//! through a oneshot reply.

use std::fmt;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};

use crate::frame::OpCode;

/// Ring size of a rolling rate counter
const RATE_BUF_LEN: usize = 1000;

/// Window over which rates are computed
const RATE_WINDOW: Duration = Duration::from_secs(30);

/// Capacity of the stats mailbox
const MAILBOX_CAPACITY: usize = 1024;

/// Rolling events-per-second counter
///
/// Keeps a ring of the last [`RATE_BUF_LEN`] event timestamps (nanoseconds
/// on a caller-supplied monotonic scale) plus a cumulative count. The rate
/// is computed over the samples that fall inside the last
/// [`RATE_WINDOW`]; empty (zero) slots are skipped and fewer than two
/// qualifying samples yield 0.
#[derive(Debug, Clone)]
pub struct RateCounter {
    count: u64,
    buf: Vec<u64>,
    i: usize,
}

impl RateCounter {
    /// Create an empty counter
    pub fn new() -> Self {
        Self {
            count: 0,
            buf: vec![0; RATE_BUF_LEN],
            i: 0,
        }
    }

    /// Cumulative number of recorded events
    #[inline]
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Record one event at `now_ns`
    pub fn record(&mut self, now_ns: u64) {
        self.count += 1;
        self.buf[self.i] = now_ns;
        self.i = (self.i + 1) % self.buf.len();
    }

    /// Events per second over the window ending at `now_ns`
    pub fn rate(&self, now_ns: u64) -> f64 {
        let since = now_ns.saturating_sub(RATE_WINDOW.as_nanos() as u64);
        let mut ts_min = u64::MAX;
        let mut ts_max = 0u64;
        let mut n = 0u64;
        for &ts in &self.buf {
            // Zero marks a slot that was never written.
            if ts == 0 || ts < since || ts > now_ns {
                continue;
            }
            n += 1;
            ts_min = ts_min.min(ts);
            ts_max = ts_max.max(ts);
        }
        if n <= 1 || ts_max == ts_min {
            0.0
        } else {
            (n as f64) * 1e9 / ((ts_max - ts_min) as f64)
        }
    }
}

impl Default for RateCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Events emitted into the stats mailbox
#[derive(Debug)]
pub(crate) enum StatsEvent {
    Connect,
    Disconnect,
    Handshake,
    HandshakeFailed,
    ReadStart,
    ReadStop,
    WriteStart,
    WriteStop,
    InFrame(OpCode),
    OutFrame(OpCode),
    Query(oneshot::Sender<StatsSnapshot>),
}

/// Cumulative count plus current rate of one event class
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateSample {
    /// Total events since server start
    pub count: u64,
    /// Events per second over the rolling window
    pub per_sec: f64,
}

impl fmt::Display for RateSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:.2})", self.count, self.per_sec)
    }
}

/// Point-in-time view of the server counters
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    /// Currently open connections
    pub connections: u64,
    /// Socket reads in flight (requires `io_statistics`)
    pub connections_reading: u64,
    /// Socket writes in flight (requires `io_statistics`)
    pub connections_writing: u64,
    /// Successful handshakes
    pub handshakes: RateSample,
    /// Failed handshakes
    pub handshakes_failed: RateSample,
    /// Inbound frames by opcode
    pub in_frames: Vec<(OpCode, RateSample)>,
    /// Outbound frames by opcode
    pub out_frames: Vec<(OpCode, RateSample)>,
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Connections: {}", self.connections)?;
        writeln!(f, "  Reading: {}", self.connections_reading)?;
        writeln!(f, "  Writing: {}", self.connections_writing)?;
        writeln!(f, "Handshakes: {}", self.handshakes)?;
        writeln!(f, "HandshakesFailed: {}", self.handshakes_failed)?;
        writeln!(f, "InFrames")?;
        for (opcode, sample) in &self.in_frames {
            writeln!(f, "  {}: {}", opcode.name(), sample)?;
        }
        writeln!(f, "OutFrames")?;
        for (opcode, sample) in &self.out_frames {
            writeln!(f, "  {}: {}", opcode.name(), sample)?;
        }
        Ok(())
    }
}

/// Handle for emitting stats events and querying snapshots
#[derive(Debug, Clone)]
pub struct StatsHandle {
    tx: Option<mpsc::Sender<StatsEvent>>,
}

impl StatsHandle {
    /// Spawn the consumer task and return a handle to it
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        tokio::spawn(run(rx));
        Self { tx: Some(tx) }
    }

    /// A handle that swallows every event (for embedding without a server)
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Emit one event; awaits while the mailbox is full
    pub(crate) async fn emit(&self, event: StatsEvent) {
        if let Some(tx) = &self.tx {
            // The consumer task runs for the process lifetime; a send error
            // only means shutdown is underway.
            let _ = tx.send(event).await;
        }
    }

    /// Fetch a snapshot of all counters
    ///
    /// Returns `None` on a disabled handle or when the consumer is gone.
    pub async fn snapshot(&self) -> Option<StatsSnapshot> {
        let tx = self.tx.as_ref()?;
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(StatsEvent::Query(reply_tx)).await.ok()?;
        reply_rx.await.ok()
    }
}

struct Stats {
    epoch: Instant,
    connections: u64,
    connections_reading: u64,
    connections_writing: u64,
    handshakes: RateCounter,
    handshakes_failed: RateCounter,
    in_frames: [RateCounter; 6],
    out_frames: [RateCounter; 6],
}

fn opcode_index(opcode: OpCode) -> usize {
    OpCode::ALL
        .iter()
        .position(|o| *o == opcode)
        .expect("every opcode is in OpCode::ALL")
}

impl Stats {
    fn new() -> Self {
        Self {
            epoch: Instant::now(),
            connections: 0,
            connections_reading: 0,
            connections_writing: 0,
            handshakes: RateCounter::new(),
            handshakes_failed: RateCounter::new(),
            in_frames: std::array::from_fn(|_| RateCounter::new()),
            out_frames: std::array::from_fn(|_| RateCounter::new()),
        }
    }

    fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    fn dec(gauge: &mut u64, name: &str) {
        if *gauge > 0 {
            *gauge -= 1;
        } else {
            tracing::warn!("stats: {} below zero", name);
        }
    }

    fn apply(&mut self, event: StatsEvent) {
        let now = self.now_ns();
        match event {
            StatsEvent::Connect => self.connections += 1,
            StatsEvent::Disconnect => Self::dec(&mut self.connections, "Connections"),
            StatsEvent::Handshake => self.handshakes.record(now),
            StatsEvent::HandshakeFailed => self.handshakes_failed.record(now),
            StatsEvent::ReadStart => self.connections_reading += 1,
            StatsEvent::ReadStop => Self::dec(&mut self.connections_reading, "ConnectionsReading"),
            StatsEvent::WriteStart => self.connections_writing += 1,
            StatsEvent::WriteStop => {
                Self::dec(&mut self.connections_writing, "ConnectionsWriting")
            }
            StatsEvent::InFrame(opcode) => self.in_frames[opcode_index(opcode)].record(now),
            StatsEvent::OutFrame(opcode) => self.out_frames[opcode_index(opcode)].record(now),
            StatsEvent::Query(reply) => {
                let _ = reply.send(self.snapshot(now));
            }
        }
    }

    fn snapshot(&self, now_ns: u64) -> StatsSnapshot {
        let sample = |rc: &RateCounter| RateSample {
            count: rc.count(),
            per_sec: rc.rate(now_ns),
        };
        StatsSnapshot {
            connections: self.connections,
            connections_reading: self.connections_reading,
            connections_writing: self.connections_writing,
            handshakes: sample(&self.handshakes),
            handshakes_failed: sample(&self.handshakes_failed),
            in_frames: OpCode::ALL
                .iter()
                .map(|&o| (o, sample(&self.in_frames[opcode_index(o)])))
                .collect(),
            out_frames: OpCode::ALL
                .iter()
                .map(|&o| (o, sample(&self.out_frames[opcode_index(o)])))
                .collect(),
        }
    }
}

async fn run(mut rx: mpsc::Receiver<StatsEvent>) {
    let mut stats = Stats::new();
    while let Some(event) = rx.recv().await {
        stats.apply(event);
    }
}
