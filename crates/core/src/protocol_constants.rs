//! Fixed protocol constants that should NOT be changed.
//!
//! These values are defined by the wire protocol itself; changing them breaks
//! compatibility with any client or server that didn't change along with it.

// ─────────────────────────────────────────────────────────────────────────────
// Wire framing
// ─────────────────────────────────────────────────────────────────────────────

/// Size of the fixed message header on the wire, in bytes.
///
/// `type(2) + id(2) + refers_to(2) + sent(8) + received(8) + payload_size(4)`.
pub const HEADER_SIZE: usize = 26;

/// Maximum payload size accepted on send or receive.
///
/// A header claiming more than this is a protocol violation; the session is
/// torn down before the body is even read.
pub const MAX_PAYLOAD_SIZE: u32 = 1_000_000;

/// Highest known `message_type` value. Anything above this on the wire is a
/// fatal protocol error (there is intentionally no message type `6`).
pub const MAX_MESSAGE_TYPE: u16 = 7;

// ─────────────────────────────────────────────────────────────────────────────
// Request/response correlation
// ─────────────────────────────────────────────────────────────────────────────

/// The `id` value reserved to mean "this message does not expect a reply".
pub const NO_REQUEST_ID: u16 = 0;

/// Rolling request-id counter wraps back to 1 after reaching this value,
/// never reusing `NO_REQUEST_ID`.
pub const MAX_REQUEST_ID: u16 = 10_000;

// ─────────────────────────────────────────────────────────────────────────────
// Chunking & timing
// ─────────────────────────────────────────────────────────────────────────────

/// Default chunk duration for source readers, in milliseconds.
pub const DEFAULT_CHUNK_MS: u32 = 20;

/// Smallest chunk duration a reader may be configured with, in milliseconds.
pub const MIN_CHUNK_MS: u32 = 10;

/// Resync tolerance: a reader/renderer that wakes up later than this past its
/// scheduled tick is considered drifted rather than merely jittery.
pub const RESYNC_TOLERANCE_MS: i64 = 50;

/// Default duration of continuous silence before a starved reader transitions
/// its stream to `idle` and stops emitting silent chunks, in milliseconds.
pub const DEFAULT_DRYOUT_MS: u64 = 2000;

/// Default watchdog timeout for process-backed readers, in seconds.
/// `0` disables the watchdog.
pub const DEFAULT_WATCHDOG_TIMEOUT_SECS: u64 = 0;

/// Default client time-sync request interval, in milliseconds.
pub const DEFAULT_TIME_SYNC_INTERVAL_MS: u64 = 1000;

// ─────────────────────────────────────────────────────────────────────────────
// Sample format
// ─────────────────────────────────────────────────────────────────────────────

/// Sample rate Opus requires; any other rate must be resampled upstream.
pub const OPUS_REQUIRED_SAMPLE_RATE: u32 = 48000;

/// Frame sizes Opus accepts, in milliseconds (times ten, to stay integral:
/// 2.5ms is represented as `25`).
pub const OPUS_FRAME_SIZES_MS_X10: &[u32] = &[25, 50, 100, 200, 400, 600];

// ─────────────────────────────────────────────────────────────────────────────
// Networking
// ─────────────────────────────────────────────────────────────────────────────

/// Socket send/receive timeout applied to every accepted session, in seconds.
pub const SESSION_SOCKET_TIMEOUT_SECS: u64 = 5;

/// Interval between fan-out server diagnostics snapshots, in seconds.
pub const SERVER_DIAGNOSTICS_INTERVAL_SECS: u64 = 30;

/// Minimum buffer size eligible for a zero-copy send attempt, in bytes.
/// Below this, the fixed per-syscall overhead of `MSG_ZEROCOPY` outweighs the
/// copy it avoids.
pub const ZEROCOPY_MIN_SIZE: usize = 1024;

/// Interval between zero-copy completion-queue drains, in milliseconds.
pub const ZEROCOPY_REAPER_POLL_MS: u64 = 100;

// ─────────────────────────────────────────────────────────────────────────────
// Buffer pool
// ─────────────────────────────────────────────────────────────────────────────

/// Smallest bucket size the buffer pool will allocate, in bytes.
pub const POOL_MIN_BUCKET_SIZE: usize = 1024;

/// A bucket stops retaining returned buffers once it holds this many.
pub const POOL_MAX_BUCKET_ENTRIES: usize = 128;

/// Default idle threshold before a pooled buffer is evicted, in seconds.
pub const POOL_DEFAULT_MAX_IDLE_SECS: u64 = 300;

/// Cleanup runs opportunistically on acquire/release, but never more often
/// than this, in seconds.
pub const POOL_CLEANUP_MIN_INTERVAL_SECS: u64 = 30;

// ─────────────────────────────────────────────────────────────────────────────
// Application identity
// ─────────────────────────────────────────────────────────────────────────────

/// Protocol version triple advertised in `Hello`/`ServerSettings` exchanges.
pub const PROTOCOL_VERSION: (u16, u16, u16) = (0, 1, 0);

/// Default TCP port the fan-out server listens on.
pub const DEFAULT_SERVER_PORT: u16 = 1704;

// ─────────────────────────────────────────────────────────────────────────────
// Idle / silence state machine
// ─────────────────────────────────────────────────────────────────────────────

/// Default cumulative-silence threshold before a playing stream transitions to
/// `idle`, in milliseconds.
pub const DEFAULT_IDLE_THRESHOLD_MS: u64 = 100;

/// Fixed backoff applied to a reader's transient errors (e.g. a pipe not yet
/// opened by its writer), in milliseconds.
pub const READER_RETRY_BACKOFF_MS: u64 = 100;

// ─────────────────────────────────────────────────────────────────────────────
// Stream control (component L)
// ─────────────────────────────────────────────────────────────────────────────

/// Deadline for a JSON-RPC request issued to an external `controlscript`, in
/// milliseconds.
pub const CONTROL_REQUEST_TIMEOUT_MS: u64 = 2000;

// ─────────────────────────────────────────────────────────────────────────────
// Client controller
// ─────────────────────────────────────────────────────────────────────────────

/// Default client-side playback buffer target, in milliseconds.
pub const DEFAULT_BUFFER_MS: u32 = 1000;

/// Deadline for a client's own pending requests (`Time`, etc), in milliseconds.
pub const CLIENT_REQUEST_TIMEOUT_MS: u64 = 2000;
