//! Client session: attach, validate, subscribe (spec §4.2 — C2).
//!
//! Two failure modes must stay distinguishable (spec §4.2 Rationale):
//! "not yet ready" (`InvalidMagic`, `InvalidSession`, `NoSuchQueue`, all
//! transient while the host (re)initializes) versus "corrupt/fatal"
//! (`VersionMismatch`, out-of-range offsets). [`VmError::is_transient`]
//! is the single place that distinction lives.

use crate::error::{VmError, VmResult};
use crate::ring::{QueueId, Region, MAGIC, VERSION};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A validated attachment to a shared region. `last_heartbeat` is a
/// `Mutex` rather than a `Cell` so `&Session` can be shared across the
/// frame/cursor/render threads (spec §5) that all call `session_valid`/
/// `subscribe` concurrently; like the mutexes in [`crate::texture`], it's
/// never meaningfully contended — each caller just snapshots or updates a
/// pair of plain values.
pub struct Session<'a> {
    region: Region<'a>,
    session_id: u32,
    heartbeat_timeout: Duration,
    last_heartbeat: Mutex<(u64, Instant)>,
}

/// A subscribed queue. Holds the session id it was issued under so that a
/// stale handle (from before a host restart) can be rejected rather than
/// silently reading garbage.
pub struct QueueHandle {
    pub(crate) queue: QueueId,
    session_id: u32,
}

impl<'a> Session<'a> {
    /// Scan the header, check magic/version, snapshot the session id
    /// (spec §4.2 `init`).
    pub fn init(bytes: &'a [u8], heartbeat_timeout: Duration) -> VmResult<Self> {
        let region = Region::new(bytes);
        let header = region.header()?;

        if header.magic != MAGIC {
            return Err(VmError::InvalidMagic);
        }
        if header.version != VERSION {
            return Err(VmError::VersionMismatch {
                host: header.version,
                client: VERSION,
            });
        }
        if header.session_id == 0 {
            return Err(VmError::InvalidSession);
        }

        let session_id = header.session_id;
        let heartbeat = region.heartbeat_atomic()?.load(std::sync::atomic::Ordering::Acquire);

        Ok(Self {
            region,
            session_id,
            heartbeat_timeout,
            last_heartbeat: Mutex::new((heartbeat, Instant::now())),
        })
    }

    pub fn region(&self) -> &Region<'a> {
        &self.region
    }

    /// Compares the current header session id to the snapshot taken at
    /// `init`, and treats a stalled host heartbeat as invalid too (spec
    /// §4.2 `session_valid`).
    pub fn session_valid(&self) -> bool {
        let header = match self.region.header() {
            Ok(h) => h,
            Err(_) => return false,
        };
        if header.session_id != self.session_id {
            return false;
        }

        let current = match self.region.heartbeat_atomic() {
            Ok(hb) => hb.load(std::sync::atomic::Ordering::Acquire),
            Err(_) => return false,
        };
        let mut last = self.last_heartbeat.lock().unwrap();
        let (last_value, last_seen) = *last;
        if current != last_value {
            *last = (current, Instant::now());
            true
        } else {
            last_seen.elapsed() < self.heartbeat_timeout
        }
    }

    /// Subscribe to a queue. `NO_SUCH_QUEUE` if the descriptor is
    /// inactive — this is the transient case a caller retries on (spec
    /// §4.2, §7).
    pub fn subscribe(&self, queue: QueueId) -> VmResult<QueueHandle> {
        let desc = self.region.queue_descriptor(queue)?;
        if desc.active == 0 {
            return Err(VmError::NoSuchQueue(queue as u32));
        }
        Ok(QueueHandle {
            queue,
            session_id: self.session_id,
        })
    }

    /// Drop a queue handle. Consumer-side bookkeeping only; the ring
    /// indices themselves aren't reset (another subscriber may attach
    /// later within the same session).
    pub fn unsubscribe(&self, _handle: QueueHandle) {}

    /// Returns whether `handle` was issued under this session's current
    /// id; a queue handle obtained before a host restart must not be used
    /// to read the new session's ring.
    pub fn owns(&self, handle: &QueueHandle) -> bool {
        handle.session_id == self.session_id
    }
}

/// Releases all resources associated with a session. The region mapping
/// itself is owned by the caller (outside this crate's scope); this only
/// drops the client-side session state.
pub fn free(session: Session<'_>) {
    drop(session);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::test_support::build_region;

    #[test]
    fn init_rejects_bad_magic() {
        let mut bytes = build_region(&[b"x"]);
        bytes[0] = b'!';
        let err = Session::init(&bytes, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, VmError::InvalidMagic));
    }

    #[test]
    fn init_succeeds_on_well_formed_region() {
        let bytes = build_region(&[b"frame-bytes"]);
        let session = Session::init(&bytes, Duration::from_secs(1)).unwrap();
        assert!(session.session_valid());
    }

    #[test]
    fn subscribe_to_inactive_queue_then_activated_succeeds() {
        let bytes = build_region(&[b"x"]);
        let session = Session::init(&bytes, Duration::from_secs(1)).unwrap();

        // Pointer queue starts inactive in `build_region`.
        let err = session.subscribe(QueueId::Pointer).unwrap_err();
        assert!(matches!(err, VmError::NoSuchQueue(_)));
        assert!(err.is_transient());

        // Frame queue was marked active by the builder.
        let handle = session.subscribe(QueueId::Frame).unwrap();
        assert!(session.owns(&handle));
    }

    #[test]
    fn session_invalid_after_session_id_changes() {
        let bytes = build_region(&[b"x"]);
        let session = Session::init(&bytes, Duration::from_secs(1)).unwrap();
        assert!(session.session_valid());

        // Simulate the host restarting and bumping the session id.
        let region = Region::new(&bytes);
        let header = region.header().unwrap();
        let ptr = std::ptr::addr_of!(header.session_id) as *mut u32;
        unsafe { *ptr = 2 };

        assert!(!session.session_valid());
    }
}
