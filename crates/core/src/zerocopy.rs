//! Component H: the optional kernel zero-copy send path.
//!
//! Grounded in `original_source/server/stream_session_tcp_coordinated.{hpp,cpp}`
//! (`StreamSessionTcpCoordinated`), translated from Boost.Asio callbacks to an
//! explicit state machine a [`crate::session::Session`] drives directly. Only
//! Linux exposes `MSG_ZEROCOPY`/`SO_EE_ORIGIN_ZEROCOPY`; everywhere else this
//! module degrades to "always unavailable", matching §7's
//! `ZeroCopyUnavailable` — "kernel declined; falls back silently".
//!
//! Coordination rule (§4.H): a zero-copy attempt may only start while
//! `pending_async_ops == 0`. The regular async-write path increments it on
//! submit and decrements on completion. [`Session`](crate::session::Session)
//! shares one [`std::sync::atomic::AtomicU32`] between its writer task and
//! this module to enforce that.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;

/// Read-only snapshot of a session's zero-copy counters, logged by the
/// fan-out server's periodic diagnostics timer (§4.G) and asserted on by
/// scenario S6.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ZeroCopyStats {
    pub zerocopy_attempts: u64,
    pub zerocopy_successful: u64,
    pub zerocopy_bytes: u64,
    pub regular_sends: u64,
    pub regular_bytes: u64,
    pub coordination_fallbacks: u64,
    pub outstanding_buffers: u64,
}

impl ZeroCopyStats {
    pub fn zerocopy_percentage(&self) -> f64 {
        if self.zerocopy_attempts == 0 {
            0.0
        } else {
            100.0 * self.zerocopy_successful as f64 / self.zerocopy_attempts as f64
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    zerocopy_attempts: AtomicU64,
    zerocopy_successful: AtomicU64,
    zerocopy_bytes: AtomicU64,
    regular_sends: AtomicU64,
    regular_bytes: AtomicU64,
    coordination_fallbacks: AtomicU64,
    outstanding_buffers: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ZeroCopyStats {
        ZeroCopyStats {
            zerocopy_attempts: self.zerocopy_attempts.load(Ordering::Relaxed),
            zerocopy_successful: self.zerocopy_successful.load(Ordering::Relaxed),
            zerocopy_bytes: self.zerocopy_bytes.load(Ordering::Relaxed),
            regular_sends: self.regular_sends.load(Ordering::Relaxed),
            regular_bytes: self.regular_bytes.load(Ordering::Relaxed),
            coordination_fallbacks: self.coordination_fallbacks.load(Ordering::Relaxed),
            outstanding_buffers: self.outstanding_buffers.load(Ordering::Relaxed),
        }
    }
}

/// Outcome of [`ZeroCopySender::try_send`]. Either the buffer's ownership was
/// fully handed to the kernel (or is being tracked pending completion), or
/// some suffix of it must still go out via the session's regular async-write
/// queue.
#[derive(Debug)]
pub enum ZeroCopyOutcome {
    /// Fully handled: either queued with the kernel for zero-copy completion,
    /// or (non-Linux / disabled) nothing was attempted at all.
    Handled,
    /// The caller must send `remaining` via the regular async-write path.
    /// This is the whole buffer (reservation busy, or the kernel declined
    /// with `EAGAIN`/`ENOBUFS`) or a partial-send tail.
    SendRemaining(Bytes),
}

/// Size below which a zero-copy attempt isn't worth the syscall overhead
/// (§4.H: "size >= 1024 B").
pub use crate::protocol_constants::ZEROCOPY_MIN_SIZE;

#[cfg(target_os = "linux")]
mod linux {
    use super::*;
    use std::collections::HashMap;
    use std::os::fd::RawFd;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex;
    use std::thread::JoinHandle;
    use std::time::Duration;

    // Not all libc versions expose these; mirrors the C++ source's own
    // `#ifndef MSG_ZEROCOPY` compatibility shim.
    const MSG_ZEROCOPY: libc::c_int = 0x4000000;
    const SO_ZEROCOPY: libc::c_int = 60;
    const SO_EE_ORIGIN_ZEROCOPY: u8 = 5;

    struct Shared {
        fd: RawFd,
        pending_async_ops: Arc<AtomicU32>,
        next_buffer_id: AtomicU32,
        pending_buffers: Mutex<HashMap<u32, Bytes>>,
        counters: Counters,
        shutdown_requested: AtomicBool,
    }

    /// Linux implementation: enables `SO_ZEROCOPY` on a raw socket fd and
    /// spawns a dedicated completion-reaper thread (§4.H).
    pub struct ZeroCopySender {
        shared: Arc<Shared>,
        reaper: Option<JoinHandle<()>>,
    }

    impl ZeroCopySender {
        /// Attempts to enable `SO_ZEROCOPY` on `fd`. Returns `None` if the
        /// running kernel declines (old kernel, unsupported socket family).
        pub fn try_enable(fd: RawFd, pending_async_ops: Arc<AtomicU32>) -> Option<Self> {
            unsafe {
                let enable: libc::c_int = 1;
                let rc = libc::setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    SO_ZEROCOPY,
                    &enable as *const _ as *const libc::c_void,
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                );
                if rc < 0 {
                    return None;
                }
            }

            let shared = Arc::new(Shared {
                fd,
                pending_async_ops,
                next_buffer_id: AtomicU32::new(0),
                pending_buffers: Mutex::new(HashMap::new()),
                counters: Counters::default(),
                shutdown_requested: AtomicBool::new(false),
            });

            let reaper_shared = shared.clone();
            let reaper = std::thread::Builder::new()
                .name("zcopy-compl".into())
                .spawn(move || reaper_loop(reaper_shared))
                .ok();

            Some(Self { shared, reaper })
        }

        /// Attempts a zero-copy send of `buf` (caller has already checked
        /// `buf.len() >= ZEROCOPY_MIN_SIZE`).
        pub fn try_send(&self, buf: Bytes) -> ZeroCopyOutcome {
            if self.shared.pending_async_ops.compare_exchange(
                0,
                1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ).is_err()
            {
                self.shared.counters.coordination_fallbacks.fetch_add(1, Ordering::Relaxed);
                return ZeroCopyOutcome::SendRemaining(buf);
            }

            self.shared.counters.zerocopy_attempts.fetch_add(1, Ordering::Relaxed);
            let buffer_id = self.shared.next_buffer_id.fetch_add(1, Ordering::Relaxed);

            let result = unsafe {
                let mut iov = libc::iovec {
                    iov_base: buf.as_ptr() as *mut libc::c_void,
                    iov_len: buf.len(),
                };
                let mut msg: libc::msghdr = std::mem::zeroed();
                msg.msg_iov = &mut iov;
                msg.msg_iovlen = 1;
                libc::sendmsg(self.shared.fd, &msg, MSG_ZEROCOPY | libc::MSG_DONTWAIT)
            };

            // Reservation is only held for the duration of the syscall
            // itself; release it immediately, matching `releaseZeroCopy()`
            // being called right after every branch in the C++ source.
            self.shared.pending_async_ops.store(0, Ordering::Release);

            if result < 0 {
                let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
                if errno == libc::EAGAIN || errno == libc::EWOULDBLOCK || errno == libc::ENOBUFS {
                    return ZeroCopyOutcome::SendRemaining(buf);
                }
                // Fatal socket error: let the regular write path surface it.
                return ZeroCopyOutcome::SendRemaining(buf);
            }

            let sent = result as usize;
            self.shared.counters.zerocopy_successful.fetch_add(1, Ordering::Relaxed);
            self.shared.counters.zerocopy_bytes.fetch_add(sent as u64, Ordering::Relaxed);
            self.shared.counters.outstanding_buffers.fetch_add(1, Ordering::Relaxed);

            if sent == buf.len() {
                self.shared.pending_buffers.lock().unwrap().insert(buffer_id, buf);
                ZeroCopyOutcome::Handled
            } else {
                // Partial send: the sent prefix is owned by the kernel until
                // completion; track it, send the tail via the regular path.
                let sent_prefix = buf.slice(0..sent);
                let remaining = buf.slice(sent..);
                self.shared.pending_buffers.lock().unwrap().insert(buffer_id, sent_prefix);
                ZeroCopyOutcome::SendRemaining(remaining)
            }
        }

        pub fn note_regular_send(&self, len: usize) {
            self.shared.counters.regular_sends.fetch_add(1, Ordering::Relaxed);
            self.shared.counters.regular_bytes.fetch_add(len as u64, Ordering::Relaxed);
        }

        pub fn stats(&self) -> ZeroCopyStats {
            self.shared.counters.snapshot()
        }
    }

    impl Drop for ZeroCopySender {
        fn drop(&mut self) {
            self.shared.shutdown_requested.store(true, Ordering::Release);
            if let Some(handle) = self.reaper.take() {
                let _ = handle.join();
            }
        }
    }

    /// Drains the socket's error queue every 100ms, releasing buffers named
    /// in `SO_EE_ORIGIN_ZEROCOPY` completion ranges (§4.H).
    fn reaper_loop(shared: Arc<Shared>) {
        while !shared.shutdown_requested.load(Ordering::Acquire) {
            drain_error_queue(&shared);
            std::thread::sleep(Duration::from_millis(crate::protocol_constants::ZEROCOPY_REAPER_POLL_MS));
        }
    }

    fn drain_error_queue(shared: &Shared) {
        let mut control_buf = [0u8; 512];
        loop {
            let mut iov = libc::iovec { iov_base: std::ptr::null_mut(), iov_len: 0 };
            let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
            msg.msg_iov = &mut iov;
            msg.msg_iovlen = 1;
            msg.msg_control = control_buf.as_mut_ptr() as *mut libc::c_void;
            msg.msg_controllen = control_buf.len();

            let ret = unsafe { libc::recvmsg(shared.fd, &mut msg, libc::MSG_ERRQUEUE | libc::MSG_DONTWAIT) };
            if ret < 0 {
                break;
            }

            let mut completed: Vec<(u32, u32)> = Vec::new();
            unsafe {
                let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
                while !cmsg.is_null() {
                    let hdr = &*cmsg;
                    if hdr.cmsg_level == libc::SOL_IP && hdr.cmsg_type == libc::IP_RECVERR {
                        let ee = &*(libc::CMSG_DATA(cmsg) as *const libc::sock_extended_err);
                        if ee.ee_errno == 0 && ee.ee_origin == SO_EE_ORIGIN_ZEROCOPY {
                            completed.push((ee.ee_info, ee.ee_data));
                        }
                    }
                    cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
                }
            }

            if completed.is_empty() {
                continue;
            }
            let mut pending = shared.pending_buffers.lock().unwrap();
            let mut released = 0u64;
            for (lo, hi) in completed {
                for buffer_id in lo..=hi {
                    if pending.remove(&buffer_id).is_some() {
                        released += 1;
                    }
                }
            }
            drop(pending);
            shared.counters.outstanding_buffers.fetch_sub(released.min(shared.counters.outstanding_buffers.load(Ordering::Relaxed)), Ordering::Relaxed);
        }
    }

}

#[cfg(target_os = "linux")]
pub use linux::ZeroCopySender;

/// Non-Linux stub: `SO_ZEROCOPY`/`MSG_ZEROCOPY` don't exist outside Linux, so
/// every attempt is declined up front and callers fall back to the regular
/// async-write path, per §7's `ZeroCopyUnavailable`.
#[cfg(not(target_os = "linux"))]
pub struct ZeroCopySender {
    counters: Counters,
}

#[cfg(not(target_os = "linux"))]
impl ZeroCopySender {
    pub fn try_enable(_fd: std::os::fd::RawFd, _pending_async_ops: Arc<AtomicU32>) -> Option<Self> {
        None
    }

    pub fn try_send(&self, buf: Bytes) -> ZeroCopyOutcome {
        ZeroCopyOutcome::SendRemaining(buf)
    }

    pub fn note_regular_send(&self, len: usize) {
        self.counters.regular_sends.fetch_add(1, Ordering::Relaxed);
        self.counters.regular_bytes.fetch_add(len as u64, Ordering::Relaxed);
    }

    pub fn stats(&self) -> ZeroCopyStats {
        self.counters.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_percentage_handles_zero_attempts() {
        let stats = ZeroCopyStats::default();
        assert_eq!(stats.zerocopy_percentage(), 0.0);
    }

    #[test]
    fn stats_percentage_computes_ratio() {
        let stats = ZeroCopyStats { zerocopy_attempts: 4, zerocopy_successful: 3, ..Default::default() };
        assert_eq!(stats.zerocopy_percentage(), 75.0);
    }
}
