//! Pollable asynchronous reads
//!
//! Runs the blocking receive on a dedicated thread and signals readiness
//! through a non-blocking self-pipe, so a caller can park the query in its
//! own event loop: `resume()` never blocks, and while a packet is still in
//! flight the exposed descriptor becomes readable exactly when there is
//! something to collect.

use crate::driver::DriverCore;
use parking_lot::{Condvar, Mutex};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tundra_common::{QueryKind, Result, TundraError};
use tundra_net::ServerPacket;

struct FiberState {
    /// The caller asked for the next packet
    want_next: bool,
    /// One received packet (or the receive error), awaiting collection
    packet: Option<Result<ServerPacket>>,
}

struct Shared {
    state: Mutex<FiberState>,
    resumed: Condvar,
    cancelled: AtomicBool,
    query_sent: AtomicBool,
    write_fd: RawFd,
}

impl Shared {
    /// Park until the caller resumes with an empty packet slot.
    /// Returns false once the context is cancelled.
    fn wait_for_resume(&self) -> bool {
        let mut state = self.state.lock();
        loop {
            if self.cancelled.load(Ordering::Acquire) {
                return false;
            }
            if state.want_next && state.packet.is_none() {
                state.want_next = false;
                return true;
            }
            self.resumed.wait(&mut state);
        }
    }

    fn post(&self, packet: Result<ServerPacket>) {
        if self.cancelled.load(Ordering::Acquire) {
            return;
        }
        self.state.lock().packet = Some(packet);
        self.notify_fd();
    }

    fn notify_fd(&self) {
        let byte = [1u8];
        unsafe {
            libc::write(self.write_fd, byte.as_ptr() as *const libc::c_void, 1);
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.write_fd);
        }
    }
}

pub(crate) struct ReadContext {
    shared: Arc<Shared>,
    read_fd: RawFd,
    in_progress: AtomicBool,
}

fn make_pipe() -> Result<(RawFd, RawFd)> {
    let mut fds = [0 as libc::c_int; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    for fd in fds {
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
        }
    }
    Ok((fds[0], fds[1]))
}

impl ReadContext {
    /// With `suspend_after_send` the first resume only carries the query to
    /// the wire; receiving starts on the resume after that.
    pub(crate) fn new(core: Arc<DriverCore>, suspend_after_send: bool) -> Result<Self> {
        let (read_fd, write_fd) = make_pipe()?;
        let shared = Arc::new(Shared {
            state: Mutex::new(FiberState {
                want_next: false,
                packet: None,
            }),
            resumed: Condvar::new(),
            cancelled: AtomicBool::new(false),
            query_sent: AtomicBool::new(false),
            write_fd,
        });

        let worker = shared.clone();
        std::thread::Builder::new()
            .name("tundra-remote-read".to_string())
            .spawn(move || {
                if !worker.wait_for_resume() {
                    return;
                }
                if let Err(e) = core.send_query_attempt(QueryKind::Initial, None) {
                    worker.post(Err(e));
                    return;
                }
                worker.query_sent.store(true, Ordering::Release);
                worker.notify_fd();
                if suspend_after_send && !worker.wait_for_resume() {
                    return;
                }
                loop {
                    let packet = core.receive_for_read_context();
                    let failed = packet.is_err();
                    worker.post(packet);
                    if failed || !worker.wait_for_resume() {
                        return;
                    }
                }
            })?;

        Ok(Self {
            shared,
            read_fd,
            in_progress: AtomicBool::new(true),
        })
    }

    /// Drive the conversation one step without blocking. Afterwards either
    /// a packet is collectable (`!is_in_progress`) or the descriptor should
    /// be polled.
    pub(crate) fn resume(&self) {
        if self.shared.cancelled.load(Ordering::Acquire) {
            return;
        }
        let mut state = self.shared.state.lock();
        if state.packet.is_some() {
            self.in_progress.store(false, Ordering::Release);
        } else {
            state.want_next = true;
            self.in_progress.store(true, Ordering::Release);
            self.shared.resumed.notify_one();
        }
    }

    pub(crate) fn is_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }

    /// Monotonic: true once the query (and its pending data) reached the wire.
    pub(crate) fn is_query_sent(&self) -> bool {
        self.shared.query_sent.load(Ordering::Acquire)
    }

    /// Readable exactly when a resumed receive has completed.
    pub(crate) fn file_descriptor(&self) -> RawFd {
        self.read_fd
    }

    /// Collect the packet produced by the last completed receive.
    pub(crate) fn take_packet(&self) -> Result<ServerPacket> {
        let packet = self.shared.state.lock().packet.take();
        self.drain_fd();
        self.shared.resumed.notify_one();
        packet.unwrap_or_else(|| Err(TundraError::Logical("no packet is ready".to_string())))
    }

    /// Steal the conversation: drop any unconsumed packet and render the
    /// context permanently cancelled. Pollers are woken so they observe it.
    pub(crate) fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::Release);
        self.shared.state.lock().packet = None;
        self.shared.resumed.notify_all();
        self.shared.notify_fd();
    }

    fn drain_fd(&self) {
        let mut buf = [0u8; 16];
        loop {
            let n = unsafe {
                libc::read(self.read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n <= 0 {
                break;
            }
        }
    }
}

impl Drop for ReadContext {
    fn drop(&mut self) {
        self.cancel();
        unsafe {
            libc::close(self.read_fd);
        }
    }
}
