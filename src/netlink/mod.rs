//! rtnetlink address source.
//!
//! Subscribes to the kernel's address-notification groups and feeds the
//! resulting changes into an [`InterfaceTable`]. A dedicated worker thread
//! spends its life blocked in `recv`; a configurable interrupt signal is
//! the only way to unblock it early, so the worker masks every other
//! signal.
//!
//! Useful things when developing this:
//!     - https://man7.org/linux/man-pages/man7/rtnetlink.7.html
//!     - simulate ipv4 activity: `ip a add 10.0.0.254 dev wlan0 && sleep 1 && ip a del 10.0.0.254/32 dev wlan0`
//!     - simulate ipv6 activity: `ip -6 addr add 2001:0db8:0:f101::1/64 dev lo && sleep 1 && ip -6 addr del 2001:0db8:0:f101::1/64 dev lo`

mod ffi;

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::process;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use nix::sys::pthread::{pthread_kill, pthread_self, Pthread};
use nix::sys::signal::{
    pthread_sigmask, sigaction, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal,
};

use crate::bail;
use crate::error::Result;
use crate::interfaces::InterfaceTable;

/// One outstanding kernel enumeration, shared between `refresh` callers and
/// the worker that observes its completion.
struct RefreshState {
    in_progress: Mutex<bool>,
    cond: Condvar,
}

impl RefreshState {
    fn new() -> RefreshState {
        RefreshState {
            in_progress: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Run `send` unless a refresh is already pending; a single outstanding
    /// enumeration satisfies every caller.
    fn begin<F>(&self, send: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        let mut in_progress = self.in_progress.lock().unwrap();
        if !*in_progress {
            send()?;
            *in_progress = true;
        }
        Ok(())
    }

    /// Mark the pending refresh complete and wake all waiters.
    fn complete(&self) {
        let mut in_progress = self.in_progress.lock().unwrap();
        *in_progress = false;
        self.cond.notify_all();
    }

    /// Block until no refresh is in progress.
    fn wait(&self) {
        let mut in_progress = self.in_progress.lock().unwrap();
        while *in_progress {
            in_progress = self.cond.wait(in_progress).unwrap();
        }
    }
}

#[cfg(test)]
impl RefreshState {
    fn is_pending(&self) -> bool {
        *self.in_progress.lock().unwrap()
    }
}

/// The kernel-facing side of the interface table.
pub struct NetlinkSource {
    fd: OwnedFd,
    interrupt_signal: Option<Signal>,
    refresh: Arc<RefreshState>,
    terminated: Arc<AtomicBool>,
    worker: Option<(Pthread, JoinHandle<()>)>,
}

impl NetlinkSource {
    /// Open an rtnetlink socket bound to the IPv4 and IPv6 address
    /// notification groups.
    pub fn open(interrupt_signal: Option<Signal>) -> Result<NetlinkSource> {
        // SAFETY: plain socket(2) call; the fd is checked before use and
        // owned below.
        let raw = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                libc::NETLINK_ROUTE,
            )
        };
        if raw < 0 {
            bail!(
                "could not open an rtnetlink socket: {}",
                io::Error::last_os_error()
            );
        }
        // SAFETY: raw is a freshly opened, valid fd that nothing else owns.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        addr.nl_groups = ffi::RTMGRP_IPV4_IFADDR | ffi::RTMGRP_IPV6_IFADDR;
        // SAFETY: fd is valid and addr is a properly initialized
        // sockaddr_nl of the size passed.
        let ret = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            bail!(
                "could not bind the rtnetlink socket: {}",
                io::Error::last_os_error()
            );
        }

        Ok(NetlinkSource {
            fd,
            interrupt_signal,
            refresh: Arc::new(RefreshState::new()),
            terminated: Arc::new(AtomicBool::new(false)),
            worker: None,
        })
    }

    /// Spawn the worker thread that consumes kernel notifications into
    /// `table`.
    ///
    /// The worker runs with every signal blocked except the interrupt
    /// signal, which exists solely to break its blocking `recv`.
    pub fn start(&mut self, table: Arc<InterfaceTable>) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        self.terminated.store(false, Ordering::SeqCst);

        if let Some(signal) = self.interrupt_signal {
            let action = SigAction::new(
                SigHandler::Handler(interrupt_handler),
                SaFlags::empty(),
                SigSet::empty(),
            );
            // SAFETY: the handler is a no-op and therefore async-signal-safe.
            unsafe { sigaction(signal, &action) }?;
        }

        // The worker inherits its signal mask from us, so set the mask
        // before spawning and restore it right after.
        let mut mask = SigSet::all();
        if let Some(signal) = self.interrupt_signal {
            mask.remove(signal);
        }
        let mut old_mask = SigSet::empty();
        pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&mask), Some(&mut old_mask))?;

        let fd = self.fd.as_raw_fd();
        let refresh = self.refresh.clone();
        let terminated = self.terminated.clone();
        let (tid_tx, tid_rx) = mpsc::channel();
        let spawned = thread::Builder::new().name("netlink".into()).spawn(move || {
            let _ = tid_tx.send(pthread_self());
            worker_loop(fd, &table, &refresh, &terminated);
        });

        pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&old_mask), None)?;

        let handle = spawned?;
        let tid = match tid_rx.recv() {
            Ok(tid) => tid,
            Err(_) => {
                let _ = handle.join();
                bail!("the netlink worker died before reporting its thread id");
            }
        };
        self.worker = Some((tid, handle));
        Ok(())
    }

    /// Ask the kernel to re-enumerate all interface addresses.
    ///
    /// Idempotent: while an enumeration is outstanding, further calls
    /// return immediately and are satisfied by the same reply stream.
    pub fn refresh(&self) -> Result<()> {
        let fd = self.fd.as_raw_fd();
        self.refresh.begin(|| {
            let request = ffi::getaddr_request(libc::AF_INET6 as u8);
            // SAFETY: fd is valid and request is a complete message.
            let sent = unsafe {
                libc::send(
                    fd,
                    request.as_ptr() as *const libc::c_void,
                    request.len(),
                    0,
                )
            };
            if sent < 0 {
                bail!(
                    "could not send an rtnetlink request: {}",
                    io::Error::last_os_error()
                );
            }
            if sent as usize != request.len() {
                log::error!(
                    "truncated rtnetlink request ({} of {} bytes sent)",
                    sent,
                    request.len()
                );
                process::abort();
            }
            Ok(())
        })
    }

    /// Block until the outstanding refresh, if any, has completed.
    pub fn wait_for_refresh(&self) {
        self.refresh.wait();
    }

    /// Stop and join the worker thread.
    ///
    /// Without an interrupt signal this waits for the next kernel message
    /// to shake the worker out of `recv`.
    pub fn stop(&mut self) {
        if let Some((tid, handle)) = self.worker.take() {
            self.terminated.store(true, Ordering::SeqCst);
            if let Some(signal) = self.interrupt_signal {
                let _ = pthread_kill(tid, signal);
            }
            let _ = handle.join();
        }
    }
}

impl Drop for NetlinkSource {
    fn drop(&mut self) {
        self.stop();
    }
}

extern "C" fn interrupt_handler(_signal: libc::c_int) {
    // Nothing to do: delivery alone breaks the blocking recv.
}

fn worker_loop(
    fd: RawFd,
    table: &InterfaceTable,
    refresh: &RefreshState,
    terminated: &AtomicBool,
) {
    while !terminated.load(Ordering::SeqCst) {
        // Size the next message before receiving it.
        // SAFETY: a null buffer of length zero is valid for a peek.
        let peeked = unsafe {
            libc::recv(
                fd,
                ptr::null_mut(),
                0,
                libc::MSG_PEEK | libc::MSG_TRUNC,
            )
        };
        if peeked < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            log::error!("failed to recv from rtnetlink: {}", err);
            return;
        }

        let mut buf = vec![0u8; peeked as usize];
        // SAFETY: buf is a live allocation of the length passed.
        let received = unsafe {
            libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)
        };
        if received < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            log::error!("failed to recv from rtnetlink: {}", err);
            return;
        }

        decode(table, refresh, &buf[..received as usize]);
    }
}

/// Walk a receive buffer of netlink messages, applying address changes to
/// the table. Multi-part reply walking stops on NLMSG_DONE or on a
/// non-multi message.
fn decode(table: &InterfaceTable, refresh: &RefreshState, buf: &[u8]) {
    let mut offset = 0;
    while let Some(header) = ffi::read_header(buf, offset) {
        let header_size = mem::size_of::<ffi::NlMsgHdr>();
        if (header.nlmsg_len as usize) < header_size {
            break;
        }
        let msg_end = offset + header.nlmsg_len as usize;
        if msg_end > buf.len() {
            break;
        }
        let payload = &buf[offset + header_size..msg_end];

        let mut done = false;
        match header.nlmsg_type {
            ffi::NLMSG_NOOP => log::info!("got NLMSG_NOOP from rtnetlink"),
            ffi::NLMSG_ERROR => {
                if payload.len() >= 4 {
                    let errno = i32::from_ne_bytes(payload[..4].try_into().unwrap());
                    log::error!(
                        "got an rtnetlink error: {}",
                        io::Error::from_raw_os_error(-errno)
                    );
                }
            }
            ffi::NLMSG_DONE => {
                refresh.complete();
                done = true;
            }
            ffi::RTM_NEWADDR => {
                log::debug!("got RTM_NEWADDR");
                handle_ifaddrmsg(table, payload, true);
            }
            ffi::RTM_DELADDR => {
                log::debug!("got RTM_DELADDR");
                handle_ifaddrmsg(table, payload, false);
            }
            other => log::info!("unknown netlink message type: {}", other),
        }

        if header.nlmsg_flags & ffi::NLM_F_MULTI == 0 || done {
            break;
        }
        offset = ffi::nlmsg_align(msg_end);
    }
}

fn handle_ifaddrmsg(table: &InterfaceTable, payload: &[u8], added: bool) {
    let ifa = match ffi::read_ifaddrmsg(payload) {
        Some(ifa) => ifa,
        None => return,
    };
    for (kind, data) in ffi::attrs(&payload[mem::size_of::<ffi::IfAddrMsg>()..]) {
        if kind == ffi::IFA_ADDRESS {
            if added {
                table.add_address(ifa.ifa_index, ifa.ifa_family, data);
            } else {
                table.remove_address(ifa.ifa_index, ifa.ifa_family, data);
            }
        }
    }
}
