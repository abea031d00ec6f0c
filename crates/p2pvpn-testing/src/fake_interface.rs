//! Queue-backed virtual interface
//!
//! Frames injected with [`FakeInterface::inject_frame`] come out of
//! `read_frame`; frames the tunnel writes are kept for inspection.

use async_trait::async_trait;
use p2pvpn_device::VirtualInterface;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug)]
pub struct FakeInterface {
    name: String,
    mtu: u16,
    link_layer: bool,
    incoming: Mutex<VecDeque<Vec<u8>>>,
    readable: Notify,
    written: Mutex<Vec<Vec<u8>>>,
    wrote: Notify,
    closed: AtomicBool,
    fail_writes: AtomicBool,
}

impl FakeInterface {
    pub fn new(name: &str, mtu: u16, link_layer: bool) -> Self {
        Self {
            name: name.to_string(),
            mtu,
            link_layer,
            incoming: Mutex::new(VecDeque::new()),
            readable: Notify::new(),
            written: Mutex::new(Vec::new()),
            wrote: Notify::new(),
            closed: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// A TUN device named tun0 with MTU 1500
    pub fn tun() -> Self {
        Self::new("tun0", 1500, false)
    }

    /// A TAP device named tap0 with MTU 1500
    pub fn tap() -> Self {
        Self::new("tap0", 1500, true)
    }

    /// Queue a frame for the next `read_frame`
    pub fn inject_frame(&self, frame: impl Into<Vec<u8>>) {
        lock(&self.incoming).push_back(frame.into());
        self.readable.notify_one();
    }

    /// Close the device; pending and future reads fail once the queue drains
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.readable.notify_one();
    }

    /// Make every subsequent `write_frame` fail
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Frames written so far, in order
    pub fn written(&self) -> Vec<Vec<u8>> {
        lock(&self.written).clone()
    }

    pub fn written_count(&self) -> usize {
        lock(&self.written).len()
    }

    /// Wait until at least `count` frames have been written
    pub async fn wait_for_written(&self, count: usize) -> Vec<Vec<u8>> {
        loop {
            let notified = self.wrote.notified();
            {
                let written = lock(&self.written);
                if written.len() >= count {
                    return written.clone();
                }
            }
            notified.await;
        }
    }
}

#[async_trait]
impl VirtualInterface for FakeInterface {
    async fn read_frame(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if let Some(frame) = lock(&self.incoming).pop_front() {
                let n = frame.len().min(buf.len());
                buf[..n].copy_from_slice(&frame[..n]);
                return Ok(n);
            }

            if self.closed.load(Ordering::SeqCst) {
                return Err(io::Error::new(
                    io::ErrorKind::NotConnected,
                    format!("{} is closed", self.name),
                ));
            }

            self.readable.notified().await;
        }
    }

    async fn write_frame(&self, frame: &[u8]) -> io::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("write to {} failed", self.name),
            ));
        }

        lock(&self.written).push(frame.to_vec());
        self.wrote.notify_waiters();
        Ok(())
    }

    fn is_link_layer(&self) -> bool {
        self.link_layer
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }
}
