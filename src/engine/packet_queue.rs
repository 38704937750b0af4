// SPDX-License-Identifier: MPL-2.0
//! Serial-tagged packet FIFO.
//!
//! One queue exists per selected elementary stream. The demux reader is the
//! only producer; the matching decode loop is the only consumer, but flush,
//! abort and the byte-size accounting are touched from control threads too,
//! so everything lives behind one mutex.
//!
//! A `None` packet entry is the end-of-stream marker: the reader enqueues it
//! when the container is drained so the decoder can flush its codec and mark
//! the current serial finished.

use super::Serial;
use crate::error::{Error, Result};
use ffmpeg_next::Packet;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex};

struct Entry {
    packet: Option<Packet>,
    serial: Serial,
}

struct Inner {
    entries: VecDeque<Entry>,
    nb_packets: usize,
    /// Compressed bytes queued, plus a fixed per-entry overhead.
    size: usize,
    /// Queued duration in stream time-base units.
    duration: i64,
    serial: Serial,
    aborted: bool,
}

pub struct PacketQueue {
    inner: Mutex<Inner>,
    cond: Condvar,
    /// Mirror of the live serial, readable without the queue lock. Clocks
    /// bound to this queue compare against it on every read.
    live_serial: Arc<AtomicI32>,
}

impl PacketQueue {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: VecDeque::new(),
                nb_packets: 0,
                size: 0,
                duration: 0,
                serial: 0,
                aborted: true,
            }),
            cond: Condvar::new(),
            live_serial: Arc::new(AtomicI32::new(0)),
        }
    }

    /// Handle for clocks slaved to this queue.
    #[must_use]
    pub fn live_serial_handle(&self) -> Arc<AtomicI32> {
        Arc::clone(&self.live_serial)
    }

    #[must_use]
    pub fn serial(&self) -> Serial {
        self.live_serial.load(Ordering::Acquire)
    }

    /// Enqueues a packet tagged with the live serial.
    pub fn put(&self, packet: Packet) -> Result<()> {
        self.put_entry(Some(packet))
    }

    /// Enqueues the end-of-stream marker.
    pub fn put_eof(&self) -> Result<()> {
        self.put_entry(None)
    }

    fn put_entry(&self, packet: Option<Packet>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.aborted {
            return Err(Error::Aborted);
        }
        let size = packet.as_ref().map_or(0, Packet::size);
        let duration = packet.as_ref().map_or(0, Packet::duration);
        let serial = inner.serial;
        inner.entries.push_back(Entry { packet, serial });
        inner.nb_packets += 1;
        inner.size += size + std::mem::size_of::<Entry>();
        inner.duration += duration;
        self.cond.notify_one();
        Ok(())
    }

    /// Pops the head, blocking until an entry arrives or the queue aborts.
    /// Returns the packet (`None` = end-of-stream marker) and its serial.
    pub fn get(&self) -> Result<(Option<Packet>, Serial)> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.aborted {
                return Err(Error::Aborted);
            }
            if let Some(entry) = inner.entries.pop_front() {
                Self::account_removed(&mut inner, &entry);
                return Ok((entry.packet, entry.serial));
            }
            inner = self.cond.wait(inner).unwrap();
        }
    }

    /// Non-blocking variant of [`PacketQueue::get`].
    pub fn try_get(&self) -> Result<Option<(Option<Packet>, Serial)>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.aborted {
            return Err(Error::Aborted);
        }
        match inner.entries.pop_front() {
            Some(entry) => {
                Self::account_removed(&mut inner, &entry);
                Ok(Some((entry.packet, entry.serial)))
            }
            None => Ok(None),
        }
    }

    fn account_removed(inner: &mut Inner, entry: &Entry) {
        inner.nb_packets -= 1;
        inner.size -= entry.packet.as_ref().map_or(0, Packet::size) + std::mem::size_of::<Entry>();
        inner.duration -= entry.packet.as_ref().map_or(0, Packet::duration);
    }

    /// Drops all queued entries and bumps the serial: everything still in
    /// flight downstream is now distinguishable as stale.
    pub fn flush(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
        inner.nb_packets = 0;
        inner.size = 0;
        inner.duration = 0;
        inner.serial += 1;
        self.live_serial.store(inner.serial, Ordering::Release);
    }

    /// Cancels the queue: wakes every waiter, further puts/gets fail.
    pub fn abort(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.aborted = true;
        self.cond.notify_all();
    }

    /// Re-arms an aborted queue under a fresh serial.
    pub fn start(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.aborted = false;
        inner.serial += 1;
        self.live_serial.store(inner.serial, Ordering::Release);
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.inner.lock().unwrap().aborted
    }

    #[must_use]
    pub fn nb_packets(&self) -> usize {
        self.inner.lock().unwrap().nb_packets
    }

    /// Queued bytes including per-entry overhead.
    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().size
    }

    /// Queued duration in stream time-base units.
    #[must_use]
    pub fn duration(&self) -> i64 {
        self.inner.lock().unwrap().duration
    }
}

impl Default for PacketQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn packet_with_pts(pts: i64) -> Packet {
        let mut packet = Packet::empty();
        packet.set_pts(Some(pts));
        packet
    }

    #[test]
    fn put_get_preserves_fifo_order_and_serial() {
        let queue = PacketQueue::new();
        queue.start();
        let serial = queue.serial();

        for pts in 0..5 {
            queue.put(packet_with_pts(pts)).unwrap();
        }
        for pts in 0..5 {
            let (packet, entry_serial) = queue.get().unwrap();
            assert_eq!(packet.unwrap().pts(), Some(pts));
            assert_eq!(entry_serial, serial);
        }
    }

    #[test]
    fn flush_strictly_increases_serial() {
        let queue = PacketQueue::new();
        queue.start();
        let before = queue.serial();

        queue.put(packet_with_pts(1)).unwrap();
        queue.flush();

        assert_eq!(queue.serial(), before + 1);
        assert_eq!(queue.nb_packets(), 0);
        assert_eq!(queue.size(), 0);
    }

    #[test]
    fn entries_enqueued_before_flush_carry_lower_serial() {
        let queue = PacketQueue::new();
        queue.start();

        queue.put(packet_with_pts(1)).unwrap();
        let old_serial = queue.serial();
        // Consume, then flush, then enqueue a current-generation packet.
        let (_, first_serial) = queue.get().unwrap();
        queue.flush();
        queue.put(packet_with_pts(2)).unwrap();
        let (_, second_serial) = queue.get().unwrap();

        assert_eq!(first_serial, old_serial);
        assert_eq!(second_serial, old_serial + 1);
        assert!(second_serial > first_serial);
    }

    #[test]
    fn put_fails_when_aborted() {
        let queue = PacketQueue::new();
        // Fresh queues start aborted until started.
        assert!(matches!(queue.put(packet_with_pts(0)), Err(Error::Aborted)));

        queue.start();
        assert!(queue.put(packet_with_pts(0)).is_ok());

        queue.abort();
        assert!(matches!(queue.put(packet_with_pts(1)), Err(Error::Aborted)));
    }

    #[test]
    fn abort_releases_blocked_get() {
        let queue = Arc::new(PacketQueue::new());
        queue.start();

        let waiter = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.get())
        };
        // Give the waiter time to block, then cancel.
        thread::sleep(Duration::from_millis(50));
        queue.abort();

        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(Error::Aborted)));
    }

    #[test]
    fn eof_marker_flows_through() {
        let queue = PacketQueue::new();
        queue.start();
        queue.put_eof().unwrap();
        let (packet, _) = queue.get().unwrap();
        assert!(packet.is_none());
    }

    #[test]
    fn size_accounting_returns_to_zero() {
        let queue = PacketQueue::new();
        queue.start();
        queue.put(packet_with_pts(0)).unwrap();
        assert!(queue.size() > 0);
        let _ = queue.get().unwrap();
        assert_eq!(queue.size(), 0);
        assert_eq!(queue.duration(), 0);
    }

    #[test]
    fn start_after_abort_rearms_with_new_serial() {
        let queue = PacketQueue::new();
        queue.start();
        let first = queue.serial();
        queue.abort();
        queue.start();
        assert_eq!(queue.serial(), first + 1);
        assert!(queue.put(packet_with_pts(0)).is_ok());
    }
}
