// SPDX-License-Identifier: MPL-2.0
//! Bounded ring of decoded frames.
//!
//! Producers block while the ring is full, consumers while it is empty; both
//! are released by `abort`. With `keep_last` set (video) the slot holding the
//! most recently displayed frame is not freed by the first `next()`, so the
//! picture stays available across a brief underrun and for the render loop's
//! "re-display last frame" path.
//!
//! Payloads sit behind `Arc`, so every peek hands out a cheap clone instead
//! of a reference into the locked ring.

use super::Serial;
use crate::error::{Error, Result};
use std::sync::{Arc, Condvar, Mutex};

/// One ring entry: shared payload plus presentation metadata.
#[derive(Debug)]
pub struct QueuedFrame<T> {
    pub payload: Arc<T>,
    /// Presentation timestamp in seconds, NaN when unknown.
    pub pts: f64,
    /// Nominal duration in seconds.
    pub duration: f64,
    /// Byte position in the container, -1 when unknown.
    pub pos: i64,
    pub serial: Serial,
}

impl<T> Clone for QueuedFrame<T> {
    fn clone(&self) -> Self {
        Self {
            payload: Arc::clone(&self.payload),
            pts: self.pts,
            duration: self.duration,
            pos: self.pos,
            serial: self.serial,
        }
    }
}

struct Ring<T> {
    slots: Vec<Option<QueuedFrame<T>>>,
    rindex: usize,
    windex: usize,
    size: usize,
    /// 1 once the frame at `rindex` has been displayed (keep-last mode).
    rindex_shown: usize,
    aborted: bool,
}

pub struct FrameQueue<T> {
    ring: Mutex<Ring<T>>,
    cond: Condvar,
    capacity: usize,
    keep_last: bool,
}

impl<T> FrameQueue<T> {
    #[must_use]
    pub fn new(capacity: usize, keep_last: bool) -> Self {
        assert!(capacity > 0);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            ring: Mutex::new(Ring {
                slots,
                rindex: 0,
                windex: 0,
                size: 0,
                rindex_shown: 0,
                aborted: false,
            }),
            cond: Condvar::new(),
            capacity,
            keep_last,
        }
    }

    /// Blocks until a slot is free, then commits the frame and wakes readers.
    pub fn push(&self, frame: QueuedFrame<T>) -> Result<()> {
        let mut ring = self.ring.lock().unwrap();
        loop {
            if ring.aborted {
                return Err(Error::Aborted);
            }
            if ring.size < self.capacity {
                break;
            }
            ring = self.cond.wait(ring).unwrap();
        }
        let windex = ring.windex;
        ring.slots[windex] = Some(frame);
        ring.windex = (windex + 1) % self.capacity;
        ring.size += 1;
        self.cond.notify_all();
        Ok(())
    }

    /// Blocks until at least one unread frame exists.
    pub fn peek_readable(&self) -> Result<QueuedFrame<T>> {
        let mut ring = self.ring.lock().unwrap();
        loop {
            if ring.aborted {
                return Err(Error::Aborted);
            }
            if ring.size > ring.rindex_shown {
                let index = (ring.rindex + ring.rindex_shown) % self.capacity;
                return Ok(ring.slots[index].as_ref().expect("occupied slot").clone());
            }
            ring = self.cond.wait(ring).unwrap();
        }
    }

    /// Lock-light readable check for the audio callback: returns `None` when
    /// the ring is empty, aborted, or the lock is contended right now.
    #[must_use]
    pub fn poll_readable(&self) -> Option<QueuedFrame<T>> {
        let ring = self.ring.try_lock().ok()?;
        if ring.aborted || ring.size <= ring.rindex_shown {
            return None;
        }
        let index = (ring.rindex + ring.rindex_shown) % self.capacity;
        Some(ring.slots[index].as_ref().expect("occupied slot").clone())
    }

    /// The frame `next()` would expose, without blocking.
    #[must_use]
    pub fn peek(&self) -> Option<QueuedFrame<T>> {
        let ring = self.ring.lock().unwrap();
        if ring.size <= ring.rindex_shown {
            return None;
        }
        let index = (ring.rindex + ring.rindex_shown) % self.capacity;
        ring.slots[index].clone()
    }

    /// One frame of lookahead past [`FrameQueue::peek`].
    #[must_use]
    pub fn peek_next(&self) -> Option<QueuedFrame<T>> {
        let ring = self.ring.lock().unwrap();
        if ring.size <= ring.rindex_shown + 1 {
            return None;
        }
        let index = (ring.rindex + ring.rindex_shown + 1) % self.capacity;
        ring.slots[index].clone()
    }

    /// The most recently displayed frame (keep-last slot).
    #[must_use]
    pub fn peek_last(&self) -> Option<QueuedFrame<T>> {
        let ring = self.ring.lock().unwrap();
        ring.slots[ring.rindex].clone()
    }

    /// Advances the read index. In keep-last mode the first call after a
    /// display only marks the frame shown without freeing its slot.
    pub fn next(&self) {
        let mut ring = self.ring.lock().unwrap();
        if self.keep_last && ring.rindex_shown == 0 {
            if ring.size > 0 {
                ring.rindex_shown = 1;
            }
            return;
        }
        // Only the shown frame (or nothing) left: freeing it would leave
        // rindex_shown pointing at an empty slot.
        if ring.size <= ring.rindex_shown {
            return;
        }
        let rindex = ring.rindex;
        ring.slots[rindex] = None;
        ring.rindex = (rindex + 1) % self.capacity;
        ring.size -= 1;
        self.cond.notify_all();
    }

    /// Number of undisplayed frames.
    #[must_use]
    pub fn nb_remaining(&self) -> usize {
        let ring = self.ring.lock().unwrap();
        ring.size - ring.rindex_shown
    }

    /// Container byte position of the last displayed frame, if it belongs to
    /// the given (current) serial.
    #[must_use]
    pub fn last_pos(&self, current_serial: Serial) -> Option<i64> {
        let ring = self.ring.lock().unwrap();
        let frame = ring.slots[ring.rindex].as_ref()?;
        (ring.rindex_shown != 0 && frame.serial == current_serial).then_some(frame.pos)
    }

    /// Wakes every blocked producer and consumer; all blocking calls return
    /// `Aborted` from now on.
    pub fn abort(&self) {
        let mut ring = self.ring.lock().unwrap();
        ring.aborted = true;
        self.cond.notify_all();
    }

    /// Wakes waiters without changing state (used when an upstream condition
    /// they also check has changed).
    pub fn signal(&self) {
        let _ring = self.ring.lock().unwrap();
        self.cond.notify_all();
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.ring.lock().unwrap().aborted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn frame(pts: f64, serial: Serial) -> QueuedFrame<u32> {
        QueuedFrame {
            payload: Arc::new(0),
            pts,
            duration: 0.04,
            pos: (pts * 1000.0) as i64,
            serial,
        }
    }

    #[test]
    fn never_holds_more_than_capacity() {
        let queue = FrameQueue::new(3, false);
        for i in 0..3 {
            queue.push(frame(i as f64, 1)).unwrap();
        }
        assert_eq!(queue.nb_remaining(), 3);

        // A fourth push must block until one frame is consumed.
        let queue = Arc::new(queue);
        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.push(frame(3.0, 1)))
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!producer.is_finished());

        queue.next();
        producer.join().unwrap().unwrap();
        assert_eq!(queue.nb_remaining(), 3);
    }

    #[test]
    fn fifo_order_through_peek_and_next() {
        let queue = FrameQueue::new(4, false);
        for i in 0..4 {
            queue.push(frame(i as f64, 1)).unwrap();
        }
        for i in 0..4 {
            let head = queue.peek().unwrap();
            assert_eq!(head.pts, i as f64);
            queue.next();
        }
        assert!(queue.peek().is_none());
    }

    #[test]
    fn peek_next_gives_one_frame_of_lookahead() {
        let queue = FrameQueue::new(4, false);
        queue.push(frame(0.0, 1)).unwrap();
        assert!(queue.peek_next().is_none());

        queue.push(frame(1.0, 1)).unwrap();
        assert_eq!(queue.peek().unwrap().pts, 0.0);
        assert_eq!(queue.peek_next().unwrap().pts, 1.0);
    }

    #[test]
    fn keep_last_retains_displayed_frame() {
        let queue = FrameQueue::new(3, true);
        queue.push(frame(0.0, 1)).unwrap();
        queue.push(frame(1.0, 1)).unwrap();

        // First next() only marks the head shown; the slot is not freed.
        assert_eq!(queue.nb_remaining(), 2);
        queue.next();
        assert_eq!(queue.nb_remaining(), 1);
        assert_eq!(queue.peek_last().unwrap().pts, 0.0);
        assert_eq!(queue.peek().unwrap().pts, 1.0);

        // Second next() actually frees the shown slot and moves on.
        queue.next();
        assert_eq!(queue.peek_last().unwrap().pts, 1.0);
        assert_eq!(queue.nb_remaining(), 0);
    }

    #[test]
    fn next_on_drained_keep_last_queue_is_a_no_op() {
        let queue = FrameQueue::new(3, true);
        queue.push(frame(0.0, 1)).unwrap();
        queue.next(); // marks the only frame shown
        queue.next(); // nothing unshown left; must not free the shown slot
        assert_eq!(queue.nb_remaining(), 0);
        assert_eq!(queue.peek_last().unwrap().pts, 0.0);
    }

    #[test]
    fn last_pos_requires_matching_serial() {
        let queue = FrameQueue::new(3, true);
        queue.push(frame(2.0, 7)).unwrap();
        queue.next(); // mark shown

        assert_eq!(queue.last_pos(7), Some(2000));
        assert_eq!(queue.last_pos(8), None);
    }

    #[test]
    fn abort_releases_blocked_reader() {
        let queue = Arc::new(FrameQueue::<u32>::new(2, false));
        let reader = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.peek_readable())
        };
        thread::sleep(Duration::from_millis(50));
        queue.abort();
        assert!(matches!(reader.join().unwrap(), Err(Error::Aborted)));
    }

    #[test]
    fn poll_readable_is_nonblocking() {
        let queue = FrameQueue::new(2, false);
        assert!(queue.poll_readable().is_none());
        queue.push(frame(0.5, 1)).unwrap();
        assert_eq!(queue.poll_readable().unwrap().pts, 0.5);
    }
}
