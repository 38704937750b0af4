// SPDX-License-Identifier: MPL-2.0
//! Packet-fetch protocol shared by the decode loops.
//!
//! A [`Decoder`] tracks which queue generation its codec has been fed from.
//! When the serial of the next packet differs from the last one seen, a seek
//! or stream switch happened: the caller must flush its codec state and the
//! gapless-pts bookkeeping restarts. Packets whose serial no longer matches
//! the queue's live serial predate the flush and are discarded unread.
//!
//! End of stream arrives as a `None` packet (queued by the demux reader);
//! after draining the codec the loop records the serial it finished at, which
//! is how the refresh loop distinguishes a drained stream from a stalled one.

use super::packet_queue::PacketQueue;
use super::session::Session;
use super::Serial;
use crate::config::PtsReorderPolicy;
use crate::error::Result;
use ffmpeg_next::{Packet, Rational};

/// One packet handed to a decode loop.
pub struct Fetched {
    /// `None` is the end-of-stream marker.
    pub packet: Option<Packet>,
    pub serial: Serial,
    /// True when this packet opens a new generation: flush the codec first.
    pub serial_changed: bool,
}

pub struct Decoder {
    pkt_serial: Serial,
    finished: Serial,
    /// Packet the codec refused (send returned "try again"); resent before
    /// pulling new input. Only the audio/video loops hit this path: subtitle
    /// decoding consumes a whole packet per call.
    pending: Option<(Packet, Serial)>,
    start_pts: Option<i64>,
    start_pts_tb: Rational,
    next_pts: Option<i64>,
    next_pts_tb: Rational,
}

impl Decoder {
    #[must_use]
    pub fn new(start_pts: Option<i64>, start_pts_tb: Rational) -> Self {
        Self {
            pkt_serial: -1,
            finished: 0,
            pending: None,
            start_pts,
            start_pts_tb,
            next_pts: start_pts,
            next_pts_tb: start_pts_tb,
        }
    }

    #[must_use]
    pub fn pkt_serial(&self) -> Serial {
        self.pkt_serial
    }

    #[must_use]
    pub fn finished_serial(&self) -> Serial {
        self.finished
    }

    /// Records that the codec drained at the current generation.
    pub fn mark_finished(&mut self) {
        self.finished = self.pkt_serial;
    }

    /// Gapless continuation pts for audio frames that arrive without one.
    #[must_use]
    pub fn next_pts(&self) -> (Option<i64>, Rational) {
        (self.next_pts, self.next_pts_tb)
    }

    pub fn set_next_pts(&mut self, pts: i64, tb: Rational) {
        self.next_pts = Some(pts);
        self.next_pts_tb = tb;
    }

    /// Stashes a packet to be returned by the next `fetch` (codec asked for
    /// a resend).
    pub fn push_pending(&mut self, packet: Packet) {
        self.pending = Some((packet, self.pkt_serial));
    }

    /// Blocks for the next current-generation packet. Stale packets are
    /// discarded; an empty queue wakes the demux reader before blocking.
    pub fn fetch(&mut self, queue: &PacketQueue, session: &Session) -> Result<Fetched> {
        loop {
            if let Some((packet, serial)) = self.pending.take() {
                return Ok(self.admit(Some(packet), serial));
            }
            if queue.nb_packets() == 0 {
                session.wake_reader();
            }
            let (packet, serial) = queue.get()?;
            if queue.serial() != serial {
                // Predates the last flush.
                continue;
            }
            return Ok(self.admit(packet, serial));
        }
    }

    fn admit(&mut self, packet: Option<Packet>, serial: Serial) -> Fetched {
        let serial_changed = self.pkt_serial != serial;
        self.pkt_serial = serial;
        if serial_changed {
            self.finished = 0;
            self.next_pts = self.start_pts;
            self.next_pts_tb = self.start_pts_tb;
        }
        Fetched {
            packet,
            serial,
            serial_changed,
        }
    }
}

/// Normalizes a decoded video frame's timestamp per the reorder policy.
#[must_use]
pub fn video_frame_pts(frame: &ffmpeg_next::frame::Video, policy: PtsReorderPolicy) -> Option<i64> {
    match policy {
        PtsReorderPolicy::BestEffort => frame.timestamp(),
        PtsReorderPolicy::Raw => frame.pts(),
        PtsReorderPolicy::DecodeTime => {
            // The safe wrapper does not expose the packet dts.
            let dts = unsafe { (*frame.as_ptr()).pkt_dts };
            (dts != ffmpeg_next::ffi::AV_NOPTS_VALUE).then_some(dts)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlayerConfig;
    use crate::logging::Logger;

    fn packet_with_pts(pts: i64) -> Packet {
        let mut packet = Packet::empty();
        packet.set_pts(Some(pts));
        packet
    }

    fn session() -> Session {
        Session::new(&PlayerConfig::default(), Logger::none())
    }

    #[test]
    fn first_fetch_reports_serial_change() {
        let session = session();
        session.audioq.start();
        session.audioq.put(packet_with_pts(1)).unwrap();

        let mut decoder = Decoder::new(None, Rational(1, 1000));
        let fetched = decoder.fetch(&session.audioq, &session).unwrap();
        assert!(fetched.serial_changed);
        assert_eq!(decoder.pkt_serial(), session.audioq.serial());
    }

    #[test]
    fn stale_packets_are_discarded_after_flush() {
        let session = session();
        session.audioq.start();
        let mut decoder = Decoder::new(None, Rational(1, 1000));

        session.audioq.put(packet_with_pts(1)).unwrap();
        let first = decoder.fetch(&session.audioq, &session).unwrap();
        assert_eq!(first.packet.unwrap().pts(), Some(1));

        // Packet 2 becomes stale the moment the queue is flushed; 3 is
        // current-generation.
        session.audioq.put(packet_with_pts(2)).unwrap();
        session.audioq.flush();
        session.audioq.put(packet_with_pts(3)).unwrap();

        let fetched = decoder.fetch(&session.audioq, &session).unwrap();
        assert_eq!(fetched.packet.unwrap().pts(), Some(3));
        assert!(fetched.serial_changed);
    }

    #[test]
    fn serial_change_resets_gapless_pts() {
        let session = session();
        session.audioq.start();
        let mut decoder = Decoder::new(Some(100), Rational(1, 48_000));
        decoder.set_next_pts(5000, Rational(1, 48_000));

        session.audioq.put(packet_with_pts(1)).unwrap();
        let _ = decoder.fetch(&session.audioq, &session).unwrap();
        assert_eq!(decoder.next_pts().0, Some(100));
    }

    #[test]
    fn pending_packet_is_returned_before_queue() {
        let session = session();
        session.audioq.start();
        let mut decoder = Decoder::new(None, Rational(1, 1000));

        session.audioq.put(packet_with_pts(1)).unwrap();
        let first = decoder.fetch(&session.audioq, &session).unwrap();
        let packet = first.packet.unwrap();

        decoder.push_pending(packet);
        session.audioq.put(packet_with_pts(9)).unwrap();

        let again = decoder.fetch(&session.audioq, &session).unwrap();
        assert_eq!(again.packet.unwrap().pts(), Some(1));
        assert!(!again.serial_changed);
    }

    #[test]
    fn eof_marker_passes_through_and_finishes() {
        let session = session();
        session.audioq.start();
        let mut decoder = Decoder::new(None, Rational(1, 1000));

        session.audioq.put_eof().unwrap();
        let fetched = decoder.fetch(&session.audioq, &session).unwrap();
        assert!(fetched.packet.is_none());

        decoder.mark_finished();
        assert_eq!(decoder.finished_serial(), session.audioq.serial());
    }
}
