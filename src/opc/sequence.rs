use serde::{Deserialize, Serialize};

/// What to do with a frame that re-sends the current sequence number.
///
/// The observed senders disagree: some re-send the last frame as a refresh
/// (accept and overwrite), some only ever increment (discard as a stray).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    #[default]
    Accept,
    Discard,
}

/// Classification of an incoming sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqVerdict {
    InOrder,
    /// In order but with `missed` sequence numbers skipped
    Gap { missed: u64 },
    Duplicate,
    Stale,
}

/// Tracks sequence continuity for one sender.
///
/// Counters live for the process (UDP) or for one connection (TCP, reset on
/// accept). Comparisons are plain, not modulo-16-bit: a stream that wraps
/// past 65535 misclassifies the frames at the boundary, same as the senders
/// this was written against.
#[derive(Debug)]
pub struct SequenceTracker {
    last_sequence: u16,
    dropped: u64,
    stale: u64,
}

impl SequenceTracker {
    pub fn new() -> Self {
        SequenceTracker {
            last_sequence: 0,
            dropped: 0,
            stale: 0,
        }
    }

    /// Classify `seq` and update the tracker.
    ///
    /// In-order and gapped frames advance `last_sequence`; gaps add the number
    /// of skipped frames to the dropped counter. Duplicates never advance
    /// `last_sequence` (whether their payload is applied is the caller's
    /// DuplicatePolicy). Stale frames bump the stale counter and must be
    /// discarded by the caller without touching the pixel buffer.
    pub fn observe(&mut self, seq: u16) -> SeqVerdict {
        if seq == self.last_sequence.wrapping_add(1) {
            self.last_sequence = seq;
            SeqVerdict::InOrder
        } else if seq == self.last_sequence {
            SeqVerdict::Duplicate
        } else if seq > self.last_sequence {
            let missed = u64::from(seq - self.last_sequence) - 1;
            self.dropped += missed;
            self.last_sequence = seq;
            SeqVerdict::Gap { missed }
        } else {
            self.stale += 1;
            SeqVerdict::Stale
        }
    }

    pub fn last_sequence(&self) -> u16 {
        self.last_sequence
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn stale(&self) -> u64 {
        self.stale
    }

    /// Back to identity defaults (new TCP connection)
    pub fn reset(&mut self) {
        *self = SequenceTracker::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_order_advances() {
        let mut t = SequenceTracker::new();
        assert_eq!(t.observe(1), SeqVerdict::InOrder);
        assert_eq!(t.observe(2), SeqVerdict::InOrder);
        assert_eq!(t.last_sequence(), 2);
        assert_eq!(t.dropped(), 0);
        assert_eq!(t.stale(), 0);
    }

    #[test]
    fn test_single_gap_counts_one_drop() {
        // 1, 2, 4: one frame (3) went missing
        let mut t = SequenceTracker::new();
        t.observe(1);
        t.observe(2);
        assert_eq!(t.observe(4), SeqVerdict::Gap { missed: 1 });
        assert_eq!(t.dropped(), 1);
        assert_eq!(t.last_sequence(), 4);
    }

    #[test]
    fn test_stale_does_not_advance() {
        let mut t = SequenceTracker::new();
        t.observe(5);
        assert_eq!(t.observe(3), SeqVerdict::Stale);
        assert_eq!(t.stale(), 1);
        assert_eq!(t.last_sequence(), 5);
    }

    #[test]
    fn test_duplicate_does_not_advance() {
        let mut t = SequenceTracker::new();
        t.observe(7);
        assert_eq!(t.observe(7), SeqVerdict::Duplicate);
        assert_eq!(t.last_sequence(), 7);
        assert_eq!(t.stale(), 0);
        assert_eq!(t.dropped(), 6); // initial jump 0 -> 7
    }

    #[test]
    fn test_wrap_increment_is_in_order() {
        let mut t = SequenceTracker::new();
        t.observe(65535);
        assert_eq!(t.observe(0), SeqVerdict::InOrder);
        assert_eq!(t.last_sequence(), 0);
    }

    #[test]
    fn test_reset_clears_counters() {
        let mut t = SequenceTracker::new();
        t.observe(10);
        t.observe(3);
        t.reset();
        assert_eq!(t.last_sequence(), 0);
        assert_eq!(t.dropped(), 0);
        assert_eq!(t.stale(), 0);
    }
}
