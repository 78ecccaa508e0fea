//! Reassembly of IMU samples from SPI-sized fragments.
//!
//! A 48-byte IMU sample does not fit the 40-byte sensor payload, so boards
//! send it as three 16-byte "tribbles" across successive frames, tagged
//! HIGH, MID, LOW by a 2-bit flag. The main board accepts them strictly in
//! that order; anything else abandons the partial sample.

use crate::board::{IMU_DATA_SIZE, IMU_FRAGMENT_SIZE};
use num_enum::TryFromPrimitive;

/// The 2-bit per-IMU fragment tag in the sensor payload.
#[derive(Clone, Copy, PartialEq, Eq, Debug, TryFromPrimitive)]
#[repr(u8)]
pub enum TribbleFlag {
    /// No fragment this frame; also used by boards to abort a sequence.
    New = 0,
    Low = 1,
    Mid = 2,
    High = 3,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum State {
    Idle,
    GotHigh,
    GotMid,
}

/// What one fragment did to the assembly, so the gather stats can be kept
/// by the caller.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FeedOutcome {
    /// Fragment accepted, sample not complete yet.
    Stored,
    /// A HIGH fragment arrived over a partial sample: the old one is lost
    /// (counted as overwritten) and assembly restarts from this fragment.
    OverwrittenRestart,
    /// LOW fragment closed the sequence; the assembled sample is returned.
    Committed([u8; IMU_DATA_SIZE]),
    /// Out-of-order fragment; assembly reset.
    Misaligned,
    /// Nothing to do (idle NEW tick).
    Ignored,
}

/// Assembly state for a single IMU.
#[derive(Clone, Copy)]
pub struct ImuAssembler {
    state: State,
    data: [u8; IMU_DATA_SIZE],
}

impl Default for ImuAssembler {
    fn default() -> Self {
        Self {
            state: State::Idle,
            data: [0; IMU_DATA_SIZE],
        }
    }
}

impl ImuAssembler {
    pub fn feed(&mut self, flag: TribbleFlag, fragment: &[u8]) -> FeedOutcome {
        match flag {
            TribbleFlag::High => {
                let outcome = if self.state == State::Idle {
                    FeedOutcome::Stored
                } else {
                    FeedOutcome::OverwrittenRestart
                };
                self.store(0, fragment);
                self.state = State::GotHigh;
                outcome
            }
            TribbleFlag::Mid => {
                if self.state == State::GotHigh {
                    self.store(1, fragment);
                    self.state = State::GotMid;
                    FeedOutcome::Stored
                } else {
                    self.reset_misaligned()
                }
            }
            TribbleFlag::Low => {
                if self.state == State::GotMid {
                    self.store(2, fragment);
                    self.state = State::Idle;
                    FeedOutcome::Committed(self.data)
                } else {
                    self.reset_misaligned()
                }
            }
            TribbleFlag::New => {
                if self.state == State::Idle {
                    FeedOutcome::Ignored
                } else {
                    self.state = State::Idle;
                    FeedOutcome::Misaligned
                }
            }
        }
    }

    fn store(&mut self, idx: usize, fragment: &[u8]) {
        let off = idx * IMU_FRAGMENT_SIZE;
        self.data[off..off + IMU_FRAGMENT_SIZE].copy_from_slice(&fragment[..IMU_FRAGMENT_SIZE]);
    }

    fn reset_misaligned(&mut self) -> FeedOutcome {
        // A misaligned fragment while idle still counts: the board is mid
        // sequence from its point of view and the sample is unrecoverable.
        self.state = State::Idle;
        FeedOutcome::Misaligned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frag(fill: u8) -> [u8; IMU_FRAGMENT_SIZE] {
        [fill; IMU_FRAGMENT_SIZE]
    }

    #[test]
    fn high_mid_low_commits_once() {
        let mut asm = ImuAssembler::default();
        assert_eq!(asm.feed(TribbleFlag::High, &frag(0xAA)), FeedOutcome::Stored);
        assert_eq!(asm.feed(TribbleFlag::Mid, &frag(0xBB)), FeedOutcome::Stored);
        match asm.feed(TribbleFlag::Low, &frag(0xCC)) {
            FeedOutcome::Committed(data) => {
                assert_eq!(&data[..16], &frag(0xAA));
                assert_eq!(&data[16..32], &frag(0xBB));
                assert_eq!(&data[32..], &frag(0xCC));
            }
            other => panic!("expected commit, got {other:?}"),
        }
        // A stray LOW afterwards is misalignment, not a second commit.
        assert_eq!(
            asm.feed(TribbleFlag::Low, &frag(0xCC)),
            FeedOutcome::Misaligned
        );
    }

    #[test]
    fn every_wrong_order_commits_nothing() {
        use TribbleFlag::*;
        let orders = [
            [Mid, High, Low],
            [Low, Mid, High],
            [Mid, Low, High],
            [Low, High, Mid],
            [High, Low, Mid],
        ];
        for order in orders {
            let mut asm = ImuAssembler::default();
            let mut misaligned = 0;
            for flag in order {
                match asm.feed(flag, &frag(1)) {
                    FeedOutcome::Committed(_) => panic!("{order:?} must not commit"),
                    FeedOutcome::Misaligned => misaligned += 1,
                    _ => {}
                }
            }
            assert!(misaligned > 0, "{order:?} must count misalignment");
        }
    }

    #[test]
    fn high_restart_loses_partial_sample() {
        let mut asm = ImuAssembler::default();
        asm.feed(TribbleFlag::High, &frag(1));
        asm.feed(TribbleFlag::Mid, &frag(2));
        assert_eq!(
            asm.feed(TribbleFlag::High, &frag(3)),
            FeedOutcome::OverwrittenRestart
        );
        asm.feed(TribbleFlag::Mid, &frag(4));
        match asm.feed(TribbleFlag::Low, &frag(5)) {
            FeedOutcome::Committed(data) => assert_eq!(&data[..16], &frag(3)),
            other => panic!("expected commit, got {other:?}"),
        }
    }

    #[test]
    fn new_flag_aborts_partial_sequence() {
        let mut asm = ImuAssembler::default();
        assert_eq!(asm.feed(TribbleFlag::New, &frag(0)), FeedOutcome::Ignored);
        asm.feed(TribbleFlag::High, &frag(1));
        assert_eq!(asm.feed(TribbleFlag::New, &frag(0)), FeedOutcome::Misaligned);
        // After the abort the next full sequence works.
        asm.feed(TribbleFlag::High, &frag(6));
        asm.feed(TribbleFlag::Mid, &frag(7));
        assert!(matches!(
            asm.feed(TribbleFlag::Low, &frag(8)),
            FeedOutcome::Committed(_)
        ));
    }
}
