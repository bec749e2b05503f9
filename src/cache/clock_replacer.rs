pub(super) type FrameId = usize;

/// ClockReplacer picks which frame of a fixed-size cache gets refilled next.
/// Empty frames are handed out first; after that the clock hand sweeps the
/// frames and takes the first one not referenced since the last sweep.
pub(super) struct ClockReplacer {
    clock_hand: FrameId,
    occupied: Vec<bool>,
    ref_bits: Vec<bool>,
    free_frames: Vec<FrameId>,
}

impl ClockReplacer {
    /// Construct a new ClockReplacer for a cache with `frames` frames
    pub fn new(frames: usize) -> Self {
        Self {
            clock_hand: 0,
            occupied: vec![false; frames],
            ref_bits: vec![false; frames],
            free_frames: (0..frames).rev().collect(),
        }
    }

    /// The frame was read
    pub fn touch(&mut self, frame: FrameId) {
        self.ref_bits[frame] = true;
    }

    /// The frame was emptied and can be reused right away
    pub fn release(&mut self, frame: FrameId) {
        if self.occupied[frame] {
            self.occupied[frame] = false;
            self.ref_bits[frame] = false;
            self.free_frames.push(frame);
        }
    }

    /// Returns the frame to fill next, None if the cache has no frames at all
    pub fn claim(&mut self) -> Option<FrameId> {
        if self.occupied.is_empty() {
            return None;
        }
        let frame = match self.free_frames.pop() {
            Some(frame) => frame,
            None => loop {
                let frame = self.clock_hand;
                self.clock_hand = (self.clock_hand + 1) % self.occupied.len();
                if self.ref_bits[frame] {
                    self.ref_bits[frame] = false;
                } else {
                    break frame;
                }
            },
        };
        self.occupied[frame] = true;
        self.ref_bits[frame] = true;
        Some(frame)
    }
}

#[cfg(test)]
mod tests {

    use super::ClockReplacer;

    #[test]
    fn hands_out_empty_frames_first() {
        let mut clock_replacer = ClockReplacer::new(3);
        assert_eq!(clock_replacer.claim(), Some(0));
        assert_eq!(clock_replacer.claim(), Some(1));
        clock_replacer.release(0);
        assert_eq!(clock_replacer.claim(), Some(0));
        assert_eq!(clock_replacer.claim(), Some(2));

        // every frame was just filled, so one full sweep clears all ref bits
        assert_eq!(clock_replacer.claim(), Some(0));
    }

    #[test]
    fn recently_touched_frames_survive() {
        let mut clock_replacer = ClockReplacer::new(3);
        for _ in 0..3 {
            clock_replacer.claim();
        }
        assert_eq!(clock_replacer.claim(), Some(0));
        clock_replacer.touch(1);
        clock_replacer.touch(0);

        // the hand passes frame 1 and spends its touch before taking frame 2
        assert_eq!(clock_replacer.claim(), Some(2));
        // frame 0 still holds its touch, frame 1 does not
        assert_eq!(clock_replacer.claim(), Some(1));
        assert_eq!(clock_replacer.claim(), Some(0));
    }

    #[test]
    fn zero_frames_never_claim() {
        let mut clock_replacer = ClockReplacer::new(0);
        assert!(clock_replacer.claim().is_none());
    }
}
