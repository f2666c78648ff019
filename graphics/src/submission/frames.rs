//! Frame counters and the ring of frame-closing submissions.

/// Frames that may be queued on the GPU before the host blocks.
pub const MAX_FRAMES_IN_FLIGHT: usize = 3;

/// Frame bookkeeping.
///
/// `closed_frame_submissions[frame % MAX_FRAMES_IN_FLIGHT]` holds the number
/// of the submission that closed `frame`, so opening frame `n` must first
/// await the submission that closed frame `n - MAX_FRAMES_IN_FLIGHT`.
#[derive(Debug, Clone)]
pub struct FrameRing {
    frame_current: u64,
    frame_completed: u64,
    frame_open: bool,
    closed_frame_submissions: [u64; MAX_FRAMES_IN_FLIGHT],
}

impl Default for FrameRing {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameRing {
    pub fn new() -> Self {
        Self {
            frame_current: 1,
            frame_completed: 0,
            frame_open: false,
            closed_frame_submissions: [0; MAX_FRAMES_IN_FLIGHT],
        }
    }

    pub fn current(&self) -> u64 {
        self.frame_current
    }

    pub fn completed(&self) -> u64 {
        self.frame_completed
    }

    pub fn is_open(&self) -> bool {
        self.frame_open
    }

    fn slot(frame: u64) -> usize {
        (frame % MAX_FRAMES_IN_FLIGHT as u64) as usize
    }

    /// Submission that must complete before the current frame may open.
    pub fn submission_to_await(&self) -> u64 {
        self.closed_frame_submissions[Self::slot(self.frame_current)]
    }

    /// Recompute the completed frame from the completed submission.
    ///
    /// Frames more than `MAX_FRAMES_IN_FLIGHT` behind the current one were
    /// awaited when a later frame opened, so only the ring needs checking.
    pub fn update_completed(&mut self, completed_submission: u64) {
        let awaited = MAX_FRAMES_IN_FLIGHT as u64 + 1;
        let mut frame_completed = self.frame_current.saturating_sub(awaited);
        for frame in frame_completed + 1..self.frame_current {
            if self.closed_frame_submissions[Self::slot(frame)] > completed_submission {
                break;
            }
            frame_completed = frame;
        }
        self.frame_completed = self.frame_completed.max(frame_completed);
    }

    pub fn open(&mut self) {
        self.frame_open = true;
    }

    /// Close the current frame, which ended with `closing_submission`.
    pub fn close(&mut self, closing_submission: u64) {
        self.closed_frame_submissions[Self::slot(self.frame_current)] = closing_submission;
        self.frame_current += 1;
        self.frame_open = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_frames_await_nothing() {
        let mut ring = FrameRing::new();
        for submission in 1..=3 {
            assert_eq!(ring.submission_to_await(), 0);
            ring.open();
            ring.close(submission);
        }
        assert_eq!(ring.current(), 4);
        assert_eq!(ring.submission_to_await(), 1);
    }

    #[test]
    fn test_completed_frame_follows_completed_submission() {
        let mut ring = FrameRing::new();
        for submission in [2, 4, 6] {
            ring.open();
            ring.close(submission);
        }
        ring.update_completed(3);
        assert_eq!(ring.completed(), 1);
        ring.update_completed(6);
        assert_eq!(ring.completed(), 3);
    }

    #[test]
    fn test_completed_frame_never_decreases() {
        let mut ring = FrameRing::new();
        ring.open();
        ring.close(1);
        ring.update_completed(1);
        assert_eq!(ring.completed(), 1);
        ring.update_completed(0);
        assert_eq!(ring.completed(), 1);
    }

    #[test]
    fn test_unawaited_frames_are_not_completed() {
        let mut ring = FrameRing::new();
        for submission in 1..=3 {
            ring.open();
            ring.close(submission);
        }
        ring.update_completed(0);
        assert_eq!(ring.completed(), 0);
    }
}
