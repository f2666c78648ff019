//! Submission-gated object recycling.
//!
//! GPU objects (fences, semaphores, command buffers, descriptor pool pages)
//! can only be reused once the GPU has finished the submission that last
//! referenced them. [`Recycler<T>`] keeps a free list plus a queue of items
//! tagged with the submission number that retires them:
//!
//! ```text
//!   acquire()            retire(submission, item)        reclaim(completed)
//!  ┌──────────┐  take   ┌──────────┐  push_back         ┌───────────────────┐
//!  │ free     │ ──────► │ in use   │ ─────────────────► │ in flight (FIFO)  │
//!  └──────────┘         └──────────┘                    └───────────────────┘
//!        ▲                                                        │
//!        └────────── submission <= completed, oldest first ───────┘
//! ```
//!
//! # Example
//!
//! ```
//! use xegpu_core::pool::Recycler;
//!
//! let mut fences = Recycler::new();
//! fences.push_free("fence-a");
//!
//! let fence = fences.acquire().unwrap();
//! fences.retire(1, fence);
//! assert!(fences.acquire().is_none());
//!
//! fences.reclaim(1);
//! assert_eq!(fences.acquire(), Some("fence-a"));
//! ```

use std::collections::VecDeque;

/// Free list plus a submission-ordered in-flight queue.
///
/// Items in flight are kept sorted by submission number, so reclamation only
/// ever inspects the front of the queue.
#[derive(Debug)]
pub struct Recycler<T> {
    free: Vec<T>,
    in_flight: VecDeque<(u64, T)>,
}

impl<T> Default for Recycler<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Recycler<T> {
    /// Create an empty recycler.
    pub fn new() -> Self {
        Self {
            free: Vec::new(),
            in_flight: VecDeque::new(),
        }
    }

    /// Take an item from the free list, if any.
    pub fn acquire(&mut self) -> Option<T> {
        self.free.pop()
    }

    /// Peek at the item [`acquire`](Self::acquire) would return next.
    pub fn peek_free(&self) -> Option<&T> {
        self.free.last()
    }

    /// Return an item that the GPU no longer references.
    pub fn push_free(&mut self, item: T) {
        self.free.push(item);
    }

    /// Hand an item to the GPU until `submission` completes.
    pub fn retire(&mut self, submission: u64, item: T) {
        match self.in_flight.back() {
            Some(&(last, _)) if last > submission => {
                log::warn!(
                    "Recycler: out-of-order retirement ({} after {}), inserting sorted",
                    submission,
                    last
                );
                let index = self.in_flight.partition_point(|(s, _)| *s <= submission);
                self.in_flight.insert(index, (submission, item));
            }
            _ => self.in_flight.push_back((submission, item)),
        }
    }

    /// Move every item whose submission is `<= completed` back to the free list.
    ///
    /// Returns the number of reclaimed items.
    pub fn reclaim(&mut self, completed: u64) -> usize {
        self.reclaim_with(completed, |_| {})
    }

    /// Like [`reclaim`](Self::reclaim), running `reset` on each item before it
    /// becomes free again.
    pub fn reclaim_with(&mut self, completed: u64, mut reset: impl FnMut(&mut T)) -> usize {
        let mut reclaimed = 0;
        while let Some(&(submission, _)) = self.in_flight.front() {
            if submission > completed {
                break;
            }
            if let Some((_, mut item)) = self.in_flight.pop_front() {
                reset(&mut item);
                self.free.push(item);
                reclaimed += 1;
            }
        }
        reclaimed
    }

    /// Submission number of the oldest item still in flight.
    pub fn oldest_in_flight(&self) -> Option<u64> {
        self.in_flight.front().map(|(s, _)| *s)
    }

    /// Iterate over in-flight items, oldest first.
    pub fn in_flight(&self) -> impl Iterator<Item = (u64, &T)> {
        self.in_flight.iter().map(|(s, item)| (*s, item))
    }

    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Remove every item, free and in flight, for destruction.
    ///
    /// Only valid once the GPU is idle.
    pub fn drain_all(&mut self) -> Vec<T> {
        let mut items: Vec<T> = self.free.drain(..).collect();
        items.extend(self.in_flight.drain(..).map(|(_, item)| item));
        items
    }
}
