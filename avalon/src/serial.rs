//! Submission serials.
//!
//! A **serial** identifies a batch of commands submitted to the device queue.
//! Serial 0 is considered invalid, so the first submitted batch carries serial 1,
//! and serials increase monotonically with submission order.
//!
//! The device timeline signals serials as batches finish executing. Completion
//! is monotone: once a serial has completed it stays completed, and completion
//! of serial S implies completion of every serial below S. Because of this,
//! every reuse decision in this crate reduces to comparing the serial stamped
//! on a resource against the last completed serial, which is a non-blocking
//! read.

use std::fmt;

/// Identifies a submitted batch of commands.
///
/// See the module-level documentation for more information.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
#[repr(transparent)]
pub struct Serial(u64);

impl Serial {
    /// The invalid serial. No batch carries it, and it never counts as in use.
    pub const fn invalid() -> Serial {
        Serial(0)
    }

    pub const fn from_raw(raw: u64) -> Serial {
        Serial(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Whether this serial identifies an actual batch.
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Debug for Serial {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
