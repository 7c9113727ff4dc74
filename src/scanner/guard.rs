//! Memory headroom reserved for the fatal-error path.
//!
//! A program that dies from memory exhaustion leaves no room for the code
//! that has to report it. The guard buffer keeps a block allocated during
//! normal operation and frees it only while the scanner is working, so the
//! scanner always finds some headroom.

/// Default reservation: 64 KiB.
pub const DEFAULT_GUARD_BYTES: usize = 64 * 1024;

/// A block of memory held whenever scanner code is not running.
#[derive(Debug)]
pub struct GuardBuffer {
    size: usize,
    reserve: Option<Box<[u8]>>,
}

impl Default for GuardBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_GUARD_BYTES)
    }
}

impl GuardBuffer {
    /// Creates the buffer and reserves `size` bytes immediately.
    pub fn new(size: usize) -> Self {
        let mut guard = Self {
            size,
            reserve: None,
        };
        guard.reacquire();
        guard
    }

    /// Configured reservation size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns true while the reservation is held.
    pub fn is_reserved(&self) -> bool {
        self.reserve.is_some()
    }

    /// Bytes currently held.
    pub fn reserved_bytes(&self) -> usize {
        self.reserve.as_ref().map_or(0, |r| r.len())
    }

    /// Frees the reservation until the returned guard is dropped.
    ///
    /// Reacquisition happens in `Drop`, so it runs on every exit path,
    /// including unwinding out of a panicking dispatch.
    pub fn release(&mut self) -> Headroom<'_> {
        self.reserve = None;
        Headroom { guard: self }
    }

    fn reacquire(&mut self) {
        if self.reserve.is_none() && self.size > 0 {
            // Filled rather than zeroed so the pages are actually committed.
            self.reserve = Some(vec![b'x'; self.size].into_boxed_slice());
        }
    }
}

/// Scope during which the guard buffer is released.
#[derive(Debug)]
pub struct Headroom<'a> {
    guard: &'a mut GuardBuffer,
}

impl Headroom<'_> {
    /// Returns true if the reservation is currently freed (always, inside the scope).
    pub fn is_released(&self) -> bool {
        !self.guard.is_reserved()
    }
}

impl Drop for Headroom<'_> {
    fn drop(&mut self) {
        self.guard.reacquire();
    }
}
