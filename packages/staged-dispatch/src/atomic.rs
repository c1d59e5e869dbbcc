//! Lock-free flag and counter cells with explicit memory ordering.
//!
//! The dispatcher's run state is a single [`AtomicFlag`]; its statistics are
//! [`AtomicCounter`]s. Both expose every ordering the dispatcher needs as a
//! named method, so call sites say which barrier they rely on instead of
//! passing `Ordering` values around.
//!
//! | Access            | Read               | Write               |
//! |-------------------|--------------------|---------------------|
//! | Unfenced          | `load`             | `store`             |
//! | Acquire / Release | `load_acquire`     | `store_release`     |
//! | Full fence        | `load_fenced`      | `store_fenced`      |
//! | Compiler only     | `load_compiler_fenced` | `store_compiler_fenced` |
//!
//! Read-modify-write operations (`compare_and_swap`, `exchange`, `add`) are
//! always `AcqRel` on success.
//!
//! # Encoding
//!
//! A flag is stored as a byte: `0` is `false`, `1` is `true`. Any other byte is
//! an invariant violation. [`AtomicFlag::from_raw`] rejects it up front and
//! reads panic if one is ever observed.

use std::fmt;
use std::sync::atomic::{compiler_fence, fence, AtomicI64, AtomicU8, Ordering};

use crate::error::FlagError;

const FALSE: u8 = 0;
const TRUE: u8 = 1;

#[inline]
fn encode(value: bool) -> u8 {
    if value {
        TRUE
    } else {
        FALSE
    }
}

#[inline]
fn decode(raw: u8) -> bool {
    match raw {
        FALSE => false,
        TRUE => true,
        other => panic!("atomic flag holds non-canonical encoding {other:#04x}"),
    }
}

// =============================================================================
// Atomic Flag
// =============================================================================

/// A boolean cell updated without locks.
#[derive(Default)]
pub struct AtomicFlag {
    cell: AtomicU8,
}

impl AtomicFlag {
    /// Create a flag holding `value`.
    pub const fn new(value: bool) -> Self {
        Self {
            cell: AtomicU8::new(if value { TRUE } else { FALSE }),
        }
    }

    /// Create a flag from its raw byte encoding.
    ///
    /// Returns [`FlagError::NonCanonical`] unless `raw` is `0` or `1`.
    pub fn from_raw(raw: u8) -> Result<Self, FlagError> {
        match raw {
            FALSE | TRUE => Ok(Self {
                cell: AtomicU8::new(raw),
            }),
            other => Err(FlagError::NonCanonical { raw: other }),
        }
    }

    /// Unfenced read for uncontended fast paths.
    #[inline]
    pub fn load(&self) -> bool {
        decode(self.cell.load(Ordering::Relaxed))
    }

    /// Unfenced write.
    #[inline]
    pub fn store(&self, value: bool) {
        self.cell.store(encode(value), Ordering::Relaxed);
    }

    /// Read with acquire semantics.
    #[inline]
    pub fn load_acquire(&self) -> bool {
        decode(self.cell.load(Ordering::Acquire))
    }

    /// Write with release semantics.
    #[inline]
    pub fn store_release(&self, value: bool) {
        self.cell.store(encode(value), Ordering::Release);
    }

    /// Read behind a full memory barrier.
    #[inline]
    pub fn load_fenced(&self) -> bool {
        fence(Ordering::SeqCst);
        decode(self.cell.load(Ordering::SeqCst))
    }

    /// Write followed by a full memory barrier.
    #[inline]
    pub fn store_fenced(&self, value: bool) {
        self.cell.store(encode(value), Ordering::SeqCst);
        fence(Ordering::SeqCst);
    }

    /// Read that the compiler may not reorder, without a hardware barrier.
    #[inline]
    pub fn load_compiler_fenced(&self) -> bool {
        compiler_fence(Ordering::SeqCst);
        let raw = self.cell.load(Ordering::Relaxed);
        compiler_fence(Ordering::SeqCst);
        decode(raw)
    }

    /// Write that the compiler may not reorder, without a hardware barrier.
    #[inline]
    pub fn store_compiler_fenced(&self, value: bool) {
        compiler_fence(Ordering::SeqCst);
        self.cell.store(encode(value), Ordering::Relaxed);
        compiler_fence(Ordering::SeqCst);
    }

    /// Set the flag to `new` if it currently holds `expected`.
    ///
    /// Returns `true` if the swap happened.
    #[inline]
    pub fn compare_and_swap(&self, new: bool, expected: bool) -> bool {
        self.cell
            .compare_exchange(
                encode(expected),
                encode(new),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Replace the value, returning the previous one.
    #[inline]
    pub fn exchange(&self, new: bool) -> bool {
        decode(self.cell.swap(encode(new), Ordering::AcqRel))
    }
}

impl fmt::Debug for AtomicFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AtomicFlag").field(&self.load_acquire()).finish()
    }
}

// =============================================================================
// Atomic Counter
// =============================================================================

/// A signed 64-bit counter updated without locks.
///
/// Arithmetic wraps on overflow, matching the underlying hardware add.
#[derive(Default)]
pub struct AtomicCounter {
    cell: AtomicI64,
}

impl AtomicCounter {
    /// Create a counter holding `value`.
    pub const fn new(value: i64) -> Self {
        Self {
            cell: AtomicI64::new(value),
        }
    }

    #[inline]
    pub fn load(&self) -> i64 {
        self.cell.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn store(&self, value: i64) {
        self.cell.store(value, Ordering::Relaxed);
    }

    #[inline]
    pub fn load_acquire(&self) -> i64 {
        self.cell.load(Ordering::Acquire)
    }

    #[inline]
    pub fn store_release(&self, value: i64) {
        self.cell.store(value, Ordering::Release);
    }

    #[inline]
    pub fn load_fenced(&self) -> i64 {
        fence(Ordering::SeqCst);
        self.cell.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn store_fenced(&self, value: i64) {
        self.cell.store(value, Ordering::SeqCst);
        fence(Ordering::SeqCst);
    }

    #[inline]
    pub fn load_compiler_fenced(&self) -> i64 {
        compiler_fence(Ordering::SeqCst);
        let value = self.cell.load(Ordering::Relaxed);
        compiler_fence(Ordering::SeqCst);
        value
    }

    #[inline]
    pub fn store_compiler_fenced(&self, value: i64) {
        compiler_fence(Ordering::SeqCst);
        self.cell.store(value, Ordering::Relaxed);
        compiler_fence(Ordering::SeqCst);
    }

    /// Set the counter to `new` if it currently holds `expected`.
    ///
    /// Returns `true` if the swap happened.
    #[inline]
    pub fn compare_and_swap(&self, new: i64, expected: i64) -> bool {
        self.cell
            .compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Replace the value, returning the previous one.
    #[inline]
    pub fn exchange(&self, new: i64) -> i64 {
        self.cell.swap(new, Ordering::AcqRel)
    }

    /// Add `delta` and return the new value.
    #[inline]
    pub fn add(&self, delta: i64) -> i64 {
        self.cell
            .fetch_add(delta, Ordering::AcqRel)
            .wrapping_add(delta)
    }

    /// Add one and return the new value.
    #[inline]
    pub fn increment(&self) -> i64 {
        self.add(1)
    }

    /// Subtract one and return the new value.
    #[inline]
    pub fn decrement(&self) -> i64 {
        self.add(-1)
    }
}

impl fmt::Debug for AtomicCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AtomicCounter")
            .field(&self.load_acquire())
            .finish()
    }
}
