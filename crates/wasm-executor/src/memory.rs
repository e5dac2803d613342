//! Bounds-checked access to a guest's linear memory.
//!
//! An interface for handling guest memory access, implemented both for the
//! adapter itself (host-side supervision) and for the call context handed to
//! host-registered import functions, so that host callbacks can read the
//! arguments a guest passes by pointer.
//!
//! Out-of-bounds accesses are routine, frequent, expected outcomes on
//! adversarial guest pointers; they are signalled as `None`/`false` and
//! never as a panic or an error.
//!
//! ## Authors
//!
//! The Wasm Executor Development Team.
//!
//! ## Licensing and copyright notice
//!
//! See the `LICENSE.md` file in the repository root directory for
//! information on licensing and copyright.

use crate::value::{Word, WORD_SIZE};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// The fixed page size of guest linear memory: 64 KiB.
pub const WASM_PAGE_SIZE: u64 = 1 << 16;

/// Bounds-checked read/write access to a guest's linear memory.
///
/// The current memory size is re-read on every access; linear memory grows
/// monotonically at runtime and its backing storage may move on growth, so
/// no size or base address is ever cached across calls.
pub trait GuestMemory {
    /// The current size of the guest's linear memory in bytes: page count
    /// times the fixed page size, read fresh on each call.
    fn memory_size(&self) -> u64;

    /// Reads `length` bytes at guest address `pointer`.  Returns `None` if
    /// the range does not lie within the current memory size.
    fn read_memory(&self, pointer: u64, length: u64) -> Option<Vec<u8>>;

    /// Writes `data` at guest address `pointer`.  Either the full range fits
    /// and is written, or nothing is written and `false` is returned.
    fn write_memory(&mut self, pointer: u64, data: &[u8]) -> bool;

    /// Reads a 4-byte [`Word`] at guest address `pointer`.  Always reads
    /// exactly four little-endian bytes, regardless of the host's native
    /// pointer width.
    fn read_word(&self, pointer: u64) -> Option<Word> {
        let bytes = self.read_memory(pointer, WORD_SIZE as u64)?;
        let mut reader = Cursor::new(bytes);
        reader.read_u32::<LittleEndian>().ok().map(Word)
    }

    /// Writes a 4-byte [`Word`] at guest address `pointer`, subject to the
    /// same bounds rule as [`GuestMemory::write_memory`].
    fn write_word(&mut self, pointer: u64, word: Word) -> bool {
        let mut bytes = Vec::with_capacity(WORD_SIZE);
        if bytes.write_u32::<LittleEndian>(word.0).is_err() {
            return false;
        }
        self.write_memory(pointer, &bytes)
    }
}

/// Checks that `pointer + length` lies within `size` bytes of memory,
/// without overflowing the offset arithmetic.
#[inline]
pub(crate) fn range_in_bounds(pointer: u64, length: u64, size: u64) -> bool {
    match pointer.checked_add(length) {
        Some(end) => end <= size,
        None => false,
    }
}
