//! Generalized file operations reported by every backend.

use std::fmt;

use bitflags::bitflags;

bitflags! {
    /// A set of file operations.
    ///
    /// This is a bitmask because some backends report several operations in a
    /// single notification. Use [`Op::has`] rather than `==` to test for an
    /// operation; a backend may set bits the caller did not ask about.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Op: u32 {
        /// A new path was created.
        const CREATE = 1;

        /// The file was written to.
        const WRITE = 1 << 1;

        /// The path was removed.
        const REMOVE = 1 << 2;

        /// The path was renamed to something else.
        const RENAME = 1 << 3;

        /// File attributes were changed.
        const CHMOD = 1 << 4;
    }
}

/// Rendering order, independent of the bit layout.
const CANONICAL_ORDER: [(Op, &str); 5] = [
    (Op::CREATE, "CREATE"),
    (Op::REMOVE, "REMOVE"),
    (Op::WRITE, "WRITE"),
    (Op::RENAME, "RENAME"),
    (Op::CHMOD, "CHMOD"),
];

impl Op {
    /// Reports whether every bit of `op` is set in this mask.
    pub fn has(self, op: Op) -> bool {
        self.contains(op)
    }
}

impl From<u32> for Op {
    /// Builds a mask from raw backend bits, keeping bits this crate does not name.
    fn from(bits: u32) -> Self {
        Self::from_bits_retain(bits)
    }
}

impl fmt::Display for Op {
    /// Formats as `CREATE|WRITE|...`, or the empty string for an empty mask.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (flag, name) in CANONICAL_ORDER {
            if !self.has(flag) {
                continue;
            }
            if !first {
                f.write_str("|")?;
            }
            f.write_str(name)?;
            first = false;
        }
        Ok(())
    }
}
