//! Machine addresses inside the managed heap.
//!
//! Addresses are plain integers. Every heap object starts at an address that is a
//! multiple of [`OBJECT_ALIGNMENT`], which leaves the low bits free for the tag
//! scheme used by [`Tagged`](crate::Tagged).

use std::fmt;
use std::ops::{Add, Sub};

/// Alignment of every heap object and every tagged field, in bytes.
pub const OBJECT_ALIGNMENT: usize = 8;

/// Size of one tagged field, in bytes.
pub const TAGGED_SIZE: usize = 8;

/// An address in the managed heap.
///
/// `Address::NULL` never refers to an object; page 0 of the address space is
/// never handed out.
///
/// # Examples
///
/// ```
/// use core_types::Address;
///
/// let a = Address::new(0x4_0100);
/// assert_eq!(a.offset(16), Address::new(0x4_0110));
/// assert!(a.is_aligned());
/// assert!(Address::NULL.is_null());
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(usize);

impl Address {
    /// The null address.
    pub const NULL: Address = Address(0);

    /// Wraps a raw address value.
    pub const fn new(raw: usize) -> Self {
        Address(raw)
    }

    /// Returns the raw address value.
    pub const fn raw(self) -> usize {
        self.0
    }

    /// Returns true for the null address.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Returns this address advanced by `bytes`.
    pub const fn offset(self, bytes: usize) -> Self {
        Address(self.0 + bytes)
    }

    /// Returns true if the address is object-aligned.
    pub const fn is_aligned(self) -> bool {
        self.0 % OBJECT_ALIGNMENT == 0
    }

    /// Rounds `size` up to the object alignment.
    pub const fn align_size(size: usize) -> usize {
        (size + OBJECT_ALIGNMENT - 1) & !(OBJECT_ALIGNMENT - 1)
    }
}

impl Add<usize> for Address {
    type Output = Address;

    fn add(self, rhs: usize) -> Address {
        Address(self.0 + rhs)
    }
}

impl Sub<Address> for Address {
    type Output = isize;

    /// Signed distance between two addresses.
    fn sub(self, rhs: Address) -> isize {
        self.0 as isize - rhs.0 as isize
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
