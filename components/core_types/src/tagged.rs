//! Tagged heap words.
//!
//! Every field of a heap object, every root slot and every header word is a single
//! 64-bit [`Tagged`] word. The low two bits select what the word holds:
//!
//! | bits | meaning                                   |
//! |------|-------------------------------------------|
//! | `00` | small integer (Smi), payload `>> 2`      |
//! | `01` | strong reference to a heap object         |
//! | `11` | weak reference; the bare tag is *cleared* |
//! | `10` | oddball sentinel (`undefined`, hole, ...) |
//!
//! Because objects are [`OBJECT_ALIGNMENT`](crate::OBJECT_ALIGNMENT)-aligned the
//! address of a reference is recovered by masking the tag away.

use crate::Address;
use std::fmt;

const TAG_MASK: u64 = 0b11;
const SMI_TAG: u64 = 0b00;
const STRONG_TAG: u64 = 0b01;
const ODDBALL_TAG: u64 = 0b10;
const WEAK_TAG: u64 = 0b11;

/// Immortal sentinel values that are not heap objects.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Oddball {
    /// The `undefined` value; also the value of an empty or severed field.
    Undefined = 0,
    /// Marks a removed entry inside a table.
    TheHole = 1,
    /// Function data of a SharedFunctionInfo whose bytecode was flushed.
    Uncompiled = 2,
    /// Code entry of a function that must be compiled lazily on next call.
    LazyCompile = 3,
}

impl Oddball {
    fn from_index(index: u64) -> Option<Oddball> {
        match index {
            0 => Some(Oddball::Undefined),
            1 => Some(Oddball::TheHole),
            2 => Some(Oddball::Uncompiled),
            3 => Some(Oddball::LazyCompile),
            _ => None,
        }
    }
}

/// One tagged heap word.
///
/// # Examples
///
/// ```
/// use core_types::{Address, Tagged};
///
/// let target = Address::new(0x8_0100);
/// let strong = Tagged::strong(target);
/// let weak = strong.to_weak();
///
/// assert_eq!(strong.strong_ref(), Some(target));
/// assert_eq!(weak.weak_ref(), Some(target));
/// assert_eq!(weak.heap_object(), Some(target));
/// assert!(Tagged::CLEARED.is_cleared());
/// assert_eq!(Tagged::smi(-7).to_smi(), Some(-7));
/// ```
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tagged(u64);

impl Tagged {
    /// A weak reference whose target died.
    pub const CLEARED: Tagged = Tagged(WEAK_TAG);
    /// The `undefined` oddball.
    pub const UNDEFINED: Tagged = Tagged::oddball(Oddball::Undefined);
    /// The hole oddball.
    pub const HOLE: Tagged = Tagged::oddball(Oddball::TheHole);

    /// Reinterprets a raw word.
    pub const fn from_raw(raw: u64) -> Self {
        Tagged(raw)
    }

    /// Returns the raw word.
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Encodes a small integer. The top two bits of `value` are lost.
    pub const fn smi(value: i64) -> Self {
        Tagged((value as u64).wrapping_shl(2) | SMI_TAG)
    }

    /// Encodes an oddball sentinel.
    pub const fn oddball(value: Oddball) -> Self {
        Tagged(((value as u64) << 2) | ODDBALL_TAG)
    }

    /// Encodes a strong reference to the object at `address`.
    pub fn strong(address: Address) -> Self {
        debug_assert!(address.is_aligned() && !address.is_null());
        Tagged(address.raw() as u64 | STRONG_TAG)
    }

    /// Encodes a weak reference to the object at `address`.
    pub fn weak(address: Address) -> Self {
        debug_assert!(address.is_aligned() && !address.is_null());
        Tagged(address.raw() as u64 | WEAK_TAG)
    }

    fn tag(self) -> u64 {
        self.0 & TAG_MASK
    }

    fn address_bits(self) -> Address {
        Address::new((self.0 & !TAG_MASK) as usize)
    }

    /// Returns true for small integers.
    pub fn is_smi(self) -> bool {
        self.tag() == SMI_TAG
    }

    /// Decodes a small integer.
    pub fn to_smi(self) -> Option<i64> {
        if self.is_smi() {
            Some((self.0 as i64) >> 2)
        } else {
            None
        }
    }

    /// Returns true for oddball sentinels.
    pub fn is_oddball(self) -> bool {
        self.tag() == ODDBALL_TAG
    }

    /// Decodes an oddball sentinel.
    pub fn as_oddball(self) -> Option<Oddball> {
        if self.is_oddball() {
            Oddball::from_index(self.0 >> 2)
        } else {
            None
        }
    }

    /// Returns true for `undefined`.
    pub fn is_undefined(self) -> bool {
        self == Tagged::UNDEFINED
    }

    /// Returns true for a strong reference.
    pub fn is_strong(self) -> bool {
        self.tag() == STRONG_TAG
    }

    /// Returns true for a live (not cleared) weak reference.
    pub fn is_weak(self) -> bool {
        self.tag() == WEAK_TAG && self.0 != WEAK_TAG
    }

    /// Returns true for the cleared weak sentinel.
    pub fn is_cleared(self) -> bool {
        self.0 == WEAK_TAG
    }

    /// The referenced address for strong or (uncleared) weak references.
    pub fn heap_object(self) -> Option<Address> {
        if self.is_strong() || self.is_weak() {
            Some(self.address_bits())
        } else {
            None
        }
    }

    /// The referenced address if this is a strong reference.
    pub fn strong_ref(self) -> Option<Address> {
        if self.is_strong() {
            Some(self.address_bits())
        } else {
            None
        }
    }

    /// The referenced address if this is an uncleared weak reference.
    pub fn weak_ref(self) -> Option<Address> {
        if self.is_weak() {
            Some(self.address_bits())
        } else {
            None
        }
    }

    /// Same reference strength, different target. Non-references are returned as is.
    pub fn with_address(self, address: Address) -> Self {
        if self.is_strong() {
            Tagged::strong(address)
        } else if self.is_weak() {
            Tagged::weak(address)
        } else {
            self
        }
    }

    /// Weak version of a strong reference. Non-references are returned as is.
    pub fn to_weak(self) -> Self {
        match self.strong_ref() {
            Some(address) => Tagged::weak(address),
            None => self,
        }
    }

    /// Strong version of a weak reference. Non-references are returned as is.
    pub fn to_strong(self) -> Self {
        match self.weak_ref() {
            Some(address) => Tagged::strong(address),
            None => self,
        }
    }
}

impl Default for Tagged {
    fn default() -> Self {
        Tagged::UNDEFINED
    }
}

impl fmt::Debug for Tagged {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(value) = self.to_smi() {
            f.debug_tuple("Smi").field(&value).finish()
        } else if let Some(address) = self.strong_ref() {
            f.debug_tuple("Strong").field(&address).finish()
        } else if let Some(address) = self.weak_ref() {
            f.debug_tuple("Weak").field(&address).finish()
        } else if self.is_cleared() {
            write!(f, "Cleared")
        } else if let Some(oddball) = self.as_oddball() {
            write!(f, "{:?}", oddball)
        } else {
            write!(f, "Tagged({:#x})", self.0)
        }
    }
}
