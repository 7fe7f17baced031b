//! Contract compliance tests for core_types
//!
//! These tests pin down the word encoding the collector relies on: tag
//! bits, the cleared sentinel and the oddballs.

use core_types::{Address, Oddball, Tagged, OBJECT_ALIGNMENT, TAGGED_SIZE};

#[cfg(test)]
mod address_contract_tests {
    use super::*;

    /// Contract: addresses are word aligned and words are 8 bytes
    #[test]
    fn contract_alignment_constants() {
        assert_eq!(OBJECT_ALIGNMENT, 8);
        assert_eq!(TAGGED_SIZE, 8);
        assert_eq!(Address::align_size(9), 16);
    }

    /// Contract: address arithmetic is byte based
    #[test]
    fn contract_address_arithmetic() {
        let base = Address::new(0x4_0100);
        assert_eq!(base + 16, Address::new(0x4_0110));
        assert_eq!(base.offset(8).raw(), 0x4_0108);
        assert_eq!(Address::new(0x4_0110) - base, 16);
        assert!(Address::NULL.is_null());
    }
}

#[cfg(test)]
mod tagged_contract_tests {
    use super::*;

    /// Contract: strong and weak references decode to the same target
    #[test]
    fn contract_reference_strength() {
        let target = Address::new(0x8_0200);
        let strong = Tagged::strong(target);
        let weak = Tagged::weak(target);
        assert!(strong.is_strong());
        assert!(weak.is_weak());
        assert_eq!(strong.strong_ref(), Some(target));
        assert_eq!(strong.weak_ref(), None);
        assert_eq!(weak.strong_ref(), None);
        assert_eq!(weak.heap_object(), Some(target));
        assert_eq!(strong.to_weak(), weak);
        assert_eq!(weak.to_strong(), strong);
    }

    /// Contract: the cleared sentinel is weak-tagged but references nothing
    #[test]
    fn contract_cleared_sentinel() {
        assert!(Tagged::CLEARED.is_cleared());
        assert!(!Tagged::CLEARED.is_weak());
        assert_eq!(Tagged::CLEARED.heap_object(), None);
        assert_eq!(Tagged::CLEARED.with_address(Address::new(0x8_0200)), Tagged::CLEARED);
    }

    /// Contract: retargeting keeps the reference strength
    #[test]
    fn contract_with_address_keeps_strength() {
        let old = Address::new(0x8_0200);
        let new = Address::new(0xC_0300);
        assert_eq!(Tagged::weak(old).with_address(new), Tagged::weak(new));
        assert_eq!(Tagged::strong(old).with_address(new), Tagged::strong(new));
        assert_eq!(Tagged::smi(3).with_address(new), Tagged::smi(3));
    }

    /// Contract: oddballs are not references
    #[test]
    fn contract_oddballs() {
        for oddball in [
            Oddball::Undefined,
            Oddball::TheHole,
            Oddball::Uncompiled,
            Oddball::LazyCompile,
        ] {
            let word = Tagged::oddball(oddball);
            assert_eq!(word.as_oddball(), Some(oddball));
            assert_eq!(word.heap_object(), None);
        }
        assert!(Tagged::UNDEFINED.is_undefined());
        assert_eq!(Tagged::HOLE.as_oddball(), Some(Oddball::TheHole));
        assert_eq!(Tagged::default(), Tagged::UNDEFINED);
    }

    /// Contract: small integers keep their sign
    #[test]
    fn contract_smi() {
        assert_eq!(Tagged::smi(-1).to_smi(), Some(-1));
        assert_eq!(Tagged::smi(1 << 40).to_smi(), Some(1 << 40));
        assert_eq!(Tagged::UNDEFINED.to_smi(), None);
    }
}
