use crate::error::Result;
use anyhow::bail;
use std::fmt::Display;

/// An alignment. Always a power of two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, PartialOrd, Ord)]
pub struct Alignment {
    pub(crate) exponent: u8,
}

/// The minimum alignment that we support.
pub(crate) const MIN: Alignment = Alignment { exponent: 0 };

/// The maximum alignment that we support.
pub(crate) const MAX: Alignment = Alignment { exponent: 20 };

impl Alignment {
    pub fn new(raw: u64) -> Result<Self> {
        if !raw.is_power_of_two() {
            bail!("Invalid alignment 0x{raw:x}");
        }
        let exponent = raw.trailing_zeros();
        if exponent > u32::from(MAX.exponent) {
            bail!("Unsupported alignment 0x{raw:x}");
        }
        Ok(Alignment {
            exponent: exponent as u8,
        })
    }

    pub fn value(self) -> u64 {
        1 << self.exponent
    }

    pub(crate) fn mask(self) -> u64 {
        self.value() - 1
    }

    pub(crate) fn align_up(self, value: u64) -> u64 {
        value.next_multiple_of(self.value())
    }

    /// Returns the smallest value that is >= `align_up(offset)` and congruent to `ref_offset`
    /// modulo this alignment. Used to place loadable segments so that `p_vaddr` and `p_offset`
    /// agree modulo the page size.
    pub(crate) fn align_modulo(self, ref_offset: u64, offset: u64) -> u64 {
        self.align_up(offset) + (ref_offset & self.mask())
    }
}

impl Display for Alignment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.value(), f)
    }
}

#[test]
fn test_align_up() {
    assert_eq!(Alignment::new(8).unwrap().align_up(0), 0);
    assert_eq!(Alignment::new(8).unwrap().align_up(1), 8);
    assert_eq!(Alignment::new(8).unwrap().align_up(8), 8);
    assert_eq!(Alignment::new(8).unwrap().align_up(17), 24);
}

#[test]
fn test_align_modulo() {
    const PAGE: Alignment = Alignment { exponent: 12 };
    assert_eq!(PAGE.align_modulo(0x123456, 0x987456), 0x988456);
    assert_eq!(PAGE.align_modulo(0x123456, 0x987000), 0x987456);
    assert_eq!(PAGE.align_modulo(0x0, 0x400000), 0x400000);
    assert_eq!(PAGE.align_modulo(0x2afce, 0x42af7e), 0x42bfce);
}

#[test]
fn test_rejects_non_power_of_two() {
    assert!(Alignment::new(0).is_err());
    assert!(Alignment::new(3).is_err());
    assert!(Alignment::new(4096).is_ok());
}
