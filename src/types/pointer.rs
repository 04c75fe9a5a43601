use std::fmt;

use super::PageNo;

/// Packed record address: page number in the high 32 bits, slot id in the
/// next 16 and an optional caller-defined type tag in the low 16.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Pointer(u64);

impl Pointer {
    /// Builds an untagged pointer.
    pub const fn new(page: PageNo, slot: u16) -> Self {
        Pointer(((page.0 as u64) << 32) | ((slot as u64) << 16))
    }

    /// Returns the same address carrying `tag`.
    pub const fn with_tag(self, tag: u16) -> Self {
        Pointer((self.0 & !0xFFFF) | tag as u64)
    }

    /// Page component.
    pub const fn page(self) -> PageNo {
        PageNo((self.0 >> 32) as u32)
    }

    /// Slot component.
    pub const fn slot(self) -> u16 {
        ((self.0 >> 16) & 0xFFFF) as u16
    }

    /// Type tag, zero when untagged.
    pub const fn tag(self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }

    /// Splits the pointer into its address fields.
    pub const fn decode(self) -> (PageNo, u16) {
        (self.page(), self.slot())
    }

    /// The address with the tag cleared, used to compare locations.
    pub const fn address(self) -> Pointer {
        Pointer(self.0 & !0xFFFF)
    }

    /// Raw 64-bit form, as stored by index collaborators.
    pub const fn to_u64(self) -> u64 {
        self.0
    }

    /// Rebuilds a pointer from its raw 64-bit form.
    pub const fn from_u64(raw: u64) -> Self {
        Pointer(raw)
    }
}

impl fmt::Display for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.page(), self.slot())?;
        if self.tag() != 0 {
            write!(f, "#{}", self.tag())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_survive_packing() {
        let ptr = Pointer::new(PageNo(0x0012_3456), 0xBEEF);
        assert_eq!(ptr.decode(), (PageNo(0x0012_3456), 0xBEEF));
        assert_eq!(ptr.tag(), 0);
        assert_eq!(Pointer::from_u64(ptr.to_u64()), ptr);
    }

    #[test]
    fn tag_does_not_disturb_address() {
        let ptr = Pointer::new(PageNo(u32::MAX), u16::MAX).with_tag(7);
        assert_eq!(ptr.page(), PageNo(u32::MAX));
        assert_eq!(ptr.slot(), u16::MAX);
        assert_eq!(ptr.tag(), 7);
        assert_eq!(ptr.address(), Pointer::new(PageNo(u32::MAX), u16::MAX));
        assert_eq!(ptr.to_string(), format!("{}:{}#7", u32::MAX, u16::MAX));
    }
}
