//! Memory regions and address-space mappings.

use bitflags::bitflags;

use crate::error::{Result, SdfError};
use crate::store::Handle;

/// Smallest mappable unit on every supported architecture.
pub const PAGE_SIZE: u64 = 0x1000;

/// Handle to a [`MemoryRegion`] owned by a system description.
pub type MrHandle = Handle<MemoryRegion>;

/// A named block of addressable memory.
///
/// A region is either floating (the downstream toolchain picks a physical
/// placement) or pinned to a caller-supplied physical address. The engine
/// never checks pinned regions for overlap; that assertion stays with the
/// caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    name: String,
    size: u64,
    paddr: Option<u64>,
}

impl MemoryRegion {
    /// Creates a floating memory region.
    ///
    /// # Errors
    ///
    /// Returns [`SdfError::InvalidAddress`] if `size` is zero or not
    /// page-aligned.
    pub fn new(name: impl Into<String>, size: u64) -> Result<Self> {
        let name = name.into();
        check_region_size(&name, size)?;
        Ok(Self {
            name,
            size,
            paddr: None,
        })
    }

    /// Creates a memory region pinned to a fixed physical address.
    ///
    /// # Errors
    ///
    /// Returns [`SdfError::InvalidAddress`] if the size is invalid or the
    /// physical address is not page-aligned.
    pub fn new_physical(name: impl Into<String>, size: u64, paddr: u64) -> Result<Self> {
        let name = name.into();
        check_region_size(&name, size)?;
        if paddr % PAGE_SIZE != 0 {
            return Err(SdfError::InvalidAddress(format!(
                "physical address {paddr:#x} of region '{name}' is not page-aligned"
            )));
        }
        Ok(Self {
            name,
            size,
            paddr: Some(paddr),
        })
    }

    /// Region name, unique within a system.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Region size in bytes.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Fixed physical address, if the region is pinned.
    #[must_use]
    pub const fn paddr(&self) -> Option<u64> {
        self.paddr
    }
}

fn check_region_size(name: &str, size: u64) -> Result<()> {
    if size == 0 {
        return Err(SdfError::InvalidAddress(format!(
            "region '{name}' has zero size"
        )));
    }
    if size % PAGE_SIZE != 0 {
        return Err(SdfError::InvalidAddress(format!(
            "size {size:#x} of region '{name}' is not page-aligned"
        )));
    }
    Ok(())
}

bitflags! {
    /// Access permissions of one mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapPerms: u8 {
        const READ = 0b001;
        const WRITE = 0b010;
        const EXECUTE = 0b100;
    }
}

impl MapPerms {
    /// Shorthand for read + write.
    pub const RW: Self = Self::READ.union(Self::WRITE);

    /// Renders the conventional "rwx" letter form.
    #[must_use]
    pub fn letters(&self) -> String {
        let mut out = String::new();
        if self.contains(Self::READ) {
            out.push('r');
        }
        if self.contains(Self::WRITE) {
            out.push('w');
        }
        if self.contains(Self::EXECUTE) {
            out.push('x');
        }
        out
    }

    /// Parses the "rwx" letter form.
    ///
    /// # Errors
    ///
    /// Returns [`SdfError::InvalidAddress`] on an unknown letter.
    pub fn from_letters(letters: &str) -> Result<Self> {
        let mut perms = Self::empty();
        for ch in letters.chars() {
            perms |= match ch {
                'r' => Self::READ,
                'w' => Self::WRITE,
                'x' => Self::EXECUTE,
                other => {
                    return Err(SdfError::InvalidAddress(format!(
                        "unknown permission letter '{other}'"
                    )))
                }
            };
        }
        Ok(perms)
    }
}

/// A mapping of one memory region into a PD's or VM's virtual address space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Map {
    mr: MrHandle,
    vaddr: u64,
    perms: MapPerms,
    cached: bool,
    setvar_vaddr: Option<String>,
}

impl Map {
    /// Creates a mapping with at least one permission.
    ///
    /// # Errors
    ///
    /// Returns [`SdfError::InvalidAddress`] if `vaddr` is not page-aligned
    /// or the permission set is empty.
    pub fn new(mr: MrHandle, vaddr: u64, perms: MapPerms, cached: bool) -> Result<Self> {
        if perms.is_empty() {
            return Err(SdfError::InvalidAddress(format!(
                "mapping at {vaddr:#x} has an empty permission set"
            )));
        }
        check_map_vaddr(vaddr)?;
        Ok(Self {
            mr,
            vaddr,
            perms,
            cached,
            setvar_vaddr: None,
        })
    }

    /// Creates a permission-less reservation of the address range.
    ///
    /// # Errors
    ///
    /// Returns [`SdfError::InvalidAddress`] if `vaddr` is not page-aligned.
    pub fn reservation(mr: MrHandle, vaddr: u64) -> Result<Self> {
        check_map_vaddr(vaddr)?;
        Ok(Self {
            mr,
            vaddr,
            perms: MapPerms::empty(),
            cached: false,
            setvar_vaddr: None,
        })
    }

    /// Names a symbol in the program image to patch with the mapping's vaddr.
    #[must_use]
    pub fn with_setvar_vaddr(mut self, symbol: impl Into<String>) -> Self {
        self.setvar_vaddr = Some(symbol.into());
        self
    }

    /// The mapped memory region.
    #[must_use]
    pub const fn mr(&self) -> MrHandle {
        self.mr
    }

    /// Virtual address of the mapping.
    #[must_use]
    pub const fn vaddr(&self) -> u64 {
        self.vaddr
    }

    /// Access permissions.
    #[must_use]
    pub const fn perms(&self) -> MapPerms {
        self.perms
    }

    /// Whether the mapping is cached.
    #[must_use]
    pub const fn cached(&self) -> bool {
        self.cached
    }

    /// Symbol patched with the mapping's vaddr, if any.
    #[must_use]
    pub fn setvar_vaddr(&self) -> Option<&str> {
        self.setvar_vaddr.as_deref()
    }
}

fn check_map_vaddr(vaddr: u64) -> Result<()> {
    if vaddr % PAGE_SIZE != 0 {
        return Err(SdfError::InvalidAddress(format!(
            "virtual address {vaddr:#x} is not page-aligned"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Arena;

    #[test]
    fn test_region_validation() {
        assert!(MemoryRegion::new("ok", PAGE_SIZE).is_ok());
        assert!(matches!(
            MemoryRegion::new("zero", 0),
            Err(SdfError::InvalidAddress(_))
        ));
        assert!(matches!(
            MemoryRegion::new("unaligned", 0x1234),
            Err(SdfError::InvalidAddress(_))
        ));
        assert!(matches!(
            MemoryRegion::new_physical("pinned", PAGE_SIZE, 0x10),
            Err(SdfError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_perm_letters_round_trip() {
        let perms = MapPerms::READ | MapPerms::EXECUTE;
        assert_eq!(perms.letters(), "rx");
        assert_eq!(MapPerms::from_letters("rx").unwrap(), perms);
        assert!(MapPerms::from_letters("q").is_err());
    }

    #[test]
    fn test_map_validation() {
        let mut arena = Arena::new();
        let mr = arena.insert(MemoryRegion::new("buf", PAGE_SIZE).unwrap());

        assert!(Map::new(mr, 0x200_0000, MapPerms::RW, true).is_ok());
        assert!(matches!(
            Map::new(mr, 0x200_0001, MapPerms::RW, true),
            Err(SdfError::InvalidAddress(_))
        ));
        assert!(matches!(
            Map::new(mr, 0x200_0000, MapPerms::empty(), true),
            Err(SdfError::InvalidAddress(_))
        ));
        // A reservation is the one legal empty-permission mapping.
        assert!(Map::reservation(mr, 0x200_0000).is_ok());
    }
}
