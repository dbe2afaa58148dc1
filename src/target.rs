//! The target description consumed by the writer and the per-architecture hook surface. The
//! writer itself is architecture-agnostic; everything machine-specific goes through
//! [`TargetHandler`].

use crate::atom::ResolvedInput;
use crate::chunks::SectionId;
use crate::elf::ElfClass;
use crate::elf::HeaderFields;
use crate::elf::NON_PIE_START_MEM_ADDRESS;
use crate::error::Result;
use crate::layout::Layout;

/// What to build: class, byte order, machine, entry point and the dynamic-linking switches.
pub trait TargetInfo {
    fn is_64_bits(&self) -> bool;
    fn is_little_endian(&self) -> bool;
    /// Whether the output gets the dynamic-linking sections (`.dynamic`, `.dynsym`, `.dynstr`,
    /// `.interp`, `.hash`).
    fn is_dynamic(&self) -> bool;
    fn output_type(&self) -> u16 {
        object::elf::ET_EXEC
    }
    fn output_machine(&self) -> u16;
    /// Name of the entry symbol, resolved against the atom address map for `e_entry`.
    fn entry(&self) -> &str;
    /// Path written into `.interp` for dynamic output.
    fn interpreter(&self) -> &str;
    fn base_address(&self) -> u64 {
        NON_PIE_START_MEM_ADDRESS
    }
    fn page_size(&self) -> u64 {
        0x1000
    }
    fn handler<C: ElfClass>(&self) -> Box<dyn TargetHandler<C>> {
        Box::new(GenericTargetHandler)
    }
}

/// Per-architecture customisation points, called at fixed places in the write pipeline. Every
/// method has a do-nothing default; a target implements only what it needs.
pub trait TargetHandler<C: ElfClass> {
    /// The layout instance the writer will drive. Targets with special placement rules can
    /// pre-seed the returned layout with their own sections.
    fn create_layout<'data>(&self, base_address: u64, page_size: u64) -> Result<Layout<'data, C>> {
        Layout::new(base_address, page_size)
    }

    /// Last chance to inject synthetic atoms before chunk building freezes the input.
    fn add_files(&self, _runtime: &mut ResolvedInput) -> Result<()> {
        Ok(())
    }

    /// Called after chunks are built but before any default section exists.
    fn pre_flight(&self, _layout: &mut Layout<C>) -> Result<()> {
        Ok(())
    }

    /// Opportunity to instantiate extra sections such as a PLT or GOT.
    fn create_default_sections(&self, _layout: &mut Layout<C>) -> Result<()> {
        Ok(())
    }

    /// Opportunity to reserve extra dynamic table entries (`DT_RELA`, `DT_PLTGOT`, ...).
    fn add_dynamic_entries(&self, _layout: &mut Layout<C>, _dynamic: SectionId) -> Result<()> {
        Ok(())
    }

    fn overrides_header(&self) -> bool {
        false
    }

    /// Mutates the file header before emission. Only called when [`Self::overrides_header`]
    /// returns true; otherwise the SysV defaults stand.
    fn set_header_info(&self, _header: &mut HeaderFields) {}

    /// Assigns values to target-specific linker symbols after layout.
    fn finalize_symbol_values(&self, _layout: &mut Layout<C>) -> Result<()> {
        Ok(())
    }
}

/// The hook used when a machine needs nothing special.
pub struct GenericTargetHandler;

impl<C: ElfClass> TargetHandler<C> for GenericTargetHandler {}

/// A plain-data [`TargetInfo`] for callers that don't need their own type.
#[derive(Clone, Debug)]
pub struct BasicTargetInfo {
    pub is_64_bits: bool,
    pub is_little_endian: bool,
    pub dynamic: bool,
    pub output_type: u16,
    pub machine: u16,
    pub entry: String,
    pub interpreter: String,
    pub base_address: u64,
    pub page_size: u64,
}

impl BasicTargetInfo {
    pub fn x86_64(entry: &str) -> Self {
        Self {
            is_64_bits: true,
            is_little_endian: true,
            dynamic: false,
            output_type: object::elf::ET_EXEC,
            machine: object::elf::EM_X86_64,
            entry: entry.to_owned(),
            interpreter: "/lib64/ld-linux-x86-64.so.2".to_owned(),
            base_address: NON_PIE_START_MEM_ADDRESS,
            page_size: 0x1000,
        }
    }
}

impl TargetInfo for BasicTargetInfo {
    fn is_64_bits(&self) -> bool {
        self.is_64_bits
    }

    fn is_little_endian(&self) -> bool {
        self.is_little_endian
    }

    fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    fn output_type(&self) -> u16 {
        self.output_type
    }

    fn output_machine(&self) -> u16 {
        self.machine
    }

    fn entry(&self) -> &str {
        &self.entry
    }

    fn interpreter(&self) -> &str {
        &self.interpreter
    }

    fn base_address(&self) -> u64 {
        self.base_address
    }

    fn page_size(&self) -> u64 {
        self.page_size
    }
}
