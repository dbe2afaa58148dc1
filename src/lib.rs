//! An ELF executable writer. Consumes a fully resolved collection of atoms plus a target
//! description and produces a byte-exact, statically or dynamically linked executable. Symbol
//! resolution, relocation computation and object parsing all happen upstream; this crate lays
//! sections into segments, synthesises the linker-owned metadata sections and emits the image.
//!
//! Entry point: [`create_writer_elf`], which dispatches on the target's class and byte order and
//! returns a [`Writer`].

mod alignment;
mod atom;
mod chunks;
mod elf;
mod elf_writer;
mod error;
mod layout;
mod linker_symbols;
mod program_segments;
mod target;

pub use atom::AbsoluteAtom;
pub use atom::AtomContent;
pub use atom::Binding;
pub use atom::DefinedAtom;
pub use atom::Permissions;
pub use atom::Reference;
pub use atom::ReferenceKind;
pub use atom::ResolvedInput;
pub use atom::SharedLibraryAtom;
pub use atom::UndefinedAtom;
pub use chunks::order;
pub use chunks::AtomRef;
pub use chunks::AtomSection;
pub use chunks::DynamicSlot;
pub use chunks::DynamicTable;
pub use chunks::HashTable;
pub use chunks::Section;
pub use chunks::SectionContent;
pub use chunks::SectionId;
pub use chunks::StringTable;
pub use chunks::SymbolTable;
pub use elf::Elf32;
pub use elf::Elf64;
pub use elf::ElfClass;
pub use elf::HeaderFields;
pub use elf::NON_PIE_START_MEM_ADDRESS;
pub use elf_writer::create_writer_elf;
pub use elf_writer::Writer;
pub use error::Error;
pub use error::Result;
pub use layout::Layout;
pub use target::BasicTargetInfo;
pub use target::GenericTargetHandler;
pub use target::TargetHandler;
pub use target::TargetInfo;
