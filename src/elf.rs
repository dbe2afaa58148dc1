//! Typed ELF output records, parametric over class and byte order. Each supported combination is
//! a zero-sized tag implementing [`ElfClass`]; the writer is monomorphised over the tag and builds
//! endian-correct `object::elf` records from class-neutral field structs.

use crate::alignment::Alignment;
use object::Endian;
use object::U16;
use object::U32;
use object::U64;
use std::marker::PhantomData;
use std::mem::size_of;

/// Our starting address in memory when linking non-relocatable executables. We can start memory
/// addresses wherever we like, even from 0. We pick 400k because it's the same as what ld does and
/// because picking a distinctive non-zero values makes it more obvious what's happening if we mix
/// up file and memory offsets.
pub const NON_PIE_START_MEM_ADDRESS: u64 = 0x400_000;

/// ELF file header values in class-independent widths. Built by the writer, optionally mutated by
/// the target handler, then serialised by [`ElfClass::file_header`].
#[derive(Clone, Copy, Debug)]
pub struct HeaderFields {
    pub class: u8,
    pub data: u8,
    pub ident_version: u8,
    pub os_abi: u8,
    pub abi_version: u8,
    pub ty: u16,
    pub machine: u16,
    pub version: u32,
    pub entry: u64,
    pub phoff: u64,
    pub shoff: u64,
    pub flags: u32,
    pub ehsize: u16,
    pub phentsize: u16,
    pub phnum: u16,
    pub shentsize: u16,
    pub shnum: u16,
    pub shstrndx: u16,
}

/// Program header values in class-independent widths.
#[derive(Clone, Copy, Debug)]
pub struct SegmentRecord {
    pub ty: u32,
    pub flags: u32,
    pub offset: u64,
    pub virtual_address: u64,
    pub file_size: u64,
    pub mem_size: u64,
    pub alignment: u64,
}

/// Section header values in class-independent widths.
#[derive(Clone, Copy, Debug, Default)]
pub struct SectionRecord {
    pub name: u32,
    pub ty: u32,
    pub flags: u64,
    pub address: u64,
    pub offset: u64,
    pub size: u64,
    pub link: u32,
    pub info: u32,
    pub alignment: u64,
    pub entsize: u64,
}

/// Symbol table entry values in class-independent widths.
#[derive(Clone, Copy, Debug, Default)]
pub struct SymRecord {
    pub name: u32,
    pub info: u8,
    pub other: u8,
    pub shndx: u16,
    pub value: u64,
    pub size: u64,
}

pub(crate) fn st_info(binding: u8, ty: u8) -> u8 {
    (binding << 4) | (ty & 0xf)
}

/// Compile-time tag selecting one of the four supported (class, byte order) combinations.
pub trait ElfClass: Copy + 'static {
    type Endian: Endian;
    type FileHeader: object::Pod;
    type ProgramHeader: object::Pod;
    type SectionHeader: object::Pod;
    type Sym: object::Pod;
    type Dyn: object::Pod;

    /// EI_CLASS byte.
    const CLASS: u8;
    const FILE_HEADER_SIZE: u64;
    const PROGRAM_HEADER_SIZE: u64;
    const SECTION_HEADER_SIZE: u64;
    const SYM_SIZE: u64;
    const DYN_SIZE: u64;
    /// Alignment of a native word. Also the alignment of the fixed-size table sections.
    const WORD_ALIGN: Alignment;

    fn endian() -> Self::Endian {
        Self::Endian::default()
    }

    /// EI_DATA byte.
    fn data_encoding() -> u8 {
        if Self::endian().is_little_endian() {
            object::elf::ELFDATA2LSB
        } else {
            object::elf::ELFDATA2MSB
        }
    }

    fn file_header(fields: &HeaderFields) -> Self::FileHeader;
    fn program_header(rec: &SegmentRecord) -> Self::ProgramHeader;
    fn section_header(rec: &SectionRecord) -> Self::SectionHeader;
    fn sym(rec: &SymRecord) -> Self::Sym;
    fn dyn_entry(tag: u32, value: u64) -> Self::Dyn;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Elf32<E>(PhantomData<E>);

#[derive(Clone, Copy, Debug, Default)]
pub struct Elf64<E>(PhantomData<E>);

impl<E: Endian> ElfClass for Elf32<E> {
    type Endian = E;
    type FileHeader = object::elf::FileHeader32<E>;
    type ProgramHeader = object::elf::ProgramHeader32<E>;
    type SectionHeader = object::elf::SectionHeader32<E>;
    type Sym = object::elf::Sym32<E>;
    type Dyn = object::elf::Dyn32<E>;

    const CLASS: u8 = object::elf::ELFCLASS32;
    const FILE_HEADER_SIZE: u64 = size_of::<object::elf::FileHeader32<E>>() as u64;
    const PROGRAM_HEADER_SIZE: u64 = size_of::<object::elf::ProgramHeader32<E>>() as u64;
    const SECTION_HEADER_SIZE: u64 = size_of::<object::elf::SectionHeader32<E>>() as u64;
    const SYM_SIZE: u64 = size_of::<object::elf::Sym32<E>>() as u64;
    const DYN_SIZE: u64 = size_of::<object::elf::Dyn32<E>>() as u64;
    const WORD_ALIGN: Alignment = Alignment { exponent: 2 };

    fn file_header(fields: &HeaderFields) -> Self::FileHeader {
        let e = Self::endian();
        object::elf::FileHeader32 {
            e_ident: ident(fields),
            e_type: U16::new(e, fields.ty),
            e_machine: U16::new(e, fields.machine),
            e_version: U32::new(e, fields.version),
            e_entry: U32::new(e, fields.entry as u32),
            e_phoff: U32::new(e, fields.phoff as u32),
            e_shoff: U32::new(e, fields.shoff as u32),
            e_flags: U32::new(e, fields.flags),
            e_ehsize: U16::new(e, fields.ehsize),
            e_phentsize: U16::new(e, fields.phentsize),
            e_phnum: U16::new(e, fields.phnum),
            e_shentsize: U16::new(e, fields.shentsize),
            e_shnum: U16::new(e, fields.shnum),
            e_shstrndx: U16::new(e, fields.shstrndx),
        }
    }

    fn program_header(rec: &SegmentRecord) -> Self::ProgramHeader {
        let e = Self::endian();
        object::elf::ProgramHeader32 {
            p_type: U32::new(e, rec.ty),
            p_offset: U32::new(e, rec.offset as u32),
            p_vaddr: U32::new(e, rec.virtual_address as u32),
            p_paddr: U32::new(e, rec.virtual_address as u32),
            p_filesz: U32::new(e, rec.file_size as u32),
            p_memsz: U32::new(e, rec.mem_size as u32),
            p_flags: U32::new(e, rec.flags),
            p_align: U32::new(e, rec.alignment as u32),
        }
    }

    fn section_header(rec: &SectionRecord) -> Self::SectionHeader {
        let e = Self::endian();
        object::elf::SectionHeader32 {
            sh_name: U32::new(e, rec.name),
            sh_type: U32::new(e, rec.ty),
            sh_flags: U32::new(e, rec.flags as u32),
            sh_addr: U32::new(e, rec.address as u32),
            sh_offset: U32::new(e, rec.offset as u32),
            sh_size: U32::new(e, rec.size as u32),
            sh_link: U32::new(e, rec.link),
            sh_info: U32::new(e, rec.info),
            sh_addralign: U32::new(e, rec.alignment as u32),
            sh_entsize: U32::new(e, rec.entsize as u32),
        }
    }

    fn sym(rec: &SymRecord) -> Self::Sym {
        let e = Self::endian();
        object::elf::Sym32 {
            st_name: U32::new(e, rec.name),
            st_value: U32::new(e, rec.value as u32),
            st_size: U32::new(e, rec.size as u32),
            st_info: rec.info,
            st_other: rec.other,
            st_shndx: U16::new(e, rec.shndx),
        }
    }

    fn dyn_entry(tag: u32, value: u64) -> Self::Dyn {
        let e = Self::endian();
        object::elf::Dyn32 {
            d_tag: U32::new(e, tag),
            d_val: U32::new(e, value as u32),
        }
    }
}

impl<E: Endian> ElfClass for Elf64<E> {
    type Endian = E;
    type FileHeader = object::elf::FileHeader64<E>;
    type ProgramHeader = object::elf::ProgramHeader64<E>;
    type SectionHeader = object::elf::SectionHeader64<E>;
    type Sym = object::elf::Sym64<E>;
    type Dyn = object::elf::Dyn64<E>;

    const CLASS: u8 = object::elf::ELFCLASS64;
    const FILE_HEADER_SIZE: u64 = size_of::<object::elf::FileHeader64<E>>() as u64;
    const PROGRAM_HEADER_SIZE: u64 = size_of::<object::elf::ProgramHeader64<E>>() as u64;
    const SECTION_HEADER_SIZE: u64 = size_of::<object::elf::SectionHeader64<E>>() as u64;
    const SYM_SIZE: u64 = size_of::<object::elf::Sym64<E>>() as u64;
    const DYN_SIZE: u64 = size_of::<object::elf::Dyn64<E>>() as u64;
    const WORD_ALIGN: Alignment = Alignment { exponent: 3 };

    fn file_header(fields: &HeaderFields) -> Self::FileHeader {
        let e = Self::endian();
        object::elf::FileHeader64 {
            e_ident: ident(fields),
            e_type: U16::new(e, fields.ty),
            e_machine: U16::new(e, fields.machine),
            e_version: U32::new(e, fields.version),
            e_entry: U64::new(e, fields.entry),
            e_phoff: U64::new(e, fields.phoff),
            e_shoff: U64::new(e, fields.shoff),
            e_flags: U32::new(e, fields.flags),
            e_ehsize: U16::new(e, fields.ehsize),
            e_phentsize: U16::new(e, fields.phentsize),
            e_phnum: U16::new(e, fields.phnum),
            e_shentsize: U16::new(e, fields.shentsize),
            e_shnum: U16::new(e, fields.shnum),
            e_shstrndx: U16::new(e, fields.shstrndx),
        }
    }

    fn program_header(rec: &SegmentRecord) -> Self::ProgramHeader {
        let e = Self::endian();
        object::elf::ProgramHeader64 {
            p_type: U32::new(e, rec.ty),
            p_flags: U32::new(e, rec.flags),
            p_offset: U64::new(e, rec.offset),
            p_vaddr: U64::new(e, rec.virtual_address),
            p_paddr: U64::new(e, rec.virtual_address),
            p_filesz: U64::new(e, rec.file_size),
            p_memsz: U64::new(e, rec.mem_size),
            p_align: U64::new(e, rec.alignment),
        }
    }

    fn section_header(rec: &SectionRecord) -> Self::SectionHeader {
        let e = Self::endian();
        object::elf::SectionHeader64 {
            sh_name: U32::new(e, rec.name),
            sh_type: U32::new(e, rec.ty),
            sh_flags: U64::new(e, rec.flags),
            sh_addr: U64::new(e, rec.address),
            sh_offset: U64::new(e, rec.offset),
            sh_size: U64::new(e, rec.size),
            sh_link: U32::new(e, rec.link),
            sh_info: U32::new(e, rec.info),
            sh_addralign: U64::new(e, rec.alignment),
            sh_entsize: U64::new(e, rec.entsize),
        }
    }

    fn sym(rec: &SymRecord) -> Self::Sym {
        let e = Self::endian();
        object::elf::Sym64 {
            st_name: U32::new(e, rec.name),
            st_info: rec.info,
            st_other: rec.other,
            st_shndx: U16::new(e, rec.shndx),
            st_value: U64::new(e, rec.value),
            st_size: U64::new(e, rec.size),
        }
    }

    fn dyn_entry(tag: u32, value: u64) -> Self::Dyn {
        let e = Self::endian();
        object::elf::Dyn64 {
            d_tag: U64::new(e, u64::from(tag)),
            d_val: U64::new(e, value),
        }
    }
}

fn ident(fields: &HeaderFields) -> object::elf::Ident {
    object::elf::Ident {
        magic: object::elf::ELFMAG,
        class: fields.class,
        data: fields.data,
        version: fields.ident_version,
        os_abi: fields.os_abi,
        abi_version: fields.abi_version,
        padding: [0; 7],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object::BigEndian;
    use object::LittleEndian;

    #[test]
    fn record_sizes_match_the_abi() {
        assert_eq!(Elf32::<LittleEndian>::FILE_HEADER_SIZE, 0x34);
        assert_eq!(Elf32::<LittleEndian>::PROGRAM_HEADER_SIZE, 0x20);
        assert_eq!(Elf32::<LittleEndian>::SECTION_HEADER_SIZE, 0x28);
        assert_eq!(Elf32::<LittleEndian>::SYM_SIZE, 16);
        assert_eq!(Elf32::<LittleEndian>::DYN_SIZE, 8);
        assert_eq!(Elf64::<LittleEndian>::FILE_HEADER_SIZE, 0x40);
        assert_eq!(Elf64::<LittleEndian>::PROGRAM_HEADER_SIZE, 0x38);
        assert_eq!(Elf64::<LittleEndian>::SECTION_HEADER_SIZE, 0x40);
        assert_eq!(Elf64::<LittleEndian>::SYM_SIZE, 24);
        assert_eq!(Elf64::<LittleEndian>::DYN_SIZE, 16);
    }

    #[test]
    fn dyn_entries_are_endian_correct() {
        let le = Elf64::<LittleEndian>::dyn_entry(object::elf::DT_NEEDED, 0x1234);
        assert_eq!(object::bytes_of(&le)[..8], [1, 0, 0, 0, 0, 0, 0, 0]);
        let be = Elf64::<BigEndian>::dyn_entry(object::elf::DT_NEEDED, 0x1234);
        assert_eq!(object::bytes_of(&be)[..8], [0, 0, 0, 0, 0, 0, 0, 1]);
    }
}
