//! Drives the whole pipeline for one output file: chunks, layout, linker symbols, table
//! finalisation, then emission into a memory-mapped buffer of exactly the right size.

use crate::atom::AtomContent;
use crate::atom::Binding;
use crate::atom::ResolvedInput;
use crate::chunks::order;
use crate::chunks::AtomSection;
use crate::chunks::DynamicSlot;
use crate::chunks::DynamicTable;
use crate::chunks::HashTable;
use crate::chunks::Section;
use crate::chunks::SectionContent;
use crate::chunks::SectionId;
use crate::chunks::StringTable;
use crate::chunks::SymbolTable;
use crate::elf::Elf32;
use crate::elf::Elf64;
use crate::elf::ElfClass;
use crate::elf::HeaderFields;
use crate::elf::SectionRecord;
use crate::error::Result;
use crate::layout::Layout;
use crate::linker_symbols;
use crate::target::TargetHandler;
use crate::target::TargetInfo;
use ahash::AHashSet;
use anyhow::bail;
use anyhow::Context;
use memmap2::MmapOptions;
use object::elf::DT_HASH;
use object::elf::DT_NEEDED;
use object::elf::DT_NULL;
use object::elf::DT_STRSZ;
use object::elf::DT_STRTAB;
use object::elf::DT_SYMENT;
use object::elf::DT_SYMTAB;
use object::elf::SHF_ALLOC;
use object::elf::SHF_WRITE;
use object::elf::SHN_ABS;
use object::elf::SHN_UNDEF;
use object::elf::SHT_DYNAMIC;
use object::elf::SHT_DYNSYM;
use object::elf::SHT_HASH;
use object::elf::SHT_PROGBITS;
use object::elf::SHT_STRTAB;
use object::elf::SHT_SYMTAB;
use object::elf::STT_FUNC;
use object::elf::STT_NOTYPE;
use object::elf::STT_OBJECT;
use object::BigEndian;
use object::LittleEndian;
use object::U32;
use std::marker::PhantomData;
use std::path::Path;

/// Writes one resolved input to one path. Created through [`create_writer_elf`].
pub trait Writer {
    fn write_file(&self, input: &ResolvedInput, path: &Path) -> Result;
}

/// Picks the writer monomorphisation matching the target's class and byte order.
pub fn create_writer_elf<T: TargetInfo>(target_info: &T) -> Box<dyn Writer + '_> {
    match (target_info.is_64_bits(), target_info.is_little_endian()) {
        (false, true) => Box::new(ExecutableWriter::<Elf32<LittleEndian>, T>::new(target_info)),
        (true, true) => Box::new(ExecutableWriter::<Elf64<LittleEndian>, T>::new(target_info)),
        (false, false) => Box::new(ExecutableWriter::<Elf32<BigEndian>, T>::new(target_info)),
        (true, false) => Box::new(ExecutableWriter::<Elf64<BigEndian>, T>::new(target_info)),
    }
}

struct ExecutableWriter<'info, C: ElfClass, T: TargetInfo> {
    target_info: &'info T,
    _class: PhantomData<C>,
}

impl<'info, C: ElfClass, T: TargetInfo> ExecutableWriter<'info, C, T> {
    fn new(target_info: &'info T) -> Self {
        Self {
            target_info,
            _class: PhantomData,
        }
    }
}

impl<C: ElfClass, T: TargetInfo> Writer for ExecutableWriter<'_, C, T> {
    #[tracing::instrument(skip_all, name = "Write ELF file")]
    fn write_file(&self, input: &ResolvedInput, path: &Path) -> Result {
        let target_info = self.target_info;
        let handler = target_info.handler::<C>();

        let mut runtime = linker_symbols::runtime_atoms(target_info.entry(), input);
        handler.add_files(&mut runtime)?;

        let mut layout =
            handler.create_layout(target_info.base_address(), target_info.page_size())?;
        for atom in input.defined().chain(runtime.defined()) {
            layout.add_atom(atom)?;
        }
        for atom in input.absolute() {
            layout.add_absolute(atom, false);
        }
        for atom in runtime.absolute() {
            layout.add_absolute(atom, true);
        }
        handler.pre_flight(&mut layout)?;

        let sections = create_default_sections::<C, T>(&mut layout, target_info)?;
        handler.create_default_sections(&mut layout)?;

        let slots = if target_info.is_dynamic() {
            let dynamic = sections
                .dynamic
                .expect("dynamic output always has a .dynamic section");
            let slots = create_default_dynamic_entries(&mut layout, dynamic);
            build_dynamic_symbol_table(&mut layout, input, &sections);
            handler.add_dynamic_entries(&mut layout, dynamic)?;
            Some(slots)
        } else {
            None
        };

        layout.assign_sections_to_segments(sections.program_headers)?;
        layout.assign_file_offsets()?;
        layout.assign_virtual_addresses()?;

        linker_symbols::finalize_default_atom_values(&mut layout, target_info.is_dynamic())?;
        handler.finalize_symbol_values(&mut layout)?;

        layout.build_atom_address_map();
        build_static_symbol_table(&mut layout, input, &runtime, sections.symtab);
        layout.finalize(sections.hash, sections.dynsym)?;

        build_section_header_table(&mut layout, &sections)?;
        assign_sections_with_no_segments(&mut layout, &sections)?;

        if let Some(slots) = &slots {
            update_dynamic_table::<C>(&mut layout, slots, &sections);
        }

        let header_table = layout.section(sections.section_headers);
        let total_size = header_table.file_offset + header_table.file_size;
        let mut output = Output::create(path, total_size)?;
        write_output::<C, T>(
            &layout,
            target_info,
            handler.as_ref(),
            &sections,
            output.buffer_mut(),
        )?;
        output.commit()
    }
}

/// Ids of the sections every output gets, plus the dynamic set when requested.
struct DefaultSections {
    program_headers: SectionId,
    symtab: SectionId,
    shstrtab: SectionId,
    section_headers: SectionId,
    dynamic: Option<SectionId>,
    dynstr: Option<SectionId>,
    dynsym: Option<SectionId>,
    hash: Option<SectionId>,
}

/// Slots of the dynamic entries whose values only exist after layout.
struct ReservedDynamicSlots {
    hash: DynamicSlot,
    strtab: DynamicSlot,
    symtab: DynamicSlot,
    strsz: DynamicSlot,
    syment: DynamicSlot,
}

fn create_default_sections<'data, C: ElfClass, T: TargetInfo>(
    layout: &mut Layout<'data, C>,
    target_info: &T,
) -> Result<DefaultSections> {
    let word = C::WORD_ALIGN.value();

    layout.add_section(Section::new(
        "",
        0,
        u64::from(SHF_ALLOC),
        order::ELF_HEADER,
        word,
        SectionContent::ElfHeader,
    )?)?;
    let program_headers = layout.add_section(Section::new(
        "",
        0,
        u64::from(SHF_ALLOC),
        order::PROGRAM_HEADERS,
        word,
        SectionContent::ProgramHeaders,
    )?)?;

    let strtab = layout.add_section(Section::new(
        ".strtab",
        SHT_STRTAB,
        0,
        order::STRTAB,
        1,
        SectionContent::Strings(StringTable::new(false)),
    )?)?;
    let symtab = {
        let mut section = Section::new(
            ".symtab",
            SHT_SYMTAB,
            0,
            order::SYMTAB,
            word,
            SectionContent::Symbols(SymbolTable::new(strtab)),
        )?;
        section.entsize = C::SYM_SIZE;
        section.link = Some(strtab);
        layout.add_section(section)?
    };
    let shstrtab = layout.add_section(Section::new(
        ".shstrtab",
        SHT_STRTAB,
        0,
        order::SHSTRTAB,
        1,
        SectionContent::Strings(StringTable::new(false)),
    )?)?;
    let section_headers = layout.add_section(Section::new(
        "",
        0,
        0,
        order::SECTION_HEADERS,
        word,
        SectionContent::SectionHeaders(Vec::new()),
    )?)?;

    let mut sections = DefaultSections {
        program_headers,
        symtab,
        shstrtab,
        section_headers,
        dynamic: None,
        dynstr: None,
        dynsym: None,
        hash: None,
    };
    if !target_info.is_dynamic() {
        return Ok(sections);
    }

    let dynstr = layout.add_section(Section::new(
        ".dynstr",
        SHT_STRTAB,
        u64::from(SHF_ALLOC),
        order::DYNSTR,
        1,
        SectionContent::Strings(StringTable::new(true)),
    )?)?;
    let dynsym = {
        let mut section = Section::new(
            ".dynsym",
            SHT_DYNSYM,
            u64::from(SHF_ALLOC),
            order::DYNSYM,
            word,
            SectionContent::Symbols(SymbolTable::new(dynstr)),
        )?;
        section.entsize = C::SYM_SIZE;
        section.link = Some(dynstr);
        layout.add_section(section)?
    };
    let mut interp_bytes = target_info.interpreter().as_bytes().to_vec();
    interp_bytes.push(0);
    layout.add_section(Section::new(
        ".interp",
        SHT_PROGBITS,
        u64::from(SHF_ALLOC),
        order::INTERP,
        1,
        SectionContent::Interp(interp_bytes),
    )?)?;
    let hash = {
        let mut section = Section::new(
            ".hash",
            SHT_HASH,
            u64::from(SHF_ALLOC),
            order::HASH,
            4,
            SectionContent::Hash(HashTable::new()),
        )?;
        section.entsize = 4;
        section.link = Some(dynsym);
        layout.add_section(section)?
    };
    let dynamic = {
        let mut section = Section::new(
            ".dynamic",
            SHT_DYNAMIC,
            u64::from(SHF_ALLOC | SHF_WRITE),
            order::DYNAMIC,
            word,
            SectionContent::Dynamic(DynamicTable::new()),
        )?;
        section.entsize = C::DYN_SIZE;
        section.link = Some(dynstr);
        layout.add_section(section)?
    };

    sections.dynamic = Some(dynamic);
    sections.dynstr = Some(dynstr);
    sections.dynsym = Some(dynsym);
    sections.hash = Some(hash);
    Ok(sections)
}

/// Reserves the dynamic entries that reference sections whose addresses layout hasn't fixed yet.
/// The returned slots are patched in [`update_dynamic_table`].
fn create_default_dynamic_entries<C: ElfClass>(
    layout: &mut Layout<C>,
    dynamic: SectionId,
) -> ReservedDynamicSlots {
    ReservedDynamicSlots {
        hash: layout.add_dynamic_entry(dynamic, DT_HASH, 0),
        strtab: layout.add_dynamic_entry(dynamic, DT_STRTAB, 0),
        symtab: layout.add_dynamic_entry(dynamic, DT_SYMTAB, 0),
        strsz: layout.add_dynamic_entry(dynamic, DT_STRSZ, 0),
        syment: layout.add_dynamic_entry(dynamic, DT_SYMENT, 0),
    }
}

/// One undefined dynamic symbol per shared-library atom, one DT_NEEDED per distinct load name.
fn build_dynamic_symbol_table<C: ElfClass>(
    layout: &mut Layout<C>,
    input: &ResolvedInput,
    sections: &DefaultSections,
) {
    let dynsym = sections.dynsym.expect("dynamic sections exist");
    let dynstr = sections.dynstr.expect("dynamic sections exist");
    let dynamic = sections.dynamic.expect("dynamic sections exist");
    let mut needed = AHashSet::new();
    for atom in input.shared_library() {
        layout.add_symbol(
            dynsym,
            &atom.name,
            Binding::Global,
            STT_NOTYPE,
            SHN_UNDEF,
            0,
            0,
        );
        if needed.insert(atom.load_name.clone()) {
            let offset = layout
                .section_mut(dynstr)
                .strings_mut()
                .add_string(&atom.load_name);
            layout.add_dynamic_entry(dynamic, DT_NEEDED, u64::from(offset));
        }
    }
}

/// Fills `.symtab`: every placed atom with its section index and final address, the absolutes
/// against SHN_ABS, and the undefined atoms against SHN_UNDEF.
fn build_static_symbol_table<C: ElfClass>(
    layout: &mut Layout<C>,
    input: &ResolvedInput,
    runtime: &ResolvedInput,
    symtab: SectionId,
) {
    let mut placed = Vec::new();
    for id in layout.section_ids() {
        let section = layout.section(id);
        let Some(atoms) = section.atoms() else {
            continue;
        };
        let Some(shndx) = section.shndx else {
            continue;
        };
        let st_type = if section.is_executable() {
            STT_FUNC
        } else {
            STT_OBJECT
        };
        for atom_ref in &atoms.atoms {
            placed.push((
                atom_ref.atom.name.clone(),
                atom_ref.atom.binding,
                st_type,
                shndx,
                atom_ref.virtual_addr,
                atom_ref.atom.size(),
            ));
        }
    }
    for (name, binding, st_type, shndx, value, size) in placed {
        layout.add_symbol(symtab, &name, binding, st_type, shndx, value, size);
    }

    let absolutes: Vec<(String, Binding, u64)> = layout
        .absolute_atoms()
        .iter()
        .map(|a| (a.name.clone(), a.binding, a.value))
        .collect();
    for (name, binding, value) in absolutes {
        layout.add_symbol(symtab, &name, binding, STT_NOTYPE, SHN_ABS, value, 0);
    }

    for atom in input.undefined().chain(runtime.undefined()) {
        layout.add_symbol(
            symtab,
            &atom.name,
            Binding::Global,
            STT_NOTYPE,
            SHN_UNDEF,
            0,
            0,
        );
    }
}

/// Appends `id` to the section header table, interning its name. Returns the assigned index.
fn append_section_header<C: ElfClass>(
    layout: &mut Layout<C>,
    sections: &DefaultSections,
    id: SectionId,
) -> Result<u16> {
    let name = layout.section(id).name.clone();
    let name_offset = layout
        .section_mut(sections.shstrtab)
        .strings_mut()
        .add_string(&name);
    let index = {
        let table = layout.section_mut(sections.section_headers);
        let SectionContent::SectionHeaders(entries) = &mut table.content else {
            panic!("section header chunk lost its content");
        };
        entries.push(id);
        u16::try_from(entries.len()).context("More than 65534 output sections")?
    };
    let section = layout.section_mut(id);
    section.sh_name = name_offset;
    match section.shndx {
        Some(expected) if expected != index => bail!(
            "Section `{}` was assigned header index {expected} but appended at {index}",
            section.name
        ),
        _ => section.shndx = Some(index),
    }
    Ok(index)
}

/// Appends every allocatable section that belongs to a segment, in layout order.
fn build_section_header_table<C: ElfClass>(
    layout: &mut Layout<C>,
    sections: &DefaultSections,
) -> Result<()> {
    let mut in_segment: Vec<(u16, SectionId)> = layout
        .section_ids()
        .filter_map(|id| {
            let section = layout.section(id);
            match (section.load_segment, section.shndx) {
                (Some(_), Some(index)) if section.wants_header_entry() => Some((index, id)),
                _ => None,
            }
        })
        .collect();
    in_segment.sort_by_key(|&(index, _)| index);
    for (_, id) in in_segment {
        append_section_header(layout, sections, id)?;
    }
    Ok(())
}

/// Appends the segment-less sections and places them past the last loadable byte.
fn assign_sections_with_no_segments<C: ElfClass>(
    layout: &mut Layout<C>,
    sections: &DefaultSections,
) -> Result<()> {
    let mut misc: Vec<SectionId> = layout
        .section_ids()
        .filter(|&id| {
            let section = layout.section(id);
            section.load_segment.is_none() && section.wants_header_entry()
        })
        .collect();
    misc.sort_by_key(|&id| (layout.section(id).rank, id.as_usize()));
    for id in misc {
        append_section_header(layout, sections, id)?;
    }
    layout.assign_offsets_for_misc_sections();
    Ok(())
}

/// Patches the reserved entries with the now-known addresses and sizes.
fn update_dynamic_table<C: ElfClass>(
    layout: &mut Layout<C>,
    slots: &ReservedDynamicSlots,
    sections: &DefaultSections,
) {
    let dynamic = sections.dynamic.expect("dynamic sections exist");
    let hash_address = layout
        .section(sections.hash.expect("dynamic sections exist"))
        .virtual_address;
    let dynstr = layout.section(sections.dynstr.expect("dynamic sections exist"));
    let dynstr_address = dynstr.virtual_address;
    let dynstr_size = dynstr.file_size;
    let dynsym_address = layout
        .section(sections.dynsym.expect("dynamic sections exist"))
        .virtual_address;
    layout.patch_dynamic_entry(dynamic, slots.hash, hash_address);
    layout.patch_dynamic_entry(dynamic, slots.strtab, dynstr_address);
    layout.patch_dynamic_entry(dynamic, slots.symtab, dynsym_address);
    layout.patch_dynamic_entry(dynamic, slots.strsz, dynstr_size);
    layout.patch_dynamic_entry(dynamic, slots.syment, C::SYM_SIZE);
}

struct SectionAllocation {
    id: SectionId,
    offset: u64,
    size: u64,
}

/// Serialises the image: header and program headers first, then every section's bytes at its
/// assigned offset. The header and program header chunks are written from layout state rather
/// than stored content, since their bytes depend on everything else.
#[tracing::instrument(skip_all, name = "Write output sections")]
fn write_output<C: ElfClass, T: TargetInfo>(
    layout: &Layout<C>,
    target_info: &T,
    handler: &dyn TargetHandler<C>,
    sections: &DefaultSections,
    out: &mut [u8],
) -> Result<()> {
    let header_table = layout.section(sections.section_headers);
    let SectionContent::SectionHeaders(entries) = &header_table.content else {
        panic!("section header chunk lost its content");
    };
    let mut fields = HeaderFields {
        class: C::CLASS,
        data: C::data_encoding(),
        ident_version: 1,
        os_abi: 0,
        abi_version: 0,
        ty: target_info.output_type(),
        machine: target_info.output_machine(),
        version: 1,
        entry: layout.atom_address(target_info.entry()).unwrap_or(0),
        phoff: layout.section(sections.program_headers).file_offset,
        shoff: header_table.file_offset,
        flags: 0,
        ehsize: C::FILE_HEADER_SIZE as u16,
        phentsize: C::PROGRAM_HEADER_SIZE as u16,
        phnum: u16::try_from(layout.segments().len()).context("Too many program headers")?,
        shentsize: C::SECTION_HEADER_SIZE as u16,
        shnum: u16::try_from(entries.len() + 1).context("Too many sections")?,
        shstrndx: layout
            .section(sections.shstrtab)
            .shndx
            .expect(".shstrtab is always in the section header table"),
    };
    if handler.overrides_header() {
        handler.set_header_info(&mut fields);
    }

    let mut allocations: Vec<SectionAllocation> = layout
        .section_ids()
        .filter_map(|id| {
            let section = layout.section(id);
            if section.is_nobits() || section.file_size == 0 {
                return None;
            }
            Some(SectionAllocation {
                id,
                offset: section.file_offset,
                size: section.file_size,
            })
        })
        .collect();
    allocations.sort_by_key(|a| (a.offset, a.offset + a.size));

    let mut data = out;
    let mut cursor = 0u64;
    for allocation in allocations {
        let Some(padding) = allocation.offset.checked_sub(cursor) else {
            bail!(
                "Section offsets went backwards: {cursor:#x} to {:#x}",
                allocation.offset
            );
        };
        data.split_off_mut(..padding as usize)
            .context("Output buffer too small for padding")?;
        let window = data
            .split_off_mut(..allocation.size as usize)
            .context("Output buffer too small for section")?;
        write_section::<C>(layout, allocation.id, &fields, window)?;
        cursor = allocation.offset + allocation.size;
    }
    Ok(())
}

fn write_section<C: ElfClass>(
    layout: &Layout<C>,
    id: SectionId,
    fields: &HeaderFields,
    out: &mut [u8],
) -> Result<()> {
    let section = layout.section(id);
    match &section.content {
        SectionContent::ElfHeader => {
            out.copy_from_slice(object::bytes_of(&C::file_header(fields)));
        }
        SectionContent::ProgramHeaders => {
            let records: Vec<C::ProgramHeader> = layout
                .segments()
                .iter()
                .map(|segment| C::program_header(&segment.record()))
                .collect();
            out.copy_from_slice(object::bytes_of_slice(&records));
        }
        SectionContent::SectionHeaders(entries) => {
            write_section_headers::<C>(layout, entries, out);
        }
        SectionContent::Atoms(atoms) => write_atoms(layout, atoms, out)?,
        SectionContent::Raw(bytes) | SectionContent::Interp(bytes) => {
            out.copy_from_slice(bytes);
        }
        SectionContent::Strings(table) => out.copy_from_slice(table.as_bytes()),
        SectionContent::Symbols(table) => {
            let records: Vec<C::Sym> = table.records().map(|rec| C::sym(&rec)).collect();
            out.copy_from_slice(object::bytes_of_slice(&records));
        }
        SectionContent::Dynamic(table) => {
            let mut records: Vec<C::Dyn> = table
                .entries()
                .map(|(tag, value)| C::dyn_entry(tag, value))
                .collect();
            records.push(C::dyn_entry(DT_NULL, 0));
            out.copy_from_slice(object::bytes_of_slice(&records));
        }
        SectionContent::Hash(table) => {
            let words: Vec<U32<C::Endian>> = table
                .words()
                .map(|word| U32::new(C::endian(), word))
                .collect();
            out.copy_from_slice(object::bytes_of_slice(&words));
        }
    }
    Ok(())
}

fn write_atoms<C: ElfClass>(
    layout: &Layout<C>,
    atoms: &AtomSection,
    out: &mut [u8],
) -> Result<()> {
    for atom_ref in &atoms.atoms {
        // Zero-filled atoms in a PROGBITS section keep the buffer's zeroes.
        let AtomContent::Data(bytes) = &atom_ref.atom.content else {
            continue;
        };
        let start = atom_ref.offset_in_section as usize;
        let window = &mut out[start..start + bytes.len()];
        window.copy_from_slice(bytes);
        layout
            .apply_references(atom_ref.atom, atom_ref.virtual_addr, window)
            .with_context(|| format!("Failed to fix up atom `{}`", atom_ref.atom.name))?;
    }
    Ok(())
}

fn write_section_headers<C: ElfClass>(layout: &Layout<C>, entries: &[SectionId], out: &mut [u8]) {
    let mut records: Vec<C::SectionHeader> = Vec::with_capacity(entries.len() + 1);
    records.push(C::section_header(&SectionRecord::default()));
    for &id in entries {
        let section = layout.section(id);
        let link = section
            .link
            .and_then(|link| layout.section(link).shndx)
            .unwrap_or(0);
        let info = match &section.content {
            SectionContent::Symbols(table) => table.first_nonlocal_index(),
            _ => 0,
        };
        let size = if section.is_nobits() {
            section.mem_size
        } else {
            section.file_size
        };
        records.push(C::section_header(&SectionRecord {
            name: section.sh_name,
            ty: section.ty,
            flags: section.flags,
            address: section.virtual_address,
            offset: section.file_offset,
            size,
            link: u32::from(link),
            info,
            alignment: section.alignment.value(),
            entsize: section.entsize,
        }));
    }
    out.copy_from_slice(object::bytes_of_slice(&records));
}

pub(crate) struct Output {
    file: std::fs::File,
    mmap: memmap2::MmapMut,
}

impl Output {
    pub(crate) fn create(path: &Path, size: u64) -> Result<Output> {
        let _ = std::fs::remove_file(path);
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("Failed to open `{}`", path.display()))?;
        file.set_len(size)
            .with_context(|| format!("Failed to size `{}`", path.display()))?;
        let mmap = unsafe { MmapOptions::new().map_mut(&file) }
            .with_context(|| format!("Failed to mmap output file `{}`", path.display()))?;
        Ok(Output { file, mmap })
    }

    pub(crate) fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.mmap
    }

    pub(crate) fn commit(self) -> Result {
        self.mmap.flush()?;
        make_executable(&self.file)
    }
}

fn make_executable(file: &std::fs::File) -> Result {
    use std::os::unix::fs::PermissionsExt;

    let mut permissions = file.metadata()?.permissions();
    let mode = permissions.mode();
    // Grant execute wherever read is already granted.
    permissions.set_mode(mode | ((mode & 0o444) >> 2));
    file.set_permissions(permissions)?;
    Ok(())
}
