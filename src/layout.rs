//! Decides what goes where: routes atoms into sections, groups allocatable sections into loadable
//! segments, then assigns file offsets and virtual addresses so that the ELF loader contract
//! holds. Also owns the atom address map that relocation application and the entry address are
//! resolved against.

use crate::alignment;
use crate::alignment::Alignment;
use crate::atom::AbsoluteAtom;
use crate::atom::Binding;
use crate::atom::DefinedAtom;
use crate::atom::ReferenceKind;
use crate::chunks::attributes_for_atom;
use crate::chunks::AtomSection;
use crate::chunks::DynamicSlot;
use crate::chunks::Section;
use crate::chunks::SectionContent;
use crate::chunks::SectionId;
use crate::elf::ElfClass;
use crate::error::Result;
use object::Endian;
use crate::program_segments::load_flags;
use crate::program_segments::Segment;
use ahash::AHashMap;
use anyhow::bail;
use object::elf::PF_R;
use object::elf::PF_W;
use object::elf::PT_DYNAMIC;
use object::elf::PT_INTERP;
use object::elf::PT_PHDR;
use object::elf::SHT_FINI_ARRAY;
use object::elf::SHT_INIT_ARRAY;
use object::elf::SHT_PREINIT_ARRAY;
use std::marker::PhantomData;

/// A linker-visible absolute symbol. Synthesised entries get their value assigned after layout;
/// entries carried in from the input keep the value the input gave them.
pub struct AbsoluteEntry {
    pub(crate) name: String,
    pub(crate) value: u64,
    pub(crate) binding: Binding,
    pub(crate) synthesized: bool,
}

/// The section arena plus everything derived from it during one write. Sections are created once,
/// mutated by the layout walks and the finalize step, then read-only during emission.
pub struct Layout<'data, C: ElfClass> {
    pub(crate) sections: Vec<Section<'data>>,
    by_name: AHashMap<String, SectionId>,
    pub(crate) segments: Vec<Segment>,
    pub(crate) absolute_atoms: Vec<AbsoluteEntry>,
    atom_addresses: AHashMap<String, u64>,
    base_address: u64,
    page_alignment: Alignment,
    _class: PhantomData<C>,
}

impl<'data, C: ElfClass> Layout<'data, C> {
    pub fn new(base_address: u64, page_size: u64) -> Result<Self> {
        Ok(Self {
            sections: Vec::new(),
            by_name: AHashMap::new(),
            segments: Vec::new(),
            absolute_atoms: Vec::new(),
            atom_addresses: AHashMap::new(),
            base_address,
            page_alignment: Alignment::new(page_size)?,
            _class: PhantomData,
        })
    }

    pub fn add_section(&mut self, section: Section<'data>) -> Result<SectionId> {
        let id = SectionId(self.sections.len());
        if !section.name.is_empty() {
            if self.by_name.contains_key(&section.name) {
                bail!("Duplicate output section `{}`", section.name);
            }
            self.by_name.insert(section.name.clone(), id);
        }
        self.sections.push(section);
        Ok(id)
    }

    pub fn find_output_section(&self, name: &str) -> Option<SectionId> {
        self.by_name.get(name).copied()
    }

    pub fn section(&self, id: SectionId) -> &Section<'data> {
        &self.sections[id.as_usize()]
    }

    pub(crate) fn section_mut(&mut self, id: SectionId) -> &mut Section<'data> {
        &mut self.sections[id.as_usize()]
    }

    pub(crate) fn section_ids(&self) -> impl Iterator<Item = SectionId> {
        (0..self.sections.len()).map(SectionId)
    }

    /// Routes a defined atom into the section named by the atom, creating the section on first
    /// use.
    pub(crate) fn add_atom(&mut self, atom: &'data DefinedAtom) -> Result<()> {
        let id = match self.find_output_section(&atom.section_name) {
            Some(id) => id,
            None => {
                let (ty, flags, rank) = attributes_for_atom(atom);
                let mut section = Section::new(
                    &atom.section_name,
                    ty,
                    flags,
                    rank,
                    1,
                    SectionContent::Atoms(AtomSection::default()),
                )?;
                if matches!(ty, SHT_PREINIT_ARRAY | SHT_INIT_ARRAY | SHT_FINI_ARRAY) {
                    section.entsize = C::WORD_ALIGN.value();
                }
                self.add_section(section)?
            }
        };
        self.section_mut(id).push_atom(atom)
    }

    pub(crate) fn add_absolute(
        &mut self,
        atom: &AbsoluteAtom,
        synthesized: bool,
    ) {
        self.absolute_atoms.push(AbsoluteEntry {
            name: atom.name.clone(),
            value: atom.value,
            binding: atom.binding,
            synthesized,
        });
    }

    pub(crate) fn absolute_atoms(&self) -> &[AbsoluteEntry] {
        &self.absolute_atoms
    }

    /// Assigns a value to an absolute symbol, whoever created it. Returns whether it was found.
    /// Target handlers use this from `finalize_symbol_values`.
    pub fn set_absolute_value(&mut self, name: &str, value: u64) -> bool {
        match self.absolute_atoms.iter_mut().find(|a| a.name == name) {
            Some(entry) => {
                entry.value = value;
                true
            }
            None => false,
        }
    }

    /// Assigns a value to a linker-synthesised absolute symbol. An input-provided definition is
    /// left alone; a missing symbol means default-atom injection went wrong.
    pub(crate) fn set_synthesized_value(&mut self, name: &str, value: u64) -> Result<()> {
        match self.absolute_atoms.iter_mut().find(|a| a.name == name) {
            Some(entry) => {
                if entry.synthesized {
                    entry.value = value;
                }
                Ok(())
            }
            None => bail!("Linker-defined absolute symbol `{name}` was never injected"),
        }
    }

    /// Interns `name` in the symbol table's string table and appends the symbol.
    pub(crate) fn add_symbol(
        &mut self,
        table: SectionId,
        name: &str,
        binding: Binding,
        st_type: u8,
        shndx: u16,
        value: u64,
        size: u64,
    ) {
        let string_table = self.section(table).symbols().string_table;
        let [table_section, strings] = self
            .sections
            .get_disjoint_mut([table.as_usize(), string_table.as_usize()])
            .expect("a symbol table cannot be its own string table");
        let name_offset = strings.strings_mut().add_string(name);
        table_section
            .symbols_mut()
            .add_symbol(name, name_offset, binding, st_type, shndx, value, size);
    }

    pub fn add_dynamic_entry(&mut self, dynamic: SectionId, tag: u32, value: u64) -> DynamicSlot {
        self.section_mut(dynamic).dynamic_mut().add_entry(tag, value)
    }

    pub fn patch_dynamic_entry(&mut self, dynamic: SectionId, slot: DynamicSlot, value: u64) {
        self.section_mut(dynamic).dynamic_mut().patch(slot, value);
    }

    /// Groups allocatable sections into LOAD segments and creates the PHDR, INTERP and DYNAMIC
    /// segments. Also fixes each allocatable section's index in the section header table, so
    /// symbol entries written before the table is built carry final indices.
    #[tracing::instrument(skip_all, name = "Assign sections to segments")]
    pub(crate) fn assign_sections_to_segments(&mut self, program_headers: SectionId) -> Result<()> {
        self.finalize_chunk_sizes();

        let mut alloc: Vec<SectionId> = self
            .section_ids()
            .filter(|&id| self.section(id).is_allocatable())
            .collect();
        alloc.sort_by_key(|&id| (self.section(id).rank, id.as_usize()));
        let read_only: Vec<SectionId> = alloc
            .iter()
            .copied()
            .filter(|&id| !self.section(id).is_writable())
            .collect();
        let writable: Vec<SectionId> = alloc
            .iter()
            .copied()
            .filter(|&id| self.section(id).is_writable())
            .collect();

        let mut segments = Vec::new();
        segments.push({
            let mut phdr = Segment::new(PT_PHDR, PF_R, C::WORD_ALIGN);
            phdr.members.push(program_headers);
            phdr
        });
        if let Some(interp) = self.find_output_section(".interp") {
            let mut segment = Segment::new(PT_INTERP, PF_R, alignment::MIN);
            segment.members.push(interp);
            segments.push(segment);
        }
        for (group, writable) in [(&read_only, false), (&writable, true)] {
            if group.is_empty() {
                continue;
            }
            let any_executable = group.iter().any(|&id| self.section(id).is_executable());
            let mut segment = Segment::new(
                object::elf::PT_LOAD,
                load_flags(writable, any_executable),
                self.page_alignment,
            );
            segment.members.extend(group.iter().copied());
            let index = segments.len();
            segments.push(segment);
            for &id in group {
                self.section_mut(id).load_segment = Some(index);
            }
        }
        if let Some(dynamic) = self.find_output_section(".dynamic") {
            let mut segment = Segment::new(PT_DYNAMIC, PF_R | PF_W, C::WORD_ALIGN);
            segment.members.push(dynamic);
            segments.push(segment);
        }

        let mut next_index = 1u16;
        for &id in read_only.iter().chain(writable.iter()) {
            let section = self.section_mut(id);
            if section.wants_header_entry() {
                section.shndx = Some(next_index);
                next_index += 1;
            }
        }

        let headers_size = segments.len() as u64 * C::PROGRAM_HEADER_SIZE;
        let headers = self.section_mut(program_headers);
        headers.file_size = headers_size;
        headers.mem_size = headers_size;

        self.segments = segments;
        Ok(())
    }

    /// Computes the final size of every chunk whose content is already complete. The program and
    /// section header chunks are sized when their entry counts are known.
    fn finalize_chunk_sizes(&mut self) {
        let sizes: Vec<Option<(u64, u64)>> = self
            .sections
            .iter()
            .map(|section| match &section.content {
                SectionContent::ElfHeader => {
                    Some((C::FILE_HEADER_SIZE, C::FILE_HEADER_SIZE))
                }
                SectionContent::ProgramHeaders | SectionContent::SectionHeaders(_) => None,
                SectionContent::Atoms(_) => {
                    let mem = section.mem_size;
                    let file = if section.is_nobits() { 0 } else { mem };
                    Some((file, mem))
                }
                SectionContent::Raw(bytes) | SectionContent::Interp(bytes) => {
                    Some((bytes.len() as u64, bytes.len() as u64))
                }
                SectionContent::Strings(table) => Some((table.len_bytes(), table.len_bytes())),
                SectionContent::Symbols(table) => {
                    let size = table.num_symbols() * C::SYM_SIZE;
                    Some((size, size))
                }
                SectionContent::Dynamic(table) => {
                    let size = table.num_entries() * C::DYN_SIZE;
                    Some((size, size))
                }
                SectionContent::Hash(_) => {
                    let dynsym = section.link.expect("hash section must link its symbol table");
                    let size =
                        crate::chunks::HashTable::file_size(self.section(dynsym).symbols().num_symbols());
                    Some((size, size))
                }
            })
            .collect();
        for (section, size) in self.sections.iter_mut().zip(sizes) {
            if let Some((file, mem)) = size {
                section.file_size = file;
                section.mem_size = mem;
            }
        }
    }

    /// Walks the LOAD segments assigning increasing file offsets. NOBITS sections take no file
    /// bytes and must trail the file-backed members of their segment.
    #[tracing::instrument(skip_all, name = "Assign file offsets")]
    pub(crate) fn assign_file_offsets(&mut self) -> Result<()> {
        let mut offset = 0u64;
        for index in 0..self.segments.len() {
            if !self.segments[index].is_load() {
                continue;
            }
            let members = self.segments[index].members.clone();
            offset = self.segments[index].alignment.align_up(offset);
            let start = offset;
            let mut nobits_seen = false;
            for id in members {
                let section = self.section_mut(id);
                let aligned = section.alignment.align_up(offset);
                section.file_offset = aligned;
                if section.is_nobits() {
                    nobits_seen = true;
                } else {
                    if nobits_seen {
                        bail!(
                            "Section `{}` has file content after a NOBITS section in its segment",
                            section.name
                        );
                    }
                    offset = aligned + section.file_size;
                }
            }
            let segment = &mut self.segments[index];
            segment.file_offset = start;
            segment.file_size = offset - start;
        }
        Ok(())
    }

    /// Same walk as the file offsets, in memory. Each LOAD segment starts at an address congruent
    /// to its file offset modulo the page size; NOBITS members extend the segment's memory image
    /// past its file image.
    #[tracing::instrument(skip_all, name = "Assign virtual addresses")]
    pub(crate) fn assign_virtual_addresses(&mut self) -> Result<()> {
        let mut next = self.base_address;
        for index in 0..self.segments.len() {
            if !self.segments[index].is_load() {
                continue;
            }
            let members = self.segments[index].members.clone();
            let segment_file_offset = self.segments[index].file_offset;
            let vaddr = self
                .page_alignment
                .align_modulo(segment_file_offset, next);
            let mut mem_cursor = vaddr;
            for id in members {
                let section = self.section_mut(id);
                if section.is_nobits() {
                    mem_cursor = section.alignment.align_up(mem_cursor);
                    section.virtual_address = mem_cursor;
                    mem_cursor += section.mem_size;
                } else {
                    section.virtual_address = vaddr + (section.file_offset - segment_file_offset);
                    mem_cursor = section.virtual_address + section.mem_size;
                }
            }
            let segment = &mut self.segments[index];
            segment.virtual_address = vaddr;
            segment.mem_size = mem_cursor - vaddr;
            next = mem_cursor;
        }

        for section in &mut self.sections {
            let base_address = section.virtual_address;
            let base_offset = section.file_offset;
            if let SectionContent::Atoms(atoms) = &mut section.content {
                for atom_ref in &mut atoms.atoms {
                    atom_ref.virtual_addr = base_address + atom_ref.offset_in_section;
                    atom_ref.file_offset = base_offset + atom_ref.offset_in_section;
                }
            }
        }

        // PHDR, INTERP and DYNAMIC reference bytes some LOAD already placed.
        for index in 0..self.segments.len() {
            if self.segments[index].is_load() {
                continue;
            }
            let members = self.segments[index].members.clone();
            let mut file_start = u64::MAX;
            let mut file_end = 0;
            let mut mem_start = u64::MAX;
            let mut mem_end = 0;
            for id in members {
                let section = self.section(id);
                file_start = file_start.min(section.file_offset);
                file_end = file_end.max(section.file_offset + section.file_size);
                mem_start = mem_start.min(section.virtual_address);
                mem_end = mem_end.max(section.virtual_address + section.mem_size);
            }
            let segment = &mut self.segments[index];
            segment.file_offset = file_start;
            segment.file_size = file_end - file_start;
            segment.virtual_address = mem_start;
            segment.mem_size = mem_end - mem_start;
        }
        Ok(())
    }

    /// Places the non-allocatable sections past the last loadable byte. Their sizes are
    /// recomputed first: the symbol and string tables grow after the allocatable walk.
    #[tracing::instrument(skip_all, name = "Assign misc section offsets")]
    pub(crate) fn assign_offsets_for_misc_sections(&mut self) {
        let mut offset = self
            .sections
            .iter()
            .map(|s| s.file_offset + s.file_size)
            .max()
            .unwrap_or(0);
        let mut misc: Vec<SectionId> = self
            .section_ids()
            .filter(|&id| !self.section(id).is_allocatable())
            .collect();
        misc.sort_by_key(|&id| (self.section(id).rank, id.as_usize()));
        for id in misc {
            let size = {
                let section = self.section(id);
                match &section.content {
                    SectionContent::Strings(table) => Some(table.len_bytes()),
                    SectionContent::Symbols(table) => Some(table.num_symbols() * C::SYM_SIZE),
                    SectionContent::SectionHeaders(entries) => {
                        Some((entries.len() as u64 + 1) * C::SECTION_HEADER_SIZE)
                    }
                    SectionContent::Raw(bytes) => Some(bytes.len() as u64),
                    _ => None,
                }
            };
            let section = self.section_mut(id);
            if let Some(size) = size {
                section.file_size = size;
                section.mem_size = size;
            }
            offset = section.alignment.align_up(offset);
            section.file_offset = offset;
            offset += section.file_size;
        }
    }

    /// Final content pass: the hash table buckets are filled from the now-complete dynamic symbol
    /// table.
    pub(crate) fn finalize(
        &mut self,
        hash: Option<SectionId>,
        dynsym: Option<SectionId>,
    ) -> Result<()> {
        if let (Some(hash), Some(dynsym)) = (hash, dynsym) {
            let [hash_section, dynsym_section] = self
                .sections
                .get_disjoint_mut([hash.as_usize(), dynsym.as_usize()])
                .expect("hash and dynsym are distinct sections");
            hash_section
                .hash_mut()
                .build(dynsym_section.symbols().entries().map(|e| e.name.as_str()));
        }
        Ok(())
    }

    /// Records the final address of every defined and absolute atom, for relocation application
    /// and entry point resolution.
    #[tracing::instrument(skip_all, name = "Build atom address map")]
    pub(crate) fn build_atom_address_map(&mut self) {
        let mut addresses = AHashMap::new();
        for section in &self.sections {
            if let Some(atoms) = section.atoms() {
                for atom_ref in &atoms.atoms {
                    addresses.insert(atom_ref.atom.name.clone(), atom_ref.virtual_addr);
                }
            }
        }
        for absolute in &self.absolute_atoms {
            addresses.insert(absolute.name.clone(), absolute.value);
        }
        self.atom_addresses = addresses;
    }

    pub(crate) fn atom_address(&self, name: &str) -> Option<u64> {
        self.atom_addresses.get(name).copied()
    }

    /// Patches an atom's references into its copied bytes. `atom_address` is where the atom
    /// landed; `out` is exactly the atom's content window in the output buffer.
    pub(crate) fn apply_references(
        &self,
        atom: &DefinedAtom,
        atom_address: u64,
        out: &mut [u8],
    ) -> Result<()> {
        for reference in &atom.references {
            let Some(target) = self.atom_address(&reference.target) else {
                bail!(
                    "Reference to undefined symbol `{}` in atom `{}`",
                    reference.target,
                    atom.name
                );
            };
            let addend = reference.addend as u64;
            let place = atom_address + reference.offset;
            let (value, byte_size) = match reference.kind {
                ReferenceKind::Absolute { byte_size } => (target.wrapping_add(addend), byte_size),
                ReferenceKind::Relative { byte_size } => {
                    (target.wrapping_add(addend).wrapping_sub(place), byte_size)
                }
            };
            let offset = reference.offset as usize;
            let end = offset + byte_size;
            if byte_size > 8 || end > out.len() {
                bail!(
                    "Reference at offset 0x{:x} is outside the bounds of atom `{}`",
                    reference.offset,
                    atom.name
                );
            }
            if C::endian().is_little_endian() {
                out[offset..end].copy_from_slice(&value.to_le_bytes()[..byte_size]);
            } else {
                out[offset..end].copy_from_slice(&value.to_be_bytes()[8 - byte_size..]);
            }
        }
        Ok(())
    }

    pub(crate) fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// The data segment: the one writable, non-executable LOAD.
    pub(crate) fn writable_load_segment(&self) -> Option<&Segment> {
        self.segments
            .iter()
            .find(|s| s.is_load() && s.is_writable() && !s.is_executable())
            .or_else(|| self.segments.iter().find(|s| s.is_load() && s.is_writable()))
    }

    pub(crate) fn last_load_segment(&self) -> Option<&Segment> {
        self.segments.iter().filter(|s| s.is_load()).last()
    }
}
