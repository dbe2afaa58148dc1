//! The building blocks of the output image: sections ("chunks" until their bytes are final) and
//! the builders for the sections the linker synthesises itself. All mutation happens while the
//! layout owns the chunks; during emission they are read-only.

use crate::alignment::Alignment;
use crate::atom::Binding;
use crate::atom::DefinedAtom;
use crate::elf::st_info;
use crate::elf::SymRecord;
use crate::error::Result;
use ahash::AHashMap;
use anyhow::bail;
use object::elf::SHF_ALLOC;
use object::elf::SHF_EXECINSTR;
use object::elf::SHF_WRITE;
use object::elf::SHT_FINI_ARRAY;
use object::elf::SHT_INIT_ARRAY;
use object::elf::SHT_NOBITS;
use object::elf::SHT_PREINIT_ARRAY;
use object::elf::SHT_PROGBITS;
use object::elf::SHT_RELA;
use object::elf::STB_GLOBAL;
use object::elf::STB_LOCAL;
use object::elf::STB_WEAK;

/// Index of a section within the layout's arena. Stable for the lifetime of one write.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SectionId(pub(crate) usize);

impl SectionId {
    pub(crate) fn as_usize(self) -> usize {
        self.0
    }
}

impl std::fmt::Display for SectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// Ranks fixing the order of sections in the file: headers first, the read-only and executable
/// groups next, writable data with the NOBITS tail after that, and the non-allocatable tables at
/// the end. Gaps leave room for target-injected sections.
pub mod order {
    pub const ELF_HEADER: u32 = 0;
    pub const PROGRAM_HEADERS: u32 = 1;
    pub const INTERP: u32 = 10;
    pub const HASH: u32 = 20;
    pub const DYNSYM: u32 = 30;
    pub const DYNSTR: u32 = 40;
    pub const TEXT: u32 = 100;
    pub const RODATA: u32 = 120;
    pub const RELA_PLT: u32 = 130;
    pub const PREINIT_ARRAY: u32 = 200;
    pub const INIT_ARRAY: u32 = 210;
    pub const FINI_ARRAY: u32 = 220;
    pub const DATA: u32 = 230;
    pub const GOT: u32 = 240;
    pub const DYNAMIC: u32 = 250;
    pub const BSS: u32 = 300;
    pub const SYMTAB: u32 = 400;
    pub const STRTAB: u32 = 410;
    pub const SHSTRTAB: u32 = 420;
    pub const SECTION_HEADERS: u32 = 430;
}

/// Attributes a section gets when it is created for an atom with the given target section name.
pub(crate) fn attributes_for_atom(atom: &DefinedAtom) -> (u32, u64, u32) {
    let (ty, flags, rank) = match atom.section_name.as_str() {
        ".text" => (SHT_PROGBITS, SHF_ALLOC | SHF_EXECINSTR, order::TEXT),
        ".rodata" => (SHT_PROGBITS, SHF_ALLOC, order::RODATA),
        ".rela.plt" => (SHT_RELA, SHF_ALLOC, order::RELA_PLT),
        ".preinit_array" => (
            SHT_PREINIT_ARRAY,
            SHF_ALLOC | SHF_WRITE,
            order::PREINIT_ARRAY,
        ),
        ".init_array" => (SHT_INIT_ARRAY, SHF_ALLOC | SHF_WRITE, order::INIT_ARRAY),
        ".fini_array" => (SHT_FINI_ARRAY, SHF_ALLOC | SHF_WRITE, order::FINI_ARRAY),
        ".data" => (SHT_PROGBITS, SHF_ALLOC | SHF_WRITE, order::DATA),
        ".got" => (SHT_PROGBITS, SHF_ALLOC | SHF_WRITE, order::GOT),
        ".bss" => (SHT_NOBITS, SHF_ALLOC | SHF_WRITE, order::BSS),
        _ => {
            let perms = atom.permissions;
            let ty = if atom.is_zero_fill() {
                SHT_NOBITS
            } else {
                SHT_PROGBITS
            };
            let mut flags = SHF_ALLOC;
            let rank = if perms.is_executable() {
                flags |= SHF_EXECINSTR;
                order::TEXT + 5
            } else if !perms.is_writable() {
                order::RODATA + 5
            } else {
                flags |= SHF_WRITE;
                if ty == SHT_NOBITS {
                    order::BSS + 5
                } else {
                    order::DATA + 5
                }
            };
            (ty, flags, rank)
        }
    };
    (ty, u64::from(flags), rank)
}

/// One section of the output image plus its assigned layout. Offsets, addresses and sizes start
/// at zero and are filled in by the layout walks.
pub struct Section<'data> {
    pub(crate) name: String,
    pub(crate) ty: u32,
    pub(crate) flags: u64,
    pub(crate) rank: u32,
    pub(crate) alignment: Alignment,
    pub(crate) entsize: u64,
    pub(crate) link: Option<SectionId>,
    pub(crate) file_offset: u64,
    pub(crate) virtual_address: u64,
    pub(crate) file_size: u64,
    pub(crate) mem_size: u64,
    /// Index into the layout's segment list, for allocatable sections once assigned.
    pub(crate) load_segment: Option<usize>,
    /// Index in the section header table once appended.
    pub(crate) shndx: Option<u16>,
    pub(crate) sh_name: u32,
    pub(crate) content: SectionContent<'data>,
}

pub enum SectionContent<'data> {
    ElfHeader,
    ProgramHeaders,
    SectionHeaders(Vec<SectionId>),
    Atoms(AtomSection<'data>),
    Raw(Vec<u8>),
    Strings(StringTable),
    Symbols(SymbolTable),
    Dynamic(DynamicTable),
    Hash(HashTable),
    Interp(Vec<u8>),
}

impl<'data> Section<'data> {
    pub fn new(
        name: &str,
        ty: u32,
        flags: u64,
        rank: u32,
        alignment: u64,
        content: SectionContent<'data>,
    ) -> Result<Self> {
        Ok(Self {
            name: name.to_owned(),
            ty,
            flags,
            rank,
            alignment: Alignment::new(alignment)?,
            entsize: 0,
            link: None,
            file_offset: 0,
            virtual_address: 0,
            file_size: 0,
            mem_size: 0,
            load_segment: None,
            shndx: None,
            sh_name: 0,
            content,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn virtual_address(&self) -> u64 {
        self.virtual_address
    }

    pub fn file_offset(&self) -> u64 {
        self.file_offset
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn mem_size(&self) -> u64 {
        self.mem_size
    }

    pub(crate) fn is_allocatable(&self) -> bool {
        self.flags & u64::from(SHF_ALLOC) != 0
    }

    pub(crate) fn is_writable(&self) -> bool {
        self.flags & u64::from(SHF_WRITE) != 0
    }

    pub(crate) fn is_executable(&self) -> bool {
        self.flags & u64::from(SHF_EXECINSTR) != 0
    }

    pub(crate) fn is_nobits(&self) -> bool {
        self.ty == SHT_NOBITS
    }

    /// Whether this section appears in the section header table. The ELF header, program header
    /// and section header chunks are described by the file header instead.
    pub(crate) fn wants_header_entry(&self) -> bool {
        !matches!(
            self.content,
            SectionContent::ElfHeader
                | SectionContent::ProgramHeaders
                | SectionContent::SectionHeaders(_)
        )
    }

    /// Places `atom` at the next suitably aligned offset within this section.
    pub(crate) fn push_atom(&mut self, atom: &'data DefinedAtom) -> Result<()> {
        if self.is_nobits() && !atom.is_zero_fill() {
            bail!(
                "Atom `{}` has file content, but section `{}` is NOBITS",
                atom.name,
                self.name
            );
        }
        let atom_alignment = Alignment::new(atom.alignment)?;
        self.alignment = self.alignment.max(atom_alignment);
        let offset = atom_alignment.align_up(self.mem_size);
        let atoms = self.atoms_mut();
        let ordinal = atoms.atoms.len() as u32;
        atoms.atoms.push(AtomRef {
            atom,
            offset_in_section: offset,
            virtual_addr: 0,
            file_offset: 0,
            ordinal,
        });
        self.mem_size = offset + atom.size();
        Ok(())
    }

    pub(crate) fn atoms(&self) -> Option<&AtomSection<'data>> {
        match &self.content {
            SectionContent::Atoms(a) => Some(a),
            _ => None,
        }
    }

    pub(crate) fn atoms_mut(&mut self) -> &mut AtomSection<'data> {
        match &mut self.content {
            SectionContent::Atoms(a) => a,
            _ => panic!("section `{}` does not hold atoms", self.name),
        }
    }

    pub(crate) fn strings_mut(&mut self) -> &mut StringTable {
        match &mut self.content {
            SectionContent::Strings(t) => t,
            _ => panic!("section `{}` is not a string table", self.name),
        }
    }

    pub(crate) fn symbols(&self) -> &SymbolTable {
        match &self.content {
            SectionContent::Symbols(t) => t,
            _ => panic!("section `{}` is not a symbol table", self.name),
        }
    }

    pub(crate) fn symbols_mut(&mut self) -> &mut SymbolTable {
        match &mut self.content {
            SectionContent::Symbols(t) => t,
            _ => panic!("section `{}` is not a symbol table", self.name),
        }
    }

    pub(crate) fn dynamic_mut(&mut self) -> &mut DynamicTable {
        match &mut self.content {
            SectionContent::Dynamic(t) => t,
            _ => panic!("section `{}` is not a dynamic table", self.name),
        }
    }

    pub(crate) fn hash_mut(&mut self) -> &mut HashTable {
        match &mut self.content {
            SectionContent::Hash(t) => t,
            _ => panic!("section `{}` is not a hash table", self.name),
        }
    }
}

/// An atom positioned within a section.
pub struct AtomRef<'data> {
    pub(crate) atom: &'data DefinedAtom,
    pub(crate) offset_in_section: u64,
    pub(crate) virtual_addr: u64,
    #[allow(dead_code)]
    pub(crate) file_offset: u64,
    #[allow(dead_code)]
    pub(crate) ordinal: u32,
}

#[derive(Default)]
pub struct AtomSection<'data> {
    pub(crate) atoms: Vec<AtomRef<'data>>,
}

/// An append-only string table starting with a NUL byte. When deduplicating, equal strings share
/// one offset.
pub struct StringTable {
    data: Vec<u8>,
    dedup: Option<AHashMap<String, u32>>,
}

impl StringTable {
    pub fn new(dedup: bool) -> Self {
        Self {
            data: vec![0],
            dedup: dedup.then(AHashMap::new),
        }
    }

    /// Returns the offset of `s`, appending it if necessary. Offsets are stable once returned.
    pub(crate) fn add_string(&mut self, s: &str) -> u32 {
        if let Some(map) = &self.dedup {
            if let Some(&offset) = map.get(s) {
                return offset;
            }
        }
        let offset = self.data.len() as u32;
        self.data.extend_from_slice(s.as_bytes());
        self.data.push(0);
        if let Some(map) = &mut self.dedup {
            map.insert(s.to_owned(), offset);
        }
        offset
    }

    pub(crate) fn len_bytes(&self) -> u64 {
        self.data.len() as u64
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

pub(crate) struct SymbolEntry {
    pub(crate) name: String,
    pub(crate) name_offset: u32,
    pub(crate) info: u8,
    pub(crate) shndx: u16,
    pub(crate) value: u64,
    pub(crate) size: u64,
}

/// A symbol table under construction. Locals and non-locals are kept apart so the ordering
/// contract holds structurally; within each class insertion order is preserved.
pub struct SymbolTable {
    pub(crate) string_table: SectionId,
    locals: Vec<SymbolEntry>,
    globals: Vec<SymbolEntry>,
}

impl SymbolTable {
    pub fn new(string_table: SectionId) -> Self {
        Self {
            string_table,
            // Index 0 is the null symbol.
            locals: vec![SymbolEntry {
                name: String::new(),
                name_offset: 0,
                info: 0,
                shndx: 0,
                value: 0,
                size: 0,
            }],
            globals: Vec::new(),
        }
    }

    pub(crate) fn add_symbol(
        &mut self,
        name: &str,
        name_offset: u32,
        binding: Binding,
        st_type: u8,
        shndx: u16,
        value: u64,
        size: u64,
    ) {
        let (stb, out) = match binding {
            Binding::Local => (STB_LOCAL, &mut self.locals),
            Binding::Global => (STB_GLOBAL, &mut self.globals),
            Binding::Weak => (STB_WEAK, &mut self.globals),
        };
        out.push(SymbolEntry {
            name: name.to_owned(),
            name_offset,
            info: st_info(stb, st_type),
            shndx,
            value,
            size,
        });
    }

    pub(crate) fn num_symbols(&self) -> u64 {
        (self.locals.len() + self.globals.len()) as u64
    }

    /// sh_info of the symbol table section: the index of the first non-local symbol.
    pub(crate) fn first_nonlocal_index(&self) -> u32 {
        self.locals.len() as u32
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = &SymbolEntry> {
        self.locals.iter().chain(self.globals.iter())
    }

    pub(crate) fn records(&self) -> impl Iterator<Item = SymRecord> + '_ {
        self.entries().map(|entry| SymRecord {
            name: entry.name_offset,
            info: entry.info,
            other: 0,
            shndx: entry.shndx,
            value: entry.value,
            size: entry.size,
        })
    }
}

/// Handle to one reserved dynamic table entry, used to patch its value after layout.
#[derive(Clone, Copy, Debug)]
pub struct DynamicSlot(usize);

/// The `.dynamic` table: ordered (tag, value) pairs, closed with DT_NULL at serialisation.
#[derive(Default)]
pub struct DynamicTable {
    entries: Vec<(u32, u64)>,
}

impl DynamicTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_entry(&mut self, tag: u32, value: u64) -> DynamicSlot {
        self.entries.push((tag, value));
        DynamicSlot(self.entries.len() - 1)
    }

    pub(crate) fn patch(&mut self, slot: DynamicSlot, value: u64) {
        self.entries[slot.0].1 = value;
    }

    /// Number of serialised entries, including the DT_NULL terminator.
    pub(crate) fn num_entries(&self) -> u64 {
        self.entries.len() as u64 + 1
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = (u32, u64)> + '_ {
        self.entries.iter().copied()
    }
}

/// The classic bucket sizes used by SysV linkers.
const BUCKET_COUNTS: [u32; 16] = [
    1, 3, 17, 37, 67, 97, 131, 197, 263, 521, 1031, 2053, 4099, 8209, 16411, 32771,
];

/// A SysV `.hash` section: nbucket, nchain, then the bucket heads and the per-symbol chains over
/// the dynamic symbol table.
#[derive(Default)]
pub struct HashTable {
    buckets: Vec<u32>,
    chains: Vec<u32>,
}

impl HashTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn bucket_count(num_symbols: u64) -> u32 {
        BUCKET_COUNTS
            .iter()
            .copied()
            .take_while(|&p| u64::from(p) <= num_symbols.max(1))
            .last()
            .unwrap_or(1)
    }

    pub(crate) fn file_size(num_symbols: u64) -> u64 {
        (2 + u64::from(Self::bucket_count(num_symbols)) + num_symbols) * 4
    }

    /// Fills buckets and chains from the dynamic symbol names, in symbol table order. Index 0 is
    /// STN_UNDEF and doubles as the chain terminator.
    pub(crate) fn build<'n>(&mut self, names: impl Iterator<Item = &'n str>) {
        let names: Vec<&str> = names.collect();
        let nbucket = Self::bucket_count(names.len() as u64);
        self.buckets = vec![0; nbucket as usize];
        self.chains = vec![0; names.len()];
        for (index, name) in names.iter().enumerate().skip(1) {
            let bucket = (object::elf::hash(name.as_bytes()) % nbucket) as usize;
            self.chains[index] = self.buckets[bucket];
            self.buckets[bucket] = index as u32;
        }
    }

    pub(crate) fn words(&self) -> impl Iterator<Item = u32> + '_ {
        [self.buckets.len() as u32, self.chains.len() as u32]
            .into_iter()
            .chain(self.buckets.iter().copied())
            .chain(self.chains.iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_table_dedup() {
        let mut table = StringTable::new(true);
        let a = table.add_string("libc.so.6");
        let b = table.add_string("libm.so.6");
        let c = table.add_string("libc.so.6");
        assert_eq!(a, 1);
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(table.as_bytes()[0], 0);
        assert_eq!(table.len_bytes(), 1 + 10 + 10);
    }

    #[test]
    fn string_table_without_dedup_appends() {
        let mut table = StringTable::new(false);
        let a = table.add_string("x");
        let b = table.add_string("x");
        assert_ne!(a, b);
    }

    #[test]
    fn symbol_table_orders_locals_first() {
        let mut table = SymbolTable::new(SectionId(0));
        table.add_symbol("g1", 1, Binding::Global, 0, 1, 0x10, 0);
        table.add_symbol("l1", 4, Binding::Local, 0, 1, 0x20, 0);
        table.add_symbol("w1", 7, Binding::Weak, 0, 1, 0x30, 0);
        table.add_symbol("l2", 10, Binding::Local, 0, 1, 0x40, 0);
        let names: Vec<&str> = table.entries().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["", "l1", "l2", "g1", "w1"]);
        assert_eq!(table.first_nonlocal_index(), 3);
        assert_eq!(table.num_symbols(), 5);
    }

    #[test]
    fn dynamic_table_patches_reserved_slots() {
        let mut table = DynamicTable::new();
        let hash = table.add_entry(object::elf::DT_HASH, 0);
        table.add_entry(object::elf::DT_NEEDED, 7);
        table.patch(hash, 0x400200);
        let entries: Vec<(u32, u64)> = table.entries().collect();
        assert_eq!(
            entries,
            [
                (object::elf::DT_HASH, 0x400200),
                (object::elf::DT_NEEDED, 7)
            ]
        );
        assert_eq!(table.num_entries(), 3);
    }

    #[test]
    fn hash_table_chains_reach_every_symbol() {
        let names = ["", "printf", "malloc", "free", "exit", "open64"];
        let mut table = HashTable::new();
        table.build(names.iter().copied());
        let nbucket = table.buckets.len() as u32;
        for (expected, name) in names.iter().enumerate().skip(1) {
            let bucket = (object::elf::hash(name.as_bytes()) % nbucket) as usize;
            let mut index = table.buckets[bucket] as usize;
            let mut found = false;
            while index != 0 {
                if index == expected {
                    found = true;
                    break;
                }
                index = table.chains[index] as usize;
            }
            assert!(found, "symbol `{name}` not reachable through its bucket");
        }
    }

    #[test]
    fn bucket_counts_come_from_the_prime_table() {
        assert_eq!(HashTable::bucket_count(0), 1);
        assert_eq!(HashTable::bucket_count(2), 1);
        assert_eq!(HashTable::bucket_count(3), 3);
        assert_eq!(HashTable::bucket_count(100), 97);
    }
}
