//! Tests that write real executables into the target tmpdir, then read them back with `object`
//! and check the loader-visible contract: header fields, segment geometry, symbol and dynamic
//! tables, and the linker-defined symbols.

use atomld::create_writer_elf;
use atomld::AtomContent;
use atomld::BasicTargetInfo;
use atomld::Binding;
use atomld::DefinedAtom;
use atomld::Permissions;
use atomld::Reference;
use atomld::ReferenceKind;
use atomld::ResolvedInput;
use atomld::SharedLibraryAtom;
use atomld::UndefinedAtom;
use object::elf::EM_PPC;
use object::elf::EM_X86_64;
use object::elf::ET_EXEC;
use object::elf::PF_R;
use object::elf::PF_W;
use object::elf::PF_X;
use object::elf::PT_LOAD;
use object::elf::PT_PHDR;
use object::elf::SHF_ALLOC;
use object::read::elf::ElfFile;
use object::read::elf::ElfFile32;
use object::read::elf::ElfFile64;
use object::read::elf::FileHeader;
use object::read::elf::ProgramHeader as _;
use object::read::elf::SectionHeader as _;
use object::LittleEndian;
use object::Object;
use object::ObjectSection;
use object::ObjectSymbol;
use object::SectionFlags;
use object::SymbolSection;
use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;

const PAGE_SIZE: u64 = 0x1000;

fn out_path(name: &str) -> PathBuf {
    Path::new(env!("CARGO_TARGET_TMPDIR")).join(name)
}

fn link(target_info: &BasicTargetInfo, input: &ResolvedInput, name: &str) -> Vec<u8> {
    let path = out_path(name);
    let writer = create_writer_elf(target_info);
    writer.write_file(input, &path).unwrap();
    std::fs::read(&path).unwrap()
}

fn text_atom(name: &str, bytes: Vec<u8>) -> DefinedAtom {
    DefinedAtom {
        name: name.to_owned(),
        section_name: ".text".to_owned(),
        content: AtomContent::Data(bytes),
        permissions: Permissions::ReadExecute,
        ..DefinedAtom::default()
    }
}

fn minimal_input() -> ResolvedInput {
    ResolvedInput {
        defined: vec![text_atom("main", vec![0x90; 8])],
        undefined: vec![UndefinedAtom {
            name: "_start".to_owned(),
        }],
        ..ResolvedInput::default()
    }
}

fn symbol_map(obj: &ElfFile64<LittleEndian>) -> HashMap<String, u64> {
    obj.symbols()
        .filter_map(|sym| sym.name().ok().map(|name| (name.to_owned(), sym.address())))
        .collect()
}

fn dynamic_entries(obj: &ElfFile64<LittleEndian>, data: &[u8]) -> Vec<(u64, u64)> {
    let section = obj.section_by_name(".dynamic").expect("missing .dynamic");
    let (offset, size) = section.file_range().unwrap();
    let bytes = &data[offset as usize..(offset + size) as usize];
    bytes
        .chunks_exact(16)
        .map(|chunk| {
            (
                u64::from_le_bytes(chunk[..8].try_into().unwrap()),
                u64::from_le_bytes(chunk[8..].try_into().unwrap()),
            )
        })
        .collect()
}

#[test]
fn minimal_static_executable() {
    let target_info = BasicTargetInfo::x86_64("_start");
    let data = link(&target_info, &minimal_input(), "e1");
    let obj = ElfFile64::<LittleEndian>::parse(&*data).unwrap();
    let e = LittleEndian;
    let header = obj.elf_header();
    assert_eq!(header.e_type.get(e), ET_EXEC);
    assert_eq!(header.e_machine.get(e), EM_X86_64);

    let loads: Vec<_> = obj
        .elf_program_headers()
        .iter()
        .filter(|ph| ph.p_type(e) == PT_LOAD)
        .collect();
    assert_eq!(loads.len(), 1);
    assert_eq!(loads[0].p_flags(e), PF_R | PF_X);
    let phdrs = obj
        .elf_program_headers()
        .iter()
        .filter(|ph| ph.p_type(e) == PT_PHDR)
        .count();
    assert_eq!(phdrs, 1);

    assert!(obj.section_by_name(".dynamic").is_none());

    let symbols = symbol_map(&obj);
    assert!(symbols.contains_key("main"));
    assert!(symbols.contains_key("_start"));
    assert_eq!(obj.entry(), symbols["_start"]);
}

#[test]
fn static_with_bss() {
    let mut input = minimal_input();
    input.defined.push(DefinedAtom {
        name: "buf".to_owned(),
        section_name: ".bss".to_owned(),
        content: AtomContent::ZeroFill(4096),
        permissions: Permissions::ReadWrite,
        ..DefinedAtom::default()
    });
    let target_info = BasicTargetInfo::x86_64("_start");
    let data = link(&target_info, &input, "e2");
    let obj = ElfFile64::<LittleEndian>::parse(&*data).unwrap();
    let e = LittleEndian;

    let loads: Vec<_> = obj
        .elf_program_headers()
        .iter()
        .filter(|ph| ph.p_type(e) == PT_LOAD)
        .collect();
    assert_eq!(loads.len(), 2);
    assert_eq!(loads[0].p_flags(e), PF_R | PF_X);
    assert_eq!(loads[1].p_flags(e), PF_R | PF_W);
    let rw = loads[1];
    assert!(rw.p_memsz(e) >= rw.p_filesz(e) + 4096);

    let symbols = symbol_map(&obj);
    assert_eq!(symbols["__bss_start"], rw.p_vaddr(e) + rw.p_filesz(e));
    let end = rw.p_vaddr(e) + rw.p_memsz(e);
    assert_eq!(symbols["__bss_end"], end);
    assert_eq!(symbols["_end"], end);
    assert_eq!(symbols["end"], end);
}

#[test]
fn dynamic_executable() {
    let mut input = minimal_input();
    input.shared_libraries.push(SharedLibraryAtom {
        name: "printf".to_owned(),
        load_name: "libc.so.6".to_owned(),
    });
    let mut target_info = BasicTargetInfo::x86_64("_start");
    target_info.dynamic = true;
    let data = link(&target_info, &input, "e3");
    let obj = ElfFile64::<LittleEndian>::parse(&*data).unwrap();

    for name in [".interp", ".dynamic", ".dynstr", ".dynsym", ".hash"] {
        assert!(obj.section_by_name(name).is_some(), "missing {name}");
    }
    let interp = obj.section_by_name(".interp").unwrap();
    assert_eq!(
        interp.data().unwrap(),
        b"/lib64/ld-linux-x86-64.so.2\0".as_slice()
    );

    let entries = dynamic_entries(&obj, &data);
    let dynstr = obj.section_by_name(".dynstr").unwrap();
    let dynstr_data = dynstr.data().unwrap();

    let needed: Vec<u64> = entries
        .iter()
        .filter(|(tag, _)| *tag == u64::from(object::elf::DT_NEEDED))
        .map(|(_, value)| *value)
        .collect();
    assert_eq!(needed.len(), 1);
    let name_bytes = &dynstr_data[needed[0] as usize..];
    let len = name_bytes.iter().position(|&b| b == 0).unwrap();
    assert_eq!(&name_bytes[..len], b"libc.so.6");

    let entry_value = |tag: u32| -> u64 {
        let matches: Vec<u64> = entries
            .iter()
            .filter(|(t, _)| *t == u64::from(tag))
            .map(|(_, v)| *v)
            .collect();
        assert_eq!(matches.len(), 1, "expected exactly one tag {tag}");
        matches[0]
    };
    assert_eq!(entry_value(object::elf::DT_STRSZ), dynstr_data.len() as u64);
    assert_eq!(entry_value(object::elf::DT_SYMENT), 24);
    assert_eq!(entry_value(object::elf::DT_STRTAB), dynstr.address());
    assert_eq!(
        entry_value(object::elf::DT_SYMTAB),
        obj.section_by_name(".dynsym").unwrap().address()
    );
    assert_eq!(
        entry_value(object::elf::DT_HASH),
        obj.section_by_name(".hash").unwrap().address()
    );
    // The last serialised entry is the DT_NULL terminator.
    assert_eq!(entries.last(), Some(&(0, 0)));
}

#[test]
fn init_array_symbols() {
    let mut input = minimal_input();
    for name in ["ctor_a", "ctor_b"] {
        input.defined.push(DefinedAtom {
            name: name.to_owned(),
            section_name: ".init_array".to_owned(),
            content: AtomContent::Data(vec![0; 8]),
            alignment: 8,
            permissions: Permissions::ReadWrite,
            ..DefinedAtom::default()
        });
    }
    let target_info = BasicTargetInfo::x86_64("_start");
    let data = link(&target_info, &input, "e4");
    let obj = ElfFile64::<LittleEndian>::parse(&*data).unwrap();

    let init_array = obj.section_by_name(".init_array").unwrap();
    let symbols = symbol_map(&obj);
    assert_eq!(symbols["__init_array_start"], init_array.address());
    assert_eq!(symbols["__init_array_end"], init_array.address() + 16);
    // Sections that don't exist resolve their markers to zero.
    assert_eq!(symbols["__fini_array_start"], 0);
    assert_eq!(symbols["__fini_array_end"], 0);
}

#[test]
fn big_endian_32_bit() {
    let target_info = BasicTargetInfo {
        is_64_bits: false,
        is_little_endian: false,
        machine: EM_PPC,
        ..BasicTargetInfo::x86_64("_start")
    };
    let data = link(&target_info, &minimal_input(), "e5");

    assert_eq!(data[4], object::elf::ELFCLASS32);
    assert_eq!(data[5], object::elf::ELFDATA2MSB);
    // Multi-byte header fields are big-endian encoded.
    assert_eq!(data[16..18], [0, 2]); // e_type = ET_EXEC
    assert_eq!(data[18..20], [0, 20]); // e_machine = EM_PPC

    let obj = ElfFile32::<object::BigEndian>::parse(&*data).unwrap();
    let names: Vec<String> = obj
        .symbols()
        .filter_map(|sym| sym.name().ok().map(str::to_owned))
        .collect();
    assert!(names.contains(&"main".to_owned()));
    assert!(names.contains(&"_start".to_owned()));
}

#[test]
fn duplicate_shared_library_names_deduplicate() {
    let mut input = minimal_input();
    for name in ["sinf", "cosf"] {
        input.shared_libraries.push(SharedLibraryAtom {
            name: name.to_owned(),
            load_name: "libm.so.6".to_owned(),
        });
    }
    let mut target_info = BasicTargetInfo::x86_64("_start");
    target_info.dynamic = true;
    let data = link(&target_info, &input, "e6");
    let obj = ElfFile64::<LittleEndian>::parse(&*data).unwrap();

    let needed = dynamic_entries(&obj, &data)
        .iter()
        .filter(|(tag, _)| *tag == u64::from(object::elf::DT_NEEDED))
        .count();
    assert_eq!(needed, 1);
    // Both references still get a dynamic symbol.
    assert!(obj.dynamic_symbols().count() >= 2);
}

#[test]
fn defined_entry_symbol_address() {
    let input = ResolvedInput {
        defined: vec![text_atom("main", vec![0xc3; 4])],
        ..ResolvedInput::default()
    };
    let target_info = BasicTargetInfo::x86_64("main");
    let data = link(&target_info, &input, "e7");
    let obj = ElfFile64::<LittleEndian>::parse(&*data).unwrap();
    let symbols = symbol_map(&obj);
    assert_ne!(obj.entry(), 0);
    assert_eq!(obj.entry(), symbols["main"]);
}

#[test]
fn relative_references_are_patched() {
    let callee = text_atom("callee", vec![0xc3; 8]);
    let mut caller = text_atom("caller", vec![0x90; 8]);
    caller.references.push(Reference {
        target: "callee".to_owned(),
        offset: 4,
        kind: ReferenceKind::Relative { byte_size: 4 },
        addend: -4,
    });
    let input = ResolvedInput {
        defined: vec![callee, caller],
        ..ResolvedInput::default()
    };
    let target_info = BasicTargetInfo::x86_64("callee");
    let data = link(&target_info, &input, "e8");
    let obj = ElfFile64::<LittleEndian>::parse(&*data).unwrap();

    let symbols = symbol_map(&obj);
    let text = obj.section_by_name(".text").unwrap();
    let text_data = text.data().unwrap();
    let patch_offset = (symbols["caller"] + 4 - text.address()) as usize;
    let patched = i32::from_le_bytes(text_data[patch_offset..patch_offset + 4].try_into().unwrap());
    let expected = symbols["callee"] as i64 - 4 - (symbols["caller"] as i64 + 4);
    assert_eq!(i64::from(patched), expected);
}

#[test]
fn undefined_reference_target_is_an_error() {
    let mut atom = text_atom("caller", vec![0x90; 8]);
    atom.references.push(Reference {
        target: "nowhere".to_owned(),
        offset: 0,
        kind: ReferenceKind::Absolute { byte_size: 8 },
        addend: 0,
    });
    let input = ResolvedInput {
        defined: vec![atom],
        ..ResolvedInput::default()
    };
    let target_info = BasicTargetInfo::x86_64("caller");
    let writer = create_writer_elf(&target_info);
    let err = writer
        .write_file(&input, &out_path("undefined_ref"))
        .unwrap_err();
    assert!(err.to_string().contains("nowhere"), "{err:#}");
}

#[test]
fn symtab_orders_locals_before_globals() {
    let mut input = minimal_input();
    input.defined.push(DefinedAtom {
        name: "local_helper".to_owned(),
        binding: Binding::Local,
        ..text_atom("local_helper", vec![0x90; 4])
    });
    let target_info = BasicTargetInfo::x86_64("_start");
    let data = link(&target_info, &input, "symtab_order");
    let obj = ElfFile64::<LittleEndian>::parse(&*data).unwrap();
    let e = LittleEndian;

    let symtab = obj.section_by_name(".symtab").unwrap();
    let shdr = obj.elf_section_table().section(symtab.index()).unwrap();
    let first_nonlocal = shdr.sh_info(e) as usize;
    for sym in obj.symbols() {
        if sym.index().0 < first_nonlocal {
            assert!(sym.is_local(), "symbol {} should be local", sym.index().0);
        } else {
            assert!(!sym.is_local(), "symbol {} should be global", sym.index().0);
        }
    }
}

#[test]
fn hash_chains_reach_every_dynamic_symbol() {
    let mut input = minimal_input();
    for (name, lib) in [
        ("printf", "libc.so.6"),
        ("malloc", "libc.so.6"),
        ("free", "libc.so.6"),
        ("sinf", "libm.so.6"),
        ("cosf", "libm.so.6"),
        ("dlopen", "libdl.so.2"),
    ] {
        input.shared_libraries.push(SharedLibraryAtom {
            name: name.to_owned(),
            load_name: lib.to_owned(),
        });
    }
    let mut target_info = BasicTargetInfo::x86_64("_start");
    target_info.dynamic = true;
    let data = link(&target_info, &input, "hash_chains");
    let obj = ElfFile64::<LittleEndian>::parse(&*data).unwrap();

    let hash = obj.section_by_name(".hash").unwrap();
    let bytes = hash.data().unwrap();
    let word = |index: usize| -> u32 {
        u32::from_le_bytes(bytes[index * 4..index * 4 + 4].try_into().unwrap())
    };
    let nbucket = word(0) as usize;
    let nchain = word(1) as usize;
    let num_symbols = obj
        .dynamic_symbols()
        .map(|sym| sym.index().0)
        .max()
        .unwrap_or(0)
        + 1;
    assert_eq!(nchain, num_symbols);
    let buckets: Vec<u32> = (0..nbucket).map(|i| word(2 + i)).collect();
    let chains: Vec<u32> = (0..nchain).map(|i| word(2 + nbucket + i)).collect();

    for sym in obj.dynamic_symbols() {
        let name = sym.name().unwrap();
        if name.is_empty() {
            continue;
        }
        let mut index = buckets[(object::elf::hash(name.as_bytes()) as usize) % nbucket] as usize;
        let mut found = false;
        while index != 0 {
            if index == sym.index().0 {
                found = true;
                break;
            }
            index = chains[index] as usize;
        }
        assert!(found, "dynamic symbol `{name}` not reachable from its bucket");
    }
}

#[test]
fn writing_twice_is_byte_identical() {
    let mut input = minimal_input();
    input.shared_libraries.push(SharedLibraryAtom {
        name: "printf".to_owned(),
        load_name: "libc.so.6".to_owned(),
    });
    let mut target_info = BasicTargetInfo::x86_64("_start");
    target_info.dynamic = true;
    let first = link(&target_info, &input, "idempotent_a");
    let second = link(&target_info, &input, "idempotent_b");
    assert_eq!(first, second);
}

fn rich_input() -> ResolvedInput {
    let mut input = minimal_input();
    input.defined.push(DefinedAtom {
        name: "counter".to_owned(),
        section_name: ".data".to_owned(),
        content: AtomContent::Data(vec![0; 16]),
        alignment: 8,
        permissions: Permissions::ReadWrite,
        ..DefinedAtom::default()
    });
    input.defined.push(DefinedAtom {
        name: "buf".to_owned(),
        section_name: ".bss".to_owned(),
        content: AtomContent::ZeroFill(256),
        alignment: 16,
        permissions: Permissions::ReadWrite,
        ..DefinedAtom::default()
    });
    input.defined.push(DefinedAtom {
        name: "ctor".to_owned(),
        section_name: ".init_array".to_owned(),
        content: AtomContent::Data(vec![0; 8]),
        alignment: 8,
        permissions: Permissions::ReadWrite,
        ..DefinedAtom::default()
    });
    input.shared_libraries.push(SharedLibraryAtom {
        name: "printf".to_owned(),
        load_name: "libc.so.6".to_owned(),
    });
    input
}

fn check_invariants<Elf: FileHeader>(data: &[u8]) {
    assert_eq!(&data[..4], &[0x7f, b'E', b'L', b'F']);
    let obj = ElfFile::<Elf>::parse(data).unwrap();
    let header = obj.elf_header();
    let endian = header.endian().unwrap();

    // The section header table is the last thing in the file.
    let shoff: u64 = header.e_shoff(endian).into();
    let table_size = u64::from(header.e_shnum(endian)) * u64::from(header.e_shentsize(endian));
    assert_eq!(shoff + table_size, data.len() as u64);

    let loads: Vec<(u64, u64, u64, u64)> = obj
        .elf_program_headers()
        .iter()
        .filter(|ph| ph.p_type(endian) == PT_LOAD)
        .map(|ph| {
            (
                ph.p_offset(endian).into(),
                ph.p_vaddr(endian).into(),
                ph.p_filesz(endian).into(),
                ph.p_memsz(endian).into(),
            )
        })
        .collect();
    assert!(!loads.is_empty());
    for &(offset, vaddr, filesz, memsz) in &loads {
        assert_eq!(offset % PAGE_SIZE, vaddr % PAGE_SIZE);
        assert!(memsz >= filesz);
    }

    // Every allocatable section lies inside one LOAD segment, in file and in memory.
    for section in obj.sections() {
        let SectionFlags::Elf { sh_flags } = section.flags() else {
            unreachable!();
        };
        if sh_flags & u64::from(SHF_ALLOC) == 0 {
            continue;
        }
        let address = section.address();
        let mem_end = address + section.size();
        assert!(
            loads
                .iter()
                .any(|&(_, vaddr, _, memsz)| address >= vaddr && mem_end <= vaddr + memsz),
            "section {:?} is not covered by a LOAD segment",
            section.name()
        );
        if let Some((file_offset, file_size)) = section.file_range() {
            assert!(loads.iter().any(|&(offset, _, filesz, _)| {
                file_offset >= offset && file_offset + file_size <= offset + filesz
            }));
        }
    }

    // Symbol section references are either real sections, absolute or undefined.
    let num_sections = obj.sections().count() + 1;
    for sym in obj.symbols() {
        match sym.section() {
            SymbolSection::Section(index) => assert!(index.0 < num_sections),
            SymbolSection::Absolute | SymbolSection::Undefined | SymbolSection::Unknown => {}
            other => panic!("unexpected symbol section {other:?}"),
        }
    }
}

#[test]
fn invariants_hold_for_all_class_endian_combinations() {
    let input = rich_input();
    for (is_64_bits, is_little_endian, machine, name) in [
        (true, true, EM_X86_64, "combo_64le"),
        (true, false, object::elf::EM_S390, "combo_64be"),
        (false, true, object::elf::EM_386, "combo_32le"),
        (false, false, EM_PPC, "combo_32be"),
    ] {
        let target_info = BasicTargetInfo {
            is_64_bits,
            is_little_endian,
            machine,
            dynamic: true,
            ..BasicTargetInfo::x86_64("_start")
        };
        let data = link(&target_info, &input, name);
        match (is_64_bits, is_little_endian) {
            (true, true) => check_invariants::<object::elf::FileHeader64<LittleEndian>>(&data),
            (true, false) => check_invariants::<object::elf::FileHeader64<object::BigEndian>>(&data),
            (false, true) => check_invariants::<object::elf::FileHeader32<LittleEndian>>(&data),
            (false, false) => {
                check_invariants::<object::elf::FileHeader32<object::BigEndian>>(&data)
            }
        }
    }
}
