//! The absolute symbols the linker itself defines: the BSS family and the start/end markers of
//! the array sections. They are injected as value-0 atoms before layout so they take part in
//! symbol table construction, then resolved once segment addresses are known.

use crate::atom::AbsoluteAtom;
use crate::atom::Binding;
use crate::atom::ResolvedInput;
use crate::atom::UndefinedAtom;
use crate::elf::ElfClass;
use crate::error::Result;
use crate::layout::Layout;
use anyhow::bail;

/// Marker pairs resolved against a section's extent. `rela_iplt` deliberately maps to
/// `.rela.plt`: run-time code looks the symbols up under these names while the section keeps its
/// conventional one.
const START_END_PAIRS: [(&str, &str); 4] = [
    ("preinit_array", ".preinit_array"),
    ("init_array", ".init_array"),
    ("rela_iplt", ".rela.plt"),
    ("fini_array", ".fini_array"),
];

const BSS_SYMBOLS: [&str; 4] = ["__bss_start", "__bss_end", "_end", "end"];

fn absolute_names() -> impl Iterator<Item = String> {
    BSS_SYMBOLS
        .iter()
        .map(|name| (*name).to_owned())
        .chain(START_END_PAIRS.iter().flat_map(|(symbol, _)| {
            [format!("__{symbol}_start"), format!("__{symbol}_end")]
        }))
}

/// Builds the runtime input: the entry symbol as an undefined atom plus the linker-defined
/// absolutes. Names the input already provides are not injected; the input's definition wins.
pub(crate) fn runtime_atoms(entry: &str, input: &ResolvedInput) -> ResolvedInput {
    let mut runtime = ResolvedInput::default();
    if !entry.is_empty() && !input.mentions(entry) {
        runtime.undefined.push(UndefinedAtom {
            name: entry.to_owned(),
        });
    }
    for name in absolute_names() {
        if !input.defines(&name) {
            runtime.absolute.push(AbsoluteAtom {
                name,
                value: 0,
                binding: Binding::Global,
            });
        }
    }
    runtime
}

/// Resolves the injected absolutes now that layout has fixed every address.
pub(crate) fn finalize_default_atom_values<C: ElfClass>(
    layout: &mut Layout<C>,
    is_dynamic: bool,
) -> Result<()> {
    for (symbol, section_name) in START_END_PAIRS {
        let range = layout.find_output_section(section_name).map(|id| {
            let section = layout.section(id);
            (
                section.virtual_address,
                section.virtual_address + section.mem_size,
            )
        });
        let (start, end) = range.unwrap_or((0, 0));
        layout.set_synthesized_value(&format!("__{symbol}_start"), start)?;
        layout.set_synthesized_value(&format!("__{symbol}_end"), end)?;
    }

    let data_segment = layout
        .writable_load_segment()
        .map(|s| (s.virtual_address, s.file_size, s.mem_size));
    let (bss_start, bss_end) = match data_segment {
        Some((vaddr, file_size, mem_size)) => (vaddr + file_size, vaddr + mem_size),
        None if is_dynamic => {
            bail!("Dynamic output requires a writable LOAD segment, but none was laid out")
        }
        None => {
            // Fully read-only images still get the symbols; point them at the end of the image.
            let Some(last) = layout.last_load_segment() else {
                bail!("No loadable segments were laid out");
            };
            (
                last.virtual_address + last.file_size,
                last.virtual_address + last.mem_size,
            )
        }
    };
    layout.set_synthesized_value("__bss_start", bss_start)?;
    for name in ["__bss_end", "_end", "end"] {
        layout.set_synthesized_value(name, bss_end)?;
    }
    Ok(())
}
