//! Loader fusion: merge a payload module's loadable content into a loader module.
//!
//! `fuse` is pure: both inputs stay untouched and the result is a freshly laid out
//! image that is re-parsed and re-validated before being returned. The fused file
//! is the primary's image, followed by the secondary's loadable segments rebased
//! by a page-aligned delta, followed by one appended metadata segment holding the
//! rebuilt program-header table, the merged initializer array, the merged dynamic
//! symbol/string/relocation tables, and the patched dynamic section. Section
//! headers and a fresh `.shstrtab` go after the loadable content; they are
//! advisory at runtime.
//!
//! The delta is a multiple of the common load alignment, so every copied segment
//! keeps its offset/vaddr congruence and the dynamic linker maps it exactly as it
//! would have in the secondary. Initializer ordering is the load-time contract
//! the rest of the pipeline depends on: primary's init array entries first, then
//! the secondary's DT_INIT, then the secondary's init array entries.
//!
//! Not regenerated: DT_HASH/DT_GNU_HASH. The primary's tables are kept; their
//! buckets keep working for the primary's symbols (the merge preserves their
//! indices) while appended secondary symbols are only reachable through the
//! symbol table itself. Version tables (DT_VERSYM and friends) are dropped
//! because they are index-parallel to the symbol table and would go stale.

use std::collections::HashMap;

use goblin::elf::{
    dynamic::{
        DT_INIT_ARRAY, DT_INIT_ARRAYSZ, DT_NEEDED, DT_NULL, DT_REL, DT_RELA, DT_RELAENT,
        DT_RELASZ, DT_RELENT, DT_RELSZ, DT_RPATH, DT_RUNPATH, DT_SONAME, DT_STRSZ, DT_STRTAB,
        DT_SYMENT, DT_SYMTAB,
    },
    program_header::{PT_DYNAMIC, PT_LOAD, PT_PHDR},
    section_header::{
        SHF_ALLOC, SHF_WRITE, SHT_DYNAMIC, SHT_DYNSYM, SHT_INIT_ARRAY, SHT_REL, SHT_RELA,
        SHT_STRTAB,
    },
};

use crate::{
    elf::module::{
        DynSymbol, ElfClass, NativeModule, ProgramHeader, RelocEntry, RelocFlavor, SectionHeader,
    },
    Result,
};

const DT_RELACOUNT: u64 = 0x6fff_fff9;
const DT_RELCOUNT: u64 = 0x6fff_fffa;
const DT_VERSYM: u64 = 0x6fff_fff0;
const DT_VERDEF: u64 = 0x6fff_fffc;
const DT_VERDEFNUM: u64 = 0x6fff_fffd;
const DT_VERNEED: u64 = 0x6fff_fffe;
const DT_VERNEEDNUM: u64 = 0x6fff_ffff;

/// Merge `secondary`'s loadable content and initializers into `primary`.
///
/// Neither input is mutated; callers keep both for retry or diagnostics. The
/// returned module is re-parsed from the fused bytes, so every invariant checked
/// at load time also holds for the result.
///
/// # Errors
///
/// - [`crate::Error::Alignment`] for differing classes or machines, or an unusable
///   common load alignment
/// - [`crate::Error::NotSupported`] when the two modules carry dynamic relocations
///   of different flavors (REL vs RELA)
/// - [`crate::Error::Overlap`] if the placed segments violate the disjoint
///   virtual-address invariant (internal-consistency fault)
/// - [`crate::Error::Malformed`] when the primary has no dynamic section to patch
pub fn fuse(primary: &NativeModule, secondary: &NativeModule) -> Result<NativeModule> {
    let (common_align, flavor) = check_compatible(primary, secondary)?;
    let class = primary.class();
    let addr_size = class.addr_size();

    if primary.dynamic().is_empty() {
        return Err(malformed_error!(
            "module '{}' has no dynamic section to patch",
            primary.name()
        ));
    }

    let delta = align_up(primary.max_load_end(), common_align)
        - align_down(secondary.min_load_vaddr(), common_align);

    let mut image = primary.image().to_vec();

    // Copy the secondary's loadable segments at congruent file offsets
    let mut copied_loads = Vec::new();
    for ph in secondary.loadable() {
        let vaddr = ph.p_vaddr + delta;
        let offset = congruent_offset(image.len(), vaddr, common_align);
        image.resize(offset, 0);
        let start = ph.p_offset as usize;
        image.extend_from_slice(&secondary.image()[start..start + ph.p_filesz as usize]);
        copied_loads.push(ProgramHeader {
            p_type: PT_LOAD,
            p_flags: ph.p_flags,
            p_offset: offset as u64,
            p_vaddr: vaddr,
            p_paddr: vaddr,
            p_filesz: ph.p_filesz,
            p_memsz: ph.p_memsz,
            p_align: ph.p_align,
        });
    }

    // Merged string/symbol tables: primary entries keep their indices, secondary
    // entries are appended and re-indexed; identical strings are stored once.
    let mut strtab = StrtabBuilder::new();
    let null_symbol = DynSymbol {
        name: String::new(),
        value: 0,
        size: 0,
        info: 0,
        other: 0,
        shndx: 0,
    };
    let mut symbols = vec![null_symbol];
    let mut name_offsets = vec![0u32];
    for sym in primary.symbols().iter().skip(1) {
        name_offsets.push(strtab.offset_of(&sym.name));
        symbols.push(sym.clone());
    }
    for sym in secondary.symbols().iter().skip(1) {
        name_offsets.push(strtab.offset_of(&sym.name));
        let mut sym = sym.clone();
        if sym.is_defined() {
            sym.value += delta;
            sym.shndx = 1;
        }
        symbols.push(sym.clone());
    }
    let primary_sym_count = primary.symbols().len().saturating_sub(1) as u32;

    // Merged relocations: primary's unchanged, secondary's rebased. Base
    // relocation slots in the copied bytes are patched by the same delta so REL
    // images stay self-consistent.
    let mut relocs: Vec<RelocEntry> = primary.relocs().to_vec();
    for r in secondary.relocs() {
        let offset = r.offset + delta;
        let mut addend = r.addend;
        if r.is_relative() {
            addend = addend.map(|a| a + delta as i64);
            if let Some(slot) = segment_offset(&copied_loads, offset, addr_size) {
                patch_slot(&mut image, slot, class, delta);
            }
        }
        let sym = if r.sym == 0 {
            0
        } else {
            primary_sym_count + r.sym
        };
        relocs.push(RelocEntry {
            offset,
            r_type: r.r_type,
            sym,
            addend,
        });
    }

    // Fused initializer order is the contract: primary's array entries, then the
    // secondary's DT_INIT, then the secondary's array entries, all rebased.
    let mut init_entries: Vec<u64> = primary.init_array().to_vec();
    if let Some(init) = secondary.init() {
        init_entries.push(init + delta);
    }
    init_entries.extend(secondary.init_array().iter().map(|v| v + delta));

    // Plan the patched dynamic section before layout so its entry count is known.
    let planned_dynamic = plan_dynamic(
        primary,
        secondary,
        &mut strtab,
        flavor,
        relocs.len() + init_entries.len(),
    )?;

    // Metadata region layout, offsets relative to its base
    let phnum = primary.program_headers().len() + copied_loads.len() + 1;
    let mut cursor = phnum * class.phdr_size();
    cursor = round_up(cursor, 8);
    let init_rel = cursor;
    cursor += init_entries.len() * addr_size;
    cursor = round_up(cursor, 8);
    let sym_rel = cursor;
    cursor += symbols.len() * class.sym_size();
    // dynstr must directly follow dynsym: consumers derive the symbol count from
    // the distance between the two tables
    let str_rel = cursor;
    cursor += strtab.len();
    cursor = round_up(cursor, 8);
    let rel_rel = cursor;
    cursor += (relocs.len() + init_entries.len()) * class.reloc_size(flavor);
    cursor = round_up(cursor, 8);
    let dyn_rel = cursor;
    cursor += planned_dynamic.len() * class.dyn_size();
    let meta_len = cursor;

    let fused_end = copied_loads
        .iter()
        .map(ProgramHeader::vaddr_end)
        .fold(primary.max_load_end(), u64::max);
    let meta_vaddr = align_up(fused_end, common_align);
    let meta_offset = congruent_offset(image.len(), meta_vaddr, common_align);

    let init_vaddr = meta_vaddr + init_rel as u64;
    let sym_vaddr = meta_vaddr + sym_rel as u64;
    let str_vaddr = meta_vaddr + str_rel as u64;
    let rel_vaddr = meta_vaddr + rel_rel as u64;
    let dyn_vaddr = meta_vaddr + dyn_rel as u64;

    // Base relocations for the new init-array slots, so the linker rebases them
    // like any other absolute pointer
    let relative_type = relative_reloc_type(primary, secondary);
    for (i, value) in init_entries.iter().enumerate() {
        relocs.push(RelocEntry {
            offset: init_vaddr + (i * addr_size) as u64,
            r_type: relative_type,
            sym: 0,
            addend: match flavor {
                RelocFlavor::Rela => Some(*value as i64),
                RelocFlavor::Rel => None,
            },
        });
    }

    // Rebuilt program-header table
    let mut phdrs = Vec::with_capacity(phnum);
    for ph in primary.program_headers() {
        let mut ph = *ph;
        match ph.p_type {
            PT_PHDR => {
                ph.p_offset = meta_offset as u64;
                ph.p_vaddr = meta_vaddr;
                ph.p_paddr = meta_vaddr;
                ph.p_filesz = (phnum * class.phdr_size()) as u64;
                ph.p_memsz = ph.p_filesz;
            }
            PT_DYNAMIC => {
                ph.p_offset = (meta_offset + dyn_rel) as u64;
                ph.p_vaddr = dyn_vaddr;
                ph.p_paddr = dyn_vaddr;
                ph.p_filesz = (planned_dynamic.len() * class.dyn_size()) as u64;
                ph.p_memsz = ph.p_filesz;
            }
            _ => {}
        }
        phdrs.push(ph);
    }
    phdrs.extend(copied_loads.iter().copied());
    phdrs.push(ProgramHeader {
        p_type: PT_LOAD,
        p_flags: 6, // R+W, the linker applies relocations into the init array
        p_offset: meta_offset as u64,
        p_vaddr: meta_vaddr,
        p_paddr: meta_vaddr,
        p_filesz: meta_len as u64,
        p_memsz: meta_len as u64,
        p_align: common_align,
    });

    check_disjoint(&phdrs, primary, secondary)?;

    // Serialize the metadata region
    image.resize(meta_offset, 0);
    let mut meta = Vec::with_capacity(meta_len);
    for ph in &phdrs {
        write_phdr(&mut meta, class, ph);
    }
    pad_to(&mut meta, init_rel);
    for value in &init_entries {
        write_addr(&mut meta, class, *value);
    }
    pad_to(&mut meta, sym_rel);
    for (sym, name_off) in symbols.iter().zip(&name_offsets) {
        write_sym(&mut meta, class, *name_off, sym);
    }
    meta.extend_from_slice(strtab.bytes());
    pad_to(&mut meta, rel_rel);
    for r in &relocs {
        write_reloc(&mut meta, class, flavor, r);
    }
    pad_to(&mut meta, dyn_rel);
    for planned in &planned_dynamic {
        let value = match planned.value {
            DynValue::Fixed(v) => v,
            DynValue::InitArray => init_vaddr,
            DynValue::InitArraySz => (init_entries.len() * addr_size) as u64,
            DynValue::Symtab => sym_vaddr,
            DynValue::Syment => class.sym_size() as u64,
            DynValue::Strtab => str_vaddr,
            DynValue::Strsz => strtab.len() as u64,
            DynValue::Reloc => rel_vaddr,
            DynValue::RelocSz => (relocs.len() * class.reloc_size(flavor)) as u64,
            DynValue::RelocEnt => class.reloc_size(flavor) as u64,
        };
        write_dyn(&mut meta, class, planned.tag, value);
    }
    debug_assert_eq!(meta.len(), meta_len);
    image.extend_from_slice(&meta);

    // Section-header table and .shstrtab live after the loadable content
    let sections = build_sections(
        primary,
        secondary,
        delta,
        &copied_loads,
        addr_size,
        class,
        flavor,
        SectionPlacement {
            init_vaddr,
            init_rel: meta_offset + init_rel,
            init_len: init_entries.len() * addr_size,
            sym_vaddr,
            sym_rel: meta_offset + sym_rel,
            sym_len: symbols.len() * class.sym_size(),
            str_vaddr,
            str_rel: meta_offset + str_rel,
            str_len: strtab.len(),
            rel_vaddr,
            rel_rel: meta_offset + rel_rel,
            rel_len: relocs.len() * class.reloc_size(flavor),
            dyn_vaddr,
            dyn_rel: meta_offset + dyn_rel,
            dyn_len: planned_dynamic.len() * class.dyn_size(),
        },
    );

    let mut shstrtab = StrtabBuilder::new();
    let section_names: Vec<u32> = sections
        .iter()
        .map(|sh| shstrtab.offset_of(&sh.name))
        .collect();
    let shstrtab_offset = image.len();
    image.extend_from_slice(shstrtab.bytes());
    let shoff = round_up(image.len(), 8);
    image.resize(shoff, 0);
    for (i, sh) in sections.iter().enumerate() {
        let mut sh = sh.clone();
        if sh.name == ".shstrtab" {
            sh.sh_offset = shstrtab_offset as u64;
            sh.sh_size = shstrtab.len() as u64;
        }
        write_shdr(&mut image, class, section_names[i], &sh);
    }

    let shstrndx = sections.len() - 1;
    patch_ehdr(
        &mut image,
        class,
        meta_offset as u64,
        phnum as u16,
        shoff as u64,
        sections.len() as u16,
        shstrndx as u16,
    );

    tracing::info!(
        primary = %primary.name(),
        secondary = %secondary.name(),
        delta = format_args!("{delta:#x}"),
        initializers = init_entries.len(),
        symbols = symbols.len(),
        relocs = relocs.len(),
        size = image.len(),
        "modules fused"
    );

    NativeModule::from_bytes(
        image,
        format!("{}+{}", primary.name(), secondary.name()),
    )
}

fn check_compatible(
    primary: &NativeModule,
    secondary: &NativeModule,
) -> Result<(u64, RelocFlavor)> {
    let incompatible = |message: String| crate::Error::Alignment {
        primary: primary.name().to_string(),
        secondary: secondary.name().to_string(),
        message,
    };

    if primary.class() != secondary.class() {
        return Err(incompatible("differing ELF classes".to_string()));
    }
    if primary.machine() != secondary.machine() {
        return Err(incompatible(format!(
            "differing target machines ({} vs {})",
            primary.machine(),
            secondary.machine()
        )));
    }

    let common_align = primary.page_align().max(secondary.page_align());
    if common_align == 0 || !common_align.is_power_of_two() {
        return Err(incompatible(format!(
            "unusable common load alignment {common_align:#x}"
        )));
    }

    let flavor = match (primary.reloc_flavor(), secondary.reloc_flavor()) {
        (Some(a), Some(b)) if a != b => return Err(crate::Error::NotSupported),
        (Some(f), _) | (_, Some(f)) => f,
        (None, None) => RelocFlavor::Rela,
    };

    Ok((common_align, flavor))
}

fn check_disjoint(
    phdrs: &[ProgramHeader],
    primary: &NativeModule,
    secondary: &NativeModule,
) -> Result<()> {
    let loads: Vec<&ProgramHeader> = phdrs.iter().filter(|ph| ph.is_load()).collect();
    for (i, a) in loads.iter().enumerate() {
        for b in &loads[i + 1..] {
            if a.p_vaddr < b.vaddr_end() && b.p_vaddr < a.vaddr_end() {
                return Err(crate::Error::Overlap {
                    primary: primary.name().to_string(),
                    secondary: secondary.name().to_string(),
                    message: format!(
                        "{:#x}..{:#x} overlaps {:#x}..{:#x}",
                        a.p_vaddr,
                        a.vaddr_end(),
                        b.p_vaddr,
                        b.vaddr_end()
                    ),
                });
            }
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
enum DynValue {
    Fixed(u64),
    InitArray,
    InitArraySz,
    Symtab,
    Syment,
    Strtab,
    Strsz,
    Reloc,
    RelocSz,
    RelocEnt,
}

#[derive(Debug, Clone, Copy)]
struct PlannedDyn {
    tag: u64,
    value: DynValue,
}

/// Plan the fused dynamic section: the primary's entries with table pointers
/// repointed at the merged tables, string-valued entries remapped into the merged
/// string table, the secondary's DT_NEEDED dependencies appended, and any table
/// tag the merge requires but the primary lacked added before the terminator.
fn plan_dynamic(
    primary: &NativeModule,
    secondary: &NativeModule,
    strtab: &mut StrtabBuilder,
    flavor: RelocFlavor,
    reloc_count: usize,
) -> Result<Vec<PlannedDyn>> {
    let (reloc_tag, reloc_sz_tag, reloc_ent_tag) = match flavor {
        RelocFlavor::Rela => (DT_RELA, DT_RELASZ, DT_RELAENT),
        RelocFlavor::Rel => (DT_REL, DT_RELSZ, DT_RELENT),
    };
    let dropped = |tag: u64| {
        matches!(
            tag,
            DT_RELACOUNT | DT_RELCOUNT | DT_VERSYM | DT_VERDEF | DT_VERDEFNUM | DT_VERNEED
                | DT_VERNEEDNUM
        ) || (flavor == RelocFlavor::Rela && matches!(tag, DT_REL | DT_RELSZ | DT_RELENT))
            || (flavor == RelocFlavor::Rel && matches!(tag, DT_RELA | DT_RELASZ | DT_RELAENT))
    };

    let mut planned = Vec::new();
    let mut needed_names = Vec::new();
    for entry in primary.dynamic() {
        if entry.tag == DT_NULL {
            break;
        }
        if dropped(entry.tag) {
            continue;
        }
        let value = match entry.tag {
            DT_INIT_ARRAY => DynValue::InitArray,
            DT_INIT_ARRAYSZ => DynValue::InitArraySz,
            DT_SYMTAB => DynValue::Symtab,
            DT_SYMENT => DynValue::Syment,
            DT_STRTAB => DynValue::Strtab,
            DT_STRSZ => DynValue::Strsz,
            t if t == reloc_tag => DynValue::Reloc,
            t if t == reloc_sz_tag => DynValue::RelocSz,
            t if t == reloc_ent_tag => DynValue::RelocEnt,
            DT_NEEDED | DT_SONAME | DT_RPATH | DT_RUNPATH => {
                let name = dynstr_string(primary, entry.value).ok_or_else(|| {
                    malformed_error!(
                        "module '{}': dynamic tag {:#x} references a string outside .dynstr",
                        primary.name(),
                        entry.tag
                    )
                })?;
                if entry.tag == DT_NEEDED {
                    needed_names.push(name.clone());
                }
                DynValue::Fixed(u64::from(strtab.offset_of(&name)))
            }
            _ => DynValue::Fixed(entry.value),
        };
        planned.push(PlannedDyn {
            tag: entry.tag,
            value,
        });
    }

    // The secondary's dependencies become the fused module's dependencies too
    for entry in secondary.dynamic() {
        if entry.tag != DT_NEEDED {
            continue;
        }
        let Some(name) = dynstr_string(secondary, entry.value) else {
            continue;
        };
        if needed_names.contains(&name) {
            continue;
        }
        needed_names.push(name.clone());
        planned.push(PlannedDyn {
            tag: DT_NEEDED,
            value: DynValue::Fixed(u64::from(strtab.offset_of(&name))),
        });
    }

    let mut required = vec![
        (DT_INIT_ARRAY, DynValue::InitArray),
        (DT_INIT_ARRAYSZ, DynValue::InitArraySz),
        (DT_SYMTAB, DynValue::Symtab),
        (DT_SYMENT, DynValue::Syment),
        (DT_STRTAB, DynValue::Strtab),
        (DT_STRSZ, DynValue::Strsz),
    ];
    if reloc_count > 0 {
        required.push((reloc_tag, DynValue::Reloc));
        required.push((reloc_sz_tag, DynValue::RelocSz));
        required.push((reloc_ent_tag, DynValue::RelocEnt));
    }
    for (tag, value) in required {
        if !planned.iter().any(|p| p.tag == tag) {
            planned.push(PlannedDyn { tag, value });
        }
    }

    planned.push(PlannedDyn {
        tag: DT_NULL,
        value: DynValue::Fixed(0),
    });
    Ok(planned)
}

/// Resolve a dynamic-entry string value out of a module's own `.dynstr`.
fn dynstr_string(module: &NativeModule, offset: u64) -> Option<String> {
    let strtab_vaddr = module
        .dynamic()
        .iter()
        .find(|d| d.tag == DT_STRTAB)?
        .value;
    let file_off = module.vaddr_to_offset(strtab_vaddr + offset)?;
    let bytes = &module.image()[file_off..];
    let end = bytes.iter().position(|b| *b == 0)?;
    Some(String::from_utf8_lossy(&bytes[..end]).into_owned())
}

/// Prefer the base-relocation type both inputs already use; fall back to the
/// machine's standard one.
fn relative_reloc_type(primary: &NativeModule, secondary: &NativeModule) -> u32 {
    for module in [primary, secondary] {
        if let Some(r) = module.relocs().iter().find(|r| r.is_relative()) {
            return r.r_type;
        }
    }
    match primary.machine() {
        183 => 1027, // R_AARCH64_RELATIVE
        40 => 23,    // R_ARM_RELATIVE
        _ => 8,      // R_X86_64_RELATIVE / R_386_RELATIVE
    }
}

struct SectionPlacement {
    init_vaddr: u64,
    init_rel: usize,
    init_len: usize,
    sym_vaddr: u64,
    sym_rel: usize,
    sym_len: usize,
    str_vaddr: u64,
    str_rel: usize,
    str_len: usize,
    rel_vaddr: u64,
    rel_rel: usize,
    rel_len: usize,
    dyn_vaddr: u64,
    dyn_rel: usize,
    dyn_len: usize,
}

/// Rebuild the section table: the primary's allocatable sections kept, the
/// secondary's rebased, the dynamic-linking sections regenerated to describe the
/// merged tables, and a fresh `.shstrtab` last.
#[allow(clippy::too_many_arguments)]
fn build_sections(
    primary: &NativeModule,
    secondary: &NativeModule,
    delta: u64,
    copied_loads: &[ProgramHeader],
    addr_size: usize,
    class: ElfClass,
    flavor: RelocFlavor,
    placement: SectionPlacement,
) -> Vec<SectionHeader> {
    let regenerated = |sh: &SectionHeader| {
        matches!(
            sh.sh_type,
            SHT_DYNSYM | SHT_DYNAMIC | SHT_RELA | SHT_REL | SHT_INIT_ARRAY
        ) || sh.sh_type == SHT_STRTAB
    };

    let mut sections = vec![SectionHeader {
        name: String::new(),
        sh_type: 0,
        sh_flags: 0,
        sh_addr: 0,
        sh_offset: 0,
        sh_size: 0,
        sh_link: 0,
        sh_info: 0,
        sh_addralign: 0,
        sh_entsize: 0,
    }];

    for sh in primary.section_headers().iter().skip(1) {
        if sh.sh_flags & u64::from(SHF_ALLOC) == 0 || regenerated(sh) {
            continue;
        }
        sections.push(sh.clone());
    }
    for sh in secondary.section_headers().iter().skip(1) {
        if sh.sh_flags & u64::from(SHF_ALLOC) == 0 || regenerated(sh) {
            continue;
        }
        let mut sh = sh.clone();
        sh.sh_addr += delta;
        sh.sh_offset = segment_offset(copied_loads, sh.sh_addr, addr_size)
            .map(|off| off as u64)
            .unwrap_or(0);
        sh.sh_link = 0;
        sh.sh_info = 0;
        sections.push(sh.clone());
    }

    let dynsym_idx = (sections.len() + 1) as u32;
    let dynstr_idx = (sections.len() + 2) as u32;
    sections.push(SectionHeader {
        name: ".init_array".to_string(),
        sh_type: SHT_INIT_ARRAY,
        sh_flags: u64::from(SHF_ALLOC | SHF_WRITE),
        sh_addr: placement.init_vaddr,
        sh_offset: placement.init_rel as u64,
        sh_size: placement.init_len as u64,
        sh_link: 0,
        sh_info: 0,
        sh_addralign: addr_size as u64,
        sh_entsize: addr_size as u64,
    });
    sections.push(SectionHeader {
        name: ".dynsym".to_string(),
        sh_type: SHT_DYNSYM,
        sh_flags: u64::from(SHF_ALLOC),
        sh_addr: placement.sym_vaddr,
        sh_offset: placement.sym_rel as u64,
        sh_size: placement.sym_len as u64,
        sh_link: dynstr_idx,
        sh_info: 1,
        sh_addralign: addr_size as u64,
        sh_entsize: class.sym_size() as u64,
    });
    sections.push(SectionHeader {
        name: ".dynstr".to_string(),
        sh_type: SHT_STRTAB,
        sh_flags: u64::from(SHF_ALLOC),
        sh_addr: placement.str_vaddr,
        sh_offset: placement.str_rel as u64,
        sh_size: placement.str_len as u64,
        sh_link: 0,
        sh_info: 0,
        sh_addralign: 1,
        sh_entsize: 0,
    });
    sections.push(SectionHeader {
        name: match flavor {
            RelocFlavor::Rela => ".rela.dyn".to_string(),
            RelocFlavor::Rel => ".rel.dyn".to_string(),
        },
        sh_type: match flavor {
            RelocFlavor::Rela => SHT_RELA,
            RelocFlavor::Rel => SHT_REL,
        },
        sh_flags: u64::from(SHF_ALLOC),
        sh_addr: placement.rel_vaddr,
        sh_offset: placement.rel_rel as u64,
        sh_size: placement.rel_len as u64,
        sh_link: dynsym_idx,
        sh_info: 0,
        sh_addralign: addr_size as u64,
        sh_entsize: class.reloc_size(flavor) as u64,
    });
    sections.push(SectionHeader {
        name: ".dynamic".to_string(),
        sh_type: SHT_DYNAMIC,
        sh_flags: u64::from(SHF_ALLOC | SHF_WRITE),
        sh_addr: placement.dyn_vaddr,
        sh_offset: placement.dyn_rel as u64,
        sh_size: placement.dyn_len as u64,
        sh_link: dynstr_idx,
        sh_info: 0,
        sh_addralign: addr_size as u64,
        sh_entsize: class.dyn_size() as u64,
    });
    sections.push(SectionHeader {
        name: ".shstrtab".to_string(),
        sh_type: SHT_STRTAB,
        sh_flags: 0,
        sh_addr: 0,
        sh_offset: 0, // filled in at serialization time
        sh_size: 0,
        sh_link: 0,
        sh_info: 0,
        sh_addralign: 1,
        sh_entsize: 0,
    });

    sections
}

/// Byte-exact-deduplicating string table builder. Offset 0 is the leading NUL.
struct StrtabBuilder {
    bytes: Vec<u8>,
    offsets: HashMap<String, u32>,
}

impl StrtabBuilder {
    fn new() -> StrtabBuilder {
        StrtabBuilder {
            bytes: vec![0],
            offsets: HashMap::new(),
        }
    }

    fn offset_of(&mut self, name: &str) -> u32 {
        if name.is_empty() {
            return 0;
        }
        if let Some(offset) = self.offsets.get(name) {
            return *offset;
        }
        let offset = self.bytes.len() as u32;
        self.bytes.extend_from_slice(name.as_bytes());
        self.bytes.push(0);
        self.offsets.insert(name.to_string(), offset);
        offset
    }

    fn len(&self) -> usize {
        self.bytes.len()
    }

    fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

fn align_down(value: u64, align: u64) -> u64 {
    value & !(align - 1)
}

fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Smallest file offset at or past `current` that is congruent to `vaddr` modulo
/// the load alignment.
fn congruent_offset(current: usize, vaddr: u64, align: u64) -> usize {
    let align = align as usize;
    let want = (vaddr % align as u64) as usize;
    current + (align + want - current % align) % align
}

/// File offset of the pointer-sized slot at `vaddr` within the copied segments.
fn segment_offset(loads: &[ProgramHeader], vaddr: u64, addr_size: usize) -> Option<usize> {
    loads
        .iter()
        .find(|ph| vaddr >= ph.p_vaddr && vaddr + addr_size as u64 <= ph.p_vaddr + ph.p_filesz)
        .map(|ph| (ph.p_offset + (vaddr - ph.p_vaddr)) as usize)
}

fn patch_slot(image: &mut [u8], offset: usize, class: ElfClass, delta: u64) {
    match class {
        ElfClass::Elf32 => {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&image[offset..offset + 4]);
            let value = u32::from_le_bytes(bytes).wrapping_add(delta as u32);
            image[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        }
        ElfClass::Elf64 => {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&image[offset..offset + 8]);
            let value = u64::from_le_bytes(bytes).wrapping_add(delta);
            image[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
        }
    }
}

fn pad_to(buf: &mut Vec<u8>, len: usize) {
    debug_assert!(buf.len() <= len);
    buf.resize(len, 0);
}

fn write_addr(out: &mut Vec<u8>, class: ElfClass, value: u64) {
    match class {
        ElfClass::Elf32 => out.extend_from_slice(&(value as u32).to_le_bytes()),
        ElfClass::Elf64 => out.extend_from_slice(&value.to_le_bytes()),
    }
}

fn write_phdr(out: &mut Vec<u8>, class: ElfClass, ph: &ProgramHeader) {
    match class {
        ElfClass::Elf32 => {
            out.extend_from_slice(&ph.p_type.to_le_bytes());
            out.extend_from_slice(&(ph.p_offset as u32).to_le_bytes());
            out.extend_from_slice(&(ph.p_vaddr as u32).to_le_bytes());
            out.extend_from_slice(&(ph.p_paddr as u32).to_le_bytes());
            out.extend_from_slice(&(ph.p_filesz as u32).to_le_bytes());
            out.extend_from_slice(&(ph.p_memsz as u32).to_le_bytes());
            out.extend_from_slice(&ph.p_flags.to_le_bytes());
            out.extend_from_slice(&(ph.p_align as u32).to_le_bytes());
        }
        ElfClass::Elf64 => {
            out.extend_from_slice(&ph.p_type.to_le_bytes());
            out.extend_from_slice(&ph.p_flags.to_le_bytes());
            out.extend_from_slice(&ph.p_offset.to_le_bytes());
            out.extend_from_slice(&ph.p_vaddr.to_le_bytes());
            out.extend_from_slice(&ph.p_paddr.to_le_bytes());
            out.extend_from_slice(&ph.p_filesz.to_le_bytes());
            out.extend_from_slice(&ph.p_memsz.to_le_bytes());
            out.extend_from_slice(&ph.p_align.to_le_bytes());
        }
    }
}

fn write_shdr(out: &mut Vec<u8>, class: ElfClass, name_off: u32, sh: &SectionHeader) {
    match class {
        ElfClass::Elf32 => {
            out.extend_from_slice(&name_off.to_le_bytes());
            out.extend_from_slice(&sh.sh_type.to_le_bytes());
            out.extend_from_slice(&(sh.sh_flags as u32).to_le_bytes());
            out.extend_from_slice(&(sh.sh_addr as u32).to_le_bytes());
            out.extend_from_slice(&(sh.sh_offset as u32).to_le_bytes());
            out.extend_from_slice(&(sh.sh_size as u32).to_le_bytes());
            out.extend_from_slice(&sh.sh_link.to_le_bytes());
            out.extend_from_slice(&sh.sh_info.to_le_bytes());
            out.extend_from_slice(&(sh.sh_addralign as u32).to_le_bytes());
            out.extend_from_slice(&(sh.sh_entsize as u32).to_le_bytes());
        }
        ElfClass::Elf64 => {
            out.extend_from_slice(&name_off.to_le_bytes());
            out.extend_from_slice(&sh.sh_type.to_le_bytes());
            out.extend_from_slice(&sh.sh_flags.to_le_bytes());
            out.extend_from_slice(&sh.sh_addr.to_le_bytes());
            out.extend_from_slice(&sh.sh_offset.to_le_bytes());
            out.extend_from_slice(&sh.sh_size.to_le_bytes());
            out.extend_from_slice(&sh.sh_link.to_le_bytes());
            out.extend_from_slice(&sh.sh_info.to_le_bytes());
            out.extend_from_slice(&sh.sh_addralign.to_le_bytes());
            out.extend_from_slice(&sh.sh_entsize.to_le_bytes());
        }
    }
}

fn write_dyn(out: &mut Vec<u8>, class: ElfClass, tag: u64, value: u64) {
    match class {
        ElfClass::Elf32 => {
            out.extend_from_slice(&(tag as u32).to_le_bytes());
            out.extend_from_slice(&(value as u32).to_le_bytes());
        }
        ElfClass::Elf64 => {
            out.extend_from_slice(&tag.to_le_bytes());
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
}

fn write_sym(out: &mut Vec<u8>, class: ElfClass, name_off: u32, sym: &DynSymbol) {
    match class {
        ElfClass::Elf32 => {
            out.extend_from_slice(&name_off.to_le_bytes());
            out.extend_from_slice(&(sym.value as u32).to_le_bytes());
            out.extend_from_slice(&(sym.size as u32).to_le_bytes());
            out.push(sym.info);
            out.push(sym.other);
            out.extend_from_slice(&sym.shndx.to_le_bytes());
        }
        ElfClass::Elf64 => {
            out.extend_from_slice(&name_off.to_le_bytes());
            out.push(sym.info);
            out.push(sym.other);
            out.extend_from_slice(&sym.shndx.to_le_bytes());
            out.extend_from_slice(&sym.value.to_le_bytes());
            out.extend_from_slice(&sym.size.to_le_bytes());
        }
    }
}

fn write_reloc(out: &mut Vec<u8>, class: ElfClass, flavor: RelocFlavor, r: &RelocEntry) {
    match class {
        ElfClass::Elf32 => {
            out.extend_from_slice(&(r.offset as u32).to_le_bytes());
            let info = (r.sym << 8) | (r.r_type & 0xff);
            out.extend_from_slice(&info.to_le_bytes());
            if flavor == RelocFlavor::Rela {
                out.extend_from_slice(&(r.addend.unwrap_or(0) as i32).to_le_bytes());
            }
        }
        ElfClass::Elf64 => {
            out.extend_from_slice(&r.offset.to_le_bytes());
            let info = (u64::from(r.sym) << 32) | u64::from(r.r_type);
            out.extend_from_slice(&info.to_le_bytes());
            if flavor == RelocFlavor::Rela {
                out.extend_from_slice(&r.addend.unwrap_or(0).to_le_bytes());
            }
        }
    }
}

fn patch_ehdr(
    image: &mut [u8],
    class: ElfClass,
    phoff: u64,
    phnum: u16,
    shoff: u64,
    shnum: u16,
    shstrndx: u16,
) {
    match class {
        ElfClass::Elf32 => {
            image[28..32].copy_from_slice(&(phoff as u32).to_le_bytes());
            image[32..36].copy_from_slice(&(shoff as u32).to_le_bytes());
            image[44..46].copy_from_slice(&phnum.to_le_bytes());
            image[48..50].copy_from_slice(&shnum.to_le_bytes());
            image[50..52].copy_from_slice(&shstrndx.to_le_bytes());
        }
        ElfClass::Elf64 => {
            image[32..40].copy_from_slice(&phoff.to_le_bytes());
            image[40..48].copy_from_slice(&shoff.to_le_bytes());
            image[56..58].copy_from_slice(&phnum.to_le_bytes());
            image[60..62].copy_from_slice(&shnum.to_le_bytes());
            image[62..64].copy_from_slice(&shstrndx.to_le_bytes());
        }
    }
}
