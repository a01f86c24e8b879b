//! Owned structural model of one compiled native module.
//!
//! `goblin` does the raw structure walk; everything the fusion pass needs is then
//! copied into owned values (headers, dynamic entries, symbols with resolved
//! names, relocations, decoded initializer pointers) together with the full image
//! bytes. Validation happens at parse time so fusion can assume both inputs are
//! internally consistent.

use std::path::Path;

use goblin::elf::{
    dynamic::{
        DT_INIT, DT_INIT_ARRAY, DT_INIT_ARRAYSZ, DT_REL, DT_RELA, DT_RELASZ, DT_RELSZ,
    },
    program_header::{PT_DYNAMIC, PT_LOAD, PT_PHDR},
    Elf,
};

use crate::{file::File, Result};

/// ELF file class of a module. Only little-endian modules of either class are
/// supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfClass {
    /// 32-bit
    Elf32,
    /// 64-bit
    Elf64,
}

impl ElfClass {
    /// Size of one virtual address / pointer in bytes.
    #[must_use]
    pub fn addr_size(self) -> usize {
        match self {
            ElfClass::Elf32 => 4,
            ElfClass::Elf64 => 8,
        }
    }

    /// Size of one program header table entry.
    #[must_use]
    pub fn phdr_size(self) -> usize {
        match self {
            ElfClass::Elf32 => 32,
            ElfClass::Elf64 => 56,
        }
    }

    /// Size of one section header table entry.
    #[must_use]
    pub fn shdr_size(self) -> usize {
        match self {
            ElfClass::Elf32 => 40,
            ElfClass::Elf64 => 64,
        }
    }

    /// Size of one dynamic table entry.
    #[must_use]
    pub fn dyn_size(self) -> usize {
        match self {
            ElfClass::Elf32 => 8,
            ElfClass::Elf64 => 16,
        }
    }

    /// Size of one dynamic symbol table entry.
    #[must_use]
    pub fn sym_size(self) -> usize {
        match self {
            ElfClass::Elf32 => 16,
            ElfClass::Elf64 => 24,
        }
    }

    /// Size of one relocation entry of the given flavor.
    #[must_use]
    pub fn reloc_size(self, flavor: RelocFlavor) -> usize {
        match (self, flavor) {
            (ElfClass::Elf32, RelocFlavor::Rel) => 8,
            (ElfClass::Elf32, RelocFlavor::Rela) => 12,
            (ElfClass::Elf64, RelocFlavor::Rel) => 16,
            (ElfClass::Elf64, RelocFlavor::Rela) => 24,
        }
    }
}

/// Whether a module's dynamic relocations carry explicit addends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocFlavor {
    /// Implicit addends stored in the relocated slot (`.rel.dyn`)
    Rel,
    /// Explicit addends in the entry (`.rela.dyn`)
    Rela,
}

/// One program header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramHeader {
    /// Segment type (PT_LOAD, PT_DYNAMIC, ...)
    pub p_type: u32,
    /// Permission flags
    pub p_flags: u32,
    /// File offset of the segment's bytes
    pub p_offset: u64,
    /// Virtual load address
    pub p_vaddr: u64,
    /// Physical address (mirrors `p_vaddr` here)
    pub p_paddr: u64,
    /// Size of the file-backed part
    pub p_filesz: u64,
    /// Size in memory, at least `p_filesz`
    pub p_memsz: u64,
    /// Required load alignment
    pub p_align: u64,
}

impl ProgramHeader {
    /// End of the segment's virtual-address range. Saturating; segments that
    /// would wrap the address space are rejected at parse validation.
    #[must_use]
    pub fn vaddr_end(&self) -> u64 {
        self.p_vaddr.saturating_add(self.p_memsz)
    }

    /// True when the segment is mapped by the loader.
    #[must_use]
    pub fn is_load(&self) -> bool {
        self.p_type == PT_LOAD
    }
}

/// One section header, with its name resolved out of `.shstrtab`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionHeader {
    /// Section name, resolved from the section name string table
    pub name: String,
    /// Section type (SHT_PROGBITS, SHT_DYNSYM, ...)
    pub sh_type: u32,
    /// Flags (SHF_ALLOC, SHF_WRITE, ...)
    pub sh_flags: u64,
    /// Virtual address for allocatable sections, 0 otherwise
    pub sh_addr: u64,
    /// File offset of the section's bytes
    pub sh_offset: u64,
    /// Section size in bytes
    pub sh_size: u64,
    /// Type-specific linked section index
    pub sh_link: u32,
    /// Type-specific extra information
    pub sh_info: u32,
    /// Required alignment
    pub sh_addralign: u64,
    /// Entry size for table-like sections
    pub sh_entsize: u64,
}

/// One dynamic-section entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DynEntry {
    /// DT_ tag
    pub tag: u64,
    /// Tag-specific value or address
    pub value: u64,
}

/// One dynamic symbol, with its name resolved out of `.dynstr`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynSymbol {
    /// Symbol name
    pub name: String,
    /// Symbol value, a virtual address for defined symbols
    pub value: u64,
    /// Symbol size in bytes
    pub size: u64,
    /// Binding and type byte
    pub info: u8,
    /// Visibility byte
    pub other: u8,
    /// Defining section index, 0 for undefined symbols
    pub shndx: u16,
}

impl DynSymbol {
    /// True for symbols defined by this module, as opposed to imports.
    #[must_use]
    pub fn is_defined(&self) -> bool {
        self.shndx != 0
    }
}

/// One dynamic relocation entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocEntry {
    /// Virtual address of the slot being fixed up
    pub offset: u64,
    /// Machine-specific relocation type
    pub r_type: u32,
    /// Index into the dynamic symbol table, 0 for base relocations
    pub sym: u32,
    /// Explicit addend for RELA modules
    pub addend: Option<i64>,
}

impl RelocEntry {
    /// True for base relocations, whose target is the load base plus an addend
    /// rather than a symbol.
    #[must_use]
    pub fn is_relative(&self) -> bool {
        self.sym == 0
    }
}

/// Owned model of one compiled native module.
///
/// Invariants established at parse time: little-endian, every PT_LOAD lies within
/// the file, loadable virtual-address ranges are pairwise disjoint, and every
/// entry/initializer pointer lands inside a loadable segment. The fusion pass
/// relies on these rather than re-checking its inputs.
#[derive(Debug, Clone)]
pub struct NativeModule {
    name: String,
    image: Vec<u8>,
    class: ElfClass,
    machine: u16,
    flags: u32,
    entry: u64,
    program_headers: Vec<ProgramHeader>,
    section_headers: Vec<SectionHeader>,
    dynamic: Vec<DynEntry>,
    symbols: Vec<DynSymbol>,
    relocs: Vec<RelocEntry>,
    reloc_flavor: Option<RelocFlavor>,
    init: Option<u64>,
    init_array: Vec<u64>,
}

impl NativeModule {
    /// Load and parse a module from disk. The file name becomes the module's
    /// identity in fusion errors.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::FileError`] on I/O faults and the parse errors of
    /// [`NativeModule::from_bytes`].
    pub fn from_file(path: &Path) -> Result<NativeModule> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let file = File::from_file(path)?;
        Self::from_bytes(file.data().to_vec(), name)
    }

    /// Parse a module from an in-memory image.
    ///
    /// # Errors
    ///
    /// - [`crate::Error::GoblinErr`] if the image is not valid ELF
    /// - [`crate::Error::NotSupported`] for big-endian modules
    /// - [`crate::Error::Malformed`] for out-of-bounds or overlapping loadable
    ///   segments, or initializer pointers outside every loadable segment
    pub fn from_bytes(image: Vec<u8>, name: impl Into<String>) -> Result<NativeModule> {
        let name = name.into();
        let elf = Elf::parse(&image)?;

        if !elf.little_endian {
            return Err(crate::Error::NotSupported);
        }
        let class = if elf.is_64 {
            ElfClass::Elf64
        } else {
            ElfClass::Elf32
        };

        let program_headers: Vec<ProgramHeader> = elf
            .program_headers
            .iter()
            .map(|ph| ProgramHeader {
                p_type: ph.p_type,
                p_flags: ph.p_flags,
                p_offset: ph.p_offset,
                p_vaddr: ph.p_vaddr,
                p_paddr: ph.p_paddr,
                p_filesz: ph.p_filesz,
                p_memsz: ph.p_memsz,
                p_align: ph.p_align,
            })
            .collect();

        let section_headers: Vec<SectionHeader> = elf
            .section_headers
            .iter()
            .map(|sh| SectionHeader {
                name: elf
                    .shdr_strtab
                    .get_at(sh.sh_name)
                    .unwrap_or_default()
                    .to_string(),
                sh_type: sh.sh_type,
                sh_flags: sh.sh_flags,
                sh_addr: sh.sh_addr,
                sh_offset: sh.sh_offset,
                sh_size: sh.sh_size,
                sh_link: sh.sh_link,
                sh_info: sh.sh_info,
                sh_addralign: sh.sh_addralign,
                sh_entsize: sh.sh_entsize,
            })
            .collect();

        let mut dynamic = Vec::new();
        let mut init = None;
        let mut init_array_ptr = None;
        let mut init_array_size = 0u64;
        if let Some(dyns) = &elf.dynamic {
            for d in &dyns.dyns {
                dynamic.push(DynEntry {
                    tag: d.d_tag,
                    value: d.d_val,
                });
                match d.d_tag {
                    DT_INIT if d.d_val != 0 => init = Some(d.d_val),
                    DT_INIT_ARRAY => init_array_ptr = Some(d.d_val),
                    DT_INIT_ARRAYSZ => init_array_size = d.d_val,
                    _ => {}
                }
            }
        }

        let symbols: Vec<DynSymbol> = elf
            .dynsyms
            .iter()
            .map(|sym| DynSymbol {
                name: elf
                    .dynstrtab
                    .get_at(sym.st_name)
                    .unwrap_or_default()
                    .to_string(),
                value: sym.st_value,
                size: sym.st_size,
                info: sym.st_info,
                other: sym.st_other,
                shndx: sym.st_shndx as u16,
            })
            .collect();

        let has_rela = dynamic
            .iter()
            .any(|d| d.tag == DT_RELA && d.value != 0)
            && dynamic.iter().any(|d| d.tag == DT_RELASZ && d.value != 0);
        let has_rel = dynamic.iter().any(|d| d.tag == DT_REL && d.value != 0)
            && dynamic.iter().any(|d| d.tag == DT_RELSZ && d.value != 0);
        let reloc_flavor = match (has_rela, has_rel) {
            (true, _) => Some(RelocFlavor::Rela),
            (false, true) => Some(RelocFlavor::Rel),
            (false, false) => None,
        };
        let mut relocs = Vec::new();
        for r in elf.dynrelas.iter().chain(elf.dynrels.iter()) {
            relocs.push(RelocEntry {
                offset: r.r_offset,
                r_type: r.r_type,
                sym: r.r_sym as u32,
                addend: r.r_addend,
            });
        }

        let machine = elf.header.e_machine;
        let flags = elf.header.e_flags;
        let entry = elf.header.e_entry;
        drop(elf);

        let mut module = NativeModule {
            name,
            image,
            class,
            machine,
            flags,
            entry,
            program_headers,
            section_headers,
            dynamic,
            symbols,
            relocs,
            reloc_flavor,
            init,
            init_array: Vec::new(),
        };
        module.init_array = module.decode_init_array(init_array_ptr, init_array_size)?;
        module.validate()?;

        tracing::debug!(
            module = %module.name,
            machine = module.machine,
            loads = module.loadable().count(),
            symbols = module.symbols.len(),
            relocs = module.relocs.len(),
            initializers = module.init.iter().count() + module.init_array.len(),
            "native module parsed"
        );
        Ok(module)
    }

    fn decode_init_array(&self, ptr: Option<u64>, size: u64) -> Result<Vec<u64>> {
        let Some(vaddr) = ptr else {
            return Ok(Vec::new());
        };
        let addr_size = self.class.addr_size();
        if size as usize % addr_size != 0 {
            return Err(malformed_error!(
                "module '{}': init array size {size:#x} is not pointer aligned",
                self.name
            ));
        }

        let offset = self.vaddr_to_offset(vaddr).ok_or_else(|| {
            malformed_error!(
                "module '{}': init array at {vaddr:#x} outside every loadable segment",
                self.name
            )
        })?;
        let end = offset
            .checked_add(size as usize)
            .filter(|end| *end <= self.image.len())
            .ok_or(crate::Error::OutOfBounds)?;

        let mut entries = Vec::with_capacity(size as usize / addr_size);
        for chunk in self.image[offset..end].chunks_exact(addr_size) {
            let value = match self.class {
                ElfClass::Elf32 => u64::from(u32::from_le_bytes([
                    chunk[0], chunk[1], chunk[2], chunk[3],
                ])),
                ElfClass::Elf64 => u64::from_le_bytes([
                    chunk[0], chunk[1], chunk[2], chunk[3], chunk[4], chunk[5], chunk[6],
                    chunk[7],
                ]),
            };
            // Zero and -1 entries are linker-inserted placeholders, not initializers
            if value != 0 && value != u64::MAX && !(self.class == ElfClass::Elf32 && value == u64::from(u32::MAX)) {
                entries.push(value);
            }
        }
        Ok(entries)
    }

    fn validate(&self) -> Result<()> {
        let loads: Vec<&ProgramHeader> = self.loadable().collect();
        for ph in &loads {
            let end = ph
                .p_offset
                .checked_add(ph.p_filesz)
                .ok_or(crate::Error::OutOfBounds)?;
            if end > self.image.len() as u64 {
                return Err(malformed_error!(
                    "module '{}': loadable segment at {:#x} extends past end of file",
                    self.name,
                    ph.p_offset
                ));
            }
            if ph.p_memsz < ph.p_filesz {
                return Err(malformed_error!(
                    "module '{}': segment at {:#x} has memsz < filesz",
                    self.name,
                    ph.p_vaddr
                ));
            }
            if ph.p_vaddr.checked_add(ph.p_memsz).is_none() {
                return Err(malformed_error!(
                    "module '{}': segment at {:#x} wraps the virtual address space",
                    self.name,
                    ph.p_vaddr
                ));
            }
        }

        for (i, a) in loads.iter().enumerate() {
            for b in &loads[i + 1..] {
                if a.p_vaddr < b.vaddr_end() && b.p_vaddr < a.vaddr_end() {
                    return Err(malformed_error!(
                        "module '{}': loadable segments {:#x}..{:#x} and {:#x}..{:#x} overlap",
                        self.name,
                        a.p_vaddr,
                        a.vaddr_end(),
                        b.p_vaddr,
                        b.vaddr_end()
                    ));
                }
            }
        }

        let mut pointers = Vec::new();
        if self.entry != 0 {
            pointers.push(("entry point", self.entry));
        }
        if let Some(init) = self.init {
            pointers.push(("initializer", init));
        }
        for ptr in &self.init_array {
            pointers.push(("init array entry", *ptr));
        }
        for (what, vaddr) in pointers {
            if !loads
                .iter()
                .any(|ph| vaddr >= ph.p_vaddr && vaddr < ph.vaddr_end())
            {
                return Err(malformed_error!(
                    "module '{}': {what} {vaddr:#x} outside every loadable segment",
                    self.name
                ));
            }
        }
        Ok(())
    }

    /// Module identity used in diagnostics and fusion errors.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The complete file image.
    #[must_use]
    pub fn image(&self) -> &[u8] {
        &self.image
    }

    /// ELF class (32 or 64 bit).
    #[must_use]
    pub fn class(&self) -> ElfClass {
        self.class
    }

    /// Target machine id from the ELF header.
    #[must_use]
    pub fn machine(&self) -> u16 {
        self.machine
    }

    /// Processor-specific flags from the ELF header.
    #[must_use]
    pub fn flags(&self) -> u32 {
        self.flags
    }

    /// Entry point address, 0 when none.
    #[must_use]
    pub fn entry(&self) -> u64 {
        self.entry
    }

    /// All program headers in table order.
    #[must_use]
    pub fn program_headers(&self) -> &[ProgramHeader] {
        &self.program_headers
    }

    /// All section headers in table order.
    #[must_use]
    pub fn section_headers(&self) -> &[SectionHeader] {
        &self.section_headers
    }

    /// Dynamic-section entries in table order, including the terminating DT_NULL.
    #[must_use]
    pub fn dynamic(&self) -> &[DynEntry] {
        &self.dynamic
    }

    /// Dynamic symbols in table order; index 0 is the null symbol.
    #[must_use]
    pub fn symbols(&self) -> &[DynSymbol] {
        &self.symbols
    }

    /// Dynamic relocations.
    #[must_use]
    pub fn relocs(&self) -> &[RelocEntry] {
        &self.relocs
    }

    /// Relocation flavor of the dynamic relocation table, `None` when the module
    /// carries no dynamic relocations.
    #[must_use]
    pub fn reloc_flavor(&self) -> Option<RelocFlavor> {
        self.reloc_flavor
    }

    /// DT_INIT function pointer, if present.
    #[must_use]
    pub fn init(&self) -> Option<u64> {
        self.init
    }

    /// Decoded DT_INIT_ARRAY function pointers, in array order.
    #[must_use]
    pub fn init_array(&self) -> &[u64] {
        &self.init_array
    }

    /// Iterate the loadable segments in table order.
    pub fn loadable(&self) -> impl Iterator<Item = &ProgramHeader> {
        self.program_headers.iter().filter(|ph| ph.is_load())
    }

    /// The PT_DYNAMIC header, if present.
    #[must_use]
    pub fn dynamic_header(&self) -> Option<&ProgramHeader> {
        self.program_headers.iter().find(|ph| ph.p_type == PT_DYNAMIC)
    }

    /// The PT_PHDR header, if present.
    #[must_use]
    pub fn phdr_header(&self) -> Option<&ProgramHeader> {
        self.program_headers.iter().find(|ph| ph.p_type == PT_PHDR)
    }

    /// Largest loadable-segment alignment. Zero when the module has no loadable
    /// segments.
    #[must_use]
    pub fn page_align(&self) -> u64 {
        self.loadable().map(|ph| ph.p_align).max().unwrap_or(0)
    }

    /// Lowest loadable virtual address.
    #[must_use]
    pub fn min_load_vaddr(&self) -> u64 {
        self.loadable().map(|ph| ph.p_vaddr).min().unwrap_or(0)
    }

    /// One past the highest loadable virtual address.
    #[must_use]
    pub fn max_load_end(&self) -> u64 {
        self.loadable().map(|ph| ph.vaddr_end()).max().unwrap_or(0)
    }

    /// Translate a virtual address to a file offset via the loadable segment
    /// containing it. `None` when no loadable segment's file-backed range covers
    /// the address.
    #[must_use]
    pub fn vaddr_to_offset(&self, vaddr: u64) -> Option<usize> {
        self.loadable()
            .find(|ph| vaddr >= ph.p_vaddr && vaddr - ph.p_vaddr < ph.p_filesz)
            .and_then(|ph| {
                let offset = ph.p_offset.checked_add(vaddr - ph.p_vaddr)?;
                usize::try_from(offset).ok()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::{build_test_elf64, EM_AARCH64};

    #[test]
    fn parses_synthetic_module() {
        let module =
            NativeModule::from_bytes(build_test_elf64(EM_AARCH64, "payload_entry", true), "m")
                .unwrap();

        assert_eq!(module.class(), ElfClass::Elf64);
        assert_eq!(module.machine(), EM_AARCH64);
        assert_eq!(module.loadable().count(), 2);
        assert_eq!(module.init_array(), &[0x100]);
        assert_eq!(module.reloc_flavor(), Some(RelocFlavor::Rela));
        assert_eq!(module.relocs().len(), 1);
        assert!(module.relocs()[0].is_relative());

        let payload = module
            .symbols()
            .iter()
            .find(|s| s.name == "payload_entry")
            .unwrap();
        assert!(payload.is_defined());
        assert_eq!(payload.value, 0x100);

        let dlopen = module.symbols().iter().find(|s| s.name == "dlopen").unwrap();
        assert!(!dlopen.is_defined());
    }

    #[test]
    fn vaddr_translation_follows_segments() {
        let module =
            NativeModule::from_bytes(build_test_elf64(EM_AARCH64, "payload_entry", true), "m")
                .unwrap();
        assert_eq!(module.vaddr_to_offset(0x100), Some(0x100));
        assert_eq!(module.vaddr_to_offset(0x1200), Some(0x200));
        assert_eq!(module.vaddr_to_offset(0x900), None);
    }

    #[test]
    fn load_extents_and_alignment() {
        let module =
            NativeModule::from_bytes(build_test_elf64(EM_AARCH64, "payload_entry", true), "m")
                .unwrap();
        assert_eq!(module.min_load_vaddr(), 0);
        assert_eq!(module.max_load_end(), 0x1338);
        assert_eq!(module.page_align(), 0x1000);
    }

    #[test]
    fn rejects_big_endian() {
        let mut image = build_test_elf64(EM_AARCH64, "payload_entry", true);
        image[5] = 2; // ELFDATA2MSB
        assert!(NativeModule::from_bytes(image, "m").is_err());
    }

    #[test]
    fn rejects_overlapping_loads() {
        let mut image = build_test_elf64(EM_AARCH64, "payload_entry", true);
        // Pull the second load's vaddr down into the first load's range
        let vaddr_field = 0x40 + 56 + 16;
        image[vaddr_field..vaddr_field + 8].copy_from_slice(&0x100u64.to_le_bytes());
        assert!(NativeModule::from_bytes(image, "m").is_err());
    }

    #[test]
    fn rejects_truncated_segment() {
        let mut image = build_test_elf64(EM_AARCH64, "payload_entry", true);
        let filesz_field = 0x40 + 56 + 32;
        image[filesz_field..filesz_field + 8].copy_from_slice(&0x4000u64.to_le_bytes());
        assert!(NativeModule::from_bytes(image, "m").is_err());
    }

    #[test]
    fn rejects_address_space_wraparound() {
        // Second load pushed to the top of the address space
        let mut image = build_test_elf64(EM_AARCH64, "payload_entry", true);
        let vaddr_field = 0x40 + 56 + 16;
        image[vaddr_field..vaddr_field + 8].copy_from_slice(&(u64::MAX - 0x10).to_le_bytes());
        assert!(NativeModule::from_bytes(image, "m").is_err());

        // memsz alone overflowing vaddr + memsz
        let mut image = build_test_elf64(EM_AARCH64, "payload_entry", true);
        let memsz_field = 0x40 + 56 + 40;
        image[memsz_field..memsz_field + 8].copy_from_slice(&u64::MAX.to_le_bytes());
        assert!(NativeModule::from_bytes(image, "m").is_err());
    }

    #[test]
    fn rejects_garbage() {
        assert!(NativeModule::from_bytes(vec![0u8; 64], "m").is_err());
    }
}
