//! Loader fusion against synthetic ET_DYN modules, through the public API only:
//! parse two modules, fuse, and validate the merged image end to end.

use std::io::Write;

use dexfuse::{fuse, NativeModule};

const EM_AARCH64: u16 = 183;
const EM_ARM: u16 = 40;

// Secondary loads land one aligned page past the primary's extent
const DELTA: u64 = 0x2000;

fn push_at_u16(out: &mut [u8], pos: &mut usize, value: u16) {
    out[*pos..*pos + 2].copy_from_slice(&value.to_le_bytes());
    *pos += 2;
}

fn push_at_u32(out: &mut [u8], pos: &mut usize, value: u32) {
    out[*pos..*pos + 4].copy_from_slice(&value.to_le_bytes());
    *pos += 4;
}

fn push_at_u64(out: &mut [u8], pos: &mut usize, value: u64) {
    out[*pos..*pos + 8].copy_from_slice(&value.to_le_bytes());
    *pos += 8;
}

/// ET_DYN ELF64 with an R+X text load, an R+W data load holding init_array,
/// dynsym (one defined `sym`, one undefined `dlopen`), dynstr, an optional
/// RELATIVE rela for the init slot, and the dynamic section.
fn build_module(machine: u16, sym: &str, with_rela: bool) -> Vec<u8> {
    assert!(sym.len() < 0x2e);

    let mut out = vec![0u8; 0x400];

    out[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
    out[4] = 2; // ELFCLASS64
    out[5] = 1; // ELFDATA2LSB
    out[6] = 1;
    let mut pos = 16;
    push_at_u16(&mut out, &mut pos, 3); // ET_DYN
    push_at_u16(&mut out, &mut pos, machine);
    push_at_u32(&mut out, &mut pos, 1);
    push_at_u64(&mut out, &mut pos, 0x100); // e_entry
    push_at_u64(&mut out, &mut pos, 0x40); // e_phoff
    push_at_u64(&mut out, &mut pos, 0); // e_shoff
    push_at_u32(&mut out, &mut pos, 0);
    push_at_u16(&mut out, &mut pos, 64);
    push_at_u16(&mut out, &mut pos, 56);
    push_at_u16(&mut out, &mut pos, 3); // e_phnum
    push_at_u16(&mut out, &mut pos, 64);
    push_at_u16(&mut out, &mut pos, 0);
    push_at_u16(&mut out, &mut pos, 0);

    let phdrs = [
        // (type, flags, offset, vaddr, filesz, memsz, align)
        (1u32, 5u32, 0u64, 0u64, 0x200u64, 0x200u64, 0x1000u64),
        (1, 6, 0x200, 0x1200, 0x138, 0x138, 0x1000),
        (2, 6, 0x298, 0x1298, 0xa0, 0xa0, 8),
    ];
    let mut pos = 0x40;
    for (p_type, p_flags, p_offset, p_vaddr, p_filesz, p_memsz, p_align) in phdrs {
        push_at_u32(&mut out, &mut pos, p_type);
        push_at_u32(&mut out, &mut pos, p_flags);
        push_at_u64(&mut out, &mut pos, p_offset);
        push_at_u64(&mut out, &mut pos, p_vaddr);
        push_at_u64(&mut out, &mut pos, p_vaddr);
        push_at_u64(&mut out, &mut pos, p_filesz);
        push_at_u64(&mut out, &mut pos, p_memsz);
        push_at_u64(&mut out, &mut pos, p_align);
    }

    // aarch64 `ret` at the init/entry address
    out[0x100..0x104].copy_from_slice(&[0xc0, 0x03, 0x5f, 0xd6]);

    // init_array at vaddr 0x1200
    out[0x200..0x208].copy_from_slice(&0x100u64.to_le_bytes());

    // dynsym: null, defined `sym`, undefined dlopen
    let mut pos = 0x208 + 24;
    push_at_u32(&mut out, &mut pos, 1);
    out[pos] = 0x12; // GLOBAL | FUNC
    pos += 2;
    push_at_u16(&mut out, &mut pos, 1);
    push_at_u64(&mut out, &mut pos, 0x100);
    push_at_u64(&mut out, &mut pos, 0x10);
    let dlopen_name = 1 + sym.len() as u32 + 1;
    push_at_u32(&mut out, &mut pos, dlopen_name);
    out[pos] = 0x12;
    pos += 2;
    push_at_u16(&mut out, &mut pos, 0);
    push_at_u64(&mut out, &mut pos, 0);
    push_at_u64(&mut out, &mut pos, 0);

    // dynstr directly behind dynsym
    let mut strtab = vec![0u8];
    strtab.extend_from_slice(sym.as_bytes());
    strtab.push(0);
    strtab.extend_from_slice(b"dlopen\0");
    let strsz = strtab.len() as u64;
    out[0x250..0x250 + strtab.len()].copy_from_slice(&strtab);

    if with_rela {
        let mut pos = 0x280;
        push_at_u64(&mut out, &mut pos, 0x1200); // r_offset: the init slot
        push_at_u64(&mut out, &mut pos, 0x403); // R_AARCH64_RELATIVE
        push_at_u64(&mut out, &mut pos, 0x100); // r_addend
    }

    let mut dynamic: Vec<(u64, u64)> = vec![
        (25, 0x1200), // DT_INIT_ARRAY
        (27, 8),      // DT_INIT_ARRAYSZ
        (6, 0x1208),  // DT_SYMTAB
        (11, 24),     // DT_SYMENT
        (5, 0x1250),  // DT_STRTAB
        (10, strsz),  // DT_STRSZ
    ];
    if with_rela {
        dynamic.push((7, 0x1280)); // DT_RELA
        dynamic.push((8, 24)); // DT_RELASZ
        dynamic.push((9, 24)); // DT_RELAENT
    }
    dynamic.push((0, 0));
    let mut pos = 0x298;
    for (tag, value) in dynamic {
        push_at_u64(&mut out, &mut pos, tag);
        push_at_u64(&mut out, &mut pos, value);
    }

    out
}

fn loader() -> NativeModule {
    NativeModule::from_bytes(build_module(EM_AARCH64, "loader_entry", true), "libloader.so")
        .unwrap()
}

fn payload() -> NativeModule {
    NativeModule::from_bytes(build_module(EM_AARCH64, "payload_entry", true), "libcore.so").unwrap()
}

#[test]
fn initializers_run_loader_first_then_payload() {
    let fused = fuse(&loader(), &payload()).unwrap();
    assert_eq!(fused.init_array(), &[0x100, 0x100 + DELTA]);
}

#[test]
fn payload_symbols_rebase_past_the_loader_extent() {
    let fused = fuse(&loader(), &payload()).unwrap();

    let loader_sym = fused
        .symbols()
        .iter()
        .find(|s| s.name == "loader_entry")
        .unwrap();
    assert_eq!(loader_sym.value, 0x100);

    let payload_sym = fused
        .symbols()
        .iter()
        .find(|s| s.name == "payload_entry")
        .unwrap();
    assert_eq!(payload_sym.value, 0x100 + DELTA);
    assert!(payload_sym.is_defined());
}

#[test]
fn fused_loads_never_overlap() {
    let fused = fuse(&loader(), &payload()).unwrap();
    let loads: Vec<_> = fused.loadable().collect();
    assert!(loads.len() >= 4);
    for (i, a) in loads.iter().enumerate() {
        for b in loads.iter().skip(i + 1) {
            assert!(
                a.vaddr_end() <= b.p_vaddr || b.vaddr_end() <= a.p_vaddr,
                "segments at {:#x} and {:#x} overlap",
                a.p_vaddr,
                b.p_vaddr
            );
        }
    }
}

#[test]
fn fused_image_reloads_from_disk() {
    let fused = fuse(&loader(), &payload()).unwrap();

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(fused.image()).unwrap();
    file.flush().unwrap();

    let reloaded = NativeModule::from_file(file.path()).unwrap();
    assert_eq!(reloaded.machine(), EM_AARCH64);
    assert_eq!(reloaded.init_array(), fused.init_array());
    assert_eq!(reloaded.symbols().len(), fused.symbols().len());
}

#[test]
fn relocations_cover_the_new_init_slots() {
    let fused = fuse(&loader(), &payload()).unwrap();

    // Every init_array slot in the fused image carries a RELATIVE fixup whose
    // addend is the initializer it must hold after loading
    for &init in fused.init_array() {
        assert!(
            fused
                .relocs()
                .iter()
                .any(|r| r.is_relative() && r.addend == Some(init as i64)),
            "no base relocation produces initializer {init:#x}"
        );
    }
}

#[test]
fn differing_machines_are_rejected() {
    let arm = NativeModule::from_bytes(build_module(EM_ARM, "payload_entry", true), "libcore.so");
    // The aarch64 RELATIVE type id is meaningless on arm, but parsing is
    // architecture-agnostic; only fuse checks the machine field
    let arm = arm.unwrap();
    assert!(fuse(&loader(), &arm).is_err());
}
