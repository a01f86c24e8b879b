//! Shared fixtures for unit tests: hand-assembled minimal DEX and ELF images.
//!
//! The builders below construct the smallest inputs that exercise the real code
//! paths: a two-class DEX with one direct and one virtual method, and ET_DYN
//! modules of both ELF classes with loadable text/data segments, a dynamic
//! section, one defined symbol, and a one-entry init array. All are assembled
//! byte-by-byte so the tests do not depend on checked-in binary samples.

use crate::dex::integrity::{compute_checksum, compute_signature};

fn push_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn push_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn push_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn align4(out: &mut Vec<u8>) {
    while out.len() % 4 != 0 {
        out.push(0);
    }
}

/// Build a valid minimal DEX: classes `LA;` (direct method `foo(I)V`) and `LB;`
/// (virtual method `bar()Z`), with correct integrity fields.
pub(crate) fn build_minimal_dex() -> Vec<u8> {
    const HEADER_SIZE: u32 = 0x70;
    let strings = ["I", "LA;", "LB;", "V", "VI", "Z", "bar", "foo"];
    // type_id -> descriptor string index: I, LA;, LB;, V, Z
    let type_ids: [u32; 5] = [0, 1, 2, 3, 5];

    let string_ids_off = HEADER_SIZE;
    let type_ids_off = string_ids_off + strings.len() as u32 * 4;
    let proto_ids_off = type_ids_off + type_ids.len() as u32 * 4;
    let method_ids_off = proto_ids_off + 2 * 12;
    let class_defs_off = method_ids_off + 2 * 8;
    let data_off = class_defs_off + 2 * 32;

    // Data section, offsets relative to data_off
    let mut data = Vec::new();

    // type_list for (I)
    let type_list_rel = data.len() as u32;
    push_u32(&mut data, 1);
    push_u16(&mut data, 0); // type I
    align4(&mut data);

    // code item for foo(I)V: return-void
    let code_foo_rel = data.len() as u32;
    push_u16(&mut data, 2); // registers_size
    push_u16(&mut data, 2); // ins_size (this + int)
    push_u16(&mut data, 0); // outs_size
    push_u16(&mut data, 0); // tries_size
    push_u32(&mut data, 0); // debug_info_off
    push_u32(&mut data, 1); // insns_size
    data.extend_from_slice(&[0x0e, 0x00]); // return-void
    align4(&mut data);

    // code item for bar()Z: const/4 v0, #1; return v0
    let code_bar_rel = data.len() as u32;
    push_u16(&mut data, 2);
    push_u16(&mut data, 1); // this
    push_u16(&mut data, 0);
    push_u16(&mut data, 0);
    push_u32(&mut data, 0);
    push_u32(&mut data, 2);
    data.extend_from_slice(&[0x12, 0x10, 0x0f, 0x00]);
    align4(&mut data);

    // string_data items
    let mut string_rels = Vec::new();
    for s in strings {
        string_rels.push(data.len() as u32);
        data.push(s.len() as u8); // utf16 length, all fixture strings are ASCII
        data.extend_from_slice(s.as_bytes());
        data.push(0);
    }

    // class_data for LA;: one direct method (foo = method 0)
    let class_data_a_rel = data.len() as u32;
    data.extend_from_slice(&[0, 0, 1, 0]); // field/method counts
    data.push(0); // method_idx
    data.push(0x01); // ACC_PUBLIC
    data.extend_from_slice(&uleb(data_off + code_foo_rel));

    // class_data for LB;: one virtual method (bar = method 1)
    let class_data_b_rel = data.len() as u32;
    data.extend_from_slice(&[0, 0, 0, 1]);
    data.push(1);
    data.push(0x01);
    data.extend_from_slice(&uleb(data_off + code_bar_rel));
    align4(&mut data);

    // map list
    let map_rel = data.len() as u32;
    let map_items: &[(u16, u32, u32)] = &[
        (0x0000, 1, 0),                                   // header
        (0x0001, strings.len() as u32, string_ids_off),   // string_ids
        (0x0002, type_ids.len() as u32, type_ids_off),    // type_ids
        (0x0003, 2, proto_ids_off),                       // proto_ids
        (0x0005, 2, method_ids_off),                      // method_ids
        (0x0006, 2, class_defs_off),                      // class_defs
        (0x1001, 1, data_off + type_list_rel),            // type_list
        (0x2001, 2, data_off + code_foo_rel),             // code_items
        (0x2002, strings.len() as u32, data_off + string_rels[0]), // string_data
        (0x2000, 2, data_off + class_data_a_rel),         // class_data
        (0x1000, 1, data_off + map_rel),                  // map_list
    ];
    push_u32(&mut data, map_items.len() as u32);
    for &(item_type, count, offset) in map_items {
        push_u16(&mut data, item_type);
        push_u16(&mut data, 0);
        push_u32(&mut data, count);
        push_u32(&mut data, offset);
    }

    let file_size = data_off + data.len() as u32;

    // Assemble: header, id tables, data
    let mut out = Vec::with_capacity(file_size as usize);
    out.extend_from_slice(b"dex\n035\0");
    push_u32(&mut out, 0); // checksum, patched below
    out.extend_from_slice(&[0u8; 20]); // signature, patched below
    push_u32(&mut out, file_size);
    push_u32(&mut out, HEADER_SIZE);
    push_u32(&mut out, 0x1234_5678); // endian_tag
    push_u32(&mut out, 0); // link_size
    push_u32(&mut out, 0); // link_off
    push_u32(&mut out, data_off + map_rel);
    push_u32(&mut out, strings.len() as u32);
    push_u32(&mut out, string_ids_off);
    push_u32(&mut out, type_ids.len() as u32);
    push_u32(&mut out, type_ids_off);
    push_u32(&mut out, 2); // proto_ids_size
    push_u32(&mut out, proto_ids_off);
    push_u32(&mut out, 0); // field_ids_size
    push_u32(&mut out, 0);
    push_u32(&mut out, 2); // method_ids_size
    push_u32(&mut out, method_ids_off);
    push_u32(&mut out, 2); // class_defs_size
    push_u32(&mut out, class_defs_off);
    push_u32(&mut out, data.len() as u32);
    push_u32(&mut out, data_off);

    for rel in &string_rels {
        push_u32(&mut out, data_off + rel);
    }
    for idx in type_ids {
        push_u32(&mut out, idx);
    }
    // proto 0: (I)V, shorty "VI"
    push_u32(&mut out, 4);
    push_u32(&mut out, 3);
    push_u32(&mut out, data_off + type_list_rel);
    // proto 1: ()Z, shorty "Z"
    push_u32(&mut out, 5);
    push_u32(&mut out, 4);
    push_u32(&mut out, 0);
    // method 0: LA;.foo (I)V
    push_u16(&mut out, 1);
    push_u16(&mut out, 0);
    push_u32(&mut out, 7);
    // method 1: LB;.bar ()Z
    push_u16(&mut out, 2);
    push_u16(&mut out, 1);
    push_u32(&mut out, 6);
    // class_def LA;
    push_u32(&mut out, 1);
    push_u32(&mut out, 0x1);
    push_u32(&mut out, 0xffff_ffff); // superclass NO_INDEX
    push_u32(&mut out, 0);
    push_u32(&mut out, 0xffff_ffff);
    push_u32(&mut out, 0);
    push_u32(&mut out, data_off + class_data_a_rel);
    push_u32(&mut out, 0);
    // class_def LB;
    push_u32(&mut out, 2);
    push_u32(&mut out, 0x1);
    push_u32(&mut out, 0xffff_ffff);
    push_u32(&mut out, 0);
    push_u32(&mut out, 0xffff_ffff);
    push_u32(&mut out, 0);
    push_u32(&mut out, data_off + class_data_b_rel);
    push_u32(&mut out, 0);

    out.extend_from_slice(&data);
    assert_eq!(out.len() as u32, file_size);

    let signature = compute_signature(&out);
    out[12..32].copy_from_slice(&signature);
    let checksum = compute_checksum(&out);
    out[8..12].copy_from_slice(&checksum.to_le_bytes());
    out
}

fn uleb(mut value: u32) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            out.push(byte | 0x80);
        } else {
            out.push(byte);
            break;
        }
    }
    out
}

/// ELF machine id used for the default fixtures.
pub(crate) const EM_AARCH64: u16 = 183;

/// A different machine id, for architecture-mismatch tests.
pub(crate) const EM_ARM: u16 = 40;

/// Build a valid ET_DYN ELF64 with:
/// - PT_LOAD R+X at vaddr 0 covering file 0..0x200 (text at 0x100)
/// - PT_LOAD R+W at vaddr 0x1200 covering file 0x200..0x338 (init_array, dynsym,
///   dynstr, rela, dynamic)
/// - one init-array entry pointing at 0x100
/// - one defined global function symbol `sym` at 0x100
/// - optionally one RELATIVE relocation for the init-array slot
pub(crate) fn build_test_elf64(machine: u16, sym: &str, with_rela: bool) -> Vec<u8> {
    assert!(sym.len() < 0x2e, "fixture dynstr region is 0x30 bytes");

    let mut out = vec![0u8; 0x400];

    // ELF header
    out[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
    out[4] = 2; // ELFCLASS64
    out[5] = 1; // ELFDATA2LSB
    out[6] = 1; // EV_CURRENT
    let mut pos = 16;
    {
        let buf = &mut out;
        push_at_u16(buf, &mut pos, 3); // ET_DYN
        push_at_u16(buf, &mut pos, machine);
        push_at_u32(buf, &mut pos, 1); // e_version
        push_at_u64(buf, &mut pos, 0x100); // e_entry
        push_at_u64(buf, &mut pos, 0x40); // e_phoff
        push_at_u64(buf, &mut pos, 0); // e_shoff
        push_at_u32(buf, &mut pos, 0); // e_flags
        push_at_u16(buf, &mut pos, 64); // e_ehsize
        push_at_u16(buf, &mut pos, 56); // e_phentsize
        push_at_u16(buf, &mut pos, 3); // e_phnum
        push_at_u16(buf, &mut pos, 64); // e_shentsize
        push_at_u16(buf, &mut pos, 0); // e_shnum
        push_at_u16(buf, &mut pos, 0); // e_shstrndx
    }

    // Program headers
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
        push_at_u64(&mut out, &mut pos, p_vaddr); // p_paddr
        push_at_u64(&mut out, &mut pos, p_filesz);
        push_at_u64(&mut out, &mut pos, p_memsz);
        push_at_u64(&mut out, &mut pos, p_align);
    }

    // Text: aarch64 `ret` at the init/entry address
    out[0x100..0x104].copy_from_slice(&[0xc0, 0x03, 0x5f, 0xd6]);

    // init_array at vaddr 0x1200
    out[0x200..0x208].copy_from_slice(&0x100u64.to_le_bytes());

    // dynsym at vaddr 0x1208: null, defined `sym`, undefined "dlopen"
    let mut pos = 0x208 + 24;
    push_at_u32(&mut out, &mut pos, 1); // st_name
    out[pos] = 0x12; // GLOBAL | FUNC
    pos += 2; // st_info + st_other
    push_at_u16(&mut out, &mut pos, 1); // st_shndx (defined)
    push_at_u64(&mut out, &mut pos, 0x100); // st_value
    push_at_u64(&mut out, &mut pos, 0x10); // st_size
    let dlopen_name = 1 + sym.len() as u32 + 1;
    push_at_u32(&mut out, &mut pos, dlopen_name);
    out[pos] = 0x12;
    pos += 2;
    push_at_u16(&mut out, &mut pos, 0); // SHN_UNDEF
    push_at_u64(&mut out, &mut pos, 0);
    push_at_u64(&mut out, &mut pos, 0);

    // dynstr at vaddr 0x1250
    let mut strtab = vec![0u8];
    strtab.extend_from_slice(sym.as_bytes());
    strtab.push(0);
    strtab.extend_from_slice(b"dlopen\0");
    let strsz = strtab.len() as u64;
    out[0x250..0x250 + strtab.len()].copy_from_slice(&strtab);

    // rela at vaddr 0x1280: RELATIVE fixup of the init_array slot
    if with_rela {
        let mut pos = 0x280;
        push_at_u64(&mut out, &mut pos, 0x1200); // r_offset
        push_at_u64(&mut out, &mut pos, 0x403); // R_AARCH64_RELATIVE
        push_at_u64(&mut out, &mut pos, 0x100); // r_addend
    }

    // dynamic at vaddr 0x1298
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
    dynamic.push((0, 0)); // DT_NULL
    let mut pos = 0x298;
    for (tag, value) in dynamic {
        push_at_u64(&mut out, &mut pos, tag);
        push_at_u64(&mut out, &mut pos, value);
    }

    out
}

/// Build a valid ET_DYN ELF32 with the same shape as [`build_test_elf64`]:
/// R+X text load at vaddr 0, R+W data load at vaddr 0x1200 holding init_array,
/// dynsym, dynstr, an optional REL relocation, and the dynamic section. The
/// relocation table uses implicit addends, matching 32-bit Android output.
pub(crate) fn build_test_elf32(machine: u16, sym: &str, with_rel: bool) -> Vec<u8> {
    assert!(sym.len() < 0x1f, "fixture dynstr region is 0x28 bytes");

    let mut out = vec![0u8; 0x300];

    // ELF header
    out[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
    out[4] = 1; // ELFCLASS32
    out[5] = 1; // ELFDATA2LSB
    out[6] = 1; // EV_CURRENT
    let mut pos = 16;
    {
        let buf = &mut out;
        push_at_u16(buf, &mut pos, 3); // ET_DYN
        push_at_u16(buf, &mut pos, machine);
        push_at_u32(buf, &mut pos, 1); // e_version
        push_at_u32(buf, &mut pos, 0x100); // e_entry
        push_at_u32(buf, &mut pos, 0x34); // e_phoff
        push_at_u32(buf, &mut pos, 0); // e_shoff
        push_at_u32(buf, &mut pos, 0); // e_flags
        push_at_u16(buf, &mut pos, 52); // e_ehsize
        push_at_u16(buf, &mut pos, 32); // e_phentsize
        push_at_u16(buf, &mut pos, 3); // e_phnum
        push_at_u16(buf, &mut pos, 40); // e_shentsize
        push_at_u16(buf, &mut pos, 0); // e_shnum
        push_at_u16(buf, &mut pos, 0); // e_shstrndx
    }

    // Program headers
    let phdrs = [
        // (type, flags, offset, vaddr, filesz, memsz, align)
        (1u32, 5u32, 0u32, 0u32, 0x200u32, 0x200u32, 0x1000u32),
        (1, 6, 0x200, 0x1200, 0xb8, 0xb8, 0x1000),
        (2, 6, 0x268, 0x1268, 0x50, 0x50, 4),
    ];
    let mut pos = 0x34;
    for (p_type, p_flags, p_offset, p_vaddr, p_filesz, p_memsz, p_align) in phdrs {
        push_at_u32(&mut out, &mut pos, p_type);
        push_at_u32(&mut out, &mut pos, p_offset);
        push_at_u32(&mut out, &mut pos, p_vaddr);
        push_at_u32(&mut out, &mut pos, p_vaddr); // p_paddr
        push_at_u32(&mut out, &mut pos, p_filesz);
        push_at_u32(&mut out, &mut pos, p_memsz);
        push_at_u32(&mut out, &mut pos, p_flags);
        push_at_u32(&mut out, &mut pos, p_align);
    }

    // Text: arm `bx lr` at the init/entry address
    out[0x100..0x104].copy_from_slice(&[0x1e, 0xff, 0x2f, 0xe1]);

    // init_array at vaddr 0x1200
    out[0x200..0x204].copy_from_slice(&0x100u32.to_le_bytes());

    // dynsym at vaddr 0x1208: null, defined `sym`, undefined "dlopen"
    let mut pos = 0x208 + 16;
    push_at_u32(&mut out, &mut pos, 1); // st_name
    push_at_u32(&mut out, &mut pos, 0x100); // st_value
    push_at_u32(&mut out, &mut pos, 0x10); // st_size
    out[pos] = 0x12; // GLOBAL | FUNC
    pos += 2; // st_info + st_other
    push_at_u16(&mut out, &mut pos, 1); // st_shndx (defined)
    let dlopen_name = 1 + sym.len() as u32 + 1;
    push_at_u32(&mut out, &mut pos, dlopen_name);
    push_at_u32(&mut out, &mut pos, 0);
    push_at_u32(&mut out, &mut pos, 0);
    out[pos] = 0x12;
    pos += 2;
    push_at_u16(&mut out, &mut pos, 0); // SHN_UNDEF

    // dynstr at vaddr 0x1238
    let mut strtab = vec![0u8];
    strtab.extend_from_slice(sym.as_bytes());
    strtab.push(0);
    strtab.extend_from_slice(b"dlopen\0");
    let strsz = strtab.len() as u32;
    out[0x238..0x238 + strtab.len()].copy_from_slice(&strtab);

    // rel at vaddr 0x1260: RELATIVE fixup of the init_array slot, its addend
    // implicit in the slot bytes
    if with_rel {
        let mut pos = 0x260;
        push_at_u32(&mut out, &mut pos, 0x1200); // r_offset
        push_at_u32(&mut out, &mut pos, 23); // R_ARM_RELATIVE
    }

    // dynamic at vaddr 0x1268
    let mut dynamic: Vec<(u32, u32)> = vec![
        (25, 0x1200), // DT_INIT_ARRAY
        (27, 4),      // DT_INIT_ARRAYSZ
        (6, 0x1208),  // DT_SYMTAB
        (11, 16),     // DT_SYMENT
        (5, 0x1238),  // DT_STRTAB
        (10, strsz),  // DT_STRSZ
    ];
    if with_rel {
        dynamic.push((17, 0x1260)); // DT_REL
        dynamic.push((18, 8)); // DT_RELSZ
        dynamic.push((19, 8)); // DT_RELENT
    }
    dynamic.push((0, 0)); // DT_NULL
    let mut pos = 0x268;
    for (tag, value) in dynamic {
        push_at_u32(&mut out, &mut pos, tag);
        push_at_u32(&mut out, &mut pos, value);
    }

    out
}

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
