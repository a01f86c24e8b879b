use std::path::Path;

use serde::Serialize;

use crate::{app::GlobalOptions, commands::common::load_container, output::print_output};

#[derive(Debug, Serialize)]
pub struct ContainerInfo {
    pub version: String,
    pub file_size: u32,
    pub checksum: String,
    pub signature: String,
    pub integrity_ok: bool,
    pub string_count: u32,
    pub type_count: u32,
    pub proto_count: u32,
    pub field_count: u32,
    pub method_count: u32,
    pub class_count: u32,
}

pub fn run(path: &Path, opts: &GlobalOptions) -> anyhow::Result<()> {
    let dex = load_container(path)?;
    let header = dex.header();

    // The version digits sit behind "dex\n" in the magic
    let version = String::from_utf8_lossy(&header.magic[4..7]).into_owned();
    let signature: String = header.signature.iter().map(|b| format!("{b:02x}")).collect();

    let info = ContainerInfo {
        version,
        file_size: header.file_size,
        checksum: format!("{:#010x}", header.checksum),
        signature,
        integrity_ok: dex.verify_integrity(),
        string_count: header.string_ids_size,
        type_count: header.type_ids_size,
        proto_count: header.proto_ids_size,
        field_count: header.field_ids_size,
        method_count: header.method_ids_size,
        class_count: header.class_defs_size,
    };

    print_output(&info, opts, |info| {
        println!("Version:     {}", info.version);
        println!("File size:   {} bytes", info.file_size);
        println!("Checksum:    {}", info.checksum);
        println!("Signature:   {}", info.signature);
        println!(
            "Integrity:   {}",
            if info.integrity_ok { "ok" } else { "STALE" }
        );
        println!("Strings:     {}", info.string_count);
        println!("Types:       {}", info.type_count);
        println!("Prototypes:  {}", info.proto_count);
        println!("Fields:      {}", info.field_count);
        println!("Methods:     {}", info.method_count);
        println!("Classes:     {}", info.class_count);
    })
}
