use std::path::Path;

use serde::Serialize;

use dexfuse::dex::container::{DexContainer, EncodedMethod, MethodAccessFlags};

use crate::{
    app::GlobalOptions,
    commands::common::load_container,
    output::{print_output, Align, TabWriter},
};

#[derive(Debug, Serialize)]
pub struct MethodEntry {
    pub class: String,
    pub name: String,
    pub signature: String,
    pub code_offset: u32,
    pub native: bool,
}

pub fn run(path: &Path, class_filter: Option<&str>, opts: &GlobalOptions) -> anyhow::Result<()> {
    let dex = load_container(path)?;

    let mut entries = Vec::new();
    for (index, def) in dex.class_defs().iter().enumerate() {
        let Some(class) = dex.type_descriptor(def.class_idx) else {
            continue;
        };
        if let Some(filter) = class_filter {
            if !class.contains(filter) {
                continue;
            }
        }
        let class = class.to_string();
        let Some(data) = dex.class_data(index) else {
            continue;
        };
        for method in data.direct_methods.iter().chain(&data.virtual_methods) {
            entries.push(method_entry(&dex, &class, method));
        }
    }

    print_output(&entries, opts, |entries| {
        let mut table = TabWriter::new(vec![
            ("CLASS", Align::Left),
            ("NAME", Align::Left),
            ("SIGNATURE", Align::Left),
            ("CODE", Align::Right),
            ("", Align::Left),
        ]);
        for entry in entries {
            table.row(vec![
                entry.class.clone(),
                entry.name.clone(),
                entry.signature.clone(),
                if entry.code_offset == 0 {
                    "-".to_string()
                } else {
                    format!("{:#x}", entry.code_offset)
                },
                if entry.native { "native".to_string() } else { String::new() },
            ]);
        }
        table.print();
        println!("\n{} methods", entries.len());
    })
}

fn method_entry(dex: &DexContainer, class: &str, method: &EncodedMethod) -> MethodEntry {
    let id = &dex.method_ids()[method.method_idx as usize];
    MethodEntry {
        class: class.to_string(),
        name: dex.strings()[id.name_idx as usize].value.clone(),
        signature: dex.protos()[id.proto_idx as usize].signature.clone(),
        code_offset: method.code_off,
        native: MethodAccessFlags::from_bits_retain(method.access_flags)
            .contains(MethodAccessFlags::NATIVE),
    }
}
