use std::path::Path;

use anyhow::Context;
use dexfuse::pipeline::{config::Config, Pipeline};

pub fn run(config_path: &Path) -> anyhow::Result<()> {
    let config = Config::from_file(config_path)
        .with_context(|| format!("failed to load configuration: {}", config_path.display()))?;

    let output = Pipeline::new(config)?.run()?;

    println!("protected APK: {}", output.apk.display());
    for record in output.manifest.records() {
        println!(
            "  relocated {} at {:#x}",
            record.descriptor, record.code_offset
        );
    }
    Ok(())
}
