use std::path::Path;

use anyhow::Context;
use dexfuse::NativeModule;

pub fn run(primary: &Path, secondary: &Path, output: &Path) -> anyhow::Result<()> {
    let loader = NativeModule::from_file(primary)
        .with_context(|| format!("failed to load module: {}", primary.display()))?;
    let payload = NativeModule::from_file(secondary)
        .with_context(|| format!("failed to load module: {}", secondary.display()))?;

    let fused = dexfuse::fuse(&loader, &payload)?;
    std::fs::write(output, fused.image())
        .with_context(|| format!("failed to write fused module: {}", output.display()))?;

    println!(
        "fused {} + {} -> {} ({} bytes, {} symbols)",
        primary.display(),
        secondary.display(),
        output.display(),
        fused.image().len(),
        fused.symbols().len()
    );
    Ok(())
}
