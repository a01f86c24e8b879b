use std::path::Path;

use anyhow::Context;
use dexfuse::DexContainer;

/// Load and fully parse a DEX container.
pub fn load_container(path: &Path) -> anyhow::Result<DexContainer> {
    DexContainer::from_file(path)
        .with_context(|| format!("failed to load container: {}", path.display()))
}
