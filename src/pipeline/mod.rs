//! Linear stage sequencing for one hardening run.
//!
//! The pipeline owns no mutation logic; it wires the core operations together in
//! a fixed order and propagates the first failure. Every stage either fully
//! succeeds or aborts the run, and on-disk artifacts are only written after the
//! stage's in-memory computation succeeded.
//!
//! Stage order:
//!
//! 1. decode the package with apktool and pull `classes.dex` out of the archive
//! 2. relocate every configured method, in configuration order
//! 3. repair the container's integrity fields and write it back
//! 4. cipher the mutated container into `assets/protected.jar`
//! 5. patch the decoded manifest's application class to the wrapper
//! 6. replace the decompiled `smali/` tree with the shipped wrapper tree
//! 7. embed the relocation manifest in the loader source and run ndk-build
//! 8. fuse the loader and payload modules into one shared object under `lib/`
//! 9. rebuild the package, sign it, and optionally install it

pub mod config;
pub mod manifest_patch;
pub mod tools;

use std::{
    fs,
    io::Read,
    path::{Path, PathBuf},
};

use crate::{
    cipher::ByteCipher,
    dex::container::DexContainer,
    elf::{fusion::fuse, module::NativeModule},
    manifest::RelocationManifest,
    pipeline::{
        config::Config,
        tools::{Adb, ApkSigner, ApkTool, NdkBuild},
    },
    Result,
};

/// The artifacts a completed run leaves behind.
#[derive(Debug)]
pub struct PipelineOutput {
    /// The signed, hardened package
    pub apk: PathBuf,
    /// The relocation manifest, one record per configured method in order
    pub manifest: RelocationManifest,
}

/// One hardening run over one package.
pub struct Pipeline {
    config: Config,
    work_dir: PathBuf,
}

impl Pipeline {
    /// Build a pipeline from a validated configuration. The working tree is a
    /// `tmp/` directory next to the input package, mirroring where the decoded
    /// and repacked artifacts end up.
    ///
    /// # Errors
    ///
    /// Propagates [`Config::validate`].
    pub fn new(config: Config) -> Result<Pipeline> {
        config.validate()?;
        let work_dir = config
            .apk
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("tmp");
        Ok(Pipeline { config, work_dir })
    }

    /// Run all stages in order.
    ///
    /// # Errors
    ///
    /// Propagates the first stage failure; nothing after a failed stage runs.
    pub fn run(&self) -> Result<PipelineOutput> {
        let decompiled = self.decode()?;
        let dex_path = self.extract_dex()?;
        let manifest = self.relocate_methods(&dex_path)?;
        self.write_protected_asset(&dex_path, &decompiled)?;
        self.patch_manifest(&decompiled)?;
        self.replace_smali(&decompiled)?;
        self.build_loader(&manifest)?;
        self.fuse_loader(&decompiled)?;
        let apk = self.package(&decompiled)?;

        tracing::info!(apk = %apk.display(), methods = manifest.len(), "hardening run complete");
        Ok(PipelineOutput { apk, manifest })
    }

    fn decode(&self) -> Result<PathBuf> {
        let out = self.work_dir.join("decompile");
        ApkTool::new(&self.config.tools.apktool).decode(&self.config.apk, &out)?;
        tracing::info!(apk = %self.config.apk.display(), "package decoded");
        Ok(out)
    }

    /// Pull the raw `classes.dex` out of the archive. apktool's decoded tree
    /// holds disassembled smali, not the container itself, so the container
    /// comes straight from the zip.
    fn extract_dex(&self) -> Result<PathBuf> {
        let dir = self.work_dir.join("decompress");
        fs::create_dir_all(&dir)?;

        let apk = fs::File::open(&self.config.apk)?;
        let mut archive = zip::ZipArchive::new(apk)?;
        let mut entry = archive.by_name("classes.dex")?;
        let mut bytes = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut bytes)?;

        let dex_path = dir.join("classes.dex");
        fs::write(&dex_path, bytes)?;
        tracing::info!(dex = %dex_path.display(), "bytecode container extracted");
        Ok(dex_path)
    }

    /// Stages 2 and 3: relocate every configured method in order, then repair
    /// the integrity fields and write the container back exactly once.
    fn relocate_methods(&self, dex_path: &Path) -> Result<RelocationManifest> {
        let mut dex = DexContainer::from_file(dex_path)?;
        let mut manifest = RelocationManifest::new();
        for descriptor in &self.config.methods {
            let extracted = dex.relocate(descriptor)?;
            manifest.push(extracted.record);
        }
        dex.repair();
        dex.save(dex_path)?;
        Ok(manifest)
    }

    /// Stage 4: the ciphered container becomes the runtime asset the loader
    /// deciphers and maps back in.
    fn write_protected_asset(&self, dex_path: &Path, decompiled: &Path) -> Result<()> {
        let assets = decompiled.join("assets");
        fs::create_dir_all(&assets)?;

        let protected = ByteCipher::transform(&fs::read(dex_path)?);
        let asset_path = assets.join("protected.jar");
        fs::write(&asset_path, protected)?;
        tracing::info!(asset = %asset_path.display(), "protected asset written");
        Ok(())
    }

    fn patch_manifest(&self, decompiled: &Path) -> Result<()> {
        manifest_patch::set_application_class(
            &decompiled.join("AndroidManifest.xml"),
            &self.config.wrapper_class,
        )
    }

    /// Stage 6: the wrapper application's smali tree replaces the original
    /// application code; the original now lives only inside the protected asset.
    fn replace_smali(&self, decompiled: &Path) -> Result<()> {
        let Some(factory) = &self.config.loader.smali_factory else {
            return Ok(());
        };
        let smali = decompiled.join("smali");
        if smali.is_dir() {
            fs::remove_dir_all(&smali)?;
        }
        copy_tree(factory, &smali)?;
        tracing::info!(from = %factory.display(), "smali tree replaced");
        Ok(())
    }

    /// Stage 7: the loader build consumes the manifest as generated source. A
    /// failed build halts the run before fusion.
    fn build_loader(&self, manifest: &RelocationManifest) -> Result<()> {
        let header = self.config.loader.project.join("jni").join("data.h");
        fs::write(&header, manifest.emit_loader_header())?;
        tracing::info!(header = %header.display(), records = manifest.len(), "loader manifest embedded");

        NdkBuild::build(&self.config.loader.project)?;
        tracing::info!("native loader built");
        Ok(())
    }

    fn fuse_loader(&self, decompiled: &Path) -> Result<()> {
        let loader = &self.config.loader;
        let libs = loader.project.join("libs").join(&loader.abi);
        let primary = NativeModule::from_file(&libs.join(&loader.loader_module))?;
        let secondary = NativeModule::from_file(&libs.join(&loader.payload_module))?;

        let fused = fuse(&primary, &secondary)?;

        let lib_dir = decompiled.join("lib").join(&loader.abi);
        fs::create_dir_all(&lib_dir)?;
        let out = lib_dir.join(&loader.fused_module);
        fs::write(&out, fused.image())?;
        tracing::info!(module = %out.display(), "fused module written");
        Ok(())
    }

    fn package(&self, decompiled: &Path) -> Result<PathBuf> {
        let out_dir = self.work_dir.join("output");
        fs::create_dir_all(&out_dir)?;

        let apktool = ApkTool::new(&self.config.tools.apktool);
        let rebuilt = out_dir.join("new.apk");
        apktool.build(decompiled, &rebuilt)?;
        tracing::info!(apk = %rebuilt.display(), "package rebuilt");

        let signer = ApkSigner::new(
            &self.config.tools.signer,
            &self.config.tools.signing_cert,
            &self.config.tools.signing_key,
        );
        let signed = out_dir.join("signed.apk");
        signer.sign(&rebuilt, &signed)?;
        tracing::info!(apk = %signed.display(), "package signed");

        if self.config.install {
            Adb::install(&signed)?;
            tracing::info!("package installed");
        }
        Ok(signed)
    }
}

fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
