//! Pipeline configuration, deserialized from a JSON file.
//!
//! The configuration names the input APK, the ordered method descriptors to
//! relocate, the external tool locations, and the native loader project. Order of
//! the `methods` array is relocation order and therefore manifest order.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{dex::relocator::MethodDescriptor, Result};

/// Complete configuration of one hardening run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// The application package to harden
    pub apk: PathBuf,
    /// Application class written into the decoded manifest; its implementation
    /// ships with the loader's smali tree
    #[serde(default = "default_wrapper_class")]
    pub wrapper_class: String,
    /// Methods to relocate, in order
    pub methods: Vec<MethodDescriptor>,
    /// External tool locations
    pub tools: ToolConfig,
    /// Native loader project
    pub loader: LoaderConfig,
    /// Install the signed package on a connected device after the run
    #[serde(default)]
    pub install: bool,
}

/// Locations of the external collaborator tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    /// apktool jar used to decode and rebuild the package
    pub apktool: PathBuf,
    /// signapk-style signer jar
    pub signer: PathBuf,
    /// Signing certificate (x509 pem)
    pub signing_cert: PathBuf,
    /// Signing key (pk8)
    pub signing_key: PathBuf,
}

/// The native loader project consumed by ndk-build and the fusion stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Project root containing `jni/` sources; the relocation manifest header is
    /// written to `jni/data.h` before the build
    pub project: PathBuf,
    /// Target ABI subdirectory under `libs/` and `lib/`
    #[serde(default = "default_abi")]
    pub abi: String,
    /// Loader module produced by the native build (the fusion primary)
    #[serde(default = "default_loader_module")]
    pub loader_module: String,
    /// Payload module produced by the native build (the fusion secondary)
    #[serde(default = "default_payload_module")]
    pub payload_module: String,
    /// File name of the fused module shipped inside the package
    #[serde(default = "default_fused_module")]
    pub fused_module: String,
    /// Replacement smali tree holding the wrapper application; when set, the
    /// decoded package's `smali/` directory is replaced with it
    #[serde(default)]
    pub smali_factory: Option<PathBuf>,
}

fn default_wrapper_class() -> String {
    "com.example.shellapplication.WrapperApplication".to_string()
}

fn default_abi() -> String {
    "armeabi-v7a".to_string()
}

fn default_loader_module() -> String {
    "libloader.so".to_string()
}

fn default_payload_module() -> String {
    "libcore.so".to_string()
}

fn default_fused_module() -> String {
    "libreinforce.so".to_string()
}

impl Config {
    /// Read and deserialize a configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::FileError`] on I/O faults and
    /// [`crate::Error::Json`] for malformed configuration.
    pub fn from_file(path: &Path) -> Result<Config> {
        let text = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the parts of the configuration every run needs up front. Tool paths
    /// are left to their stages; a signing-only problem should not block the
    /// mutation stages from reporting their own errors first.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Error`] naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if !self.apk.is_file() {
            return Err(crate::Error::Error(format!(
                "configured apk does not exist: {}",
                self.apk.display()
            )));
        }
        if self.methods.is_empty() {
            return Err(crate::Error::Error(
                "no methods configured for relocation".to_string(),
            ));
        }
        Ok(())
    }
}
