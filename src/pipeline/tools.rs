//! Thin wrappers around the external collaborator tools.
//!
//! The core never inspects these tools' internals; each wrapper shapes a command
//! line, runs it to completion, and maps a non-zero exit status to
//! [`crate::Error::ToolFailed`] carrying the tail of the tool's stderr. Timeout
//! and retry policy stay with the caller.

use std::{
    path::{Path, PathBuf},
    process::Command,
};

use crate::{Error, Result};

fn run(tool: &str, command: &mut Command) -> Result<()> {
    tracing::debug!(tool, command = ?command, "running external tool");
    let output = command.output().map_err(|e| Error::ToolFailed {
        tool: tool.to_string(),
        detail: e.to_string(),
    })?;

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
    let mut detail = output.status.to_string();
    if !tail.is_empty() {
        detail.push_str(": ");
        detail.push_str(&tail.into_iter().rev().collect::<Vec<_>>().join("; "));
    }
    Err(Error::ToolFailed {
        tool: tool.to_string(),
        detail,
    })
}

/// apktool, used to decode the package to a working tree and rebuild it.
pub struct ApkTool {
    jar: PathBuf,
}

impl ApkTool {
    /// Wrap an apktool jar.
    pub fn new(jar: impl Into<PathBuf>) -> ApkTool {
        ApkTool { jar: jar.into() }
    }

    /// `apktool d -f <apk> -o <out>`
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::ToolFailed`] when decoding fails.
    pub fn decode(&self, apk: &Path, out: &Path) -> Result<()> {
        run(
            "apktool",
            Command::new("java")
                .arg("-jar")
                .arg(&self.jar)
                .arg("d")
                .arg("-f")
                .arg(apk)
                .arg("-o")
                .arg(out),
        )
    }

    /// `apktool b <dir> -o <out>`
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::ToolFailed`] when the rebuild fails.
    pub fn build(&self, dir: &Path, out: &Path) -> Result<()> {
        run(
            "apktool",
            Command::new("java")
                .arg("-jar")
                .arg(&self.jar)
                .arg("b")
                .arg(dir)
                .arg("-o")
                .arg(out),
        )
    }
}

/// ndk-build, run inside the loader project to produce the loader and payload
/// modules.
pub struct NdkBuild;

impl NdkBuild {
    /// Run `ndk-build` in `project`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::ToolFailed`] when the native build fails; the
    /// pipeline halts before fusion in that case.
    pub fn build(project: &Path) -> Result<()> {
        run("ndk-build", Command::new("ndk-build").current_dir(project))
    }
}

/// signapk-style signer.
pub struct ApkSigner {
    jar: PathBuf,
    cert: PathBuf,
    key: PathBuf,
}

impl ApkSigner {
    /// Wrap a signer jar with its certificate and key.
    pub fn new(
        jar: impl Into<PathBuf>,
        cert: impl Into<PathBuf>,
        key: impl Into<PathBuf>,
    ) -> ApkSigner {
        ApkSigner {
            jar: jar.into(),
            cert: cert.into(),
            key: key.into(),
        }
    }

    /// `java -jar <signer> <cert> <key> <apk> <out>`
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::ToolFailed`] when signing fails.
    pub fn sign(&self, apk: &Path, out: &Path) -> Result<()> {
        run(
            "signapk",
            Command::new("java")
                .arg("-jar")
                .arg(&self.jar)
                .arg(&self.cert)
                .arg(&self.key)
                .arg(apk)
                .arg(out),
        )
    }
}

/// adb, used for the optional on-device install.
pub struct Adb;

impl Adb {
    /// `adb install -t -r <apk>`
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::ToolFailed`] when the install fails.
    pub fn install(apk: &Path) -> Result<()> {
        run(
            "adb",
            Command::new("adb").arg("install").arg("-t").arg("-r").arg(apk),
        )
    }
}
