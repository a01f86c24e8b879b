use thiserror::Error;

use crate::dex::relocator::MethodDescriptor;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// This enum covers every failure mode of the hardening pipeline: container and module
/// parsing, method relocation, integrity repair, module fusion, and the external tool
/// collaborators. Each variant identifies the exact resource involved (file path, method
/// descriptor, or module pair) so an operator can fix their configuration without
/// inspecting internals.
///
/// # Error Categories
///
/// ## Format Errors (not retriable, abort the run)
/// - [`Error::Malformed`] - Corrupted or inconsistent container/module structure
/// - [`Error::OutOfBounds`] - Attempted to read beyond buffer boundaries
/// - [`Error::NotSupported`] - Unsupported file format or feature
/// - [`Error::Empty`] - Empty input provided
///
/// ## Relocation Errors
/// - [`Error::MethodNotFound`] - Configured descriptor has no exact match (operator error)
/// - [`Error::AlreadyRelocated`] - Same descriptor relocated twice in one run (fatal)
///
/// ## Fusion Errors
/// - [`Error::Alignment`] - Incompatible architectures or alignments between modules
/// - [`Error::Overlap`] - Fused segment placement violates the disjoint-range invariant
///
/// ## I/O and External Errors
/// - [`Error::FileError`] - Filesystem I/O errors (retriable when transient)
/// - [`Error::GoblinErr`] - ELF parsing errors from the goblin crate
/// - [`Error::ToolFailed`] - An external collaborator process exited unsuccessfully
#[derive(Error, Debug)]
pub enum Error {
    /// The file is damaged and could not be parsed.
    ///
    /// The structure does not conform to the expected DEX or ELF layout. The error
    /// carries the source location where the malformation was detected.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of what was malformed
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted while parsing the file.
    ///
    /// A read past the end of the buffer was requested, typically caused by a
    /// truncated container or an offset field pointing outside the file.
    #[error("Out of Bound read would have occurred!")]
    OutOfBounds,

    /// This file type is not supported.
    ///
    /// The input is not a little-endian DEX/ELF of a supported version, or uses a
    /// feature the pipeline does not handle (e.g. byte-swapped containers).
    #[error("This file type is not supported")]
    NotSupported,

    /// Provided input was empty.
    #[error("Provided input was empty")]
    Empty,

    /// File I/O error.
    ///
    /// Wraps standard I/O errors that can occur while reading containers or writing
    /// artifacts back to disk. Retriable by the orchestrator when transient.
    #[error("{0}")]
    FileError(#[from] std::io::Error),

    /// Generic error for miscellaneous failures.
    #[error("{0}")]
    Error(String),

    /// Error from the goblin crate during ELF parsing.
    #[error("{0}")]
    GoblinErr(#[from] goblin::error::Error),

    /// Error while reading or rewriting the decoded application manifest.
    #[error("{0}")]
    Xml(#[from] quick_xml::Error),

    /// Error while reading the pipeline configuration.
    #[error("{0}")]
    Json(#[from] serde_json::Error),

    /// Error while reading an entry out of the application archive.
    #[error("{0}")]
    Zip(#[from] zip::result::ZipError),

    /// No method in the container matches the configured descriptor.
    ///
    /// Matching is exact and case-sensitive on the (class, name, signature) triple;
    /// there is no overload resolution beyond the exact signature. This is an operator
    /// configuration error and aborts the run with the missing descriptor identified.
    #[error("No method matches descriptor {0}")]
    MethodNotFound(MethodDescriptor),

    /// The same method descriptor was relocated twice within one pipeline run.
    ///
    /// Extraction is a once-per-descriptor operation; a second call indicates a
    /// sequencing bug in the caller and is fatal.
    #[error("Method {0} has already been relocated in this run")]
    AlreadyRelocated(MethodDescriptor),

    /// The two native modules cannot be fused due to incompatible architectures or
    /// load alignments.
    ///
    /// Surfaced with both module identities so the operator can pick a compatible
    /// loader/payload pair.
    #[error("Cannot fuse '{primary}' with '{secondary}': {message}")]
    Alignment {
        /// Identity of the primary (loader) module
        primary: String,
        /// Identity of the secondary (payload) module
        secondary: String,
        /// Why the pair is incompatible
        message: String,
    },

    /// Fused segment placement would violate the disjoint virtual-address invariant.
    ///
    /// The placement construction makes this unreachable for valid inputs; hitting it
    /// indicates an internal consistency fault and is fatal.
    #[error("Segment overlap fusing '{primary}' with '{secondary}': {message}")]
    Overlap {
        /// Identity of the primary (loader) module
        primary: String,
        /// Identity of the secondary (payload) module
        secondary: String,
        /// The conflicting address ranges
        message: String,
    },

    /// An external collaborator process (apktool, ndk-build, signer, adb) failed.
    ///
    /// The pipeline halts at the failing stage; nothing after it runs.
    #[error("External tool '{tool}' failed: {detail}")]
    ToolFailed {
        /// Name of the tool that failed
        tool: String,
        /// Exit status or failure description
        detail: String,
    },
}
