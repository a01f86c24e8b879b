// Copyright 2026 The dexfuse authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![allow(clippy::too_many_arguments)]
// 'file/physical.rs' uses mmap to map a file into memory

//! # dexfuse
//!
//! An APK hardening toolkit: selected Java methods' bodies are relocated out of
//! `classes.dex` into an enciphered asset, the container's integrity fields are
//! repaired so it stays loadable, and the companion native loader is fused with
//! its payload module into a single shared object so no extra artifact betrays
//! the protection scheme.
//!
//! ## Core operations
//!
//! - **Method relocation** - [`DexContainer`] parses the container once;
//!   [`DexContainer::relocate`] extracts a method's code item by its exact
//!   (class, name, signature) triple and stubs the method as native, without
//!   moving a single container byte.
//! - **Integrity repair** - [`DexContainer::repair`] recomputes the SHA-1
//!   signature and Adler-32 checksum after mutation, in that order.
//! - **Byte cipher** - [`ByteCipher`] is the involutive byte transform applied
//!   to the mutated container before it ships as `assets/protected.jar`.
//! - **Loader fusion** - [`NativeModule`] models a compiled ELF module;
//!   [`fuse`] merges the payload's loadable segments, symbols, and
//!   initializers into the loader, preserving initializer order:
//!   loader first, payload second.
//! - **Pipeline** - [`pipeline::Pipeline`] sequences decode, relocation,
//!   repair, ciphering, manifest patching, the native build, fusion, and
//!   repack/sign/install around the external collaborator tools.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dexfuse::{ByteCipher, DexContainer, MethodDescriptor};
//! use std::path::Path;
//!
//! let mut dex = DexContainer::from_file(Path::new("classes.dex"))?;
//! let extracted = dex.relocate(&MethodDescriptor::new(
//!     "Lcom/example/Secret;",
//!     "check",
//!     "(I)Z",
//! ))?;
//! dex.repair();
//!
//! let asset = ByteCipher::transform(dex.image());
//! println!(
//!     "relocated {} ({} code bytes) at {:#x}",
//!     extracted.record.descriptor,
//!     extracted.code.len(),
//!     extracted.record.code_offset
//! );
//! # Ok::<(), dexfuse::Error>(())
//! ```
//!
//! ## Mutation model
//!
//! Each container or module is parsed fully into memory, mutated (or, for
//! fusion, re-laid-out into a new value), and written back exactly once. The
//! pipeline is single-threaded by design: later stages depend on the complete
//! mutated state of earlier ones, and relocation offsets recorded in the
//! manifest stay valid precisely because no mutation moves container bytes.

#[macro_use]
pub(crate) mod error;
pub(crate) mod file;

/// Shared functionality which is used in unit- and integration-tests
#[cfg(test)]
pub(crate) mod test;

/// Involutive byte transform for the protected asset.
pub mod cipher;

/// DEX container model, method relocation, and integrity repair.
pub mod dex;

/// Native module model and loader fusion.
pub mod elf;

/// The ordered relocation manifest embedded into the native loader build.
pub mod manifest;

/// Stage sequencing around the external collaborator tools.
pub mod pipeline;

/// Convenience alias for operations that can fail with [`crate::Error`].
pub type Result<T> = std::result::Result<T, Error>;

pub use error::Error;

pub use cipher::ByteCipher;
pub use file::File;
pub use dex::container::DexContainer;
pub use dex::relocator::{ExtractedMethod, MethodDescriptor};
pub use elf::fusion::fuse;
pub use elf::module::NativeModule;
pub use manifest::{RelocationManifest, RelocationRecord};
