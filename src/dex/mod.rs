//! DEX container model, method relocation, and integrity repair.
//!
//! This module implements the bytecode-container half of the hardening pipeline:
//!
//! - [`crate::dex::container::DexContainer`] - Owned in-memory model of a `classes.dex`
//!   image: header, string/type/prototype/method tables, class definitions, and the
//!   class_data method lists with their exact encoded byte positions
//! - [`crate::dex::relocator`] - Locating a method by its (class, name, signature)
//!   triple, extracting its code item, and stubbing it as a native trampoline
//! - [`crate::dex::integrity`] - Recomputing the SHA-1 signature and Adler-32
//!   checksum after mutation
//!
//! # Mutation model
//!
//! A container is parsed once, mutated in place in memory by zero or more
//! relocations, repaired, and written back exactly once. No mutation moves a byte:
//! relocation rewrites ULEB128 fields width-preservingly and repair rewrites two
//! fixed header fields. Recorded code offsets therefore stay valid regardless of
//! whether repair has run, which the relocation manifest depends on.
//!
//! # Usage
//!
//! ```rust,no_run
//! use dexfuse::dex::container::DexContainer;
//! use dexfuse::dex::relocator::MethodDescriptor;
//! use std::path::Path;
//!
//! let mut dex = DexContainer::from_file(Path::new("classes.dex"))?;
//! let target = MethodDescriptor::new("Lcom/example/Secret;", "check", "(I)Z");
//! let extracted = dex.relocate(&target)?;
//! dex.repair();
//! dex.save(Path::new("classes.dex"))?;
//! println!("relocated {} at {:#x}", extracted.record.descriptor, extracted.record.code_offset);
//! # Ok::<(), dexfuse::Error>(())
//! ```

pub mod container;
pub mod header;
pub mod integrity;
pub mod relocator;
