//! Native module model and loader fusion.
//!
//! The ELF half of the pipeline mirrors the DEX half in shape: parse once into an
//! owned structural model, produce a new artifact, write it back once.
//!
//! - [`crate::elf::module::NativeModule`] - Owned model of one compiled module:
//!   program headers, section headers, dynamic entries, dynamic symbols and
//!   relocations, and the decoded initializer pointers
//! - [`crate::elf::fusion::fuse`] - Merge a payload module's loadable content and
//!   initializers into a loader module, producing one binary the dynamic linker
//!   initializes as if both had been linked together
//!
//! Parsing delegates the raw structure walk to `goblin` and copies everything the
//! fusion needs into owned values, so neither input is borrowed or mutated while
//! the fused image is being laid out.

pub mod fusion;
pub mod module;
