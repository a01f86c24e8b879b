//! The relocation manifest: the ordered record of every method extracted from the
//! container, in the exact wire encoding the native loader decodes at runtime.
//!
//! The wire form is a flat string: the record count in decimal, then for each
//! record the class descriptor, method name, type signature, and original code-item
//! offset in decimal, all concatenated with no separators. The loader can split it
//! because class descriptors end in `;` and signatures close with their return
//! type, so the format is kept byte-for-byte as the loader expects rather than
//! replaced with something self-describing.
//!
//! For embedding, [`RelocationManifest::emit_loader_header`] renders the string as
//! a C char-array initializer with every byte shifted down by a fixed offset, so
//! the cleartext method names never appear in the loader binary.

use serde::{Deserialize, Serialize};

use crate::dex::relocator::MethodDescriptor;

/// Byte shift applied to every manifest character in the emitted loader header.
/// The loader adds the same constant back before parsing.
const HEADER_SHIFT: u8 = 10;

/// One relocated method: its descriptor and the code-item offset it occupied
/// before stubbing.
///
/// The offset stays valid in the mutated container because relocation never moves
/// a byte, which is what lets the loader read the original code_item straight out
/// of the shipped container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelocationRecord {
    /// The relocated method
    pub descriptor: MethodDescriptor,
    /// Absolute offset of its code_item in the container image
    pub code_offset: u32,
}

impl RelocationRecord {
    /// Pair a descriptor with its pre-mutation code offset.
    pub fn new(descriptor: MethodDescriptor, code_offset: u32) -> RelocationRecord {
        RelocationRecord {
            descriptor,
            code_offset,
        }
    }
}

/// Ordered collection of relocation records for one hardening run.
///
/// Append order is configuration order and is preserved through encoding; the
/// loader resolves stubs by position as well as by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelocationManifest {
    records: Vec<RelocationRecord>,
}

impl RelocationManifest {
    /// Create an empty manifest.
    #[must_use]
    pub fn new() -> RelocationManifest {
        RelocationManifest::default()
    }

    /// Append a record. Order of calls is the order on the wire.
    pub fn push(&mut self, record: RelocationRecord) {
        self.records.push(record);
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when no method was relocated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The records in append order.
    #[must_use]
    pub fn records(&self) -> &[RelocationRecord] {
        &self.records
    }

    /// Render the wire form: decimal count, then each record's class, name,
    /// signature, and decimal offset concatenated.
    #[must_use]
    pub fn encode(&self) -> String {
        let mut out = self.records.len().to_string();
        for record in &self.records {
            out.push_str(&record.descriptor.class);
            out.push_str(&record.descriptor.name);
            out.push_str(&record.descriptor.signature);
            out.push_str(&record.code_offset.to_string());
        }
        out
    }

    /// Render a C header declaring the shifted manifest bytes, ready to be
    /// compiled into the native loader.
    ///
    /// Every character of the wire form is emitted as a `\x` escape of its code
    /// minus [`HEADER_SHIFT`], wrapping modulo 256.
    #[must_use]
    pub fn emit_loader_header(&self) -> String {
        let encoded = self.encode();
        let mut out = String::with_capacity(encoded.len() * 4 + 32);
        out.push_str("char encryptedData[] = \"");
        for byte in encoded.bytes() {
            // The loader's additive decode wraps the same way, so the shift
            // stays involutive even for bytes below it
            out.push_str(&format!("\\x{:x}", byte.wrapping_sub(HEADER_SHIFT)));
        }
        out.push_str("\";");
        out
    }
}
