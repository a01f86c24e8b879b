//! Method location, code-item extraction, and native-trampoline stubbing.
//!
//! A relocation takes one method, identified by its exact (class, name, signature)
//! triple, copies its complete code_item out of the container, and rewrites its
//! class_data entry so the runtime treats it as natively implemented: the
//! `ACC_NATIVE` flag is set and `code_off` becomes zero. The rewrite is
//! width-preserving — the `access_flags` and `code_off` ULEB128 fields are adjacent,
//! and whatever bytes the grown flag encoding needs are borrowed from a padded
//! non-minimal encoding of the zero offset — so no byte in the container moves and
//! previously recorded offsets stay valid.
//!
//! Register and parameter metadata lives in the method prototype and the (now
//! unreferenced) code_item header, both untouched, so the interpreter-boundary
//! calling convention remains intact for the trampoline.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    dex::container::{DexContainer, MethodAccessFlags},
    file::parser::{encode_uleb128, encode_uleb128_padded, Parser},
    manifest::RelocationRecord,
    Result,
};

/// The (declaring class, method name, type signature) triple uniquely identifying a
/// target method within one container.
///
/// Matching is exact and case-sensitive; the signature must equal the method's
/// formal parameter/return encoding (e.g. `(ILjava/lang/String;)Z`). The triple is
/// not unique across containers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodDescriptor {
    /// Declaring class descriptor, e.g. `Lcom/example/Foo;`
    pub class: String,
    /// Method name
    pub name: String,
    /// Full type signature, e.g. `(I)V`
    pub signature: String,
}

impl MethodDescriptor {
    /// Build a descriptor from its three components.
    pub fn new(
        class: impl Into<String>,
        name: impl Into<String>,
        signature: impl Into<String>,
    ) -> MethodDescriptor {
        MethodDescriptor {
            class: class.into(),
            name: name.into(),
            signature: signature.into(),
        }
    }
}

impl fmt::Display for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}{}", self.class, self.name, self.signature)
    }
}

/// Opaque handle to a located method's class_data entry.
///
/// Produced by [`DexContainer::locate`], consumed by
/// [`DexContainer::extract_and_stub`]. Valid only against the container that
/// produced it and only until the next mutation of that container.
#[derive(Debug, Clone, Copy)]
pub struct CodeItemHandle {
    class_def_index: usize,
    /// true for the direct list, false for the virtual list
    direct: bool,
    /// Position within the selected method list
    list_index: usize,
    method_idx: u32,
}

/// The product of one relocation: the extracted code bytes and the immutable record
/// destined for the relocation manifest.
#[derive(Debug, Clone)]
pub struct ExtractedMethod {
    /// Byte-exact copy of the method's complete code_item (header, instructions,
    /// tries, and handlers) as it was before stubbing
    pub code: Vec<u8>,
    /// Descriptor plus original code-item offset
    pub record: RelocationRecord,
}

impl DexContainer {
    /// Locate a method by descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::MethodNotFound`] when no method matches the triple
    /// exactly.
    pub fn locate(&self, descriptor: &MethodDescriptor) -> Result<CodeItemHandle> {
        for (class_def_index, def) in self.class_defs().iter().enumerate() {
            match self.type_descriptor(def.class_idx) {
                Some(desc) if desc == descriptor.class => {}
                _ => continue,
            }

            let Some(data) = self.class_data(class_def_index) else {
                continue;
            };

            for (direct, list) in [(true, &data.direct_methods), (false, &data.virtual_methods)] {
                for (list_index, method) in list.iter().enumerate() {
                    let id = &self.method_ids()[method.method_idx as usize];
                    let name = &self.strings()[id.name_idx as usize].value;
                    let signature = &self.protos()[id.proto_idx as usize].signature;
                    if name == &descriptor.name && signature == &descriptor.signature {
                        return Ok(CodeItemHandle {
                            class_def_index,
                            direct,
                            list_index,
                            method_idx: method.method_idx,
                        });
                    }
                }
            }
        }

        Err(crate::Error::MethodNotFound(descriptor.clone()))
    }

    /// Report whether the method behind `handle` currently carries no interpreted
    /// code — either stubbed by this run or native/abstract to begin with.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] for a handle that does not resolve, which
    /// indicates it outlived its container.
    pub fn is_stubbed(&self, handle: &CodeItemHandle) -> Result<bool> {
        let method = self.resolve(handle)?;
        Ok(method.code_off == 0
            || MethodAccessFlags::from_bits_retain(method.access_flags)
                .contains(MethodAccessFlags::NATIVE))
    }

    fn resolve(&self, handle: &CodeItemHandle) -> Result<&crate::dex::container::EncodedMethod> {
        let data = self
            .class_data(handle.class_def_index)
            .ok_or_else(|| malformed_error!("stale handle: class_data missing"))?;
        let list = if handle.direct {
            &data.direct_methods
        } else {
            &data.virtual_methods
        };
        list.get(handle.list_index)
            .filter(|m| m.method_idx == handle.method_idx)
            .ok_or_else(|| malformed_error!("stale handle: method list changed"))
    }

    /// Extract the method's code_item and replace it with a native-trampoline stub.
    ///
    /// Returns the original code bytes and a [`RelocationRecord`] carrying the
    /// pre-mutation code offset. Safe to call once per descriptor per run.
    ///
    /// # Errors
    ///
    /// - [`crate::Error::AlreadyRelocated`] if this descriptor was already
    ///   extracted in this run
    /// - [`crate::Error::Malformed`] if the method has no code to extract (native
    ///   or abstract) or its code_item is inconsistent
    pub fn extract_and_stub(
        &mut self,
        handle: &CodeItemHandle,
        descriptor: &MethodDescriptor,
    ) -> Result<ExtractedMethod> {
        let method = self.resolve(handle)?.clone();

        if self.relocated.contains(&handle.method_idx) {
            return Err(crate::Error::AlreadyRelocated(descriptor.clone()));
        }
        if method.code_off == 0 {
            return Err(malformed_error!(
                "method {descriptor} has no code item to extract"
            ));
        }

        let code_len = measure_code_item(self.image(), method.code_off as usize)?;
        let code_start = method.code_off as usize;
        let code = self.image()[code_start..code_start + code_len].to_vec();

        // Rewrite access_flags | NATIVE and code_off = 0 into the exact byte span the
        // two ULEB128 fields occupy today. The flag encoding may grow one byte; the
        // padded zero offset shrinks to match.
        let new_flags = method.access_flags | MethodAccessFlags::NATIVE.bits();
        let flags_bytes = encode_uleb128(new_flags);
        let span = method.flags_len + method.code_off_len;
        if flags_bytes.len() >= span {
            return Err(malformed_error!(
                "stub for {descriptor} needs {} bytes but only {span} are encoded",
                flags_bytes.len() + 1
            ));
        }
        let off_bytes = encode_uleb128_padded(0, span - flags_bytes.len())?;

        let start = method.flags_pos;
        let image = self.image_mut();
        image[start..start + flags_bytes.len()].copy_from_slice(&flags_bytes);
        image[start + flags_bytes.len()..start + span].copy_from_slice(&off_bytes);

        // Keep the decoded view in lockstep with the image
        {
            let data = self
                .class_data_mut(handle.class_def_index)
                .ok_or_else(|| malformed_error!("stale handle: class_data missing"))?;
            let list = if handle.direct {
                &mut data.direct_methods
            } else {
                &mut data.virtual_methods
            };
            let entry = &mut list[handle.list_index];
            entry.access_flags = new_flags;
            entry.code_off = 0;
            entry.flags_len = flags_bytes.len();
            entry.code_off_pos = start + flags_bytes.len();
            entry.code_off_len = span - flags_bytes.len();
        }

        self.relocated.insert(handle.method_idx);
        tracing::info!(
            method = %descriptor,
            code_off = format_args!("{:#x}", method.code_off),
            code_len,
            "method relocated to native stub"
        );

        Ok(ExtractedMethod {
            code,
            record: RelocationRecord::new(descriptor.clone(), method.code_off),
        })
    }

    /// Locate and extract in one step. Convenience for the pipeline, which applies
    /// configured descriptors in order.
    ///
    /// # Errors
    ///
    /// Propagates [`DexContainer::locate`] and [`DexContainer::extract_and_stub`].
    pub fn relocate(&mut self, descriptor: &MethodDescriptor) -> Result<ExtractedMethod> {
        let handle = self.locate(descriptor)?;
        self.extract_and_stub(&handle, descriptor)
    }
}

/// Compute the total byte length of the code_item at `offset`, including the
/// instruction array, try records, and the encoded handler list.
///
/// # Errors
///
/// Returns [`crate::Error::OutOfBounds`] / [`crate::Error::Malformed`] for a
/// truncated or inconsistent item.
pub fn measure_code_item(image: &[u8], offset: usize) -> Result<usize> {
    let mut parser = Parser::new(image);
    parser.seek(offset)?;

    let _registers_size = parser.read_le::<u16>()?;
    let _ins_size = parser.read_le::<u16>()?;
    let _outs_size = parser.read_le::<u16>()?;
    let tries_size = parser.read_le::<u16>()?;
    let _debug_info_off = parser.read_le::<u32>()?;
    let insns_size = parser.read_le::<u32>()?;

    let insns_bytes = (insns_size as usize)
        .checked_mul(2)
        .ok_or_else(|| malformed_error!("insns_size overflow in code_item at {offset:#x}"))?;
    parser.advance_by(insns_bytes)?;

    if tries_size > 0 {
        // Optional two-byte pad aligns the try records to four bytes
        if insns_size % 2 == 1 {
            parser.advance_by(2)?;
        }
        parser.advance_by(usize::from(tries_size) * 8)?;

        let handler_count = parser.read_uleb128()?;
        for _ in 0..handler_count {
            let size = parser.read_sleb128()?;
            for _ in 0..size.unsigned_abs() {
                parser.read_uleb128()?; // type_idx
                parser.read_uleb128()?; // addr
            }
            if size <= 0 {
                parser.read_uleb128()?; // catch_all_addr
            }
        }
    }

    Ok(parser.pos() - offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dex::container::DexContainer;
    use crate::test::build_minimal_dex;

    fn foo() -> MethodDescriptor {
        MethodDescriptor::new("LA;", "foo", "(I)V")
    }

    fn bar() -> MethodDescriptor {
        MethodDescriptor::new("LB;", "bar", "()Z")
    }

    #[test]
    fn locate_finds_direct_and_virtual_methods() {
        let dex = DexContainer::from_bytes(build_minimal_dex()).unwrap();
        assert!(dex.locate(&foo()).is_ok());
        assert!(dex.locate(&bar()).is_ok());
    }

    #[test]
    fn locate_is_exact_on_every_component() {
        let dex = DexContainer::from_bytes(build_minimal_dex()).unwrap();
        for descriptor in [
            MethodDescriptor::new("LC;", "foo", "(I)V"),
            MethodDescriptor::new("LA;", "Foo", "(I)V"),
            MethodDescriptor::new("LA;", "foo", "(J)V"),
            MethodDescriptor::new("LA;", "foo", "()Z"),
        ] {
            assert!(matches!(
                dex.locate(&descriptor),
                Err(crate::Error::MethodNotFound(d)) if d == descriptor
            ));
        }
    }

    #[test]
    fn extract_returns_exact_code_bytes_and_stubs_method() {
        let mut dex = DexContainer::from_bytes(build_minimal_dex()).unwrap();
        let handle = dex.locate(&foo()).unwrap();
        assert!(!dex.is_stubbed(&handle).unwrap());

        let before = dex.image().to_vec();
        let code_off = {
            let data = dex.class_data(0).unwrap();
            data.direct_methods[0].code_off as usize
        };
        let code_len = measure_code_item(&before, code_off).unwrap();

        let extracted = dex.extract_and_stub(&handle, &foo()).unwrap();
        assert_eq!(extracted.code, before[code_off..code_off + code_len].to_vec());
        assert_eq!(extracted.record.code_offset as usize, code_off);
        assert!(dex.is_stubbed(&handle).unwrap());

        // Nothing outside the two rewritten ULEB128 fields may move
        assert_eq!(dex.image().len(), before.len());
        let method = &dex.class_data(0).unwrap().direct_methods[0];
        let span_start = method.flags_pos;
        let span_end = method.code_off_pos + method.code_off_len;
        assert_eq!(dex.image()[..span_start], before[..span_start]);
        assert_eq!(dex.image()[span_end..], before[span_end..]);
    }

    #[test]
    fn stub_sets_native_flag_and_clears_code_off() {
        let mut dex = DexContainer::from_bytes(build_minimal_dex()).unwrap();
        dex.relocate(&foo()).unwrap();

        let method = &dex.class_data(0).unwrap().direct_methods[0];
        assert_eq!(method.code_off, 0);
        assert!(MethodAccessFlags::from_bits_retain(method.access_flags)
            .contains(MethodAccessFlags::NATIVE));

        // Reparsing the mutated image must agree with the in-memory view
        let reparsed = DexContainer::from_bytes(dex.image().to_vec()).unwrap();
        let method = &reparsed.class_data(0).unwrap().direct_methods[0];
        assert_eq!(method.code_off, 0);
        assert!(MethodAccessFlags::from_bits_retain(method.access_flags)
            .contains(MethodAccessFlags::NATIVE));
    }

    #[test]
    fn double_relocation_is_rejected() {
        let mut dex = DexContainer::from_bytes(build_minimal_dex()).unwrap();
        dex.relocate(&foo()).unwrap();
        assert!(matches!(
            dex.relocate(&foo()),
            Err(crate::Error::AlreadyRelocated(d)) if d == foo()
        ));
    }

    #[test]
    fn independent_relocations_do_not_interfere() {
        let mut dex = DexContainer::from_bytes(build_minimal_dex()).unwrap();
        let first = dex.relocate(&foo()).unwrap();
        let second = dex.relocate(&bar()).unwrap();
        assert_ne!(first.record.code_offset, second.record.code_offset);

        let reparsed = DexContainer::from_bytes(dex.image().to_vec()).unwrap();
        assert_eq!(reparsed.class_data(0).unwrap().direct_methods[0].code_off, 0);
        assert_eq!(reparsed.class_data(1).unwrap().virtual_methods[0].code_off, 0);
    }

    #[test]
    fn measure_handles_tries_and_handlers() {
        // Hand-built code_item: 1 insn unit, one try with one catch-all handler
        let mut item = Vec::new();
        item.extend_from_slice(&1u16.to_le_bytes()); // registers_size
        item.extend_from_slice(&0u16.to_le_bytes()); // ins_size
        item.extend_from_slice(&0u16.to_le_bytes()); // outs_size
        item.extend_from_slice(&1u16.to_le_bytes()); // tries_size
        item.extend_from_slice(&0u32.to_le_bytes()); // debug_info_off
        item.extend_from_slice(&1u32.to_le_bytes()); // insns_size
        item.extend_from_slice(&[0x0e, 0x00]); // return-void
        item.extend_from_slice(&[0x00, 0x00]); // pad to 4-byte alignment
        item.extend_from_slice(&0u32.to_le_bytes()); // try.start_addr
        item.extend_from_slice(&1u16.to_le_bytes()); // try.insn_count
        item.extend_from_slice(&1u16.to_le_bytes()); // try.handler_off
        item.push(0x01); // handler list size
        item.push(0x00); // handler size: 0 (catch-all only)
        item.push(0x00); // catch_all_addr

        let expected = item.len();
        item.push(0xaa); // trailing byte that must not be counted
        assert_eq!(measure_code_item(&item, 0).unwrap(), expected);
    }

    #[test]
    fn measure_rejects_truncated_item() {
        let item = [0u8; 10];
        assert!(measure_code_item(&item, 0).is_err());
    }
}
