//! Owned structural model of a DEX container.
//!
//! [`DexContainer`] keeps the complete file image in memory alongside decoded views
//! of the identifier tables that method lookup needs: strings, type descriptors,
//! prototypes (with reconstructed `(params)return` signatures), method ids, class
//! definitions, and the class_data method lists. For every encoded method the model
//! records the absolute byte position and encoded width of its `access_flags` and
//! `code_off` ULEB128 fields, which is what makes the width-preserving stub rewrite
//! in [`crate::dex::relocator`] possible.
//!
//! The decoded views are an index over the image, not a replacement for it: all
//! mutation happens on `image` and the views are updated in lockstep. The container
//! is written back exactly once via [`DexContainer::save`].

use std::collections::HashSet;
use std::path::Path;

use bitflags::bitflags;

use crate::{
    dex::header::{DexHeader, NO_INDEX},
    file::{parser::Parser, File},
    Result,
};

bitflags! {
    /// DEX method access flags. Only the subset the relocator touches or logs is
    /// named; unknown bits are preserved verbatim by the stub rewrite.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MethodAccessFlags: u32 {
        /// Publicly visible
        const PUBLIC = 0x1;
        /// Private to the defining class
        const PRIVATE = 0x2;
        /// Protected visibility
        const PROTECTED = 0x4;
        /// Static method
        const STATIC = 0x8;
        /// Final method
        const FINAL = 0x10;
        /// Declared synchronized
        const SYNCHRONIZED = 0x20;
        /// Implemented in native code; a method with this flag carries no code item
        const NATIVE = 0x100;
        /// Abstract method, no implementation
        const ABSTRACT = 0x400;
        /// Constructor
        const CONSTRUCTOR = 0x1_0000;

        const _ = !0;
    }
}

/// One entry of the string identifier table with its decoded MUTF-8 value.
#[derive(Debug, Clone)]
pub struct StringId {
    /// Offset of the string_data_item within the container
    pub offset: u32,
    /// Decoded string value
    pub value: String,
}

/// One entry of the prototype table.
#[derive(Debug, Clone)]
pub struct ProtoId {
    /// Index of the shorty descriptor string
    pub shorty_idx: u32,
    /// Type index of the return type
    pub return_type_idx: u32,
    /// Offset of the parameter type_list, or 0 for no parameters
    pub parameters_off: u32,
    /// Reconstructed full signature, e.g. `(ILjava/lang/String;)V`
    pub signature: String,
}

/// One entry of the method identifier table.
#[derive(Debug, Clone)]
pub struct MethodId {
    /// Type index of the declaring class
    pub class_idx: u16,
    /// Prototype index
    pub proto_idx: u16,
    /// String index of the method name
    pub name_idx: u32,
}

/// One entry of the class definition table.
#[derive(Debug, Clone)]
pub struct ClassDef {
    /// Type index of this class
    pub class_idx: u32,
    /// Class access flags
    pub access_flags: u32,
    /// Type index of the superclass, or [`NO_INDEX`]
    pub superclass_idx: u32,
    /// Offset of the interface type_list, or 0
    pub interfaces_off: u32,
    /// String index of the source file name, or [`NO_INDEX`]
    pub source_file_idx: u32,
    /// Offset of the annotations directory, or 0
    pub annotations_off: u32,
    /// Offset of the class_data_item, or 0 for a marker class without one
    pub class_data_off: u32,
    /// Offset of the static values array, or 0
    pub static_values_off: u32,
}

/// One encoded method within a class_data_item, with the byte-exact location of its
/// mutable ULEB128 fields.
#[derive(Debug, Clone)]
pub struct EncodedMethod {
    /// Absolute method_ids index (diffs already accumulated)
    pub method_idx: u32,
    /// Decoded access flags
    pub access_flags: u32,
    /// Offset of the method's code_item, or 0 for native/abstract methods
    pub code_off: u32,
    /// Absolute image offset of the access_flags ULEB128
    pub flags_pos: usize,
    /// Encoded width of the access_flags ULEB128
    pub flags_len: usize,
    /// Absolute image offset of the code_off ULEB128
    pub code_off_pos: usize,
    /// Encoded width of the code_off ULEB128
    pub code_off_len: usize,
}

/// Decoded method lists of one class_data_item. Field lists are skipped during
/// parsing; the relocator has no use for them.
#[derive(Debug, Clone, Default)]
pub struct ClassData {
    /// Methods in the direct list (static, private, constructors)
    pub direct_methods: Vec<EncodedMethod>,
    /// Methods in the virtual list
    pub virtual_methods: Vec<EncodedMethod>,
}

/// In-memory structural model of a DEX container.
///
/// See the [module documentation](crate::dex::container) for the mutation model.
pub struct DexContainer {
    image: Vec<u8>,
    header: DexHeader,
    strings: Vec<StringId>,
    /// Per type_id: string index of the descriptor
    type_ids: Vec<u32>,
    protos: Vec<ProtoId>,
    method_ids: Vec<MethodId>,
    class_defs: Vec<ClassDef>,
    /// Parallel to `class_defs`; `None` when class_data_off is 0
    class_data: Vec<Option<ClassData>>,
    /// Method indices stubbed during this run, for AlreadyRelocated detection
    pub(crate) relocated: HashSet<u32>,
}

impl DexContainer {
    /// Load and fully parse a container from disk.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::FileError`] on I/O failure and the
    /// [`DexHeader::parse`] / table-decoding errors for malformed input.
    pub fn from_file(path: &Path) -> Result<DexContainer> {
        let file = File::from_file(path)?;
        Self::from_bytes(file.data().to_vec())
    }

    /// Parse a container from an owned byte image.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] / [`crate::Error::NotSupported`] as
    /// described in [`DexHeader::parse`], or when any identifier table fails to
    /// decode.
    pub fn from_bytes(image: Vec<u8>) -> Result<DexContainer> {
        let header = DexHeader::parse(&image)?;

        let strings = Self::parse_strings(&image, &header)?;
        let type_ids = Self::parse_type_ids(&image, &header, &strings)?;
        let protos = Self::parse_protos(&image, &header, &strings, &type_ids)?;
        let method_ids = Self::parse_method_ids(&image, &header, &strings, &protos)?;
        let class_defs = Self::parse_class_defs(&image, &header, &type_ids)?;
        let class_data = class_defs
            .iter()
            .map(|def| {
                if def.class_data_off == 0 {
                    Ok(None)
                } else {
                    Self::parse_class_data(&image, def.class_data_off, &method_ids).map(Some)
                }
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(
            strings = strings.len(),
            types = type_ids.len(),
            methods = method_ids.len(),
            classes = class_defs.len(),
            "parsed DEX container"
        );

        Ok(DexContainer {
            image,
            header,
            strings,
            type_ids,
            protos,
            method_ids,
            class_defs,
            class_data,
            relocated: HashSet::new(),
        })
    }

    fn parse_strings(image: &[u8], header: &DexHeader) -> Result<Vec<StringId>> {
        let mut parser = Parser::new(image);
        let mut strings = Vec::with_capacity(header.string_ids_size as usize);
        if header.string_ids_size > 0 {
            parser.seek(header.string_ids_off as usize)?;
        }
        for _ in 0..header.string_ids_size {
            let offset = parser.read_le::<u32>()?;
            let mut data_parser = Parser::new(image);
            data_parser.seek(offset as usize)?;
            let _utf16_len = data_parser.read_uleb128()?;
            let value = data_parser.read_mutf8()?;
            strings.push(StringId { offset, value });
        }
        Ok(strings)
    }

    fn parse_type_ids(image: &[u8], header: &DexHeader, strings: &[StringId]) -> Result<Vec<u32>> {
        let mut parser = Parser::new(image);
        let mut type_ids = Vec::with_capacity(header.type_ids_size as usize);
        if header.type_ids_size > 0 {
            parser.seek(header.type_ids_off as usize)?;
        }
        for i in 0..header.type_ids_size {
            let descriptor_idx = parser.read_le::<u32>()?;
            if descriptor_idx as usize >= strings.len() {
                return Err(malformed_error!(
                    "type_id {i} references string {descriptor_idx} of {}",
                    strings.len()
                ));
            }
            type_ids.push(descriptor_idx);
        }
        Ok(type_ids)
    }

    fn parse_protos(
        image: &[u8],
        header: &DexHeader,
        strings: &[StringId],
        type_ids: &[u32],
    ) -> Result<Vec<ProtoId>> {
        let descriptor = |type_idx: u32| -> Result<&str> {
            let string_idx = *type_ids
                .get(type_idx as usize)
                .ok_or_else(|| malformed_error!("type index {type_idx} out of range"))?;
            Ok(strings[string_idx as usize].value.as_str())
        };

        let mut parser = Parser::new(image);
        let mut protos = Vec::with_capacity(header.proto_ids_size as usize);
        if header.proto_ids_size > 0 {
            parser.seek(header.proto_ids_off as usize)?;
        }
        for _ in 0..header.proto_ids_size {
            let shorty_idx = parser.read_le::<u32>()?;
            let return_type_idx = parser.read_le::<u32>()?;
            let parameters_off = parser.read_le::<u32>()?;

            let mut signature = String::from("(");
            if parameters_off != 0 {
                let mut list_parser = Parser::new(image);
                list_parser.seek(parameters_off as usize)?;
                let count = list_parser.read_le::<u32>()?;
                for _ in 0..count {
                    let type_idx = list_parser.read_le::<u16>()?;
                    signature.push_str(descriptor(u32::from(type_idx))?);
                }
            }
            signature.push(')');
            signature.push_str(descriptor(return_type_idx)?);

            protos.push(ProtoId {
                shorty_idx,
                return_type_idx,
                parameters_off,
                signature,
            });
        }
        Ok(protos)
    }

    fn parse_method_ids(
        image: &[u8],
        header: &DexHeader,
        strings: &[StringId],
        protos: &[ProtoId],
    ) -> Result<Vec<MethodId>> {
        let mut parser = Parser::new(image);
        let mut method_ids = Vec::with_capacity(header.method_ids_size as usize);
        if header.method_ids_size > 0 {
            parser.seek(header.method_ids_off as usize)?;
        }
        for i in 0..header.method_ids_size {
            let class_idx = parser.read_le::<u16>()?;
            let proto_idx = parser.read_le::<u16>()?;
            let name_idx = parser.read_le::<u32>()?;
            if name_idx as usize >= strings.len() {
                return Err(malformed_error!(
                    "method_id {i} references string {name_idx} of {}",
                    strings.len()
                ));
            }
            if proto_idx as usize >= protos.len() {
                return Err(malformed_error!(
                    "method_id {i} references proto {proto_idx} of {}",
                    protos.len()
                ));
            }
            method_ids.push(MethodId {
                class_idx,
                proto_idx,
                name_idx,
            });
        }
        Ok(method_ids)
    }

    fn parse_class_defs(
        image: &[u8],
        header: &DexHeader,
        type_ids: &[u32],
    ) -> Result<Vec<ClassDef>> {
        let mut parser = Parser::new(image);
        let mut class_defs = Vec::with_capacity(header.class_defs_size as usize);
        if header.class_defs_size > 0 {
            parser.seek(header.class_defs_off as usize)?;
        }
        for i in 0..header.class_defs_size {
            let def = ClassDef {
                class_idx: parser.read_le::<u32>()?,
                access_flags: parser.read_le::<u32>()?,
                superclass_idx: parser.read_le::<u32>()?,
                interfaces_off: parser.read_le::<u32>()?,
                source_file_idx: parser.read_le::<u32>()?,
                annotations_off: parser.read_le::<u32>()?,
                class_data_off: parser.read_le::<u32>()?,
                static_values_off: parser.read_le::<u32>()?,
            };
            if def.class_idx as usize >= type_ids.len() {
                return Err(malformed_error!(
                    "class_def {i} references type {} of {}",
                    def.class_idx,
                    type_ids.len()
                ));
            }
            if def.superclass_idx != NO_INDEX && def.superclass_idx as usize >= type_ids.len() {
                return Err(malformed_error!(
                    "class_def {i} references superclass type {} of {}",
                    def.superclass_idx,
                    type_ids.len()
                ));
            }
            class_defs.push(def);
        }
        Ok(class_defs)
    }

    fn parse_class_data(
        image: &[u8],
        class_data_off: u32,
        method_ids: &[MethodId],
    ) -> Result<ClassData> {
        let mut parser = Parser::new(image);
        parser.seek(class_data_off as usize)?;

        let static_fields = parser.read_uleb128()?;
        let instance_fields = parser.read_uleb128()?;
        let direct_methods = parser.read_uleb128()?;
        let virtual_methods = parser.read_uleb128()?;

        // Field entries are (field_idx_diff, access_flags) ULEB128 pairs
        for _ in 0..(static_fields + instance_fields) {
            parser.read_uleb128()?;
            parser.read_uleb128()?;
        }

        let mut data = ClassData::default();
        for (count, list) in [
            (direct_methods, &mut data.direct_methods),
            (virtual_methods, &mut data.virtual_methods),
        ] {
            let mut method_idx: u32 = 0;
            for i in 0..count {
                let idx_diff = parser.read_uleb128()?;
                method_idx = if i == 0 {
                    idx_diff
                } else {
                    method_idx
                        .checked_add(idx_diff)
                        .ok_or_else(|| malformed_error!("method index diff overflow"))?
                };

                let flags_pos = parser.pos();
                let access_flags = parser.read_uleb128()?;
                let flags_len = parser.pos() - flags_pos;

                let code_off_pos = parser.pos();
                let code_off = parser.read_uleb128()?;
                let code_off_len = parser.pos() - code_off_pos;

                if method_idx as usize >= method_ids.len() {
                    return Err(malformed_error!(
                        "class_data at {class_data_off:#x} references method {method_idx} of {}",
                        method_ids.len()
                    ));
                }
                if code_off != 0 && code_off as usize >= image.len() {
                    return Err(malformed_error!(
                        "method {method_idx} code_off {code_off:#x} outside the container"
                    ));
                }

                list.push(EncodedMethod {
                    method_idx,
                    access_flags,
                    code_off,
                    flags_pos,
                    flags_len,
                    code_off_pos,
                    code_off_len,
                });
            }
        }

        Ok(data)
    }

    /// The parsed header. Integrity fields are stale after any relocation until
    /// [`repair`](DexContainer::repair) runs.
    #[must_use]
    pub fn header(&self) -> &DexHeader {
        &self.header
    }

    /// The complete container image in its current (possibly mutated) state.
    #[must_use]
    pub fn image(&self) -> &[u8] {
        &self.image
    }

    pub(crate) fn image_mut(&mut self) -> &mut Vec<u8> {
        &mut self.image
    }

    pub(crate) fn header_mut(&mut self) -> &mut DexHeader {
        &mut self.header
    }

    /// Decoded string table.
    #[must_use]
    pub fn strings(&self) -> &[StringId] {
        &self.strings
    }

    /// Type descriptor string for `type_idx`.
    #[must_use]
    pub fn type_descriptor(&self, type_idx: u32) -> Option<&str> {
        let string_idx = *self.type_ids.get(type_idx as usize)?;
        Some(self.strings[string_idx as usize].value.as_str())
    }

    /// Prototype table.
    #[must_use]
    pub fn protos(&self) -> &[ProtoId] {
        &self.protos
    }

    /// Method identifier table.
    #[must_use]
    pub fn method_ids(&self) -> &[MethodId] {
        &self.method_ids
    }

    /// Class definition table.
    #[must_use]
    pub fn class_defs(&self) -> &[ClassDef] {
        &self.class_defs
    }

    /// Class data for class definition `index`, when present.
    #[must_use]
    pub fn class_data(&self, index: usize) -> Option<&ClassData> {
        self.class_data.get(index)?.as_ref()
    }

    pub(crate) fn class_data_mut(&mut self, index: usize) -> Option<&mut ClassData> {
        self.class_data.get_mut(index)?.as_mut()
    }

    /// Consume the container, yielding the final image bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.image
    }

    /// Write the image to `path`. This is the single write-back of the container
    /// lifecycle; nothing is written before the in-memory state is complete.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::FileError`] on I/O failure.
    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, &self.image)?;
        tracing::info!(path = %path.display(), bytes = self.image.len(), "container written");
        Ok(())
    }
}
