//! DEX header parsing, serialization, and sanity validation.
//!
//! The 0x70-byte header anchors every table in the container: the integrity fields
//! (Adler-32 checksum at offset 8, SHA-1 signature at offset 12) and the offset/size
//! pairs for the string, type, prototype, field, method, and class-definition tables.
//! Validation here is the gate for [`crate::Error::Malformed`]: a header that passes
//! guarantees every advertised table range lies inside the buffer, so downstream
//! decoders only need item-level bounds checks.

use crate::{
    file::io::{read_le_at, write_le_at},
    Result,
};

/// Size of the DEX header in bytes.
pub const HEADER_SIZE: u32 = 0x70;

/// Byte offset of the Adler-32 checksum field.
pub const CHECKSUM_OFFSET: usize = 8;

/// Byte offset of the SHA-1 signature field.
pub const SIGNATURE_OFFSET: usize = 12;

/// Length of the SHA-1 signature field in bytes.
pub const SIGNATURE_LEN: usize = 20;

/// Byte offset of the first field after the signature (`file_size`).
pub const SIGNATURE_END: usize = SIGNATURE_OFFSET + SIGNATURE_LEN;

/// Little-endian endian tag. The byte-swapped constant (0x78563412) marks a
/// big-endian container, which this library does not support.
pub const ENDIAN_CONSTANT: u32 = 0x1234_5678;

const REVERSE_ENDIAN_CONSTANT: u32 = 0x7856_3412;

/// Sentinel index meaning "no value" in DEX index fields.
pub const NO_INDEX: u32 = 0xffff_ffff;

/// Parsed DEX header.
///
/// Field order and widths follow the published format; this struct round-trips
/// byte-for-byte through [`DexHeader::parse`] and [`DexHeader::write`].
#[derive(Debug, Clone)]
pub struct DexHeader {
    /// Magic bytes, `dex\n0NN\0`
    pub magic: [u8; 8],
    /// Adler-32 over everything after this field and the magic
    pub checksum: u32,
    /// SHA-1 over everything after this field
    pub signature: [u8; SIGNATURE_LEN],
    /// Total file size in bytes
    pub file_size: u32,
    /// Header size, 0x70 for all supported versions
    pub header_size: u32,
    /// Endianness tag, [`ENDIAN_CONSTANT`]
    pub endian_tag: u32,
    /// Link section size (unused by this library)
    pub link_size: u32,
    /// Link section offset
    pub link_off: u32,
    /// Offset of the map list
    pub map_off: u32,
    /// Number of string identifiers
    pub string_ids_size: u32,
    /// Offset of the string identifier table
    pub string_ids_off: u32,
    /// Number of type identifiers
    pub type_ids_size: u32,
    /// Offset of the type identifier table
    pub type_ids_off: u32,
    /// Number of method prototypes
    pub proto_ids_size: u32,
    /// Offset of the prototype table
    pub proto_ids_off: u32,
    /// Number of field identifiers
    pub field_ids_size: u32,
    /// Offset of the field identifier table
    pub field_ids_off: u32,
    /// Number of method identifiers
    pub method_ids_size: u32,
    /// Offset of the method identifier table
    pub method_ids_off: u32,
    /// Number of class definitions
    pub class_defs_size: u32,
    /// Offset of the class definition table
    pub class_defs_off: u32,
    /// Size of the data section
    pub data_size: u32,
    /// Offset of the data section
    pub data_off: u32,
}

impl DexHeader {
    /// Parse and validate a header from the start of `data`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Malformed`] for a bad magic, a `file_size` that
    /// disagrees with the buffer, or any table range outside the file;
    /// [`crate::Error::NotSupported`] for byte-swapped containers.
    pub fn parse(data: &[u8]) -> Result<DexHeader> {
        if data.len() < HEADER_SIZE as usize {
            return Err(malformed_error!(
                "container of {} bytes is smaller than the {} byte header",
                data.len(),
                HEADER_SIZE
            ));
        }

        let mut magic = [0u8; 8];
        magic.copy_from_slice(&data[0..8]);
        if &magic[0..4] != b"dex\n" || magic[7] != 0 {
            return Err(malformed_error!("bad DEX magic {:02x?}", magic));
        }
        if !matches!(&magic[4..7], b"035" | b"036" | b"037" | b"038" | b"039" | b"040" | b"041") {
            return Err(crate::Error::NotSupported);
        }

        let mut offset = CHECKSUM_OFFSET;
        let checksum = read_le_at::<u32>(data, &mut offset)?;
        let mut signature = [0u8; SIGNATURE_LEN];
        signature.copy_from_slice(&data[SIGNATURE_OFFSET..SIGNATURE_END]);
        offset = SIGNATURE_END;

        let header = DexHeader {
            magic,
            checksum,
            signature,
            file_size: read_le_at::<u32>(data, &mut offset)?,
            header_size: read_le_at::<u32>(data, &mut offset)?,
            endian_tag: read_le_at::<u32>(data, &mut offset)?,
            link_size: read_le_at::<u32>(data, &mut offset)?,
            link_off: read_le_at::<u32>(data, &mut offset)?,
            map_off: read_le_at::<u32>(data, &mut offset)?,
            string_ids_size: read_le_at::<u32>(data, &mut offset)?,
            string_ids_off: read_le_at::<u32>(data, &mut offset)?,
            type_ids_size: read_le_at::<u32>(data, &mut offset)?,
            type_ids_off: read_le_at::<u32>(data, &mut offset)?,
            proto_ids_size: read_le_at::<u32>(data, &mut offset)?,
            proto_ids_off: read_le_at::<u32>(data, &mut offset)?,
            field_ids_size: read_le_at::<u32>(data, &mut offset)?,
            field_ids_off: read_le_at::<u32>(data, &mut offset)?,
            method_ids_size: read_le_at::<u32>(data, &mut offset)?,
            method_ids_off: read_le_at::<u32>(data, &mut offset)?,
            class_defs_size: read_le_at::<u32>(data, &mut offset)?,
            class_defs_off: read_le_at::<u32>(data, &mut offset)?,
            data_size: read_le_at::<u32>(data, &mut offset)?,
            data_off: read_le_at::<u32>(data, &mut offset)?,
        };

        if header.endian_tag == REVERSE_ENDIAN_CONSTANT {
            return Err(crate::Error::NotSupported);
        }
        if header.endian_tag != ENDIAN_CONSTANT {
            return Err(malformed_error!(
                "unrecognized endian tag {:#010x}",
                header.endian_tag
            ));
        }
        if header.header_size < HEADER_SIZE {
            return Err(malformed_error!(
                "header_size {:#x} below minimum {:#x}",
                header.header_size,
                HEADER_SIZE
            ));
        }
        if header.file_size as usize != data.len() {
            return Err(malformed_error!(
                "file_size field {} disagrees with actual size {}",
                header.file_size,
                data.len()
            ));
        }

        header.check_table(data, "string_ids", header.string_ids_off, header.string_ids_size, 4)?;
        header.check_table(data, "type_ids", header.type_ids_off, header.type_ids_size, 4)?;
        header.check_table(data, "proto_ids", header.proto_ids_off, header.proto_ids_size, 12)?;
        header.check_table(data, "field_ids", header.field_ids_off, header.field_ids_size, 8)?;
        header.check_table(data, "method_ids", header.method_ids_off, header.method_ids_size, 8)?;
        header.check_table(data, "class_defs", header.class_defs_off, header.class_defs_size, 32)?;
        header.check_table(data, "data", header.data_off, header.data_size, 1)?;

        Ok(header)
    }

    fn check_table(
        &self,
        data: &[u8],
        name: &str,
        offset: u32,
        count: u32,
        item_size: u32,
    ) -> Result<()> {
        if count == 0 {
            return Ok(());
        }

        let bytes = u64::from(count) * u64::from(item_size);
        let end = u64::from(offset) + bytes;
        if offset < self.header_size && offset != 0 || end > data.len() as u64 {
            return Err(malformed_error!(
                "{name} table [{offset:#x}..{end:#x}) lies outside the container"
            ));
        }
        Ok(())
    }

    /// Serialize the header back into the first 0x70 bytes of `data`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::OutOfBounds`] if `data` is shorter than the header.
    pub fn write(&self, data: &mut [u8]) -> Result<()> {
        if data.len() < HEADER_SIZE as usize {
            return Err(crate::Error::OutOfBounds);
        }

        data[0..8].copy_from_slice(&self.magic);
        let mut offset = CHECKSUM_OFFSET;
        write_le_at(data, &mut offset, self.checksum)?;
        data[SIGNATURE_OFFSET..SIGNATURE_END].copy_from_slice(&self.signature);
        offset = SIGNATURE_END;
        write_le_at(data, &mut offset, self.file_size)?;
        write_le_at(data, &mut offset, self.header_size)?;
        write_le_at(data, &mut offset, self.endian_tag)?;
        write_le_at(data, &mut offset, self.link_size)?;
        write_le_at(data, &mut offset, self.link_off)?;
        write_le_at(data, &mut offset, self.map_off)?;
        write_le_at(data, &mut offset, self.string_ids_size)?;
        write_le_at(data, &mut offset, self.string_ids_off)?;
        write_le_at(data, &mut offset, self.type_ids_size)?;
        write_le_at(data, &mut offset, self.type_ids_off)?;
        write_le_at(data, &mut offset, self.proto_ids_size)?;
        write_le_at(data, &mut offset, self.proto_ids_off)?;
        write_le_at(data, &mut offset, self.field_ids_size)?;
        write_le_at(data, &mut offset, self.field_ids_off)?;
        write_le_at(data, &mut offset, self.method_ids_size)?;
        write_le_at(data, &mut offset, self.method_ids_off)?;
        write_le_at(data, &mut offset, self.class_defs_size)?;
        write_le_at(data, &mut offset, self.class_defs_off)?;
        write_le_at(data, &mut offset, self.data_size)?;
        write_le_at(data, &mut offset, self.data_off)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::build_minimal_dex;

    #[test]
    fn parse_accepts_well_formed_header() {
        let dex = build_minimal_dex();
        let header = DexHeader::parse(&dex).unwrap();
        assert_eq!(&header.magic[0..4], b"dex\n");
        assert_eq!(header.endian_tag, ENDIAN_CONSTANT);
        assert_eq!(header.file_size as usize, dex.len());
    }

    #[test]
    fn parse_rejects_bad_magic() {
        let mut dex = build_minimal_dex();
        dex[0] = b'x';
        assert!(DexHeader::parse(&dex).is_err());
    }

    #[test]
    fn parse_rejects_unknown_version() {
        let mut dex = build_minimal_dex();
        dex[4..7].copy_from_slice(b"099");
        assert!(matches!(
            DexHeader::parse(&dex),
            Err(crate::Error::NotSupported)
        ));
    }

    #[test]
    fn parse_rejects_byte_swapped_container() {
        let mut dex = build_minimal_dex();
        dex[40..44].copy_from_slice(&0x7856_3412u32.to_le_bytes());
        assert!(matches!(
            DexHeader::parse(&dex),
            Err(crate::Error::NotSupported)
        ));
    }

    #[test]
    fn parse_rejects_file_size_mismatch() {
        let mut dex = build_minimal_dex();
        dex[32..36].copy_from_slice(&1u32.to_le_bytes());
        assert!(DexHeader::parse(&dex).is_err());
    }

    #[test]
    fn parse_rejects_truncated_buffer() {
        let dex = build_minimal_dex();
        assert!(DexHeader::parse(&dex[..0x40]).is_err());
    }

    #[test]
    fn write_round_trips() {
        let dex = build_minimal_dex();
        let header = DexHeader::parse(&dex).unwrap();
        let mut out = vec![0u8; dex.len()];
        header.write(&mut out).unwrap();
        assert_eq!(&out[..HEADER_SIZE as usize], &dex[..HEADER_SIZE as usize]);
    }
}
