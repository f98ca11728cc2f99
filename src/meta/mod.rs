
//! Fixed on-disk structures at the start of every file:
//! the magic tag, the file info record, and the pixel type enumeration.

use crate::io::*;
use crate::error::{Error, Result, UnitResult};
use crate::math::compute_packed_byte_count;


/// Absolute position of the file info record. Directly follows the header tag.
pub const FILE_INFO_POSITION: u64 = 20;

/// Absolute position of the embedded dictionary text in a newly created file.
/// Directly follows the file info record.
pub const DICTIONARY_POSITION: u64 = 38;

/// Byte count of one entry header on disk.
pub const ENTRY_HEADER_BYTES: u64 = 128;


/// The first sixteen bytes of each file.
/// Used to abort reading files of other formats.
pub mod magic_number {
    use super::*;

    /// The first sixteen bytes of each file, NUL terminated within the field.
    pub const BYTES: [u8; 16] = *b"EHFA_HEADER_TAG\0";

    /// Without validation, write the header tag and the pointer
    /// to the file info record to the byte stream.
    pub fn write(write: &mut impl Write) -> UnitResult {
        u8::write_slice(write, &self::BYTES)?;
        (FILE_INFO_POSITION as u32).write(write)
    }

    /// Consume sixteen bytes from the reader
    /// and return whether the file may be an hfa file.
    /// Only the fifteen bytes before the NUL terminator are compared.
    pub fn matches(read: &mut impl Read) -> Result<bool> {
        let mut magic_num = [0_u8; 16];
        u8::read_slice(read, &mut magic_num)?;
        Ok(magic_num[..15] == self::BYTES[..15])
    }

    /// Validate the header tag. If it is an hfa file, return `Ok(())`.
    pub fn validate(read: &mut impl Read) -> UnitResult {
        if self::matches(read)? {
            Ok(())
        }
        else {
            Err(Error::malformed("file identifier missing"))
        }
    }
}


/// The file info record, stored directly after the header tag.
/// Locates the root of the node tree and the dictionary text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {

    /// The file format version. Always `1`.
    pub version: i32,

    /// Reserved pointer to a free block list. Never used.
    pub free_list: u32,

    /// Position of the root node of the tree, or zero before the first flush.
    pub root_position: u32,

    /// Byte count of one entry header. Always `128`.
    pub entry_header_length: i16,

    /// Position of the NUL terminated dictionary text.
    pub dictionary_position: u32,
}

impl FileInfo {

    /// The file info record of a newly created file,
    /// with the dictionary directly following it and no root node yet.
    pub fn new() -> Self {
        FileInfo {
            version: 1,
            free_list: 0,
            root_position: 0,
            entry_header_length: ENTRY_HEADER_BYTES as i16,
            dictionary_position: DICTIONARY_POSITION as u32,
        }
    }

    /// Read the file info record from the current stream position.
    pub fn read(read: &mut impl Read) -> Result<Self> {
        Ok(FileInfo {
            version: i32::read(read)?,
            free_list: u32::read(read)?,
            root_position: u32::read(read)?,
            entry_header_length: i16::read(read)?,
            dictionary_position: u32::read(read)?,
        })
    }

    /// Write the file info record to the current stream position.
    pub fn write(self, write: &mut impl Write) -> UnitResult {
        self.version.write(write)?;
        self.free_list.write(write)?;
        self.root_position.write(write)?;
        self.entry_header_length.write(write)?;
        self.dictionary_position.write(write)
    }
}

impl Default for FileInfo {
    fn default() -> Self { Self::new() }
}


/// The type of all samples in a raster layer,
/// as stored in the `pixelType` field of the layer node.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum PixelType {

    /// 1 bit unsigned, eight pixels per byte.
    U1,

    /// 2 bit unsigned, four pixels per byte.
    U2,

    /// 4 bit unsigned, two pixels per byte.
    U4,

    /// 8 bit unsigned integer.
    U8,

    /// 8 bit signed integer.
    S8,

    /// 16 bit unsigned integer.
    U16,

    /// 16 bit signed integer.
    S16,

    /// 32 bit unsigned integer.
    U32,

    /// 32 bit signed integer.
    S32,

    /// 32 bit float.
    F32,

    /// 64 bit float.
    F64,

    /// 64 bit complex number, two 32 bit float halves.
    C64,

    /// 128 bit complex number, two 64 bit float halves.
    C128,
}

impl PixelType {

    /// Interpret the integer enumeration stored in a layer node.
    pub fn from_code(code: i32) -> Result<Self> {
        use self::PixelType::*;
        Ok(match code {
            0 => U1, 1 => U2, 2 => U4,
            3 => U8, 4 => S8,
            5 => U16, 6 => S16,
            7 => U32, 8 => S32,
            9 => F32, 10 => F64,
            11 => C64, 12 => C128,
            _ => return Err(Error::bad_type(format!("pixel type code {}", code))),
        })
    }

    /// The integer enumeration stored in a layer node.
    pub fn code(self) -> i32 {
        use self::PixelType::*;
        match self {
            U1 => 0, U2 => 1, U4 => 2,
            U8 => 3, S8 => 4,
            U16 => 5, S16 => 6,
            U32 => 7, S32 => 8,
            F32 => 9, F64 => 10,
            C64 => 11, C128 => 12,
        }
    }

    /// Number of bits one pixel of this type occupies.
    pub fn bits_per_pixel(self) -> usize {
        use self::PixelType::*;
        match self {
            U1 => 1, U2 => 2, U4 => 4,
            U8 | S8 => 8,
            U16 | S16 => 16,
            U32 | S32 | F32 => 32,
            F64 | C64 => 64,
            C128 => 128,
        }
    }

    /// The packed byte count of a run of pixels of this type.
    pub fn packed_byte_count(self, pixel_count: usize) -> usize {
        compute_packed_byte_count(pixel_count, self.bits_per_pixel())
    }

    /// The item type character used in the per-layer `Ehfa_Layer` dictionary.
    // unsigned 32 bit values are declared as `L`, as Imagine expects
    pub fn band_type_char(self) -> char {
        use self::PixelType::*;
        match self {
            U1 => '1', U2 => '2', U4 => '4',
            U8 => 'c', S8 => 'C',
            U16 => 's', S16 => 'S',
            U32 | S32 => 'L',
            F32 => 'f', F64 => 'd',
            C64 => 'm', C128 => 'M',
        }
    }
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pixel_type_codes_round_trip(){
        for code in 0..13 {
            assert_eq!(PixelType::from_code(code).unwrap().code(), code);
        }

        assert!(PixelType::from_code(13).is_err());
        assert!(PixelType::from_code(-1).is_err());
    }

    #[test]
    fn pixel_byte_counts(){
        assert_eq!(PixelType::U8.packed_byte_count(64 * 64), 4096);
        assert_eq!(PixelType::U1.packed_byte_count(64 * 64), 512);
        assert_eq!(PixelType::U4.packed_byte_count(3), 2);
        assert_eq!(PixelType::C128.packed_byte_count(2), 32);
    }

    #[test]
    fn file_info_round_trip(){
        let info = FileInfo::new();
        let mut bytes = Vec::new();
        info.write(&mut bytes).unwrap();
        assert_eq!(bytes.len(), 18);

        let decoded = FileInfo::read(&mut bytes.as_slice()).unwrap();
        assert_eq!(decoded, info);
    }

    #[test]
    fn magic_number_is_sixteen_bytes(){
        let mut bytes = Vec::new();
        magic_number::write(&mut bytes).unwrap();
        assert_eq!(bytes.len(), 20);
        assert_eq!(&bytes[..15], b"EHFA_HEADER_TAG");

        magic_number::validate(&mut bytes.as_slice()).unwrap();
        assert!(magic_number::validate(&mut &b"EHFA_WRONG_TAG_\0\x14\0\0\0"[..]).is_err());
    }
}
