
//! Low level byte layer.
//! Every multi byte value that reaches the disk goes through this module,
//! so endianness is handled in exactly one place.
//! The on-disk form is always little-endian.

pub use ::std::io::{Read, Seek, SeekFrom, Write};
use lebe::prelude::*;
use crate::error::{Error, Result, UnitResult};


/// Position a seekable stream at an absolute byte offset.
#[inline]
pub fn seek_to(seek: &mut impl Seek, position: u64) -> UnitResult {
    seek.seek(SeekFrom::Start(position))?;
    Ok(())
}

/// The byte length of a seekable stream, leaving the cursor at the end.
#[inline]
pub fn seek_to_end(seek: &mut impl Seek) -> Result<u64> {
    Ok(seek.seek(SeekFrom::End(0))?)
}


/// Extension trait for primitive types like numbers and arrays.
pub trait Data: Sized + Default + Clone {

    /// Number of bytes this would consume in a file.
    const BYTE_SIZE: usize = ::std::mem::size_of::<Self>();

    /// Read a value of type `Self`.
    fn read(read: &mut impl Read) -> Result<Self>;

    /// Read as many values of type `Self` as fit into the specified slice.
    /// If the slice cannot be filled completely, returns `Error::Io`.
    fn read_slice(read: &mut impl Read, slice: &mut [Self]) -> UnitResult;

    /// Write this value to the writer.
    fn write(self, write: &mut impl Write) -> UnitResult;

    /// Write all values of that slice to the writer.
    fn write_slice(write: &mut impl Write, slice: &[Self]) -> UnitResult;
}


macro_rules! implement_data_for_primitive {
    ($kind: ident) => {
        impl Data for $kind {
            fn read(read: &mut impl Read) -> Result<Self> {
                Ok(read.read_from_little_endian()?)
            }

            fn write(self, write: &mut impl Write) -> UnitResult {
                write.write_as_little_endian(&self)?;
                Ok(())
            }

            fn read_slice(read: &mut impl Read, slice: &mut [Self]) -> UnitResult {
                read.read_from_little_endian_into(slice)?;
                Ok(())
            }

            fn write_slice(write: &mut impl Write, slice: &[Self]) -> UnitResult {
                write.write_as_little_endian(slice)?;
                Ok(())
            }
        }
    };
}

implement_data_for_primitive!(u8);
implement_data_for_primitive!(i8);
implement_data_for_primitive!(i16);
implement_data_for_primitive!(u16);
implement_data_for_primitive!(u32);
implement_data_for_primitive!(i32);
implement_data_for_primitive!(i64);
implement_data_for_primitive!(u64);
implement_data_for_primitive!(f32);
implement_data_for_primitive!(f64);


/// Decode one little-endian value at a byte offset inside an in-memory buffer.
#[inline]
pub fn read_at<T: Data>(buffer: &[u8], offset: usize) -> Result<T> {
    let end = offset.checked_add(T::BYTE_SIZE)
        .filter(|end| *end <= buffer.len())
        .ok_or_else(|| Error::truncated("value extends past end of buffer"))?;

    T::read(&mut &buffer[offset .. end])
}

/// Encode one little-endian value at a byte offset inside an in-memory buffer.
#[inline]
pub fn write_at<T: Data>(buffer: &mut [u8], offset: usize, value: T) -> UnitResult {
    let end = offset.checked_add(T::BYTE_SIZE)
        .filter(|end| *end <= buffer.len())
        .ok_or_else(|| Error::too_large("value extends past end of buffer"))?;

    value.write(&mut &mut buffer[offset .. end])
}


/// Read a fixed-width NUL-padded text field, for example an entry name.
/// The text ends at the first NUL byte inside the field.
pub fn read_padded_text(read: &mut impl Read, width: usize) -> Result<String> {
    let mut bytes = vec![ 0_u8; width ];
    u8::read_slice(read, &mut bytes)?;

    let length = bytes.iter().position(|byte| *byte == 0).unwrap_or(width);
    bytes.truncate(length);

    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Write a fixed-width NUL-padded text field.
/// The text must be strictly shorter than the field so that
/// at least one NUL terminator remains.
pub fn write_padded_text(write: &mut impl Write, text: &str, width: usize) -> UnitResult {
    if text.len() >= width {
        return Err(Error::too_large(format!("text `{}` exceeds its {} byte field", text, width)));
    }

    let mut bytes = vec![ 0_u8; width ];
    bytes[.. text.len()].copy_from_slice(text.as_bytes());
    u8::write_slice(write, &bytes)
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trip_buffer_values(){
        let mut buffer = vec![ 0_u8; 16 ];
        write_at(&mut buffer, 2, 0x0403_0201_u32).unwrap();
        write_at(&mut buffer, 8, -1.5_f64).unwrap();

        assert_eq!(buffer[2..6], [ 1, 2, 3, 4 ]);
        assert_eq!(read_at::<u32>(&buffer, 2).unwrap(), 0x0403_0201);
        assert_eq!(read_at::<f64>(&buffer, 8).unwrap(), -1.5);
    }

    #[test]
    fn buffer_values_bounds(){
        let buffer = [ 0_u8; 3 ];
        assert!(read_at::<u32>(&buffer, 0).is_err());
        assert!(read_at::<u8>(&buffer, 3).is_err());
        assert!(read_at::<u8>(&buffer, 2).is_ok());
    }

    #[test]
    fn padded_text(){
        let mut bytes = Vec::new();
        write_padded_text(&mut bytes, "RasterDMS", 64).unwrap();
        assert_eq!(bytes.len(), 64);
        assert_eq!(&bytes[..10], b"RasterDMS\0");

        let text = read_padded_text(&mut bytes.as_slice(), 64).unwrap();
        assert_eq!(text, "RasterDMS");

        assert!(write_padded_text(&mut Vec::new(), "four", 4).is_err());
    }
}
