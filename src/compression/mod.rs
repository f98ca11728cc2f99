
//! Contains the compression flags
//! and the run length codec used for raster tiles.

pub mod rle;

use crate::meta::PixelType;


/// Specifies whether raster tiles of a layer are compressed.
/// The run length scheme works best for thematic images with large flat areas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {

    /// Store raw pixels.
    /// Produces larger files that can be read and written very quickly.
    Uncompressed,

    /// Run length encoding with min-relative reduced-width values.
    /// This compression method is lossless.
    /// Tiles that would not shrink are stored raw.
    RunLength,
}

impl Compression {

    /// Whether tiles of the given pixel type can be stored
    /// with this compression.
    pub fn supports(self, pixel: PixelType) -> bool {
        match self {
            Compression::Uncompressed => true,
            Compression::RunLength => rle::supports(pixel),
        }
    }
}

impl std::fmt::Display for Compression {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{} compression", match self {
            Compression::Uncompressed => "no",
            Compression::RunLength => "run length",
        })
    }
}


/// Swap every multi byte pixel in the buffer between the on-disk
/// little-endian form and the native form.
/// Complex pixels swap their two halves separately.
/// A no-op on little-endian hosts.
pub fn convert_pixels_between_little_endian_and_native(data: &mut [u8], pixel: PixelType) {
    #[cfg(target_endian = "big")] {
        let half_bytes = match pixel {
            PixelType::C64 => 4,
            PixelType::C128 => 8,
            other => other.bits_per_pixel() / 8,
        };

        if half_bytes > 1 {
            for value in data.chunks_exact_mut(half_bytes) {
                value.reverse();
            }
        }
    }

    #[cfg(target_endian = "little")] {
        let _ = (data, pixel);
    }
}
