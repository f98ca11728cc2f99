
//! The spill file: an optional sibling `.ige` file holding large raster
//! payloads when the main file would exceed the 2 GB offset range.
//!
//! Each layer stack written into the spill file starts with a fixed
//! prefix, followed by one validity bitmap per layer, followed by the
//! reserved tile data region. Tile positions are computed, not stored.

use std::fs;
use std::path::Path;

use crate::io::*;
use crate::math::compute_block_count;
use crate::meta::PixelType;
use crate::error::{Error, Result, UnitResult};


/// The 25 byte magic text at the start of a spill file, and its NUL terminator.
pub const MAGIC: &[u8; 26] = b"ERDAS_IMG_EXTERNAL_RASTER\0";

/// Byte count of the header preceding each per-layer validity bitmap.
pub const BITMAP_HEADER_BYTES: usize = 20;


/// Consume the magic bytes and fail if they do not introduce a spill file.
pub fn validate_magic(read: &mut impl Read) -> UnitResult {
    let mut magic = [ 0_u8; 26 ];
    u8::read_slice(read, &mut magic)?;

    if magic == *MAGIC { Ok(()) }
    else { Err(Error::malformed("external raster file identifier missing")) }
}


/// The position of the data of one tile inside a layer stack.
/// Tiles of all layers are interleaved per block index.
pub fn tile_position(data_offset: u64, tile_bytes: u64, block_index: usize, layer_count: usize, layer_index: usize) -> u64 {
    data_offset + tile_bytes * (block_index as u64 * layer_count as u64 + layer_index as u64)
}

/// The index of the validity bit of a tile inside the bitmap of its layer.
/// The fixed bitmap header is skipped bitwise.
pub fn tile_validity_bit(row: usize, column: usize, bytes_per_row: usize) -> usize {
    row * bytes_per_row * 8 + column + BITMAP_HEADER_BYTES * 8
}


/// The result of reserving a layer stack in the spill file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpillStack {

    /// Position of the first per-layer validity bitmap.
    pub validity_offset: u64,

    /// Position of the tile data region.
    pub data_offset: u64,
}


/// Reserve a stack of raster layers in the spill file next to the main
/// file, creating the spill file if it does not exist yet.
/// All tiles start valid; the data region is reserved sparsely
/// by writing a single byte at its final position.
pub fn create_stack(directory: &Path, filename: &str, width: usize, height: usize, layer_count: usize, block_size: usize, pixel: PixelType) -> Result<SpillStack> {
    let path = directory.join(filename);

    let mut file = match fs::OpenOptions::new().read(true).write(true).open(&path) {
        Ok(existing) => existing,

        Err(_) => {
            let mut created = fs::OpenOptions::new()
                .read(true).write(true).create(true)
                .open(&path)?;

            u8::write_slice(&mut created, MAGIC)?;
            created
        },
    };

    let blocks_per_row = compute_block_count(width, block_size);
    let blocks_per_column = compute_block_count(height, block_size);
    let tile_bytes = pixel.packed_byte_count(block_size * block_size);

    let bytes_per_row = (blocks_per_row + 7) / 8;
    let bitmap_bytes = bytes_per_row * blocks_per_column;

    seek_to_end(&mut file)?;

    // stack prefix
    1_u8.write(&mut file)?;
    (layer_count as u32).write(&mut file)?;
    (width as u32).write(&mut file)?;
    (height as u32).write(&mut file)?;
    (block_size as u32).write(&mut file)?;
    (block_size as u32).write(&mut file)?;
    3_u8.write(&mut file)?;
    0_u8.write(&mut file)?;

    let validity_offset = file.stream_position()?;

    // every tile starts valid, with the bits of partial
    // trailing row bytes masked off
    let mut bitmap = vec![ 0xff_u8; bitmap_bytes ];
    let remainder = blocks_per_row % 8;
    if remainder != 0 {
        for row_end in (bytes_per_row - 1 .. bitmap_bytes).step_by(bytes_per_row) {
            bitmap[row_end] = (1 << remainder) - 1;
        }
    }

    for _ in 0 .. layer_count {
        1_i32.write(&mut file)?;
        0_i32.write(&mut file)?;
        (blocks_per_column as i32).write(&mut file)?;
        (blocks_per_row as i32).write(&mut file)?;
        0x30000_i32.write(&mut file)?;

        u8::write_slice(&mut file, &bitmap)?;
    }

    let data_offset = file.stream_position()?;

    // reserve the data region sparsely
    let data_bytes = tile_bytes as u64
        * blocks_per_row as u64 * blocks_per_column as u64
        * layer_count as u64;

    if data_bytes > 0 {
        seek_to(&mut file, data_offset + data_bytes - 1)?;
        0_u8.write(&mut file)?;
    }

    Ok(SpillStack { validity_offset, data_offset })
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn interleaved_tile_positions(){
        // a stack of three 64x64 u8 layers: tiles are 4096 bytes
        assert_eq!(tile_position(1000, 4096, 0, 3, 0), 1000);
        assert_eq!(tile_position(1000, 4096, 0, 3, 2), 1000 + 2 * 4096);
        assert_eq!(tile_position(1000, 4096, 7, 3, 1), 1000 + 4096 * 22);
    }

    #[test]
    fn validity_bits_skip_the_bitmap_header(){
        assert_eq!(tile_validity_bit(0, 0, 2), 160);
        assert_eq!(tile_validity_bit(0, 9, 2), 169);
        assert_eq!(tile_validity_bit(3, 1, 2), 3 * 16 + 1 + 160);
    }

    #[test]
    fn created_stack_layout(){
        let directory = tempfile::tempdir().unwrap();

        let stack = create_stack(
            directory.path(), "scratch.ige",
            100, 100, 2, 64, PixelType::U8,
        ).unwrap();

        let bytes = std::fs::read(directory.path().join("scratch.ige")).unwrap();
        assert_eq!(&bytes[0 .. 26], MAGIC);

        // prefix: marker, layer count, width, height, block size twice, markers
        assert_eq!(bytes[26], 1);
        assert_eq!(&bytes[27 .. 31], &2_u32.to_le_bytes());
        assert_eq!(&bytes[31 .. 35], &100_u32.to_le_bytes());
        assert_eq!(&bytes[39 .. 43], &64_u32.to_le_bytes());
        assert_eq!(bytes[47], 3);
        assert_eq!(bytes[48], 0);

        // two blocks per row and column: one bitmap byte per row,
        // two rows, masked to the two low bits
        assert_eq!(stack.validity_offset, 49);
        let bitmap_start = stack.validity_offset as usize + BITMAP_HEADER_BYTES;
        assert_eq!(&bytes[bitmap_start .. bitmap_start + 2], &[ 0b11, 0b11 ]);

        // data region: 2 layers of 4 tiles of 4096 bytes, reserved sparsely
        assert_eq!(stack.data_offset, 49 + 2 * (20 + 2));
        assert_eq!(bytes.len() as u64, stack.data_offset + 2 * 4 * 4096);
    }
}
