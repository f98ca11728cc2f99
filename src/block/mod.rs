
//! Raster bands and their tile indices.
//!
//! A band is a raster layer node together with its tile geometry.
//! Its tile index resolves a block position to a file region,
//! either through the per-tile block info array of a `RasterDMS` child,
//! or through computed offsets into the external spill file.

use std::fs;
use bit_field::BitField;

use crate::io::*;
use crate::math::compute_block_count;
use crate::meta::PixelType;
use crate::error::{Error, Result, UnitResult};
use crate::tree::NodeRef;
use crate::file::{Access, Core};
use crate::compression::rle;
use crate::compression::convert_pixels_between_little_endian_and_native;
use crate::spill;


/// Validity and compression state of one tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileFlags {

    /// Whether the tile was ever written.
    /// Reading a tile with a clear valid flag yields zeroed pixels.
    pub valid: bool,

    /// Whether the tile bytes are run length encoded.
    pub compressed: bool,
}

/// Position, size and state of one tile in the main file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileInfo {

    /// Position of the tile bytes, or zero while unallocated.
    pub offset: u64,

    /// Byte count of the stored tile.
    pub size: usize,

    /// Validity and compression state.
    pub flags: TileFlags,
}


/// The tile index of one band, built on first tile access.
#[derive(Debug)]
enum TileIndex {

    /// Per-tile positions from the `RasterDMS` block info array.
    Inline {
        dms: NodeRef,
        tiles: Vec<TileInfo>,
    },

    /// Computed positions inside the spill file.
    /// Tiles are never compressed and always the same size.
    External {
        file: fs::File,
        data_offset: u64,
        tile_bytes: u64,
        layer_count: usize,
        layer_index: usize,
        valid: Vec<bool>,
    },
}


/// One raster layer and its tile geometry.
/// Overviews are bands as well, attached to their full resolution band.
#[derive(Debug)]
pub struct Band {

    /// The `Eimg_Layer` or `Eimg_Layer_SubSample` node of this band.
    pub node: NodeRef,

    /// The type of all pixels in this band.
    pub pixel_type: PixelType,

    /// Width of the band in pixels.
    pub width: usize,

    /// Height of the band in pixels.
    pub height: usize,

    /// Width of one tile in pixels.
    pub block_width: usize,

    /// Height of one tile in pixels.
    pub block_height: usize,

    /// Number of tiles per row.
    pub blocks_per_row: usize,

    /// Number of tiles per column.
    pub blocks_per_column: usize,

    /// Total number of tiles.
    pub block_count: usize,

    /// Whether this band lives in the dependent file of its dataset.
    pub(crate) in_dependent: bool,

    pub(crate) overviews: Vec<Band>,
    pub(crate) overviews_loaded: bool,

    index: Option<TileIndex>,
}

impl Band {

    /// Read the tile geometry of a raster layer node.
    pub(crate) fn from_layer(core: &mut Core, node: NodeRef, in_dependent: bool) -> Result<Self> {
        let width = core.get_int(node, "width")?.max(0) as usize;
        let height = core.get_int(node, "height")?.max(0) as usize;
        let block_width = core.get_int(node, "blockWidth")?.max(0) as usize;
        let block_height = core.get_int(node, "blockHeight")?.max(0) as usize;
        let pixel_type = PixelType::from_code(core.get_int(node, "pixelType")?)?;

        if width == 0 || height == 0 || block_width == 0 || block_height == 0 {
            return Err(Error::unsupported("raster layer with zero sized tiles"));
        }

        let blocks_per_row = compute_block_count(width, block_width);
        let blocks_per_column = compute_block_count(height, block_height);

        Ok(Band {
            node, pixel_type,
            width, height,
            block_width, block_height,
            blocks_per_row, blocks_per_column,
            block_count: blocks_per_row * blocks_per_column,
            in_dependent,
            overviews: Vec::new(),
            overviews_loaded: false,
            index: None,
        })
    }

    /// The packed byte count of one tile of this band.
    pub fn tile_byte_count(&self) -> usize {
        self.pixel_type.packed_byte_count(self.pixels_per_tile())
    }

    /// The number of pixels in one tile of this band.
    pub fn pixels_per_tile(&self) -> usize {
        self.block_width * self.block_height
    }

    fn block_index(&self, x_block: usize, y_block: usize) -> Result<usize> {
        if x_block >= self.blocks_per_row || y_block >= self.blocks_per_column {
            return Err(Error::out_of_range(format!(
                "tile ({}, {}) of a {}x{} tile grid",
                x_block, y_block, self.blocks_per_row, self.blocks_per_column
            )));
        }

        Ok(y_block * self.blocks_per_row + x_block)
    }

    /// Build the tile index on first access.
    fn load_index(&mut self, core: &mut Core) -> UnitResult {
        if self.index.is_some() {
            return Ok(());
        }

        self.index = Some(match core.named_child(self.node, "RasterDMS")? {
            Some(dms) => self.load_inline_index(core, dms)?,

            None => {
                let dms = core.named_child(self.node, "ExternalRasterDMS")?
                    .ok_or_else(|| Error::not_found(
                        "raster layer without a RasterDMS or ExternalRasterDMS child"
                    ))?;

                self.load_external_index(core, dms)?
            },
        });

        Ok(())
    }

    fn load_inline_index(&self, core: &mut Core, dms: NodeRef) -> Result<TileIndex> {
        let mut tiles = Vec::with_capacity(self.block_count);

        for block in 0 .. self.block_count {
            let offset = core.get_int(dms, &format!("blockinfo[{}].offset", block))? as u32;
            let size = core.get_int(dms, &format!("blockinfo[{}].size", block))?.max(0) as usize;
            let valid = core.get_int(dms, &format!("blockinfo[{}].logvalid", block))? != 0;
            let compressed = core.get_int(dms, &format!("blockinfo[{}].compressionType", block))? != 0;

            tiles.push(TileInfo {
                offset: u64::from(offset),
                size,
                flags: TileFlags { valid, compressed },
            });
        }

        Ok(TileIndex::Inline { dms, tiles })
    }

    fn load_external_index(&self, core: &mut Core, dms: NodeRef) -> Result<TileIndex> {
        let layer_count = core.get_int(dms, "layerStackCount")?.max(1) as usize;
        let layer_index = core.get_int(dms, "layerStackIndex")?.max(0) as usize;

        let filename = core.get_string(dms, "fileName.string")?;
        let path = core.directory.join(&filename);

        let mut file = match core.access {
            Access::ReadOnly => fs::File::open(&path)?,
            Access::Update => fs::OpenOptions::new().read(true).write(true).open(&path)?,
        };

        spill::validate_magic(&mut file)?;
        core.ige_filename = Some(filename);

        // the whole validity bitmap of this layer, including its header
        let validity_offset = core.get_bigint(dms, "layerStackValidFlagsOffset")?.max(0) as u64;
        let bytes_per_row = (self.blocks_per_row + 7) / 8;
        let mut bitmap = vec![ 0_u8; bytes_per_row * self.blocks_per_column + spill::BITMAP_HEADER_BYTES ];

        seek_to(&mut file, validity_offset)?;
        u8::read_slice(&mut file, &mut bitmap)?;

        let valid = (0 .. self.block_count)
            .map(|block| {
                let row = block / self.blocks_per_row;
                let column = block % self.blocks_per_row;
                let bit = spill::tile_validity_bit(row, column, bytes_per_row);
                bitmap[bit >> 3].get_bit(bit & 7)
            })
            .collect();

        Ok(TileIndex::External {
            file,
            data_offset: core.get_bigint(dms, "layerStackDataOffset")?.max(0) as u64,
            tile_bytes: self.tile_byte_count() as u64,
            layer_count, layer_index,
            valid,
        })
    }

    /// Read one tile into the pixel buffer.
    /// Tiles with a clear valid flag yield zeroed pixels and success.
    /// In update access, unreadable regions also yield zeroed pixels,
    /// tolerating partially written files.
    pub(crate) fn read_tile(&mut self, core: &mut Core, x_block: usize, y_block: usize, pixels: &mut [u8]) -> UnitResult {
        let tile_bytes = self.tile_byte_count();
        if pixels.len() < tile_bytes {
            return Err(Error::truncated("tile pixel buffer"));
        }

        self.load_index(core)?;
        let block = self.block_index(x_block, y_block)?;
        let pixels = &mut pixels[.. tile_bytes];
        let pixel_type = self.pixel_type;
        let pixel_count = self.pixels_per_tile();
        let tolerate_missing = core.access == Access::Update;

        match self.index.as_mut().expect("the tile index was just loaded") {
            TileIndex::Inline { tiles, .. } => {
                let info = tiles[block];

                if !info.flags.valid {
                    return zero(pixels);
                }

                if info.flags.compressed {
                    let mut compressed = vec![ 0_u8; info.size ];
                    let present = read_region(&mut core.stream, info.offset, &mut compressed, tolerate_missing)?;
                    if !present {
                        return zero(pixels);
                    }

                    rle::decompress(&compressed, pixels, pixel_count, pixel_type)
                }
                else {
                    let present = read_region(&mut core.stream, info.offset, pixels, tolerate_missing)?;
                    if !present {
                        return zero(pixels);
                    }

                    convert_pixels_between_little_endian_and_native(pixels, pixel_type);
                    Ok(())
                }
            },

            TileIndex::External { file, data_offset, tile_bytes, layer_count, layer_index, valid } => {
                if !valid[block] {
                    return zero(pixels);
                }

                let position = spill::tile_position(*data_offset, *tile_bytes, block, *layer_count, *layer_index);
                let present = read_region(file, position, pixels, tolerate_missing)?;
                if !present {
                    return zero(pixels);
                }

                convert_pixels_between_little_endian_and_native(pixels, pixel_type);
                Ok(())
            },
        }
    }

    /// Write one tile from the pixel buffer.
    ///
    /// A tile flagged compressed is run length encoded; if the encoding
    /// does not shrink it, the tile is stored raw and its flag cleared.
    /// Writing a tile that is both invalid and uncompressed is not
    /// supported, as its slot was never allocated.
    ///
    /// On big-endian hosts the buffer is byte-swapped around the write
    /// and restored afterwards.
    pub(crate) fn write_tile(&mut self, core: &mut Core, x_block: usize, y_block: usize, pixels: &mut [u8]) -> UnitResult {
        let tile_bytes = self.tile_byte_count();
        if pixels.len() < tile_bytes {
            return Err(Error::truncated("tile pixel buffer"));
        }

        self.load_index(core)?;
        let block = self.block_index(x_block, y_block)?;
        let pixels = &mut pixels[.. tile_bytes];
        let pixel_type = self.pixel_type;

        match self.index.as_mut().expect("the tile index was just loaded") {
            TileIndex::Inline { dms, tiles } => {
                let dms = *dms;
                let flags = tiles[block].flags;

                if !flags.valid && !flags.compressed {
                    return Err(Error::unsupported(format!(
                        "writing the invalid uncompressed tile ({}, {})", x_block, y_block
                    )));
                }

                if flags.compressed {
                    match rle::compress(pixels, pixel_type)? {
                        Some(stream) => {
                            reallocate_tile(core, dms, tiles, block, stream.len())?;
                            seek_to(&mut core.stream, tiles[block].offset)?;
                            u8::write_slice(&mut core.stream, &stream)?;
                        },

                        // the tile does not shrink, store it raw from now on
                        None => {
                            tiles[block].flags.compressed = false;
                            reallocate_tile(core, dms, tiles, block, tile_bytes)?;
                            core.set_int(dms, &format!("blockinfo[{}].compressionType", block), 0)?;
                            write_region_swapped(&mut core.stream, tiles[block].offset, pixels, pixel_type)?;
                        },
                    }

                    if !flags.valid {
                        core.set_string(dms, &format!("blockinfo[{}].logvalid", block), "true")?;
                        tiles[block].flags.valid = true;
                    }

                    Ok(())
                }
                else {
                    write_region_swapped(&mut core.stream, tiles[block].offset, pixels, pixel_type)
                }
            },

            TileIndex::External { file, data_offset, tile_bytes, layer_count, layer_index, valid } => {
                if !valid[block] {
                    return Err(Error::unsupported(format!(
                        "writing the invalid tile ({}, {})", x_block, y_block
                    )));
                }

                let position = spill::tile_position(*data_offset, *tile_bytes, block, *layer_count, *layer_index);
                write_region_swapped(file, position, pixels, pixel_type)
            },
        }
    }
}


/// Allocate a file region for a rewritten tile, reusing the existing
/// slot when the new content fits, and patch the block info fields.
fn reallocate_tile(core: &mut Core, dms: NodeRef, tiles: &mut [TileInfo], block: usize, size: usize) -> UnitResult {
    if tiles[block].offset != 0 && size <= tiles[block].size {
        tiles[block].size = size;
        return Ok(());
    }

    tiles[block].offset = core.allocate_space(size as u64);
    tiles[block].size = size;

    core.set_int(dms, &format!("blockinfo[{}].offset", block), tiles[block].offset as i32)?;
    core.set_int(dms, &format!("blockinfo[{}].size", block), size as i32)?;
    Ok(())
}

fn zero(pixels: &mut [u8]) -> UnitResult {
    for byte in pixels.iter_mut() { *byte = 0; }
    Ok(())
}

/// Read a file region into the buffer.
/// Returns `Ok(false)` without filling the buffer when the region
/// is missing and that is tolerated, as in update access.
fn read_region(stream: &mut (impl Read + Seek), position: u64, buffer: &mut [u8], tolerate_missing: bool) -> Result<bool> {
    let result = seek_to(stream, position)
        .and_then(|_| u8::read_slice(stream, buffer));

    match result {
        Ok(()) => Ok(true),
        Err(_) if tolerate_missing => Ok(false),
        Err(error) => Err(error),
    }
}

/// Write a buffer of pixels to a file region in little-endian form,
/// restoring the caller's byte order afterwards.
fn write_region_swapped(stream: &mut (impl Write + Seek), position: u64, pixels: &mut [u8], pixel_type: PixelType) -> UnitResult {
    convert_pixels_between_little_endian_and_native(pixels, pixel_type);

    let result = seek_to(stream, position)
        .and_then(|_| u8::write_slice(stream, pixels));

    convert_pixels_between_little_endian_and_native(pixels, pixel_type);
    result
}
