
//! The container lifecycle: opening, creating, flushing, closing and
//! deleting files, the append-only space allocator, typed field access
//! on tree nodes, raster layer creation, overviews, and the optional
//! dependent `.rrd` file.

use std::fs;
use std::path::{Path, PathBuf};
use std::io::BufReader;

use smallvec::SmallVec;

use crate::io::*;
use crate::math::compute_block_count;
use crate::meta::{magic_number, FileInfo, PixelType, FILE_INFO_POSITION};
use crate::error::{Error, Result, UnitResult};
use crate::dictionary::{Dictionary, DEFAULT_DICTIONARY};
use crate::dictionary::field::{Extracted, FieldValue, ReqType};
use crate::compression::Compression;
use crate::tree::{NodeRef, Tree};
use crate::block::Band;
use crate::spill::{self, SpillStack};


/// Read/write or read-only access to a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {

    /// Read only access. Mutating operations fail.
    ReadOnly,

    /// Read and write access.
    Update,
}


/// Options for creating a new file.
#[derive(Debug, Clone)]
pub struct CreateOptions {

    /// Tile width and height in pixels.
    /// Values outside of `1 ..= 2048` fall back to the default of 64.
    pub block_size: usize,

    /// Whether raster tiles are created run length compressed.
    /// Compressed tiles start out invalid and are allocated when written.
    /// Ignored when a spill file is used.
    pub compression: Compression,

    /// Whether raster payloads go into a sibling `.ige` spill file.
    /// Forced when the raster data would push the main file towards 2 GB.
    pub use_spill: bool,

    /// The name of a parent file to reference
    /// through a `DependentFile` node.
    pub dependent_file: Option<String>,
}

impl Default for CreateOptions {
    fn default() -> Self {
        CreateOptions {
            block_size: 64,
            compression: Compression::Uncompressed,
            use_spill: false,
            dependent_file: None,
        }
    }
}


/// The shared state of one open file: its byte stream, header record,
/// dictionary, node tree, and the end-of-file allocation cursor.
#[derive(Debug)]
pub(crate) struct Core {
    pub stream: fs::File,
    pub access: Access,

    /// The directory containing the file. Sibling files live here.
    pub directory: PathBuf,

    /// The file name without its directory.
    pub filename: String,

    /// The name of the sibling spill file, once known.
    pub ige_filename: Option<String>,

    pub info: FileInfo,
    pub end_of_file: u64,
    pub dictionary: Dictionary,
    pub tree: Tree,
}

impl Core {

    /// Open an existing file and read its header, root node and dictionary.
    fn open(path: &Path, access: Access) -> Result<Self> {
        let mut stream = match access {
            Access::ReadOnly => fs::File::open(path)?,
            Access::Update => fs::OpenOptions::new().read(true).write(true).open(path)?,
        };

        magic_number::validate(&mut stream)?;
        let info_position = u32::read(&mut stream)?;

        seek_to(&mut stream, u64::from(info_position))?;
        let info = FileInfo::read(&mut stream)?;

        let end_of_file = seek_to_end(&mut stream)?;
        let tree = Tree::open(&mut stream, u64::from(info.root_position))?;

        seek_to(&mut stream, u64::from(info.dictionary_position))?;
        let text = Dictionary::read_text(&mut BufReader::new(&mut stream))?;
        let dictionary = Dictionary::parse(&text)?;

        Ok(Core {
            stream, access,
            directory: directory_of(path),
            filename: filename_of(path),
            ige_filename: None,
            info, end_of_file,
            dictionary, tree,
        })
    }

    /// Create a new file: magic tag, file info record, the default
    /// dictionary, and an in-memory root node placed at the first flush.
    fn create(path: &Path) -> Result<Self> {
        let mut stream = fs::OpenOptions::new()
            .read(true).write(true).create(true).truncate(true)
            .open(path)?;

        magic_number::write(&mut stream)?;

        let info = FileInfo::new();
        info.write(&mut stream)?;

        u8::write_slice(&mut stream, DEFAULT_DICTIONARY.as_bytes())?;
        0_u8.write(&mut stream)?;

        let end_of_file = stream.stream_position()?;

        Ok(Core {
            stream,
            access: Access::Update,
            directory: directory_of(path),
            filename: filename_of(path),
            ige_filename: None,
            info, end_of_file,
            dictionary: Dictionary::new(),
            tree: Tree::new_root(),
        })
    }

    /// Reserve a region in the append space and return its position.
    /// The region is never reclaimed, even if nothing is written to it.
    pub fn allocate_space(&mut self, byte_count: u64) -> u64 {
        let position = self.end_of_file;
        self.end_of_file += byte_count;
        position
    }

    /// Write all dirty nodes, then update the root node pointer
    /// in the file info record if the root has moved.
    pub fn flush(&mut self) -> UnitResult {
        if !self.tree.dirty {
            return Ok(());
        }

        let root = self.tree.root;

        {
            let Core { tree, end_of_file, .. } = self;
            tree.set_position(root, end_of_file);
        }

        self.tree.flush(&mut self.stream, root)?;
        self.tree.dirty = false;

        let root_position = self.tree.node(root).file_position as u32;
        if self.info.root_position != root_position {
            self.info.root_position = root_position;
            seek_to(&mut self.stream, FILE_INFO_POSITION + 8)?;
            root_position.write(&mut self.stream)?;
        }

        Ok(())
    }

    pub fn child(&mut self, node: NodeRef) -> Result<Option<NodeRef>> {
        self.tree.child(&mut self.stream, node)
    }

    pub fn next_sibling(&mut self, node: NodeRef) -> Result<Option<NodeRef>> {
        self.tree.next_sibling(&mut self.stream, node)
    }

    pub fn named_child(&mut self, node: NodeRef, path: &str) -> Result<Option<NodeRef>> {
        self.tree.find_named_child(&mut self.stream, node, path)
    }

    pub fn create_node(&mut self, parent: NodeRef, name: &str, type_name: &str) -> Result<NodeRef> {
        let Core { tree, stream, .. } = self;
        tree.create(stream, parent, name, type_name)
    }

    pub fn remove_node(&mut self, node: NodeRef) -> UnitResult {
        let Core { tree, stream, .. } = self;
        tree.remove(stream, node)
    }

    /// Assign a file position to a node and its subtree now,
    /// so that absolute positions can be written into its payload.
    pub fn set_position(&mut self, node: NodeRef) {
        let Core { tree, end_of_file, .. } = self;
        tree.set_position(node, end_of_file);
    }

    fn load_node_data(&mut self, node: NodeRef) -> UnitResult {
        let Core { tree, stream, .. } = self;
        tree.load_data(stream, node)
    }

    /// Reallocate the payload of a node to hold at least `size` bytes,
    /// zero-filling the growth. A size of zero requests the fixed size
    /// of the node's record type.
    pub fn make_data(&mut self, node: NodeRef, size: usize) -> UnitResult {
        self.load_node_data(node)?;

        let size = if size != 0 { size } else {
            self.dictionary.find_type(self.tree.type_name(node))
                .and_then(|record| self.dictionary[record].byte_size)
                .unwrap_or(0)
        };

        if size > 0 {
            self.tree.make_data(node, size);
        }

        Ok(())
    }

    /// Split a `nodes:fields` path and resolve the node part.
    fn resolve_field_node<'p>(&mut self, node: NodeRef, path: &'p str) -> Result<(NodeRef, &'p str)> {
        match path.find(':') {
            Some(position) => {
                let target = self.named_child(node, path)?
                    .ok_or_else(|| Error::not_found(format!("node path `{}`", path)))?;

                Ok((target, &path[position + 1 ..]))
            },

            None => Ok((node, path)),
        }
    }

    /// Extract a field value from the payload of a node.
    /// A `:` in the path first descends to a named child node.
    pub fn get_field(&mut self, node: NodeRef, path: &str, request: ReqType) -> Result<Extracted> {
        let (node, field_path) = self.resolve_field_node(node, path)?;
        self.load_node_data(node)?;

        let Core { tree, dictionary, .. } = self;

        let record = dictionary.find_type(tree.type_name(node)).ok_or_else(|| Error::not_found(
            format!("record type `{}`", tree.type_name(node))
        ))?;

        let data = tree.payload(node).ok_or_else(|| Error::not_found(
            format!("node `{}` has no payload", tree.name(node))
        ))?;

        dictionary.extract(record, field_path, data, request)
    }

    /// Assign a field value inside the payload of a node, marking it dirty.
    /// A payload is created at the record type's size if none exists yet.
    pub fn set_field(&mut self, node: NodeRef, path: &str, value: FieldValue<'_>) -> UnitResult {
        let (node, field_path) = self.resolve_field_node(node, path)?;
        self.load_node_data(node)?;

        if self.tree.payload(node).map_or(true, <[u8]>::is_empty) {
            self.make_data(node, 0)?;
        }

        let data_position = self.tree.node(node).data_position;
        let Core { tree, dictionary, .. } = self;

        let record = dictionary.find_type(tree.type_name(node)).ok_or_else(|| Error::not_found(
            format!("record type `{}`", tree.type_name(node))
        ))?;

        let has_payload = tree.payload(node).map_or(false, |data| !data.is_empty());
        if !has_payload {
            return Err(Error::not_found(format!(
                "node of field `{}` has no payload", field_path
            )));
        }

        // partial assignments must still reach the disk
        tree.dirty = true;
        let node_state = tree.node_mut(node);
        node_state.dirty = true;

        let data = node_state.data.as_mut().expect("payload presence was just verified");
        dictionary.assign(record, field_path, data, data_position, value)
    }

    pub fn get_int(&mut self, node: NodeRef, path: &str) -> Result<i32> {
        self.get_field(node, path, ReqType::Int)?.into_int()
    }

    pub fn get_double(&mut self, node: NodeRef, path: &str) -> Result<f64> {
        self.get_field(node, path, ReqType::Double)?.into_double()
    }

    pub fn get_string(&mut self, node: NodeRef, path: &str) -> Result<String> {
        self.get_field(node, path, ReqType::Text)?.into_text()
    }

    /// Read a 64 bit value stored as two consecutive unsigned 32 bit fields.
    pub fn get_bigint(&mut self, node: NodeRef, path: &str) -> Result<i64> {
        let lower = self.get_int(node, &format!("{}[0]", path))? as u32;
        let upper = self.get_int(node, &format!("{}[1]", path))?;
        Ok(i64::from(lower) | (i64::from(upper) << 32))
    }

    /// The number of value instances of a field.
    pub fn field_count(&mut self, node: NodeRef, path: &str) -> Result<usize> {
        let (node, field_path) = self.resolve_field_node(node, path)?;
        self.load_node_data(node)?;

        let Core { tree, dictionary, .. } = self;

        let record = dictionary.find_type(tree.type_name(node)).ok_or_else(|| Error::not_found(
            format!("record type `{}`", tree.type_name(node))
        ))?;

        let data = tree.payload(node).ok_or_else(|| Error::not_found(
            format!("node `{}` has no payload", tree.name(node))
        ))?;

        dictionary.instance_count(record, field_path, data)
    }

    pub fn set_int(&mut self, node: NodeRef, path: &str, value: i32) -> UnitResult {
        self.set_field(node, path, FieldValue::Int(value))
    }

    pub fn set_double(&mut self, node: NodeRef, path: &str, value: f64) -> UnitResult {
        self.set_field(node, path, FieldValue::Double(value))
    }

    pub fn set_string(&mut self, node: NodeRef, path: &str, value: &str) -> UnitResult {
        self.set_field(node, path, FieldValue::Text(value))
    }

    /// Create the spill file if needed and reserve a layer stack in it.
    pub fn reserve_spill_stack(&mut self, width: usize, height: usize, layer_count: usize, block_size: usize, pixel: PixelType) -> Result<SpillStack> {
        if self.ige_filename.is_none() {
            self.ige_filename = Some(spill_filename_of(&self.filename));
        }

        let filename = self.ige_filename.clone().expect("the spill file name was just set");
        spill::create_stack(&self.directory, &filename, width, height, layer_count, block_size, pixel)
    }
}


/// An open Erdas Imagine file: the node tree, the embedded dictionary,
/// the raster bands, and the optional spill and dependent siblings.
///
/// Dropping the file flushes pending changes, ignoring errors;
/// call [`HfaFile::close`] to observe them.
#[derive(Debug)]
pub struct HfaFile {
    pub(crate) core: Core,
    bands: SmallVec<[Band; 3]>,
    dependent: Option<Box<HfaFile>>,
    width: usize,
    height: usize,
}

impl HfaFile {

    /// Open an existing file.
    /// Fails if the file does not start with the magic header tag.
    pub fn open(path: impl AsRef<Path>, access: Access) -> Result<Self> {
        let core = Core::open(path.as_ref(), access)?;

        let mut file = HfaFile {
            core,
            bands: SmallVec::new(),
            dependent: None,
            width: 0, height: 0,
        };

        file.scan_bands()?;
        Ok(file)
    }

    /// Create a new file with the given raster layers, using default options.
    pub fn create(path: impl AsRef<Path>, width: usize, height: usize, band_count: usize, pixel: PixelType) -> Result<Self> {
        Self::create_with_options(path, width, height, band_count, pixel, &CreateOptions::default())
    }

    /// Create a new file with the given raster layers.
    pub fn create_with_options(path: impl AsRef<Path>, width: usize, height: usize, band_count: usize, pixel: PixelType, options: &CreateOptions) -> Result<Self> {
        let mut core = Core::create(path.as_ref())?;
        let root = core.tree.root;

        let block_size =
            if (1 ..= 2048).contains(&options.block_size) { options.block_size }
            else { 64 };

        if let Some(parent_name) = &options.dependent_file {
            let node = core.create_node(root, "DependentFile", "Eimg_DependentFile")?;
            core.make_data(node, parent_name.len() + 50)?;
            core.set_position(node);
            core.set_string(node, "dependent.string", parent_name)?;
        }

        let blocks_per_row = compute_block_count(width, block_size);
        let blocks_per_column = compute_block_count(height, block_size);
        let blocks = blocks_per_row * blocks_per_column;
        let bytes_per_block = pixel.packed_byte_count(block_size * block_size);

        // force the spill file when the imagery alone would approach the
        // 2 GB offset limit, leaving room for auxiliary data
        let approximate_bytes = bytes_per_block as f64 * blocks as f64 * band_count as f64
            + 10_000_000.0;

        let external = options.use_spill || approximate_bytes > 2_147_483_648.0;
        let compressed = options.compression == Compression::RunLength && !external;

        let format_info = core.create_node(root, "IMGFormatInfo", "ImgFormatInfo831")?;
        core.make_data(format_info, 0)?;
        core.set_int(format_info, "spaceUsedForRasterData",
            if external { 0 } else { (bytes_per_block * blocks * band_count) as i32 })?;

        let stack = if external {
            Some(core.reserve_spill_stack(width, height, band_count, block_size, pixel)?)
        }
        else { None };

        for band in 0 .. band_count {
            create_layer(
                &mut core, root, &format!("Layer_{}", band + 1),
                false, block_size, compressed, external,
                width, height, pixel,
                stack, band_count, band,
            )?;
        }

        let mut file = HfaFile {
            core,
            bands: SmallVec::new(),
            dependent: None,
            width: 0, height: 0,
        };

        file.scan_bands()?;
        Ok(file)
    }

    /// Create a new file containing only the header, the default
    /// dictionary and an empty root node. Used for dependent files.
    pub fn create_empty(path: impl AsRef<Path>) -> Result<Self> {
        Ok(HfaFile {
            core: Core::create(path.as_ref())?,
            bands: SmallVec::new(),
            dependent: None,
            width: 0, height: 0,
        })
    }

    /// Delete a file, including the external raster file
    /// referenced by its first raster layer, if any.
    pub fn delete(path: impl AsRef<Path>) -> UnitResult {
        let path = path.as_ref();
        let mut spill_path = None;

        {
            let mut file = Self::open(path, Access::ReadOnly)?;
            let root = file.root();

            let mut layer = None;
            let mut child = file.core.child(root)?;
            while let Some(node) = child {
                if file.core.tree.type_name(node) == "Eimg_Layer" {
                    layer = Some(node);
                    break;
                }

                child = file.core.next_sibling(node)?;
            }

            if let Some(layer) = layer {
                if let Some(dms) = file.core.named_child(layer, "ExternalRasterDMS")? {
                    if let Ok(raw_filename) = file.core.get_string(dms, "fileName.string") {
                        spill_path = Some(file.core.directory.join(raw_filename));
                    }
                }
            }
        }

        if let Some(spill_path) = spill_path {
            if spill_path.is_file() {
                fs::remove_file(spill_path)?;
            }
        }

        fs::remove_file(path)?;
        Ok(())
    }

    /// Write all pending changes to disk.
    /// Does nothing if the tree is clean or the file is read-only.
    pub fn flush(&mut self) -> UnitResult {
        if let Some(dependent) = &mut self.dependent {
            dependent.flush()?;
        }

        if self.core.access == Access::Update {
            self.core.flush()?;
        }

        Ok(())
    }

    /// Flush pending changes and release all resources.
    pub fn close(mut self) -> UnitResult {
        self.flush()
    }

    /// Width of the raster layers in pixels.
    pub fn width(&self) -> usize { self.width }

    /// Height of the raster layers in pixels.
    pub fn height(&self) -> usize { self.height }

    /// Number of raster bands.
    pub fn band_count(&self) -> usize { self.bands.len() }

    /// The tile geometry and pixel type of a band.
    pub fn band(&self, band: usize) -> Option<&Band> {
        self.bands.get(band)
    }

    /// The layer name of a band.
    pub fn band_name(&self, band: usize) -> Option<&str> {
        self.bands.get(band).map(|band| self.core.tree.name(band.node))
    }

    /// Rename the layer of a band.
    pub fn set_band_name(&mut self, band: usize, name: &str) -> UnitResult {
        if self.core.access != Access::Update {
            return Err(Error::unsupported("renaming a band of a read-only file"));
        }

        let node = self.bands.get(band)
            .ok_or_else(|| Error::out_of_range("band index"))?
            .node;

        self.core.tree.set_name(node, name)
    }

    /// The name of the sibling spill file, if one is referenced or created.
    pub fn spill_filename(&self) -> Option<&str> {
        self.core.ige_filename.as_deref()
    }

    /// Read one tile of a band into the pixel buffer.
    /// See [`Band`] for the tile geometry.
    pub fn read_tile(&mut self, band: usize, x_block: usize, y_block: usize, pixels: &mut [u8]) -> UnitResult {
        let HfaFile { core, bands, .. } = self;
        let band = bands.get_mut(band).ok_or_else(|| Error::out_of_range("band index"))?;
        band.read_tile(core, x_block, y_block, pixels)
    }

    /// Write one tile of a band from the pixel buffer.
    /// On big-endian hosts the buffer is temporarily byte-swapped.
    pub fn write_tile(&mut self, band: usize, x_block: usize, y_block: usize, pixels: &mut [u8]) -> UnitResult {
        let HfaFile { core, bands, .. } = self;
        let band = bands.get_mut(band).ok_or_else(|| Error::out_of_range("band index"))?;
        band.write_tile(core, x_block, y_block, pixels)
    }

    /// The number of overviews of a band, discovering them on first access.
    pub fn overview_count(&mut self, band: usize) -> Result<usize> {
        self.load_overviews(band)?;
        Ok(self.bands[band].overviews.len())
    }

    /// The tile geometry of one overview of a band.
    pub fn overview(&mut self, band: usize, overview: usize) -> Result<&Band> {
        self.load_overviews(band)?;
        self.bands[band].overviews.get(overview)
            .ok_or_else(|| Error::out_of_range("overview index"))
    }

    /// Read one tile of an overview of a band.
    pub fn read_overview_tile(&mut self, band: usize, overview: usize, x_block: usize, y_block: usize, pixels: &mut [u8]) -> UnitResult {
        self.load_overviews(band)?;

        let HfaFile { core, bands, dependent, .. } = self;
        let overview = bands.get_mut(band)
            .ok_or_else(|| Error::out_of_range("band index"))?
            .overviews.get_mut(overview)
            .ok_or_else(|| Error::out_of_range("overview index"))?;

        let core = core_for_overview(core, dependent, overview.in_dependent)?;
        overview.read_tile(core, x_block, y_block, pixels)
    }

    /// Write one tile of an overview of a band.
    pub fn write_overview_tile(&mut self, band: usize, overview: usize, x_block: usize, y_block: usize, pixels: &mut [u8]) -> UnitResult {
        self.load_overviews(band)?;

        let HfaFile { core, bands, dependent, .. } = self;
        let overview = bands.get_mut(band)
            .ok_or_else(|| Error::out_of_range("band index"))?
            .overviews.get_mut(overview)
            .ok_or_else(|| Error::out_of_range("overview index"))?;

        let core = core_for_overview(core, dependent, overview.in_dependent)?;
        overview.write_tile(core, x_block, y_block, pixels)
    }

    /// Create an overview layer for a band at an integer downsample factor.
    ///
    /// The overview node is attached under the band's layer and listed
    /// in its `RRDNamesList`. Large overviews go to the spill file;
    /// `use_dependent` routes others into the sibling `.rrd` file.
    /// The overview starts zero-filled; the caller supplies its pixels.
    ///
    /// Returns the index of the new overview.
    pub fn create_overview(&mut self, band: usize, factor: usize, use_dependent: bool) -> Result<usize> {
        if factor == 0 {
            return Err(Error::out_of_range("downsample factor of zero"));
        }

        let (band_node, pixel) = {
            let band = self.bands.get(band).ok_or_else(|| Error::out_of_range("band index"))?;
            (band.node, band.pixel_type)
        };

        let band_name = self.core.tree.name(band_node).to_owned();
        let overview_width = (self.width + factor - 1) / factor;
        let overview_height = (self.height + factor - 1) / factor;

        // spill once the overview would push the main file towards 2 GB
        let estimated_bytes = overview_width as f64 * overview_height as f64
            * (pixel.bits_per_pixel() / 8) as f64;

        let external = self.core.end_of_file as f64 + estimated_bytes > 2e9;

        let stack = if external {
            Some(self.core.reserve_spill_stack(overview_width, overview_height, 1, 64, pixel)?)
        }
        else { None };

        let in_dependent = !external && use_dependent;
        if in_dependent {
            self.ensure_dependent()?;
        }

        let layer_name = format!("_ss_{}_", factor);

        {
            let core = match &mut self.dependent {
                Some(dependent) if in_dependent => &mut dependent.core,
                _ => &mut self.core,
            };

            let parent = if in_dependent {
                let root = core.tree.root;
                match core.named_child(root, &band_name)? {
                    Some(existing) => existing,
                    None => core.create_node(root, &band_name, "Eimg_Layer")?,
                }
            }
            else { band_node };

            create_layer(
                core, parent, &layer_name,
                true, 64, false, external,
                overview_width, overview_height, pixel,
                stack, 1, 0,
            )?;
        }

        let stored_filename = match &self.dependent {
            Some(dependent) if in_dependent => dependent.core.filename.clone(),
            _ => self.core.filename.clone(),
        };

        // record the overview in the name list of its source layer
        let names = match self.core.named_child(band_node, "RRDNamesList")? {
            Some(existing) => existing,

            None => {
                let names = self.core.create_node(band_node, "RRDNamesList", "Eimg_RRDNamesList")?;
                self.core.make_data(names, 23 + 16 + 8 + 3000)?;
                self.core.set_position(names);
                self.core.set_string(names, "algorithm.string", "IMAGINE 2X2 Resampling")?;
                names
            },
        };

        let next_name = self.core.field_count(names, "nameList").unwrap_or(0);
        let overview_name = format!("{}(:{}:{})", stored_filename, band_name, layer_name);
        let name_field = format!("nameList[{}].string", next_name);

        match self.core.set_string(names, &name_field, &overview_name) {
            // out of slack: reallocate the payload and place it again
            Err(Error::TooLarge(_)) => {
                let grown = self.core.tree.node(names).data_size
                    + overview_name.len() + 1 + 8 + 3000;

                self.core.make_data(names, grown)?;
                self.core.set_position(names);
                self.core.set_string(names, &name_field, &overview_name)?;
            },

            other => other?,
        }

        let band_state = &mut self.bands[band];
        band_state.overviews.clear();
        band_state.overviews_loaded = false;

        let count = self.overview_count(band)?;
        if count == 0 {
            return Err(Error::not_found("the created overview layer"));
        }

        Ok(count - 1)
    }

    /// Add another raster layer to the file, returning its band index.
    /// The layer must have the dimensions of the existing bands, if any.
    /// Layers added this way always store their tiles in the main file.
    pub fn add_layer(&mut self, name: &str, width: usize, height: usize, pixel: PixelType, compression: Compression, block_size: usize) -> Result<usize> {
        if self.core.access != Access::Update {
            return Err(Error::unsupported("adding a layer to a read-only file"));
        }

        if !self.bands.is_empty() && (width != self.width || height != self.height) {
            return Err(Error::unsupported("raster layers with mismatched dimensions"));
        }

        let block_size =
            if (1 ..= 2048).contains(&block_size) { block_size }
            else { 64 };

        let root = self.root();
        let compressed = compression == Compression::RunLength;

        let node = create_layer(
            &mut self.core, root, name,
            false, block_size, compressed, false,
            width, height, pixel,
            None, 1, 0,
        )?;

        if self.bands.is_empty() {
            self.width = width;
            self.height = height;
        }

        let band = Band::from_layer(&mut self.core, node, false)?;
        self.bands.push(band);
        Ok(self.bands.len() - 1)
    }

    /// The root node of the tree.
    pub fn root(&self) -> NodeRef {
        self.core.tree.root
    }

    /// Descend from the root along a `.` separated node name path.
    pub fn named_node(&mut self, path: &str) -> Result<Option<NodeRef>> {
        let root = self.root();
        self.core.named_child(root, path)
    }

    /// Descend from a node along a `.` separated node name path.
    pub fn named_child(&mut self, node: NodeRef, path: &str) -> Result<Option<NodeRef>> {
        self.core.named_child(node, path)
    }

    /// The first child of a node.
    pub fn child(&mut self, node: NodeRef) -> Result<Option<NodeRef>> {
        self.core.child(node)
    }

    /// The next sibling of a node.
    pub fn next_sibling(&mut self, node: NodeRef) -> Result<Option<NodeRef>> {
        self.core.next_sibling(node)
    }

    /// The name of a node.
    pub fn node_name(&self, node: NodeRef) -> &str {
        self.core.tree.name(node)
    }

    /// The record type name of a node.
    pub fn node_type(&self, node: NodeRef) -> &str {
        self.core.tree.type_name(node)
    }

    /// Create a new node under a parent. The payload starts empty
    /// and is materialized by [`HfaFile::make_data`] or the first
    /// field assignment.
    pub fn create_node(&mut self, parent: NodeRef, name: &str, type_name: &str) -> Result<NodeRef> {
        self.core.create_node(parent, name, type_name)
    }

    /// Unlink a node and its descendants from the tree.
    /// The file bytes of the removed nodes are abandoned.
    pub fn remove_node(&mut self, node: NodeRef) -> UnitResult {
        self.core.remove_node(node)
    }

    /// Reallocate the payload of a node to hold at least `size` bytes.
    /// A size of zero requests the fixed size of the node's record type.
    pub fn make_data(&mut self, node: NodeRef, size: usize) -> UnitResult {
        self.core.make_data(node, size)
    }

    /// Assign a file position to a node and its subtree now, so that
    /// assignments to its pointer fields store final positions.
    pub fn set_node_position(&mut self, node: NodeRef) {
        self.core.set_position(node)
    }

    /// Extract a field value. A `:` in the path descends
    /// to a named child node first, as in `Projection:proNumber`.
    pub fn get_field(&mut self, node: NodeRef, path: &str, request: ReqType) -> Result<Extracted> {
        self.core.get_field(node, path, request)
    }

    /// Read a field as a 32 bit integer.
    pub fn get_int(&mut self, node: NodeRef, path: &str) -> Result<i32> {
        self.core.get_int(node, path)
    }

    /// Read a field as a 64 bit float.
    pub fn get_double(&mut self, node: NodeRef, path: &str) -> Result<f64> {
        self.core.get_double(node, path)
    }

    /// Read a field as text.
    pub fn get_string(&mut self, node: NodeRef, path: &str) -> Result<String> {
        self.core.get_string(node, path)
    }

    /// Read a 64 bit value stored as two consecutive 32 bit fields.
    pub fn get_bigint(&mut self, node: NodeRef, path: &str) -> Result<i64> {
        self.core.get_bigint(node, path)
    }

    /// The number of value instances of a field.
    pub fn field_count(&mut self, node: NodeRef, path: &str) -> Result<usize> {
        self.core.field_count(node, path)
    }

    /// Write a field from a 32 bit integer.
    pub fn set_int(&mut self, node: NodeRef, path: &str, value: i32) -> UnitResult {
        self.core.set_int(node, path, value)
    }

    /// Write a field from a 64 bit float.
    pub fn set_double(&mut self, node: NodeRef, path: &str, value: f64) -> UnitResult {
        self.core.set_double(node, path, value)
    }

    /// Write a field from text.
    pub fn set_string(&mut self, node: NodeRef, path: &str, value: &str) -> UnitResult {
        self.core.set_string(node, path, value)
    }

    /// Find the raster layers among the root's children.
    fn scan_bands(&mut self) -> UnitResult {
        let root = self.root();
        let mut child = self.core.child(root)?;

        while let Some(node) = child {
            if self.core.tree.type_name(node) == "Eimg_Layer" {
                let width = self.core.get_int(node, "width").unwrap_or(0);
                let height = self.core.get_int(node, "height").unwrap_or(0);

                if width > 0 && height > 0 {
                    if self.bands.is_empty() {
                        self.width = width as usize;
                        self.height = height as usize;
                    }
                    else if self.width != width as usize || self.height != height as usize {
                        return Err(Error::unsupported("raster layers with mismatched dimensions"));
                    }

                    let band = Band::from_layer(&mut self.core, node, false)?;
                    self.bands.push(band);
                }
            }

            child = self.core.next_sibling(node)?;
        }

        Ok(())
    }

    /// Discover the overviews of a band: the layers named in its
    /// `RRDNamesList`, or its unnamed subsample children.
    fn load_overviews(&mut self, band: usize) -> UnitResult {
        let loaded = self.bands.get(band)
            .ok_or_else(|| Error::out_of_range("band index"))?
            .overviews_loaded;

        if loaded {
            return Ok(());
        }

        let node = self.bands[band].node;
        let mut overviews = Vec::new();

        if let Some(names) = self.core.named_child(node, "RRDNamesList")? {
            for name_index in 0 .. {
                let field = format!("nameList[{}].string", name_index);
                let full_name = match self.core.get_string(names, &field) {
                    Ok(name) => name,
                    Err(_) => break,
                };

                let (named_file, layer_path) = match parse_overview_name(&full_name) {
                    Some(parts) => parts,
                    None => continue,
                };

                let slot = match self.resolve_named_file(&named_file)? {
                    Some(slot) => slot,
                    None => continue,
                };

                let (core, in_dependent) = match (slot, &mut self.dependent) {
                    (FileSlot::Dependent, Some(dependent)) => (&mut dependent.core, true),
                    _ => (&mut self.core, false),
                };

                let root = core.tree.root;
                if let Some(layer) = core.named_child(root, &layer_path)? {
                    overviews.push(Band::from_layer(core, layer, in_dependent)?);
                }
            }
        }

        // some files keep unnamed overviews directly under the layer
        if overviews.is_empty() {
            let mut child = self.core.child(node)?;
            while let Some(subsample) = child {
                if self.core.tree.type_name(subsample) == "Eimg_Layer_SubSample" {
                    overviews.push(Band::from_layer(&mut self.core, subsample, false)?);
                }

                child = self.core.next_sibling(subsample)?;
            }
        }

        let band = &mut self.bands[band];
        band.overviews = overviews;
        band.overviews_loaded = true;
        Ok(())
    }

    /// Find the open file matching a name from an overview reference,
    /// opening the dependent file if needed.
    fn resolve_named_file(&mut self, filename: &str) -> Result<Option<FileSlot>> {
        if filename == self.core.filename {
            return Ok(Some(FileSlot::Base));
        }

        if let Some(dependent) = &self.dependent {
            return Ok(
                if dependent.core.filename == filename { Some(FileSlot::Dependent) }
                else { None }
            );
        }

        if self.try_open_dependent(filename) {
            return Ok(Some(FileSlot::Dependent));
        }

        // tolerate renamed files by also trying the conventional name
        let fallback = dependent_filename_of(&self.core.filename);
        if fallback != filename && self.try_open_dependent(&fallback) {
            return Ok(Some(FileSlot::Dependent));
        }

        Ok(None)
    }

    fn try_open_dependent(&mut self, filename: &str) -> bool {
        let path = self.core.directory.join(filename);
        if !path.is_file() {
            return false;
        }

        match HfaFile::open(&path, Access::ReadOnly) {
            Ok(opened) => {
                self.dependent = Some(Box::new(opened));
                true
            },

            Err(_) => false,
        }
    }

    /// Open or create the dependent `.rrd` sibling for writing.
    fn ensure_dependent(&mut self) -> UnitResult {
        if self.dependent.is_some() {
            return Ok(());
        }

        let filename = dependent_filename_of(&self.core.filename);
        let path = self.core.directory.join(&filename);

        let dependent = if path.is_file() {
            HfaFile::open(&path, Access::Update)?
        }
        else {
            let mut created = HfaFile::create_empty(&path)?;
            let root = created.root();

            let node = created.core.create_node(root, "DependentFile", "Eimg_DependentFile")?;
            created.core.make_data(node, self.core.filename.len() + 50)?;
            created.core.set_position(node);

            let parent_name = self.core.filename.clone();
            created.core.set_string(node, "dependent.string", &parent_name)?;
            created
        };

        self.dependent = Some(Box::new(dependent));
        Ok(())
    }
}

impl Drop for HfaFile {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileSlot { Base, Dependent }

fn core_for_overview<'c>(core: &'c mut Core, dependent: &'c mut Option<Box<HfaFile>>, in_dependent: bool) -> Result<&'c mut Core> {
    if !in_dependent {
        return Ok(core);
    }

    match dependent {
        Some(dependent) => Ok(&mut dependent.core),
        None => Err(Error::not_found("the dependent file is not open")),
    }
}


/// Create a raster layer node with its tile index, suitable
/// for full resolution bands and for overviews.
#[allow(clippy::too_many_arguments)]
fn create_layer(core: &mut Core, parent: NodeRef, name: &str, overview: bool, block_size: usize, compressed: bool, external: bool, width: usize, height: usize, pixel: PixelType, stack: Option<SpillStack>, stack_count: usize, stack_index: usize) -> Result<NodeRef> {
    let layer_type = if overview { "Eimg_Layer_SubSample" } else { "Eimg_Layer" };

    let blocks_per_row = compute_block_count(width, block_size);
    let blocks_per_column = compute_block_count(height, block_size);
    let blocks = blocks_per_row * blocks_per_column;
    let bytes_per_block = pixel.packed_byte_count(block_size * block_size);

    let layer = core.create_node(parent, name, layer_type)?;
    core.set_int(layer, "width", width as i32)?;
    core.set_int(layer, "height", height as i32)?;
    core.set_string(layer, "layerType", "athematic")?;
    core.set_int(layer, "pixelType", pixel.code())?;
    core.set_int(layer, "blockWidth", block_size as i32)?;
    core.set_int(layer, "blockHeight", block_size as i32)?;

    if !external {
        // the block info array is variable-sized, so its prefix and
        // entries are laid out by hand instead of through the dictionary
        let dms = core.create_node(layer, "RasterDMS", "Edms_State")?;
        core.make_data(dms, 14 * blocks + 38)?;

        core.set_int(dms, "numvirtualblocks", blocks as i32)?;
        core.set_int(dms, "numobjectsperblock", (block_size * block_size) as i32)?;
        core.set_int(dms, "nextobjectnum", (block_size * block_size * blocks) as i32)?;

        core.set_string(dms, "compressionType",
            if compressed { "RLC compression" } else { "no compression" })?;

        // the block info pointer stores an absolute position,
        // so the node needs its final position now
        core.set_position(dms);
        let data_position = core.tree.node(dms).data_position;

        // compressed tiles are allocated when first written,
        // raw tiles are allocated immediately and marked valid
        let tile_offsets: Vec<u32> = (0 .. blocks)
            .map(|_| if compressed { 0 } else { core.allocate_space(bytes_per_block as u64) as u32 })
            .collect();

        let data = core.tree.payload_mut(dms).expect("the payload was just allocated");
        write_at(data, 14, blocks as u32)?;
        write_at(data, 18, data_position as u32 + 22)?;

        for (block, offset) in tile_offsets.iter().enumerate() {
            let entry = 22 + 14 * block;
            write_at(data, entry, 0_i16)?; // fileCode
            write_at(data, entry + 2, *offset)?;
            write_at(data, entry + 6, if compressed { 0_u32 } else { bytes_per_block as u32 })?;
            write_at(data, entry + 10, if compressed { 0_i16 } else { 1_i16 })?; // logvalid
            write_at(data, entry + 12, if compressed { 1_i16 } else { 0_i16 })?; // compressionType
        }

        core.tree.mark_dirty(dms);
    }
    else {
        let stack = stack.ok_or_else(|| Error::not_found("spill stack for an external layer"))?;
        let ige_filename = core.ige_filename.clone()
            .ok_or_else(|| Error::not_found("spill file name for an external layer"))?;

        let dms = core.create_node(layer, "ExternalRasterDMS", "ImgExternalRaster")?;
        core.make_data(dms, 8 + ige_filename.len() + 1 + 6 * 4)?;
        core.set_string(dms, "fileName.string", &ige_filename)?;

        let validity = stack.validity_offset as i64;
        core.set_int(dms, "layerStackValidFlagsOffset[0]", (validity & 0xffff_ffff) as i32)?;
        core.set_int(dms, "layerStackValidFlagsOffset[1]", (validity >> 32) as i32)?;

        let data = stack.data_offset as i64;
        core.set_int(dms, "layerStackDataOffset[0]", (data & 0xffff_ffff) as i32)?;
        core.set_int(dms, "layerStackDataOffset[1]", (data >> 32) as i32)?;

        core.set_int(dms, "layerStackCount", stack_count as i32)?;
        core.set_int(dms, "layerStackIndex", stack_index as i32)?;
    }

    // the per-layer dictionary describing one tile as a pixel array
    let tile_dictionary = format!(
        "{{{}:{}data,}}RasterDMS,.",
        block_size * block_size, pixel.band_type_char()
    );

    let ehfa = core.create_node(layer, "Ehfa_Layer", "Ehfa_Layer")?;
    core.make_data(ehfa, 0)?;
    core.set_position(ehfa);

    let dictionary_position = core.allocate_space(tile_dictionary.len() as u64 + 1);
    core.set_string(ehfa, "type", "raster")?;
    core.set_int(ehfa, "dictionaryPtr", dictionary_position as i32)?;

    seek_to(&mut core.stream, dictionary_position)?;
    u8::write_slice(&mut core.stream, tile_dictionary.as_bytes())?;
    0_u8.write(&mut core.stream)?;

    Ok(layer)
}


/// Split an overview reference of the form `file.img(:Layer_1:_ss_2_)`
/// into the file name and the node path inside that file.
fn parse_overview_name(name: &str) -> Option<(String, String)> {
    let open = name.find("(:")?;
    let (filename, reference) = name.split_at(open);

    let reference = &reference[2 ..];
    let reference = reference.strip_suffix(')').unwrap_or(reference);

    Some((filename.to_owned(), reference.replace(':', ".")))
}

fn directory_of(path: &Path) -> PathBuf {
    path.parent().unwrap_or_else(|| Path::new("")).to_owned()
}

fn filename_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// The conventional name of the dependent file: the file name with
/// its extension replaced by `rrd`.
fn dependent_filename_of(filename: &str) -> String {
    filename_of(&Path::new(filename).with_extension("rrd"))
}

/// The conventional name of the spill file: the file name with
/// its extension replaced by `ige`.
fn spill_filename_of(filename: &str) -> String {
    filename_of(&Path::new(filename).with_extension("ige"))
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn overview_names_parse(){
        assert_eq!(
            parse_overview_name("scene.img(:Layer_1:_ss_2_)"),
            Some(("scene.img".to_owned(), "Layer_1._ss_2_".to_owned()))
        );

        assert_eq!(
            parse_overview_name("scene.rrd(:Layer_2:_ss_16_)"),
            Some(("scene.rrd".to_owned(), "Layer_2._ss_16_".to_owned()))
        );

        assert_eq!(parse_overview_name("no reference here"), None);
    }

    #[test]
    fn sibling_filenames(){
        assert_eq!(dependent_filename_of("scene.img"), "scene.rrd");
        assert_eq!(spill_filename_of("scene.img"), "scene.ige");
        assert_eq!(spill_filename_of("archive.raster.img"), "archive.raster.ige");
    }
}
