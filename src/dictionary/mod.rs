
//! The data dictionary: a textual, embedded schema that describes
//! the layout of every record type in the file.
//! Nodes of the tree reference these types by name.

pub mod field;

use std::collections::HashMap;
use crate::io::Read;
use crate::error::{Error, Result, UnitResult};
use self::field::{DictField, ItemKind, Storage};


/// Identifies a record type inside a `Dictionary`.
/// Types reference each other through these ids instead of pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeRef(pub(crate) u32);


/// A named record type, an ordered sequence of typed fields.
#[derive(Debug, Clone)]
pub struct RecordType {

    /// The identifier of this type.
    pub name: String,

    /// The ordered fields of this type.
    pub fields: Vec<DictField>,

    /// The fixed byte count of one instance,
    /// or `None` if any field is variable-sized.
    pub byte_size: Option<usize>,
}


/// A registry of record types, parsed from the dictionary text of a file.
#[derive(Debug, Clone)]
pub struct Dictionary {
    types: Vec<RecordType>,
    by_name: HashMap<String, u32>,
    text: String,
}


/// The dictionary text embedded verbatim into every newly created file.
/// Kept byte for byte identical so files remain interoperable with existing tools.
pub const DEFAULT_DICTIONARY: &str = concat!(
    "{1:lversion,1:LfreeList,1:LrootEntryPtr,1:sentryHeaderLength,1:LdictionaryPtr,}Ehfa_File,{1:Lnext,1:Lprev,1:Lparent,1:Lchild,1:Ldata,1:ldataSize,64:cname,32:ctype,1:tmodTime,}Ehfa_Entry,{16:clabel,1:LheaderPtr,}Ehfa_HeaderTag,{1:LfreeList,1:lfreeSize,}Ehfa_FreeListNode,{1:lsize,1:Lptr,}Ehfa_Data,{1:lwidth,1:lheight,1:e3:thematic,athematic,fft of real-valued data,layerType,",
    "1:e13:u1,u2,u4,u8,s8,u16,s16,u32,s32,f32,f64,c64,c128,pixelType,1:lblockWidth,1:lblockHeight,}Eimg_Layer,{1:lwidth,1:lheight,1:e3:thematic,athematic,fft of real-valued data,layerType,1:e13:u1,u2,u4,u8,s8,u16,s16,u32,s32,f32,f64,c64,c128,pixelType,1:lblockWidth,1:lblockHeight,}Eimg_Layer_SubSample,{1:e2:raster,vector,type,1:LdictionaryPtr,}Ehfa_Layer,{1:LspaceUsedForRasterData,}ImgFormatInfo831,{1:sfileCode,1:Loffset,1:lsize,1:e2:false,true,logvalid,",
    "1:e2:no compression,ESRI GRID compression,compressionType,}Edms_VirtualBlockInfo,{1:lmin,1:lmax,}Edms_FreeIDList,{1:lnumvirtualblocks,1:lnumobjectsperblock,1:lnextobjectnum,1:e2:no compression,RLC compression,compressionType,0:poEdms_VirtualBlockInfo,blockinfo,0:poEdms_FreeIDList,freelist,1:tmodTime,}Edms_State,{0:pcstring,}Emif_String,{1:oEmif_String,fileName,2:LlayerStackValidFlagsOffset,2:LlayerStackDataOffset,1:LlayerStackCount,1:LlayerStackIndex,}ImgExternalRaster,{1:oEmif_String,algorithm,0:poEmif_String,nameList,}Eimg_RRDNamesList,{1:oEmif_String,projection,1:oEmif_String,units,}Eimg_MapInformation,",
    "{1:oEmif_String,dependent,}Eimg_DependentFile,{1:oEmif_String,ImageLayerName,}Eimg_DependentLayerName,{1:lnumrows,1:lnumcolumns,1:e13:EGDA_TYPE_U1,EGDA_TYPE_U2,EGDA_TYPE_U4,EGDA_TYPE_U8,EGDA_TYPE_S8,EGDA_TYPE_U16,EGDA_TYPE_S16,EGDA_TYPE_U32,EGDA_TYPE_S32,EGDA_TYPE_F32,EGDA_TYPE_F64,EGDA_TYPE_C64,EGDA_TYPE_C128,datatype,1:e4:EGDA_SCALAR_OBJECT,EGDA_TABLE_OBJECT,EGDA_MATRIX_OBJECT,EGDA_RASTER_OBJECT,objecttype,}Egda_BaseData,{1:*bvalueBD,}Eimg_NonInitializedValue,{1:dx,1:dy,}Eprj_Coordinate,{1:dwidth,1:dheight,}Eprj_Size,{0:pcproName,1:*oEprj_Coordinate,upperLeftCenter,",
    "1:*oEprj_Coordinate,lowerRightCenter,1:*oEprj_Size,pixelSize,0:pcunits,}Eprj_MapInfo,{0:pcdatumname,1:e3:EPRJ_DATUM_PARAMETRIC,EPRJ_DATUM_GRID,EPRJ_DATUM_REGRESSION,type,0:pdparams,0:pcgridname,}Eprj_Datum,{0:pcsphereName,1:da,1:db,1:deSquared,1:dradius,}Eprj_Spheroid,{1:e2:EPRJ_INTERNAL,EPRJ_EXTERNAL,proType,1:lproNumber,0:pcproExeName,0:pcproName,1:lproZone,0:pdproParams,1:*oEprj_Spheroid,proSpheroid,}Eprj_ProParameters,{1:dminimum,1:dmaximum,1:dmean,1:dmedian,1:dmode,1:dstddev,}Esta_Statistics,{1:lnumBins,1:e4:direct,linear,logarithmic,explicit,binFunctionType,1:dminLimit,1:dmaxLimit,1:*bbinLimits,}Edsc_BinFunction,{0:poEmif_String,LayerNames,1:*bExcludedValues,1:oEmif_String,AOIname,",
    "1:lSkipFactorX,1:lSkipFactorY,1:*oEdsc_BinFunction,BinFunction,}Eimg_StatisticsParameters830,{1:lnumrows,}Edsc_Table,{1:lnumRows,1:LcolumnDataPtr,1:e4:integer,real,complex,string,dataType,1:lmaxNumChars,}Edsc_Column,{1:lposition,0:pcname,1:e2:EMSC_FALSE,EMSC_TRUE,editable,1:e3:LEFT,CENTER,RIGHT,alignment,0:pcformat,1:e3:DEFAULT,APPLY,AUTO-APPLY,formulamode,0:pcformula,1:dcolumnwidth,0:pcunits,1:e5:NO_COLOR,RED,GREEN,BLUE,COLOR,colorflag,0:pcgreenname,0:pcbluename,}Eded_ColumnAttributes_1,{1:lversion,1:lnumobjects,1:e2:EAOI_UNION,EAOI_INTERSECTION,operation,}Eaoi_AreaOfInterest,.",
);


impl Dictionary {

    /// Parse the dictionary that every newly created file embeds.
    pub fn new() -> Self {
        Self::parse(DEFAULT_DICTIONARY)
            .expect("the built-in dictionary is well-formed")
    }

    /// Parse a dictionary text into a registry of record types.
    pub fn parse(text: &str) -> Result<Self> {
        let mut cursor = TextCursor::new(text);
        let mut types = Vec::new();
        let mut by_name = HashMap::new();

        while let Some(byte) = cursor.peek() {
            if byte == b'.' { break; }

            let record = Self::parse_type(&mut cursor)?;

            // on duplicate names, the first definition wins
            by_name.entry(record.name.clone()).or_insert(types.len() as u32);
            types.push(record);
        }

        let mut dictionary = Dictionary { types, by_name, text: text.to_owned() };
        dictionary.complete_definitions();
        Ok(dictionary)
    }

    /// Read the NUL terminated dictionary text from the stream,
    /// also accepting the `,.` sequence as a terminator.
    pub fn read_text(read: &mut impl Read) -> Result<String> {
        let mut bytes: Vec<u8> = Vec::with_capacity(1024);

        loop {
            let mut byte = [ 0_u8; 1 ];
            if read.read(&mut byte)? == 0 || byte[0] == 0 {
                break;
            }

            if bytes.len() > 2 && bytes.ends_with(b",.") {
                break;
            }

            bytes.push(byte[0]);
        }

        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Find a record type by name.
    pub fn find_type(&self, name: &str) -> Option<TypeRef> {
        self.by_name.get(name).copied().map(TypeRef)
    }

    /// The number of record types in this dictionary.
    pub fn type_count(&self) -> usize {
        self.types.len()
    }

    /// The dictionary text this registry was parsed from.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Parse one `{ field* } name ,` definition.
    fn parse_type(cursor: &mut TextCursor<'_>) -> Result<RecordType> {
        cursor.expect(b'{')?;

        let mut fields = Vec::new();
        loop {
            match cursor.peek() {
                None => return Err(Error::malformed("unterminated type definition")),
                Some(b'}') => break,
                Some(_) => fields.push(DictField::parse(cursor)?),
            }
        }

        cursor.expect(b'}')?;
        let name = cursor.take_until(b',')?.to_owned();

        Ok(RecordType { name, fields, byte_size: None })
    }

    /// Resolve type-by-name references and compute all instance sizes.
    fn complete_definitions(&mut self) {
        let by_name = self.by_name.clone();

        for record in &mut self.types {
            for field in &mut record.fields {
                if let Some(name) = &field.object_type_name {
                    // unresolved names keep `None` and behave as empty objects
                    field.object_type = by_name.get(name).copied().map(TypeRef);
                }
            }
        }

        let mut states = vec![ SizeState::Unknown; self.types.len() ];
        for index in 0 .. self.types.len() {
            self.compute_type_size(index, &mut states);
        }
    }

    /// Compute the fixed byte size of a type, or `None` when variable.
    /// Cyclic definitions are treated as variable.
    fn compute_type_size(&mut self, index: usize, states: &mut [SizeState]) -> Option<usize> {
        match states[index] {
            SizeState::Done => return self.types[index].byte_size,
            SizeState::InProgress => return None,
            SizeState::Unknown => {},
        }

        states[index] = SizeState::InProgress;

        let field_count = self.types[index].fields.len();
        let mut total = Some(0_usize);

        for field_index in 0 .. field_count {
            let (storage, item, item_count, object_type) = {
                let field = &self.types[index].fields[field_index];
                (field.storage, field.item, field.item_count, field.object_type)
            };

            let size: Option<usize> = if storage == Storage::VariablePointer {
                None
            }
            else if item == ItemKind::BaseData {
                None
            }
            else if item == ItemKind::Object {
                let element = object_type
                    .map(|element| self.compute_type_size(element.0 as usize, states))
                    .unwrap_or(Some(0));

                element.map(|element| element * item_count)
            }
            else {
                Some(item.byte_size() * item_count)
            };

            // fields with an inline count carry their count and offset prefix
            let size = match (size, storage) {
                (Some(size), Storage::FixedPointer) => Some(size + 8),
                (size, _) => size,
            };

            self.types[index].fields[field_index].byte_size = size;

            total = match (total, size) {
                (Some(total), Some(size)) => Some(total + size),
                _ => None,
            };
        }

        self.types[index].byte_size = total;
        states[index] = SizeState::Done;
        total
    }
}

impl std::ops::Index<TypeRef> for Dictionary {
    type Output = RecordType;

    fn index(&self, reference: TypeRef) -> &RecordType {
        &self.types[reference.0 as usize]
    }
}

impl Default for Dictionary {
    fn default() -> Self { Self::new() }
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SizeState { Unknown, InProgress, Done }


/// A byte cursor over the dictionary text.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TextCursor<'s> {
    rest: &'s str,
}

impl<'s> TextCursor<'s> {

    pub fn new(text: &'s str) -> Self {
        TextCursor { rest: text }
    }

    /// The next byte without consuming it.
    pub fn peek(&self) -> Option<u8> {
        self.rest.bytes().next()
    }

    /// Consume and return the next byte.
    pub fn advance(&mut self) -> Option<u8> {
        let byte = self.peek()?;
        self.rest = &self.rest[1..];
        Some(byte)
    }

    /// Consume one byte which must equal the expectation.
    pub fn expect(&mut self, expected: u8) -> UnitResult {
        match self.advance() {
            Some(byte) if byte == expected => Ok(()),
            Some(byte) => Err(Error::malformed(format!(
                "expected `{}`, found `{}`", expected as char, byte as char
            ))),
            None => Err(Error::malformed("unexpected end of dictionary")),
        }
    }

    /// Consume text up to the delimiter, and the delimiter itself.
    /// Fails on end of input, as truncated definitions must be rejected.
    pub fn take_until(&mut self, delimiter: u8) -> Result<&'s str> {
        match self.rest.as_bytes().iter().position(|byte| *byte == delimiter) {
            Some(position) => {
                let text = &self.rest[.. position];
                self.rest = &self.rest[position + 1 ..];
                Ok(text)
            },

            None => Err(Error::malformed("unterminated name")),
        }
    }

    /// Parse a leading decimal integer, ignoring leading whitespace,
    /// then skip to just after the delimiter.
    pub fn int_then(&mut self, delimiter: u8) -> Result<i64> {
        self.rest = self.rest.trim_start();

        let bytes = self.rest.as_bytes();
        let mut end = 0;

        if bytes.first() == Some(&b'-') { end = 1; }
        while end < bytes.len() && bytes[end].is_ascii_digit() { end += 1; }

        let value = self.rest[.. end].parse::<i64>()
            .map_err(|_| Error::malformed("expected a decimal count"))?;

        self.take_until(delimiter)?;
        Ok(value)
    }
}
