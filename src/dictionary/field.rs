
//! One field of a record type, and the engine that reads and writes
//! field values inside raw node payloads.
//!
//! Field paths have the form `name[index].name[index]`,
//! where every index defaults to zero:
//!
//! - `abc` is field `abc[0]`
//! - `abc[3]` is field `abc[3]`
//! - `abc[2].def` is field `def[0]` of the third `abc` record

use bit_field::BitField;

use crate::io::{read_at, write_at};
use crate::error::{Error, Result, UnitResult};
use crate::meta::PixelType;
use crate::math::compute_packed_byte_count;
use super::{Dictionary, TextCursor, TypeRef};


/// How the items of a field are laid out in the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {

    /// Items are stored directly inside the record.
    Inline,

    /// A `{count, offset}` prefix with the count fixed by the declaration.
    /// Declared with a `*` in the dictionary.
    FixedPointer,

    /// A `{count, offset}` prefix with the count stored only in the data.
    /// Declared with a `p` in the dictionary.
    VariablePointer,
}

impl Storage {

    /// Whether the on-disk form starts with the eight byte count and offset prefix.
    pub fn has_prefix(self) -> bool {
        self != Storage::Inline
    }
}


/// What one item of a field is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {

    /// 1 bit unsigned, only in packed pixel storage.
    U1,

    /// 2 bit unsigned, only in packed pixel storage.
    U2,

    /// 4 bit unsigned, only in packed pixel storage.
    U4,

    /// Unsigned byte. Arrays of these usually hold text.
    UChar,

    /// Signed byte.
    Char,

    /// An enumeration, stored as an unsigned 16 bit ordinal.
    Enum,

    /// Unsigned 16 bit integer.
    UShort,

    /// Signed 16 bit integer.
    Short,

    /// A point in time, stored as an unsigned 32 bit integer.
    Time,

    /// Unsigned 32 bit integer.
    ULong,

    /// Signed 32 bit integer.
    Long,

    /// 32 bit float.
    Float,

    /// 64 bit float.
    Double,

    /// Complex number of two 32 bit float halves.
    Complex64,

    /// Complex number of two 64 bit float halves.
    Complex128,

    /// A matrix cell carrying its own dimensions and element type.
    BaseData,

    /// A nested record of a named type.
    Object,
}

impl ItemKind {

    /// Interpret an item type character of the dictionary grammar.
    /// Inline definitions (`x`) are resolved to `Object` by the parser.
    pub fn from_code(code: u8) -> Option<Self> {
        use self::ItemKind::*;
        Some(match code {
            b'1' => U1, b'2' => U2, b'4' => U4,
            b'c' => UChar, b'C' => Char,
            b'e' => Enum, b's' => UShort, b'S' => Short,
            b't' => Time, b'l' => ULong, b'L' => Long,
            b'f' => Float, b'd' => Double,
            b'm' => Complex64, b'M' => Complex128,
            b'b' => BaseData, b'o' => Object,
            _ => return None,
        })
    }

    /// The byte count of one item when stored in a record.
    /// The sub-byte types occupy a whole byte each outside of packed pixel storage.
    /// Base data and nested records have no intrinsic size.
    pub fn byte_size(self) -> usize {
        use self::ItemKind::*;
        match self {
            U1 | U2 | U4 | UChar | Char => 1,
            Enum | UShort | Short => 2,
            Time | ULong | Long | Float => 4,
            Double | Complex64 => 8,
            Complex128 => 16,
            BaseData | Object => 0,
        }
    }
}


/// One field of a record type in the dictionary.
#[derive(Debug, Clone)]
pub struct DictField {

    /// The declared item count. One for scalars.
    /// Zero for counted pointers, whose count lives in the data.
    pub item_count: usize,

    /// How the items are laid out in the record.
    pub storage: Storage,

    /// What one item is.
    pub item: ItemKind,

    /// The field identifier.
    pub name: String,

    /// The value names of an enumeration field. Empty otherwise.
    pub enum_names: Vec<String>,

    /// The type name of a nested record field.
    pub object_type_name: Option<String>,

    /// The resolved type of a nested record field.
    /// Resolved after the whole dictionary has been parsed.
    /// `None` for unresolvable names, which behave as empty records.
    pub object_type: Option<TypeRef>,

    /// The fixed byte count of one instance of this field,
    /// or `None` if it can only be determined from the data.
    pub byte_size: Option<usize>,
}

const MAX_ENUM_NAMES: i64 = 100_000;

impl DictField {

    /// Parse one `count : pointer? item name ,` field definition.
    pub(crate) fn parse(cursor: &mut TextCursor<'_>) -> Result<Self> {
        let item_count = cursor.int_then(b':')?;
        if item_count < 0 {
            return Err(Error::malformed("negative item count"));
        }

        let storage = match cursor.peek() {
            Some(b'p') => { cursor.expect(b'p')?; Storage::VariablePointer },
            Some(b'*') => { cursor.expect(b'*')?; Storage::FixedPointer },
            _ => Storage::Inline,
        };

        let code = cursor.advance()
            .ok_or_else(|| Error::malformed("unexpected end of field definition"))?;

        let item = match code {
            b'x' => ItemKind::Object,
            known => ItemKind::from_code(known).ok_or_else(|| Error::malformed(
                format!("unrecognized item type `{}`", known as char)
            ))?,
        };

        let mut object_type_name = None;
        let mut enum_names = Vec::new();

        if code == b'x' {
            // skip the inline definition and resolve the name like a named record.
            // if the type is not also defined at the top level, it behaves as empty.
            cursor.expect(b'{')?;
            let mut depth = 1_usize;
            while depth > 0 {
                match cursor.advance() {
                    Some(b'{') => depth += 1,
                    Some(b'}') => depth -= 1,
                    Some(_) => {},
                    None => return Err(Error::malformed("unterminated inline definition")),
                }
            }

            object_type_name = Some(cursor.take_until(b',')?.to_owned());
        }

        if item == ItemKind::Object && object_type_name.is_none() {
            object_type_name = Some(cursor.take_until(b',')?.to_owned());
        }

        if item == ItemKind::Enum {
            let count = cursor.int_then(b':')?;
            if count < 0 || count > MAX_ENUM_NAMES {
                return Err(Error::malformed(format!("enumeration with {} values", count)));
            }

            enum_names.reserve(count as usize);
            for _ in 0 .. count {
                enum_names.push(cursor.take_until(b',')?.to_owned());
            }
        }

        let name = cursor.take_until(b',')?.to_owned();

        Ok(DictField {
            item_count: item_count as usize,
            storage, item, name, enum_names,
            object_type_name,
            object_type: None,
            byte_size: None,
        })
    }
}


/// Which representation a caller requests from the field engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqType {

    /// Numeric types converted to a 32 bit integer,
    /// enumerations yield their ordinal.
    Int,

    /// Numeric types converted to a 64 bit float.
    Double,

    /// Character arrays yield their text,
    /// enumerations yield their value name,
    /// numbers are formatted.
    Text,

    /// Nested records yield the byte range of the addressed instance.
    Raw,
}

/// A value extracted from a record instance.
#[derive(Debug, Clone, PartialEq)]
pub enum Extracted {

    /// The value as a 32 bit integer.
    Int(i32),

    /// The value as a 64 bit float.
    Double(f64),

    /// The value as text.
    Text(String),

    /// The byte range of a nested record instance inside the payload.
    Raw {

        /// Byte offset of the instance inside the payload the search started in.
        offset: usize,

        /// Byte count from the instance to the end of that payload.
        length: usize,
    },
}

impl Extracted {

    /// The contained integer, if this is an integer.
    pub fn into_int(self) -> Result<i32> {
        match self {
            Extracted::Int(value) => Ok(value),
            other => Err(Error::bad_type(format!("expected an integer, found {:?}", other))),
        }
    }

    /// The contained float, if this is a float.
    pub fn into_double(self) -> Result<f64> {
        match self {
            Extracted::Double(value) => Ok(value),
            other => Err(Error::bad_type(format!("expected a float, found {:?}", other))),
        }
    }

    /// The contained text, if this is text.
    pub fn into_text(self) -> Result<String> {
        match self {
            Extracted::Text(value) => Ok(value),
            other => Err(Error::bad_type(format!("expected text, found {:?}", other))),
        }
    }
}

/// A value to be assigned to a field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldValue<'s> {

    /// Written to the field as an integer.
    Int(i32),

    /// Written to the field as a float.
    Double(f64),

    /// Written to character arrays as NUL terminated text,
    /// to enumerations as the ordinal of the named value,
    /// and parsed when written to a numeric field.
    Text(&'s str),
}

impl FieldValue<'_> {

    /// This value as an integer and a float.
    fn as_numbers(&self) -> (i32, f64) {
        match *self {
            FieldValue::Int(value) => (value, f64::from(value)),
            FieldValue::Double(value) => (value as i32, value),
            FieldValue::Text(text) => {
                let value = parse_leading_number(text);
                (value as i32, value)
            },
        }
    }
}

/// The longest numeric prefix of the text as a float, or zero.
fn parse_leading_number(text: &str) -> f64 {
    let text = text.trim_start();
    (1 ..= text.len()).rev()
        .find_map(|end| text[.. end].parse::<f64>().ok())
        .unwrap_or(0.0)
}


/// One parsed step of a field path.
#[derive(Debug, Clone, Copy)]
struct PathStep<'s> {
    name: &'s str,
    index: i32,
    remainder: Option<&'s str>,
}

/// Split the leading `name[index]` step off a field path.
fn parse_path(path: &str) -> PathStep<'_> {
    let bracket = path.find('[');
    let dot = path.find('.');

    match (bracket, dot) {
        (Some(bracket), dot) if dot.map_or(true, |dot| dot > bracket) => PathStep {
            name: &path[.. bracket],
            index: parse_leading_number(&path[bracket + 1 ..]) as i32,
            remainder: dot.map(|dot| &path[dot + 1 ..]),
        },

        (_, Some(dot)) => PathStep {
            name: &path[.. dot],
            index: 0,
            remainder: Some(&path[dot + 1 ..]),
        },

        _ => PathStep { name: path, index: 0, remainder: None },
    }
}


/// The field engine: reads and writes typed values inside raw record bytes.
impl Dictionary {

    /// Extract the value of the field addressed by the path
    /// from an instance of the given record type.
    pub fn extract(&self, record: TypeRef, path: &str, data: &[u8], request: ReqType) -> Result<Extracted> {
        self.extract_in(record, path, data, 0, request)
    }

    /// Assign a value to the field addressed by the path.
    /// `data_offset` is the absolute file position of the record bytes,
    /// required because pointer prefixes store absolute positions.
    pub fn assign(&self, record: TypeRef, path: &str, data: &mut [u8], data_offset: u64, value: FieldValue<'_>) -> UnitResult {
        let step = parse_path(path);
        let (field_index, offset) = self.locate_field(record, &step, data)?;
        let field = &self[record].fields[field_index];

        self.assign_field(
            field, step.index, step.remainder,
            &mut data[offset ..], data_offset + offset as u64, value,
        )
    }

    /// The number of value instances of the field addressed by the path.
    /// The declared count for fixed fields, the count prefix for counted
    /// pointers, and `rows * columns` for base data.
    pub fn instance_count(&self, record: TypeRef, path: &str, data: &[u8]) -> Result<usize> {
        let step = parse_path(path);
        let (field_index, offset) = self.locate_field(record, &step, data)?;
        let field = &self[record].fields[field_index];

        Ok(field_instance_count(field, &data[offset ..]))
    }

    /// The encoded byte count of one instance of the given record type,
    /// reading count prefixes and base data headers from the data
    /// where the type is variable-sized.
    pub fn type_instance_bytes(&self, record: TypeRef, data: &[u8]) -> Result<usize> {
        if let Some(size) = self[record].byte_size {
            return Ok(size);
        }

        let mut total = 0;
        for field in &self[record].fields {
            if total >= data.len() { break; }
            total += self.field_instance_bytes(field, &data[total ..])?;
        }

        Ok(total)
    }

    /// The encoded byte count of one instance of a field,
    /// needed to walk past it inside a record instance.
    pub fn field_instance_bytes(&self, field: &DictField, data: &[u8]) -> Result<usize> {
        if let Some(size) = field.byte_size {
            return Ok(size);
        }

        let mut total = 0;
        let count;

        if field.storage.has_prefix() {
            let prefix: i32 = read_at(data, 0)?;
            count = prefix.max(0) as usize;
            total += 8;
        }
        else {
            count = field.item_count;
        }

        let data = &data[total.min(data.len()) ..];

        if field.item == ItemKind::BaseData && count != 0 {
            let rows: i32 = read_at(data, 0)?;
            let columns: i32 = read_at(data, 4)?;
            let item_code: i16 = read_at(data, 8)?;

            if rows < 0 || columns < 0 {
                return Err(Error::out_of_range("negative base data dimensions"));
            }

            let cells = (rows as usize).checked_mul(columns as usize)
                .ok_or_else(|| Error::too_large("base data dimensions"))?;

            let item = PixelType::from_code(i32::from(item_code))?;
            total += 12 + compute_packed_byte_count(cells, item.bits_per_pixel());
        }
        else if field.item == ItemKind::Object {
            let element = match field.object_type {
                Some(element) => element,
                None => return Ok(total),
            };

            let mut offset = 0;
            for _ in 0 .. count {
                if offset >= data.len() { break; }
                offset += self.type_instance_bytes(element, &data[offset ..])?;
            }

            total += offset;
        }
        else {
            total += count.checked_mul(field.item.byte_size())
                .ok_or_else(|| Error::too_large("field instance count"))?;
        }

        Ok(total)
    }

    /// Walk the fields of a record to the one named by the path step,
    /// returning its index and byte offset inside the record instance.
    fn locate_field(&self, record: TypeRef, step: &PathStep<'_>, data: &[u8]) -> Result<(usize, usize)> {
        let mut offset = 0;

        for (index, field) in self[record].fields.iter().enumerate() {
            if offset >= data.len() {
                return Err(Error::truncated(format!(
                    "record `{}` ends before field `{}`", self[record].name, step.name
                )));
            }

            if field.name == step.name {
                return Ok((index, offset));
            }

            offset += self.field_instance_bytes(field, &data[offset ..])?;
        }

        Err(Error::not_found(format!(
            "no field `{}` in record `{}`", step.name, self[record].name
        )))
    }

    fn extract_in(&self, record: TypeRef, path: &str, data: &[u8], base: usize, request: ReqType) -> Result<Extracted> {
        let step = parse_path(path);
        let (field_index, offset) = self.locate_field(record, &step, data)?;
        let field = &self[record].fields[field_index];

        self.extract_field(
            field, step.index, step.remainder,
            &data[offset ..], base + offset, request,
        )
    }

    /// Extract the value of one instance of a field.
    /// `base` is the byte offset of the field inside the payload
    /// the search started in, reported by raw extraction.
    fn extract_field(&self, field: &DictField, index: i32, remainder: Option<&str>, data: &[u8], base: usize, request: ReqType) -> Result<Extracted> {
        let instances = field_instance_count(field, data);

        let special_base_data_index =
            field.item == ItemKind::BaseData && (-3 .. 0).contains(&index);

        if !special_base_data_index && (index < 0 || index as usize >= instances) {
            return Err(Error::out_of_range(format!(
                "index {} of field `{}` with {} instances", index, field.name, instances
            )));
        }

        let mut data = data;
        let mut base = base;

        if field.storage.has_prefix() {
            if data.len() < 8 {
                return Err(Error::truncated(format!("pointer prefix of field `{}`", field.name)));
            }

            // the stored offset is ignored, the items always follow the prefix
            data = &data[8 ..];
            base += 8;
        }

        // arrays of characters requested as text are a special case,
        // ignoring the index and reading from the start of the array
        let characters = field.item == ItemKind::UChar || field.item == ItemKind::Char;
        if characters && request == ReqType::Text {
            let length = data.iter().position(|byte| *byte == 0).unwrap_or(data.len());
            return Ok(Extracted::Text(String::from_utf8_lossy(&data[.. length]).into_owned()));
        }

        let index = if special_base_data_index { index } else { index.max(0) };
        let position = index.max(0) as usize;

        let int_value: i32;
        let double_value: f64;
        let mut text_value: Option<String> = None;

        use self::ItemKind::*;
        match field.item {
            UChar | Char => {
                if position >= data.len() {
                    return Err(Error::truncated(format!("field `{}`", field.name)));
                }

                int_value = i32::from(data[position]);
                double_value = f64::from(data[position]);
            },

            Enum | UShort => {
                let value: u16 = read_at(data, position * 2)?;
                int_value = i32::from(value);
                double_value = f64::from(value);

                if field.item == Enum {
                    text_value = field.enum_names.get(value as usize).cloned();
                }
            },

            Short => {
                let value: i16 = read_at(data, position * 2)?;
                int_value = i32::from(value);
                double_value = f64::from(value);
            },

            Time | ULong => {
                let value: u32 = read_at(data, position * 4)?;
                int_value = value as i32;
                double_value = f64::from(value);
            },

            Long => {
                let value: i32 = read_at(data, position * 4)?;
                int_value = value;
                double_value = f64::from(value);
            },

            Float => {
                let value: f32 = read_at(data, position * 4)?;
                int_value = value as i32;
                double_value = f64::from(value);
            },

            Double => {
                let value: f64 = read_at(data, position * 8)?;
                int_value = value as i32;
                double_value = value;
            },

            BaseData => {
                let value = extract_base_data(field, data, index)?;
                int_value = value as i32;
                double_value = value;
            },

            Object => {
                let element = field.object_type.ok_or_else(|| Error::not_found(
                    format!("unresolved record type of field `{}`", field.name)
                ))?;

                let extra = self.object_instance_offset(element, data, position)?;

                return match remainder {
                    Some(remainder) =>
                        self.extract_in(element, remainder, &data[extra ..], base + extra, request),

                    None if request == ReqType::Raw =>
                        Ok(Extracted::Raw { offset: base + extra, length: data.len() - extra }),

                    None => Err(Error::not_found(format!(
                        "field `{}` is a record and needs a member path", field.name
                    ))),
                };
            },

            U1 | U2 | U4 | Complex64 | Complex128 => {
                return Err(Error::bad_type(format!(
                    "field `{}` cannot be read as a record value", field.name
                )));
            },
        }

        Ok(match request {
            ReqType::Int => Extracted::Int(int_value),
            ReqType::Double => Extracted::Double(double_value),
            ReqType::Text => Extracted::Text(
                text_value.unwrap_or_else(|| format_number(double_value))
            ),
            ReqType::Raw => return Err(Error::unsupported(format!(
                "raw access to scalar field `{}`", field.name
            ))),
        })
    }

    /// Byte offset of the indexed instance inside an array of nested records.
    fn object_instance_offset(&self, element: TypeRef, data: &[u8], position: usize) -> Result<usize> {
        let mut extra = 0;

        match self[element].byte_size {
            Some(size) => {
                extra = size.checked_mul(position)
                    .ok_or_else(|| Error::too_large("record array index"))?;
            },

            None => {
                for _ in 0 .. position {
                    if extra >= data.len() { break; }
                    extra += self.type_instance_bytes(element, &data[extra ..])?;
                }
            },
        }

        if extra >= data.len() && position > 0 {
            return Err(Error::truncated("record array instance"));
        }

        Ok(extra.min(data.len()))
    }

    /// Assign a value to one instance of a field.
    /// A failed assignment never disturbs the count prefix of a pointer
    /// field, so the declared count only ever covers written instances.
    fn assign_field(&self, field: &DictField, index: i32, remainder: Option<&str>, data: &mut [u8], data_offset: u64, value: FieldValue<'_>) -> UnitResult {
        if index < 0 && field.item != ItemKind::BaseData {
            return Err(Error::out_of_range(format!(
                "negative index of field `{}`", field.name
            )));
        }

        if !field.storage.has_prefix() {
            return self.assign_items(field, index, remainder, data, data_offset, value);
        }

        let characters = field.item == ItemKind::UChar || field.item == ItemKind::Char;
        let text = match value { FieldValue::Text(text) => Some(text), _ => None };

        // the count of a base data field is one instance,
        // the contents carry their own dimensions
        let count: u32 = if field.item == ItemKind::BaseData { 1 }
            else if characters && text.is_some() { text.unwrap_or_default().len() as u32 + 1 }
            else { index as u32 + 1 };

        // the exact byte demand of the counted items,
        // so a write that cannot fit is rejected before anything changes
        let item_bytes = match field.item {
            ItemKind::BaseData => 12, // the dimension header, cells check their own bounds
            ItemKind::Object => 0, // nested records check their own bounds
            item => (count as usize).checked_mul(item.byte_size())
                .ok_or_else(|| Error::too_large(format!("instance count of field `{}`", field.name)))?,
        };

        if item_bytes.saturating_add(8) > data.len() {
            return Err(Error::too_large(format!(
                "cannot extend field `{}` past the end of the node payload", field.name
            )));
        }

        let (prefix, items) = data.split_at_mut(8);
        self.assign_items(field, index, remainder, items, data_offset + 8, value)?;

        // only a successful write updates the prefix:
        // the grow-only count and the position of the items
        let stored: u32 = read_at(prefix, 0)?;
        if stored < count {
            write_at(prefix, 0, count)?;
        }

        write_at(prefix, 4, data_offset as u32 + 8)?;
        Ok(())
    }

    /// Write one addressed item into the field bytes,
    /// located after any pointer prefix.
    fn assign_items(&self, field: &DictField, index: i32, remainder: Option<&str>, data: &mut [u8], data_offset: u64, value: FieldValue<'_>) -> UnitResult {
        let characters = field.item == ItemKind::UChar || field.item == ItemKind::Char;
        let text = match value { FieldValue::Text(text) => Some(text), _ => None };

        // arrays of characters assigned from text are a special case
        if characters {
            if let Some(text) = text {
                let byte_count = match field.byte_size {
                    None => text.len() + 1,
                    Some(size) => size,
                };

                if byte_count > data.len() {
                    return Err(Error::too_large(format!(
                        "cannot extend field `{}` past the end of the node payload", field.name
                    )));
                }

                let copied = text.len().min(byte_count);
                data[.. byte_count].iter_mut().for_each(|byte| *byte = 0);
                data[.. copied].copy_from_slice(&text.as_bytes()[.. copied]);
                return Ok(());
            }
        }

        let (int_value, double_value) = value.as_numbers();
        let position = index.max(0) as usize;

        let too_large = || Error::too_large(format!(
            "cannot extend field `{}` past the end of the node payload", field.name
        ));

        use self::ItemKind::*;
        match field.item {
            UChar | Char => {
                if position >= data.len() { return Err(too_large()); }
                data[position] = match text {
                    Some(text) => text.bytes().next().unwrap_or(0),
                    None => int_value as u8,
                };
            },

            Enum | UShort => {
                let ordinal = match (field.item, text) {
                    (Enum, Some(name)) => {
                        field.enum_names.iter().position(|known| known == name)
                            .ok_or_else(|| Error::out_of_range(format!(
                                "unknown value `{}` of enumeration `{}`", name, field.name
                            )))? as u16
                    },

                    _ => int_value as u16,
                };

                write_at(data, position * 2, ordinal).map_err(|_| too_large())?;
            },

            Short => write_at(data, position * 2, int_value as i16).map_err(|_| too_large())?,
            Time | ULong => write_at(data, position * 4, int_value as u32).map_err(|_| too_large())?,
            Long => write_at(data, position * 4, int_value).map_err(|_| too_large())?,
            Float => write_at(data, position * 4, double_value as f32).map_err(|_| too_large())?,
            Double => write_at(data, position * 8, double_value).map_err(|_| too_large())?,

            BaseData => {
                assign_base_data(field, data, index, int_value, double_value)?;
            },

            Object => {
                let element = field.object_type.ok_or_else(|| Error::not_found(
                    format!("unresolved record type of field `{}`", field.name)
                ))?;

                let extra = self.object_instance_offset(element, data, position)?;

                let remainder = remainder.ok_or_else(|| Error::not_found(format!(
                    "field `{}` is a record and needs a member path", field.name
                )))?;

                let step = parse_path(remainder);
                let (field_index, offset) = self.locate_field(element, &step, &data[extra ..])?;
                let inner = &self[element].fields[field_index];

                return self.assign_field(
                    inner, step.index, step.remainder,
                    &mut data[extra + offset ..],
                    data_offset + (extra + offset) as u64,
                    value,
                );
            },

            U1 | U2 | U4 | Complex64 | Complex128 => {
                return Err(Error::bad_type(format!(
                    "field `{}` cannot be written as a record value", field.name
                )));
            },
        }

        Ok(())
    }
}


/// The instance count of a field: the declared count for inline fields,
/// the count prefix for pointers, and `rows * columns` for base data.
fn field_instance_count(field: &DictField, data: &[u8]) -> usize {
    if !field.storage.has_prefix() {
        return field.item_count;
    }

    if field.item == ItemKind::BaseData {
        if data.len() < 20 { return 0; }
        let rows = read_at::<i32>(data, 8).unwrap_or(0);
        let columns = read_at::<i32>(data, 12).unwrap_or(0);

        if rows < 0 || columns < 0 { return 0; }
        return (rows as usize).saturating_mul(columns as usize);
    }

    read_at::<i32>(data, 0).unwrap_or(0).max(0) as usize
}


/// Read one value of a base data matrix. The data starts at the
/// twelve byte dimension header, any pointer prefix already skipped.
/// The special indices -3, -2 and -1 address the item type,
/// the column count and the row count.
fn extract_base_data(field: &DictField, data: &[u8], index: i32) -> Result<f64> {
    if data.len() < 12 {
        return Err(Error::truncated(format!("base data header of field `{}`", field.name)));
    }

    let rows: i32 = read_at(data, 0)?;
    let columns: i32 = read_at(data, 4)?;
    let item_code: i16 = read_at(data, 8)?;
    // the two byte object type is ignored

    match index {
        -3 => return Ok(f64::from(item_code)),
        -2 => return Ok(f64::from(columns)),
        -1 => return Ok(f64::from(rows)),
        _ => {},
    }

    let cells = i64::from(rows) * i64::from(columns);
    if index < 0 || i64::from(index) >= cells {
        return Err(Error::out_of_range(format!(
            "cell {} of a {}x{} base data matrix", index, rows, columns
        )));
    }

    let cell = index as usize;
    let body = &data[12 ..];

    let truncated = || Error::truncated(format!("base data of field `{}`", field.name));

    use crate::meta::PixelType::*;
    Ok(match PixelType::from_code(i32::from(item_code))? {
        U1 => {
            let byte = *body.get(cell >> 3).ok_or_else(truncated)?;
            if byte.get_bit(cell & 7) { 1.0 } else { 0.0 }
        },

        U2 => {
            let byte = *body.get(cell >> 2).ok_or_else(truncated)?;
            f64::from((byte >> (2 * (cell & 3))) & 0x3)
        },

        U4 => {
            let byte = *body.get(cell >> 1).ok_or_else(truncated)?;
            f64::from((byte >> (4 * (cell & 1))) & 0xf)
        },

        U8 => f64::from(*body.get(cell).ok_or_else(truncated)?),
        S8 => f64::from(*body.get(cell).ok_or_else(truncated)? as i8),

        U16 => f64::from(read_at::<u16>(body, cell * 2)?),
        S16 => f64::from(read_at::<i16>(body, cell * 2)?),
        U32 => f64::from(read_at::<u32>(body, cell * 4)?),
        S32 => f64::from(read_at::<i32>(body, cell * 4)?),
        F32 => f64::from(read_at::<f32>(body, cell * 4)?),
        F64 => read_at::<f64>(body, cell * 8)?,

        C64 | C128 => return Err(Error::bad_type(format!(
            "complex base data in field `{}`", field.name
        ))),
    })
}

/// Write one value of a base data matrix, or one of its header values
/// through the special indices. Only 64 bit float cells can be written.
fn assign_base_data(field: &DictField, data: &mut [u8], index: i32, int_value: i32, double_value: f64) -> UnitResult {
    if data.len() < 12 {
        return Err(Error::too_large(format!(
            "cannot extend field `{}` past the end of the node payload", field.name
        )));
    }

    let mut rows: i32 = read_at(data, 0)?;
    let mut columns: i32 = read_at(data, 4)?;
    let mut item_code: i16 = read_at(data, 8)?;

    match index {
        -3 => item_code = int_value as i16,
        -2 => columns = int_value,
        -1 => rows = int_value,
        _ => {},
    }

    if index < -3 || (index >= 0 && i64::from(index) >= i64::from(rows) * i64::from(columns)) {
        return Err(Error::out_of_range(format!(
            "cell {} of a {}x{} base data matrix", index, rows, columns
        )));
    }

    write_at(data, 0, rows)?;
    write_at(data, 4, columns)?;
    write_at(data, 8, item_code)?;
    // the two byte object type is ignored

    if index >= 0 {
        let item = PixelType::from_code(i32::from(item_code))?;
        if item != PixelType::F64 {
            return Err(Error::unsupported(format!(
                "writing base data cells of type {:?}", item
            )));
        }

        let body = &mut data[12 ..];
        write_at(body, index as usize * 8, double_value).map_err(|_| Error::too_large(format!(
            "cannot extend field `{}` past the end of the node payload", field.name
        )))?;
    }

    Ok(())
}

/// Format a number the way the text representation of numeric fields expects.
fn format_number(value: f64) -> String {
    if value == value.trunc() && value.abs() < 1e15 {
        format!("{}", value as i64)
    }
    else {
        format!("{}", value)
    }
}


#[cfg(test)]
mod test {
    use super::*;
    use crate::dictionary::Dictionary;

    fn projection_dictionary() -> Dictionary {
        Dictionary::new()
    }

    #[test]
    fn extract_and_assign_scalars(){
        let dictionary = projection_dictionary();
        let coordinate = dictionary.find_type("Eprj_Coordinate").unwrap();
        let mut data = vec![ 0_u8; 16 ];

        dictionary.assign(coordinate, "x", &mut data, 0, FieldValue::Double(2.5)).unwrap();
        dictionary.assign(coordinate, "y", &mut data, 0, FieldValue::Double(-7.0)).unwrap();

        assert_eq!(dictionary.extract(coordinate, "x", &data, ReqType::Double).unwrap(), Extracted::Double(2.5));
        assert_eq!(dictionary.extract(coordinate, "y", &data, ReqType::Int).unwrap(), Extracted::Int(-7));
        assert_eq!(dictionary.extract(coordinate, "y", &data, ReqType::Text).unwrap(), Extracted::Text("-7".to_owned()));

        assert!(matches!(
            dictionary.extract(coordinate, "z", &data, ReqType::Double),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn extract_nested_records(){
        let dictionary = projection_dictionary();
        let spheroid = dictionary.find_type("Eprj_Spheroid").unwrap();

        // sphereName is an empty counted pointer, followed by four doubles
        let mut data = vec![ 0_u8; 8 + 4 * 8 ];
        dictionary.assign(spheroid, "a", &mut data, 0, FieldValue::Double(6378137.0)).unwrap();
        dictionary.assign(spheroid, "radius", &mut data, 0, FieldValue::Double(6371000.0)).unwrap();

        assert_eq!(
            dictionary.extract(spheroid, "a", &data, ReqType::Double).unwrap(),
            Extracted::Double(6378137.0)
        );

        assert_eq!(
            dictionary.extract(spheroid, "radius", &data, ReqType::Double).unwrap(),
            Extracted::Double(6371000.0)
        );
    }

    #[test]
    fn enumerations_convert_by_request(){
        let dictionary = projection_dictionary();
        let layer = dictionary.find_type("Eimg_Layer").unwrap();
        let mut data = vec![ 0_u8; 20 ];

        dictionary.assign(layer, "pixelType", &mut data, 0, FieldValue::Text("f64")).unwrap();
        assert_eq!(dictionary.extract(layer, "pixelType", &data, ReqType::Int).unwrap(), Extracted::Int(10));
        assert_eq!(dictionary.extract(layer, "pixelType", &data, ReqType::Text).unwrap(), Extracted::Text("f64".to_owned()));

        assert!(matches!(
            dictionary.assign(layer, "pixelType", &mut data, 0, FieldValue::Text("f128")),
            Err(Error::OutOfRange(_))
        ));
    }

    #[test]
    fn grow_only_pointer_count(){
        let dictionary = projection_dictionary();
        let datum = dictionary.find_type("Eprj_Datum").unwrap();

        // datumname pointer, type enum, params pointer, gridname pointer
        let mut data = vec![ 0_u8; 8 + 2 + 8 + 8 * 8 + 8 ];

        dictionary.assign(datum, "params[3]", &mut data, 1000, FieldValue::Double(1.5)).unwrap();
        assert_eq!(dictionary.extract(datum, "params[3]", &data, ReqType::Double).unwrap(), Extracted::Double(1.5));
        assert_eq!(dictionary.instance_count(datum, "params", &data).unwrap(), 4);

        // setting an earlier index afterwards must preserve the count of four
        dictionary.assign(datum, "params[1]", &mut data, 1000, FieldValue::Double(2.5)).unwrap();
        assert_eq!(dictionary.instance_count(datum, "params", &data).unwrap(), 4);
        assert_eq!(dictionary.extract(datum, "params[3]", &data, ReqType::Double).unwrap(), Extracted::Double(1.5));

        // the payload only has room for seven doubles after the prefixes
        assert!(matches!(
            dictionary.assign(datum, "params[9]", &mut data, 1000, FieldValue::Double(0.5)),
            Err(Error::TooLarge(_))
        ));

        // the rejected write must not disturb the stored count,
        // or later reads would treat unwritten bytes as array contents
        assert_eq!(dictionary.instance_count(datum, "params", &data).unwrap(), 4);
        assert_eq!(dictionary.extract(datum, "params[3]", &data, ReqType::Double).unwrap(), Extracted::Double(1.5));
    }

    #[test]
    fn text_fields_grow_and_shrink(){
        let dictionary = projection_dictionary();
        let string = dictionary.find_type("Emif_String").unwrap();
        let mut data = vec![ 0_u8; 8 + 32 ];

        dictionary.assign(string, "string", &mut data, 20, FieldValue::Text("Mercator")).unwrap();
        assert_eq!(dictionary.instance_count(string, "string", &data).unwrap(), 9);
        assert_eq!(
            dictionary.extract(string, "string", &data, ReqType::Text).unwrap(),
            Extracted::Text("Mercator".to_owned())
        );

        // the count prefix never shrinks
        dictionary.assign(string, "string", &mut data, 20, FieldValue::Text("utm")).unwrap();
        assert_eq!(dictionary.instance_count(string, "string", &data).unwrap(), 9);
        assert_eq!(
            dictionary.extract(string, "string", &data, ReqType::Text).unwrap(),
            Extracted::Text("utm".to_owned())
        );

        assert!(matches!(
            dictionary.assign(string, "string", &mut data, 20, FieldValue::Text(
                "a name that is much longer than the thirty two allocated bytes"
            )),
            Err(Error::TooLarge(_))
        ));

        // the rejected write leaves the count and contents untouched
        assert_eq!(dictionary.instance_count(string, "string", &data).unwrap(), 9);
        assert_eq!(
            dictionary.extract(string, "string", &data, ReqType::Text).unwrap(),
            Extracted::Text("utm".to_owned())
        );
    }

    #[test]
    fn base_data_special_indices(){
        let dictionary = projection_dictionary();
        let value = dictionary.find_type("Eimg_NonInitializedValue").unwrap();

        // pointer prefix, base data header, one f64 cell
        let mut data = vec![ 0_u8; 8 + 12 + 8 ];
        dictionary.assign(value, "valueBD[-3]", &mut data, 0, FieldValue::Int(PixelType::F64.code())).unwrap();
        dictionary.assign(value, "valueBD[-2]", &mut data, 0, FieldValue::Int(1)).unwrap();
        dictionary.assign(value, "valueBD[-1]", &mut data, 0, FieldValue::Int(1)).unwrap();
        dictionary.assign(value, "valueBD[0]", &mut data, 0, FieldValue::Double(-9999.0)).unwrap();

        assert_eq!(dictionary.extract(value, "valueBD[-3]", &data, ReqType::Int).unwrap(), Extracted::Int(10));
        assert_eq!(dictionary.extract(value, "valueBD[-2]", &data, ReqType::Int).unwrap(), Extracted::Int(1));
        assert_eq!(dictionary.extract(value, "valueBD", &data, ReqType::Double).unwrap(), Extracted::Double(-9999.0));

        assert!(matches!(
            dictionary.extract(value, "valueBD[1]", &data, ReqType::Double),
            Err(Error::OutOfRange(_))
        ));
    }

    #[test]
    fn base_data_sub_byte_cells(){
        let dictionary = projection_dictionary();
        let value = dictionary.find_type("Eimg_NonInitializedValue").unwrap();

        // a 1x8 matrix of u1 cells: one byte 0b0000_0101
        let mut data = vec![ 0_u8; 8 + 12 + 1 ];
        data[8 .. 12].copy_from_slice(&1_i32.to_le_bytes());
        data[12 .. 16].copy_from_slice(&8_i32.to_le_bytes());
        data[16 .. 18].copy_from_slice(&(PixelType::U1.code() as i16).to_le_bytes());
        data[20] = 0b0000_0101;

        let cell = |index: i32| dictionary
            .extract(value, &format!("valueBD[{}]", index), &data, ReqType::Int)
            .unwrap();

        assert_eq!(cell(0), Extracted::Int(1));
        assert_eq!(cell(1), Extracted::Int(0));
        assert_eq!(cell(2), Extracted::Int(1));
        assert_eq!(cell(3), Extracted::Int(0));
    }

    #[test]
    fn variable_sized_string_arrays(){
        let dictionary = projection_dictionary();
        let names = dictionary.find_type("Eimg_RRDNamesList").unwrap();

        let mut data = vec![ 0_u8; 200 ];
        dictionary.assign(names, "algorithm.string", &mut data, 0, FieldValue::Text("IMAGINE 2X2 Resampling")).unwrap();
        dictionary.assign(names, "nameList[0].string", &mut data, 0, FieldValue::Text("first.img(:Layer_1:_ss_2_)")).unwrap();
        dictionary.assign(names, "nameList[1].string", &mut data, 0, FieldValue::Text("second.img(:Layer_1:_ss_4_)")).unwrap();

        assert_eq!(dictionary.instance_count(names, "nameList", &data).unwrap(), 2);

        assert_eq!(
            dictionary.extract(names, "nameList[0].string", &data, ReqType::Text).unwrap(),
            Extracted::Text("first.img(:Layer_1:_ss_2_)".to_owned())
        );

        assert_eq!(
            dictionary.extract(names, "nameList[1].string", &data, ReqType::Text).unwrap(),
            Extracted::Text("second.img(:Layer_1:_ss_4_)".to_owned())
        );
    }

    #[test]
    fn raw_access_to_nested_records(){
        let dictionary = projection_dictionary();
        let map_info = dictionary.find_type("Eprj_MapInfo").unwrap();

        // proName pointer, then the coordinate pointer with prefix
        let mut data = vec![ 0_u8; 8 + 8 + 16 + 8 + 16 + 8 + 16 + 8 ];
        dictionary.assign(map_info, "upperLeftCenter.x", &mut data, 0, FieldValue::Double(40.0)).unwrap();

        let raw = dictionary.extract(map_info, "upperLeftCenter", &data, ReqType::Raw).unwrap();
        match raw {
            Extracted::Raw { offset, .. } => {
                assert_eq!(offset, 8 + 8);
                assert_eq!(crate::io::read_at::<f64>(&data, offset).unwrap(), 40.0);
            },
            other => panic!("expected raw access, found {:?}", other),
        }
    }
}
