//! Column descriptors and the scalar codec.
//!
//! Every value read or written goes through [`Value`]: one encode path and one
//! decode path, keyed off the column's [`ColumnType`].

use std::fmt;

use smallvec::SmallVec;

use crate::datetime::{Date, DateTime};
use crate::error::ValueError;

// ============================================================================
// Column Types
// ============================================================================

/// Server type tag of a column.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Bool,
    UByte,
    Short,
    Int,
    Long,
    Float,
    Double,
    Date,
    DateTime,
    /// Fixed-width, space-padded text
    Varchar,
    /// Variable-width text
    Blob,
    /// A tag this driver has no scalar codec for
    Other(String),
}

impl ColumnType {
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "ftBool" => ColumnType::Bool,
            "ftUByte" => ColumnType::UByte,
            "ftShort" => ColumnType::Short,
            "ftInt" => ColumnType::Int,
            "ftLong" => ColumnType::Long,
            "ftFloat" => ColumnType::Float,
            "ftDouble" => ColumnType::Double,
            "ftDate" => ColumnType::Date,
            "ftDateTime" => ColumnType::DateTime,
            "ftVarchar" => ColumnType::Varchar,
            "ftBlob" => ColumnType::Blob,
            other => ColumnType::Other(other.to_string()),
        }
    }

    pub fn tag(&self) -> &str {
        match self {
            ColumnType::Bool => "ftBool",
            ColumnType::UByte => "ftUByte",
            ColumnType::Short => "ftShort",
            ColumnType::Int => "ftInt",
            ColumnType::Long => "ftLong",
            ColumnType::Float => "ftFloat",
            ColumnType::Double => "ftDouble",
            ColumnType::Date => "ftDate",
            ColumnType::DateTime => "ftDateTime",
            ColumnType::Varchar => "ftVarchar",
            ColumnType::Blob => "ftBlob",
            ColumnType::Other(tag) => tag,
        }
    }

    /// Short name used in error messages.
    pub fn name(&self) -> &'static str {
        match self {
            ColumnType::Bool => "bool",
            ColumnType::UByte => "ubyte",
            ColumnType::Short => "short",
            ColumnType::Int => "int",
            ColumnType::Long => "long",
            ColumnType::Float => "float",
            ColumnType::Double => "double",
            ColumnType::Date => "date",
            ColumnType::DateTime => "datetime",
            ColumnType::Varchar => "varchar",
            ColumnType::Blob => "nvarchar",
            ColumnType::Other(_) => "unsupported",
        }
    }

    /// Width of one value for the fixed-width numeric and temporal types.
    pub fn natural_width(&self) -> Option<usize> {
        match self {
            ColumnType::Bool | ColumnType::UByte => Some(1),
            ColumnType::Short => Some(2),
            ColumnType::Int | ColumnType::Float | ColumnType::Date => Some(4),
            ColumnType::Long | ColumnType::Double | ColumnType::DateTime => Some(8),
            _ => None,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

// ============================================================================
// Column Descriptor
// ============================================================================

/// One column as described by the server's metadata reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    /// Empty for insert (input) columns
    pub name: String,
    pub nullable: bool,
    /// Values are length-prefixed with payload in a separate block
    pub is_true_varchar: bool,
    pub column_type: ColumnType,
    /// Fixed width in bytes, or declared maximum for variable-width text
    pub size: u32,
    pub scale: u32,
}

impl Column {
    pub fn is_variable(&self) -> bool {
        self.is_true_varchar
    }

    /// Bytes per row in the value block.
    pub fn width(&self) -> usize {
        if self.is_variable() {
            4
        } else {
            self.size as usize
        }
    }
}

// ============================================================================
// Values
// ============================================================================

/// A single cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    UByte(u8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Date(Date),
    DateTime(DateTime),
    /// Fixed-width text
    Varchar(String),
    /// Variable-width text
    NVarchar(String),
}

/// An encoded cell ready for the column buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell<'a> {
    /// Exactly `column.width()` bytes
    Fixed(SmallVec<[u8; 16]>),
    /// Length prefix plus payload block
    Blob(&'a [u8]),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::UByte(_) => "ubyte",
            Value::Short(_) => "short",
            Value::Int(_) => "int",
            Value::Long(_) => "long",
            Value::Float(_) => "float",
            Value::Double(_) => "double",
            Value::Date(_) => "date",
            Value::DateTime(_) => "datetime",
            Value::Varchar(_) => "varchar",
            Value::NVarchar(_) => "nvarchar",
        }
    }

    /// Encode for `column` (at position `index`), checking type and width.
    pub fn encode<'a>(&'a self, column: &Column, index: usize) -> Result<Cell<'a>, ValueError> {
        let mismatch = || ValueError::TypeMismatch {
            column: index,
            expected: self.type_name(),
            actual: column.column_type.name().to_string(),
        };

        let mut out = SmallVec::<[u8; 16]>::new();
        match (self, &column.column_type) {
            (Value::Bool(v), ColumnType::Bool) => out.push(*v as u8),
            (Value::UByte(v), ColumnType::UByte) => out.push(*v),
            (Value::Short(v), ColumnType::Short) => out.extend_from_slice(&v.to_le_bytes()),
            (Value::Int(v), ColumnType::Int) => out.extend_from_slice(&v.to_le_bytes()),
            (Value::Long(v), ColumnType::Long) => out.extend_from_slice(&v.to_le_bytes()),
            (Value::Float(v), ColumnType::Float) => out.extend_from_slice(&v.to_le_bytes()),
            (Value::Double(v), ColumnType::Double) => out.extend_from_slice(&v.to_le_bytes()),
            (Value::Date(d), ColumnType::Date) => {
                d.ensure_valid()?;
                out.extend_from_slice(&d.encode().to_le_bytes())
            }
            (Value::DateTime(dt), ColumnType::DateTime) => {
                dt.ensure_valid()?;
                out.extend_from_slice(&dt.encode().to_le_bytes())
            }
            (Value::Varchar(s), ColumnType::Varchar) => {
                let width = column.width();
                if s.len() > width {
                    return Err(ValueError::StringTooLong {
                        column: index,
                        len: s.len(),
                        width,
                    });
                }
                out.extend_from_slice(s.as_bytes());
                out.resize(width, b' ');
            }
            (Value::NVarchar(s), ColumnType::Blob) => {
                if s.len() > i32::MAX as usize {
                    return Err(ValueError::BlobTooLong(s.len()));
                }
                return Ok(Cell::Blob(s.as_bytes()));
            }
            _ => return Err(mismatch()),
        }
        Ok(Cell::Fixed(out))
    }

    /// Decode a fixed-width slice or a blob payload read from `column`.
    pub fn decode(column: &Column, index: usize, raw: &[u8]) -> Result<Value, ValueError> {
        let value = match column.column_type {
            ColumnType::Bool => Value::Bool(fixed::<1>(column, index, raw)?[0] != 0),
            ColumnType::UByte => Value::UByte(fixed::<1>(column, index, raw)?[0]),
            ColumnType::Short => Value::Short(i16::from_le_bytes(fixed(column, index, raw)?)),
            ColumnType::Int => Value::Int(i32::from_le_bytes(fixed(column, index, raw)?)),
            ColumnType::Long => Value::Long(i64::from_le_bytes(fixed(column, index, raw)?)),
            ColumnType::Float => Value::Float(f32::from_le_bytes(fixed(column, index, raw)?)),
            ColumnType::Double => Value::Double(f64::from_le_bytes(fixed(column, index, raw)?)),
            ColumnType::Date => {
                let date = Date::decode(u32::from_le_bytes(fixed(column, index, raw)?));
                date.ensure_valid()?;
                Value::Date(date)
            }
            ColumnType::DateTime => {
                let dt = DateTime::decode(u64::from_le_bytes(fixed(column, index, raw)?));
                dt.ensure_valid()?;
                Value::DateTime(dt)
            }
            ColumnType::Varchar => Value::Varchar(single_byte_text(raw)),
            ColumnType::Blob => Value::NVarchar(text(index, raw)?),
            ColumnType::Other(_) => {
                return Err(ValueError::TypeMismatch {
                    column: index,
                    expected: "supported type",
                    actual: column.column_type.tag().to_string(),
                })
            }
        };
        Ok(value)
    }
}

fn fixed<const N: usize>(column: &Column, index: usize, raw: &[u8]) -> Result<[u8; N], ValueError> {
    raw.get(..N)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| ValueError::TypeMismatch {
            column: index,
            expected: "well-formed value",
            actual: format!("{} bytes of {}", raw.len(), column.column_type.name()),
        })
}

fn text(index: usize, raw: &[u8]) -> Result<String, ValueError> {
    String::from_utf8(raw.to_vec()).map_err(|_| ValueError::InvalidText { column: index })
}

/// Fixed-width text holds one byte per character. Bytes that are not valid
/// UTF-8 map to the code point of the same value (Latin-1).
fn single_byte_text(raw: &[u8]) -> String {
    match std::str::from_utf8(raw) {
        Ok(s) => s.to_string(),
        Err(_) => raw.iter().map(|&b| char::from(b)).collect(),
    }
}

/// Converts a decoded cell into a concrete Rust type.
pub trait FromValue: Sized {
    /// The column type this getter reads.
    const COLUMN_TYPE: &'static str;

    fn from_value(value: Value) -> Option<Self>;
}

macro_rules! impl_from_value {
    ($ty:ty, $variant:ident, $name:literal) => {
        impl FromValue for $ty {
            const COLUMN_TYPE: &'static str = $name;

            fn from_value(value: Value) -> Option<Self> {
                match value {
                    Value::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }

        impl From<$ty> for Value {
            fn from(v: $ty) -> Self {
                Value::$variant(v)
            }
        }
    };
}

impl_from_value!(bool, Bool, "bool");
impl_from_value!(u8, UByte, "ubyte");
impl_from_value!(i16, Short, "short");
impl_from_value!(i32, Int, "int");
impl_from_value!(i64, Long, "long");
impl_from_value!(f32, Float, "float");
impl_from_value!(f64, Double, "double");
impl_from_value!(Date, Date, "date");
impl_from_value!(DateTime, DateTime, "datetime");

// ============================================================================
// Column References
// ============================================================================

/// A column addressed by position or by name.
pub trait ColumnRef {
    fn resolve(&self, columns: &[Column]) -> Result<usize, ValueError>;
}

impl ColumnRef for usize {
    fn resolve(&self, columns: &[Column]) -> Result<usize, ValueError> {
        if *self < columns.len() {
            Ok(*self)
        } else {
            Err(ValueError::ColumnIndex {
                index: *self,
                count: columns.len(),
            })
        }
    }
}

impl ColumnRef for &str {
    fn resolve(&self, columns: &[Column]) -> Result<usize, ValueError> {
        columns
            .iter()
            .position(|c| c.name == *self)
            .ok_or_else(|| ValueError::ColumnName(self.to_string()))
    }
}

impl ColumnRef for String {
    fn resolve(&self, columns: &[Column]) -> Result<usize, ValueError> {
        self.as_str().resolve(columns)
    }
}
