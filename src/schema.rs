//! Fixed-width tuple layouts.
//!
//! A [`Schema`] is an ordered list of columns whose byte offsets are the
//! cumulative sums of the preceding widths. Tuples carry no header: a tuple
//! is just `tuple_size()` bytes that only make sense through the schema that
//! wrote them. Numbers are stored little-endian so that hashing the raw key
//! bytes gives the same bucket on every host.
//!
//! Schemas are shared read-only between tables, the engine and its outputs
//! through [`SchemaRef`].

use std::sync::Arc;

use crate::error::{JoinError, Result};
use crate::table::TupleRef;

pub type SchemaRef = Arc<Schema>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ColumnType {
    /// 32-bit signed integer.
    Integer,
    /// 64-bit signed integer.
    Long,
    /// 64-bit float.
    Decimal,
    /// NUL-terminated text of a declared width.
    Char,
    /// Back-reference to a tuple of another table.
    Pointer,
}

impl ColumnType {
    /// Width in bytes for every type except `Char`, whose width is declared.
    pub fn fixed_width(self) -> Option<usize> {
        match self {
            ColumnType::Integer => Some(4),
            ColumnType::Long | ColumnType::Decimal | ColumnType::Pointer => Some(8),
            ColumnType::Char => None,
        }
    }

    /// Types a join key may have.
    pub fn is_join_key(self) -> bool {
        matches!(self, ColumnType::Integer | ColumnType::Long)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ColumnSpec {
    pub ty: ColumnType,
    pub width: usize,
}

impl ColumnSpec {
    pub fn new(ty: ColumnType, width: usize) -> Self {
        let width = ty.fixed_width().unwrap_or(width);
        Self { ty, width }
    }

    /// `char(n)`: `n` characters plus the terminating NUL.
    pub fn char(n: usize) -> Self {
        Self {
            ty: ColumnType::Char,
            width: n + 1,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Schema {
    types: Vec<ColumnType>,
    offsets: Vec<usize>,
    widths: Vec<usize>,
    tuple_size: usize,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a column. `width` is only consulted for `Char`.
    pub fn add(&mut self, ty: ColumnType, width: usize) {
        self.push(ColumnSpec::new(ty, width));
    }

    pub fn push(&mut self, spec: ColumnSpec) {
        assert!(spec.width > 0, "zero-width column");
        self.types.push(spec.ty);
        self.offsets.push(self.tuple_size);
        self.widths.push(spec.width);
        self.tuple_size += spec.width;
    }

    /// Parses the configuration grammar: `int`, `long`, `dec`, `char(N)`,
    /// matched case-insensitively by prefix.
    pub fn from_spec<S: AsRef<str>>(tokens: &[S]) -> Result<Schema> {
        let mut schema = Schema::new();
        for token in tokens {
            let raw = token.as_ref().trim();
            let lower = raw.to_ascii_lowercase();
            if lower.starts_with("int") {
                schema.add(ColumnType::Integer, 0);
            } else if lower.starts_with("long") {
                schema.add(ColumnType::Long, 0);
            } else if lower.starts_with("dec") {
                schema.add(ColumnType::Decimal, 0);
            } else if lower.starts_with("char") {
                let open = lower
                    .find('(')
                    .ok_or_else(|| JoinError::Schema(format!("`{raw}` is missing its width")))?;
                let inner = lower[open + 1..].trim_end_matches(')').trim();
                let n: usize = inner
                    .parse()
                    .map_err(|_| JoinError::Schema(format!("`{raw}` has a malformed width")))?;
                schema.push(ColumnSpec::char(n));
            } else {
                return Err(JoinError::Schema(format!("unknown column type `{raw}`")));
            }
        }
        if schema.columns() == 0 {
            return Err(JoinError::Schema("schema has no columns".into()));
        }
        Ok(schema)
    }

    /// A schema made of the listed columns of `self`, in order.
    pub fn project(&self, cols: &[usize]) -> Schema {
        let mut out = Schema::new();
        for &c in cols {
            out.push(self.get(c));
        }
        out
    }

    pub fn into_ref(self) -> SchemaRef {
        Arc::new(self)
    }

    pub fn columns(&self) -> usize {
        self.types.len()
    }

    pub fn get(&self, pos: usize) -> ColumnSpec {
        ColumnSpec {
            ty: self.types[pos],
            width: self.widths[pos],
        }
    }

    pub fn column_type(&self, pos: usize) -> ColumnType {
        self.types[pos]
    }

    pub fn width(&self, pos: usize) -> usize {
        self.widths[pos]
    }

    pub fn offset(&self, pos: usize) -> usize {
        self.offsets[pos]
    }

    #[inline(always)]
    pub fn tuple_size(&self) -> usize {
        self.tuple_size
    }

    #[inline(always)]
    pub fn field<'t>(&self, tuple: &'t [u8], pos: usize) -> &'t [u8] {
        let off = self.offsets[pos];
        &tuple[off..off + self.widths[pos]]
    }

    #[inline(always)]
    pub fn field_mut<'t>(&self, tuple: &'t mut [u8], pos: usize) -> &'t mut [u8] {
        let off = self.offsets[pos];
        &mut tuple[off..off + self.widths[pos]]
    }

    #[inline(always)]
    pub fn as_int(&self, tuple: &[u8], pos: usize) -> i32 {
        debug_assert_eq!(self.types[pos], ColumnType::Integer);
        i32::from_le_bytes(fixed(self.field(tuple, pos)))
    }

    #[inline(always)]
    pub fn as_long(&self, tuple: &[u8], pos: usize) -> i64 {
        debug_assert_eq!(self.types[pos], ColumnType::Long);
        i64::from_le_bytes(fixed(self.field(tuple, pos)))
    }

    #[inline(always)]
    pub fn as_double(&self, tuple: &[u8], pos: usize) -> f64 {
        debug_assert_eq!(self.types[pos], ColumnType::Decimal);
        f64::from_le_bytes(fixed(self.field(tuple, pos)))
    }

    #[inline(always)]
    pub fn as_pointer(&self, tuple: &[u8], pos: usize) -> TupleRef {
        debug_assert_eq!(self.types[pos], ColumnType::Pointer);
        TupleRef::unpack(u64::from_le_bytes(fixed(self.field(tuple, pos))))
    }

    /// Join-key value of an INTEGER or LONG column, widened to `i64`.
    #[inline(always)]
    pub fn as_key(&self, tuple: &[u8], pos: usize) -> i64 {
        match self.types[pos] {
            ColumnType::Integer => self.as_int(tuple, pos) as i64,
            _ => self.as_long(tuple, pos),
        }
    }

    /// Text of a CHAR column up to its NUL terminator.
    pub fn as_str<'t>(&self, tuple: &'t [u8], pos: usize) -> &'t str {
        let raw = self.field(tuple, pos);
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        match std::str::from_utf8(&raw[..end]) {
            Ok(s) => s,
            Err(e) => std::str::from_utf8(&raw[..e.valid_up_to()]).unwrap_or_default(),
        }
    }

    /// Copies `src` into column `pos` of `dest`, zero-filling any remainder.
    #[inline(always)]
    pub fn write_data(&self, dest: &mut [u8], pos: usize, src: &[u8]) {
        let field = self.field_mut(dest, pos);
        let n = src.len().min(field.len());
        field[..n].copy_from_slice(&src[..n]);
        field[n..].fill(0);
    }

    pub fn write_int(&self, dest: &mut [u8], pos: usize, v: i32) {
        self.write_data(dest, pos, &v.to_le_bytes());
    }

    pub fn write_long(&self, dest: &mut [u8], pos: usize, v: i64) {
        self.write_data(dest, pos, &v.to_le_bytes());
    }

    pub fn write_double(&self, dest: &mut [u8], pos: usize, v: f64) {
        self.write_data(dest, pos, &v.to_le_bytes());
    }

    pub fn write_pointer(&self, dest: &mut [u8], pos: usize, r: TupleRef) {
        self.write_data(dest, pos, &r.pack().to_le_bytes());
    }

    /// Writes text into a CHAR column, truncating to keep the terminator.
    pub fn write_str(&self, dest: &mut [u8], pos: usize, s: &str) {
        let bytes = s.as_bytes();
        let n = bytes.len().min(self.widths[pos] - 1);
        self.write_data(dest, pos, &bytes[..n]);
    }

    #[inline(always)]
    pub fn copy_tuple(&self, dest: &mut [u8], src: &[u8]) {
        dest[..self.tuple_size].copy_from_slice(&src[..self.tuple_size]);
    }

    /// Fills `dest` from one text field per column.
    pub fn parse_tuple<S: AsRef<str>>(&self, dest: &mut [u8], input: &[S]) -> Result<()> {
        if input.len() != self.columns() {
            return Err(parse_error(format!(
                "expected {} fields, found {}",
                self.columns(),
                input.len()
            )));
        }
        for (pos, text) in input.iter().enumerate() {
            let text = text.as_ref();
            match self.types[pos] {
                ColumnType::Integer => {
                    let v = text.trim().parse::<i32>().map_err(|e| bad_field(pos, text, e))?;
                    self.write_int(dest, pos, v);
                }
                ColumnType::Long => {
                    let v = text.trim().parse::<i64>().map_err(|e| bad_field(pos, text, e))?;
                    self.write_long(dest, pos, v);
                }
                ColumnType::Decimal => {
                    let v = text.trim().parse::<f64>().map_err(|e| bad_field(pos, text, e))?;
                    self.write_double(dest, pos, v);
                }
                ColumnType::Char => self.write_str(dest, pos, text),
                ColumnType::Pointer => {
                    return Err(JoinError::NotImplemented(
                        "pointer columns cannot be parsed from text".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Renders every column as text. Decimals keep two fractional digits.
    pub fn output_tuple(&self, tuple: &[u8]) -> Vec<String> {
        (0..self.columns())
            .map(|pos| match self.types[pos] {
                ColumnType::Integer => self.as_int(tuple, pos).to_string(),
                ColumnType::Long => self.as_long(tuple, pos).to_string(),
                ColumnType::Decimal => format!("{:.2}", self.as_double(tuple, pos)),
                ColumnType::Char => self.as_str(tuple, pos).to_string(),
                ColumnType::Pointer => self.as_pointer(tuple, pos).to_string(),
            })
            .collect()
    }

    pub fn pretty_print(&self, tuple: &[u8], sep: char) -> String {
        let mut sep_buf = [0u8; 4];
        let sep: &str = sep.encode_utf8(&mut sep_buf);
        self.output_tuple(tuple).join(sep)
    }
}

#[inline(always)]
fn fixed<const N: usize>(field: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&field[..N]);
    out
}

fn parse_error(reason: String) -> JoinError {
    JoinError::Parse { line: 0, reason }
}

fn bad_field(pos: usize, text: &str, e: impl std::fmt::Display) -> JoinError {
    parse_error(format!("column {}: `{text}`: {e}", pos + 1))
}
