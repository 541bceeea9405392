//! Binary encode/decode of values and segments.

use tern_error::{Result, TernError};

use crate::primitives::{read_varint, read_varuint, write_varint, write_varuint};
use crate::symtab::{Symbol, SymbolTable};
use crate::value::Value;
use crate::BVM;

const TAG_NULL: u8 = 0x00;
const TAG_MISSING: u8 = 0x01;
const TAG_FALSE: u8 = 0x02;
const TAG_TRUE: u8 = 0x03;
const TAG_INT: u8 = 0x04;
const TAG_UINT: u8 = 0x05;
const TAG_FLOAT: u8 = 0x06;
const TAG_TIMESTAMP: u8 = 0x07;
const TAG_STRING: u8 = 0x08;
const TAG_BYTES: u8 = 0x09;
const TAG_LIST: u8 = 0x0A;
const TAG_STRUCT: u8 = 0x0B;

/// Write the BVM and the symbol table for a segment.
///
/// The header must describe every symbol used by the values that follow it,
/// so values are typically encoded into a scratch buffer first while the
/// table is still being populated.
pub fn write_segment_header(buf: &mut Vec<u8>, st: &SymbolTable) {
    buf.extend_from_slice(&BVM);
    write_varuint(buf, st.len() as u64);
    for name in st.names() {
        write_varuint(buf, name.len() as u64);
        buf.extend_from_slice(name.as_bytes());
    }
}

/// Read a segment header, returning the symbol table and bytes consumed.
pub fn read_segment_header(buf: &[u8]) -> Result<(SymbolTable, usize)> {
    if buf.len() < BVM.len() || buf[..BVM.len()] != BVM {
        return Err(TernError::new("missing binary version marker"));
    }
    let mut pos = BVM.len();
    let (count, n) = read_varuint(&buf[pos..])?;
    pos += n;
    let mut st = SymbolTable::new();
    for _ in 0..count {
        let (len, n) = read_varuint(&buf[pos..])?;
        pos += n;
        let len = len as usize;
        let end = pos
            .checked_add(len)
            .filter(|&e| e <= buf.len())
            .ok_or_else(|| TernError::new("truncated symbol table"))?;
        let name = std::str::from_utf8(&buf[pos..end])
            .map_err(|_| TernError::new("symbol name is not utf-8"))?;
        st.intern(name);
        pos = end;
    }
    Ok((st, pos))
}

/// Encode one value, interning any struct field names into `st`.
pub fn encode_value(buf: &mut Vec<u8>, st: &mut SymbolTable, v: &Value) {
    match v {
        Value::Null => buf.push(TAG_NULL),
        Value::Missing => buf.push(TAG_MISSING),
        Value::Bool(false) => buf.push(TAG_FALSE),
        Value::Bool(true) => buf.push(TAG_TRUE),
        Value::Int(i) => {
            buf.push(TAG_INT);
            write_varint(buf, *i);
        }
        Value::Uint(u) => {
            buf.push(TAG_UINT);
            write_varuint(buf, *u);
        }
        Value::Float(f) => {
            buf.push(TAG_FLOAT);
            buf.extend_from_slice(&f.to_le_bytes());
        }
        Value::Timestamp(ts) => {
            buf.push(TAG_TIMESTAMP);
            write_varint(buf, ts.timestamp_micros());
        }
        Value::String(s) => {
            buf.push(TAG_STRING);
            write_varuint(buf, s.len() as u64);
            buf.extend_from_slice(s.as_bytes());
        }
        Value::Bytes(b) => {
            buf.push(TAG_BYTES);
            write_varuint(buf, b.len() as u64);
            buf.extend_from_slice(b);
        }
        Value::List(items) => {
            buf.push(TAG_LIST);
            write_varuint(buf, items.len() as u64);
            for item in items {
                encode_value(buf, st, item);
            }
        }
        Value::Struct(fields) => {
            buf.push(TAG_STRUCT);
            write_varuint(buf, fields.len() as u64);
            for (name, value) in fields {
                let sym = st.intern(name);
                write_varuint(buf, u64::from(sym.0));
                encode_value(buf, st, value);
            }
        }
    }
}

/// Streaming decoder over the value portion of one segment.
#[derive(Debug)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
    st: &'a SymbolTable,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8], st: &'a SymbolTable) -> Self {
        Decoder { buf, pos: 0, st }
    }

    pub fn done(&self) -> bool {
        self.pos >= self.buf.len()
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    fn byte(&mut self) -> Result<u8> {
        let b = self
            .buf
            .get(self.pos)
            .copied()
            .ok_or_else(|| TernError::new("truncated value"))?;
        self.pos += 1;
        Ok(b)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&e| e <= self.buf.len())
            .ok_or_else(|| TernError::new("truncated value"))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn varuint(&mut self) -> Result<u64> {
        let (v, n) = read_varuint(&self.buf[self.pos..])?;
        self.pos += n;
        Ok(v)
    }

    fn varint(&mut self) -> Result<i64> {
        let (v, n) = read_varint(&self.buf[self.pos..])?;
        self.pos += n;
        Ok(v)
    }

    pub fn value(&mut self) -> Result<Value> {
        let tag = self.byte()?;
        Ok(match tag {
            TAG_NULL => Value::Null,
            TAG_MISSING => Value::Missing,
            TAG_FALSE => Value::Bool(false),
            TAG_TRUE => Value::Bool(true),
            TAG_INT => Value::Int(self.varint()?),
            TAG_UINT => Value::Uint(self.varuint()?),
            TAG_FLOAT => {
                let raw = self.take(8)?;
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(raw);
                Value::Float(f64::from_le_bytes(bytes))
            }
            TAG_TIMESTAMP => {
                let micros = self.varint()?;
                let ts = chrono::DateTime::from_timestamp_micros(micros)
                    .ok_or_else(|| TernError::new("timestamp out of range"))?;
                Value::Timestamp(ts)
            }
            TAG_STRING => {
                let len = self.varuint()? as usize;
                let raw = self.take(len)?;
                let s = std::str::from_utf8(raw)
                    .map_err(|_| TernError::new("string is not utf-8"))?;
                Value::String(s.to_string())
            }
            TAG_BYTES => {
                let len = self.varuint()? as usize;
                Value::Bytes(self.take(len)?.to_vec())
            }
            TAG_LIST => {
                let count = self.varuint()? as usize;
                let mut items = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    items.push(self.value()?);
                }
                Value::List(items)
            }
            TAG_STRUCT => {
                let count = self.varuint()? as usize;
                let mut fields = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    let sym = Symbol(u32::try_from(self.varuint()?).map_err(|_| {
                        TernError::new("symbol id out of range")
                    })?);
                    let name = self
                        .st
                        .name(sym)
                        .ok_or_else(|| TernError::new("symbol not in table"))?
                        .to_string();
                    fields.push((name, self.value()?));
                }
                Value::Struct(fields)
            }
            other => return Err(TernError::new(format!("unknown value tag {other:#04x}"))),
        })
    }
}

/// Encode a single value as a complete segment.
pub fn encode_document(v: &Value) -> Vec<u8> {
    encode_rows(std::slice::from_ref(v))
}

/// Decode the first value of a segment, returning it and the bytes consumed.
pub fn decode_document(buf: &[u8]) -> Result<(Value, usize)> {
    let (st, header) = read_segment_header(buf)?;
    let mut dec = Decoder::new(&buf[header..], &st);
    let v = dec.value()?;
    Ok((v, header + dec.pos()))
}

/// Encode rows as one segment: BVM, symbol table, values.
pub fn encode_rows(rows: &[Value]) -> Vec<u8> {
    let mut st = SymbolTable::new();
    let mut body = Vec::new();
    for row in rows {
        encode_value(&mut body, &mut st, row);
    }
    let mut out = Vec::with_capacity(body.len() + 64);
    write_segment_header(&mut out, &st);
    out.extend_from_slice(&body);
    out
}

/// Decode every row in `buf`, which may hold several concatenated segments.
///
/// A new BVM is only recognized at a value boundary, so payload bytes that
/// happen to contain the marker sequence do not split the stream.
pub fn decode_rows(buf: &[u8]) -> Result<Vec<Value>> {
    let mut rows = Vec::new();
    let mut pos = 0;
    let mut st: Option<SymbolTable> = None;
    while pos < buf.len() {
        if buf[pos..].starts_with(&BVM) {
            let (table, n) = read_segment_header(&buf[pos..])?;
            st = Some(table);
            pos += n;
            continue;
        }
        let st = st
            .as_ref()
            .ok_or_else(|| TernError::new("value bytes before first segment header"))?;
        let mut dec = Decoder::new(&buf[pos..], st);
        let v = dec.value()?;
        pos += dec.pos();
        rows.push(v);
    }
    Ok(rows)
}
