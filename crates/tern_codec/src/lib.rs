//! Self-describing binary encoding of typed values.
//!
//! A stream is a sequence of independently decodable segments. Each segment
//! starts with a binary version marker (BVM), followed by a symbol table
//! listing every struct field name the segment uses, followed by zero or more
//! encoded values. Struct fields reference the symbol table by id, so field
//! names are written once per segment regardless of row count.

pub mod primitives;

mod binary;
mod symtab;
mod value;

pub use binary::{
    decode_document, decode_rows, encode_document, encode_rows, read_segment_header,
    write_segment_header, Decoder,
};
pub use symtab::{Symbol, SymbolTable};
pub use value::{compare_total, encode_key, Value};

/// Binary version marker prefixing every encoded segment.
pub const BVM: [u8; 4] = [0xE0, 0x74, 0x6E, 0xEA];
