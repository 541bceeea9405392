//! Loose type hints for node output schemas.

use std::fmt;

/// A set of possible value types, used in `(field, typeset)` output hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TypeSet(pub u16);

impl TypeSet {
    pub const MISSING: TypeSet = TypeSet(1 << 0);
    pub const NULL: TypeSet = TypeSet(1 << 1);
    pub const BOOL: TypeSet = TypeSet(1 << 2);
    pub const INTEGER: TypeSet = TypeSet(1 << 3);
    pub const FLOAT: TypeSet = TypeSet(1 << 4);
    pub const STRING: TypeSet = TypeSet(1 << 5);
    pub const TIMESTAMP: TypeSet = TypeSet(1 << 6);
    pub const LIST: TypeSet = TypeSet(1 << 7);
    pub const STRUCT: TypeSet = TypeSet(1 << 8);

    pub const ANY: TypeSet = TypeSet(0x1FF);

    pub fn union(self, other: TypeSet) -> TypeSet {
        TypeSet(self.0 | other.0)
    }

    pub fn contains(self, other: TypeSet) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for TypeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == TypeSet::ANY {
            return write!(f, "any");
        }
        let names = [
            (TypeSet::MISSING, "missing"),
            (TypeSet::NULL, "null"),
            (TypeSet::BOOL, "bool"),
            (TypeSet::INTEGER, "integer"),
            (TypeSet::FLOAT, "float"),
            (TypeSet::STRING, "string"),
            (TypeSet::TIMESTAMP, "timestamp"),
            (TypeSet::LIST, "list"),
            (TypeSet::STRUCT, "struct"),
        ];
        let mut first = true;
        for (bit, name) in names {
            if self.contains(bit) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        if first {
            write!(f, "none")?;
        }
        Ok(())
    }
}

/// One field of a node's result schema.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeHint {
    pub field: String,
    pub types: TypeSet,
}
