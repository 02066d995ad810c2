//! Heap objects: interned strings and compiled functions.

use std::fmt;

use crate::chunk::Chunk;

/// A heap object. Every instance is owned by the [`Heap`](crate::Heap) that
/// allocated it and lives until the heap is torn down.
#[derive(Debug)]
pub enum Obj {
    Str(ObjString),
    Function(ObjFunction),
}

impl Obj {
    /// The string payload, when this is a string.
    pub fn as_str(&self) -> Option<&ObjString> {
        match self {
            Obj::Str(s) => Some(s),
            _ => None,
        }
    }

    /// The function payload, when this is a function.
    pub fn as_function(&self) -> Option<&ObjFunction> {
        match self {
            Obj::Function(f) => Some(f),
            _ => None,
        }
    }

    /// Truth weight of an object: strings weigh by non-emptiness, functions
    /// are always truthy.
    pub fn bool_value(&self) -> f64 {
        match self {
            Obj::Str(s) => {
                if s.chars.is_empty() {
                    0.0
                } else {
                    1.0
                }
            }
            Obj::Function(_) => 1.0,
        }
    }
}

impl fmt::Display for Obj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Obj::Str(s) => write!(f, "{}", s.as_str()),
            Obj::Function(_) => write!(f, "FUNCTION"),
        }
    }
}

/// An immutable string with its FNV-1a hash cached for table lookups.
///
/// Invariant: interned. Any two `ObjString`s with equal content are the same
/// heap object, so callers may compare by reference.
#[derive(Debug)]
pub struct ObjString {
    pub chars: Box<str>,
    pub hash: u32,
}

impl ObjString {
    pub fn as_str(&self) -> &str {
        &self.chars
    }
}

/// A compiled function: an argument count and the bytecode it runs.
///
/// The compiler builds one of these for the top-level script (arity 0) and
/// for each `function ... end function` form it encounters.
#[derive(Debug, Default)]
pub struct ObjFunction {
    pub arity: u8,
    pub chunk: Chunk,
}

impl ObjFunction {
    pub fn new() -> ObjFunction {
        ObjFunction {
            arity: 0,
            chunk: Chunk::new(),
        }
    }
}
