//! Values the language talks about.
//!
//! A value is a tagged union: a number, the distinct `null` unit, or a
//! reference to a heap object. Booleans are numbers (true = 1, false = 0),
//! which is what lets the boolean operators carry fuzzy-logic weights
//! through arithmetic.

use std::fmt;
use std::rc::Rc;

use crate::object::Obj;

/// A runtime value.
///
/// Cloning is cheap: numbers and null are `Copy`-shaped, objects clone an
/// `Rc` handle.
#[derive(Debug, Clone)]
pub enum Value {
    /// A double-precision number; also the representation of booleans.
    Num(f64),
    /// The unit value.
    Null,
    /// A reference to a heap object owned by the [`Heap`](crate::Heap).
    Obj(Rc<Obj>),
}

impl Value {
    /// True when both values carry the same tag.
    pub fn same_type(&self, other: &Value) -> bool {
        matches!(
            (self, other),
            (Value::Num(_), Value::Num(_))
                | (Value::Null, Value::Null)
                | (Value::Obj(_), Value::Obj(_))
        )
    }

    /// The value's truth weight as a number.
    ///
    /// Numbers are their own weight, null is 0, strings weigh 1 when
    /// non-empty, functions are always truthy.
    pub fn bool_value(&self) -> f64 {
        match self {
            Value::Num(n) => *n,
            Value::Null => 0.0,
            Value::Obj(obj) => obj.bool_value(),
        }
    }

    /// The number payload, when this is a number.
    pub fn as_num(&self) -> Option<f64> {
        match self {
            Value::Num(n) => Some(*n),
            _ => None,
        }
    }

    /// The object payload, when this is an object reference.
    pub fn as_obj(&self) -> Option<&Rc<Obj>> {
        match self {
            Value::Obj(obj) => Some(obj),
            _ => None,
        }
    }
}

/// Structural equality over tags; object references compare by identity.
/// String interning makes identity equivalent to content equality for
/// strings, so no deep comparison is ever needed.
impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Num(a), Value::Num(b)) => a == b,
            (Value::Null, Value::Null) => true,
            (Value::Obj(a), Value::Obj(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Num(n) => write!(f, "{}", n),
            Value::Null => write!(f, "null"),
            Value::Obj(obj) => write!(f, "{}", obj),
        }
    }
}
