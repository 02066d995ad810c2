//! Heap ownership and byte accounting.
//!
//! The VM owns every object it ever allocates: the heap keeps a central
//! list of reference-counted handles and drops the whole list at teardown.
//! There is no garbage collection; nothing is freed before then.
//!
//! Every allocation and release moves a byte counter, and teardown checks
//! that the counter lands back on zero.

use std::mem;
use std::rc::Rc;

use crate::chunk::Chunk;
use crate::object::{Obj, ObjFunction, ObjString};
use crate::table::Table;
use crate::value::Value;

/// FNV-1a over a byte slice.
pub fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash = 2166136261u32;
    for byte in bytes {
        hash = (hash ^ u32::from(*byte)).wrapping_mul(16777619);
    }
    hash
}

// Sizes must be stable between allocation and release; objects are immutable
// once registered, so measuring lengths (not capacities) guarantees that.
fn object_size(obj: &Obj) -> usize {
    mem::size_of::<Obj>()
        + match obj {
            Obj::Str(s) => s.chars.len() + 1,
            Obj::Function(f) => chunk_size(&f.chunk),
        }
}

fn chunk_size(chunk: &Chunk) -> usize {
    chunk.bytes.len()
        + chunk.lines.len() * mem::size_of::<u32>()
        + chunk.constants.len() * mem::size_of::<Value>()
}

/// Owner of all heap objects, the string intern pool, and the byte counter.
#[derive(Debug, Default)]
pub struct Heap {
    objects: Vec<Rc<Obj>>,
    strings: Table,
    bytes_used: usize,
}

impl Heap {
    pub fn new() -> Heap {
        Heap::default()
    }

    /// Bytes currently accounted to live objects.
    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    /// Number of live objects on the heap.
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    fn register(&mut self, obj: Obj) -> Rc<Obj> {
        let size = object_size(&obj);
        self.bytes_used += size;
        tracing::trace!(target: "mscript::mem", "allocated {} bytes", size);
        let obj = Rc::new(obj);
        self.objects.push(obj.clone());
        obj
    }

    /// Canonical allocation of a string: returns the already-interned object
    /// when one with equal content exists.
    pub fn intern(&mut self, text: &str) -> Rc<Obj> {
        let hash = fnv1a(text.as_bytes());
        if let Some(interned) = self.strings.find_string(text, hash) {
            return interned;
        }
        let obj = self.register(Obj::Str(ObjString {
            chars: text.into(),
            hash,
        }));
        self.strings.set(Value::Obj(obj.clone()), Value::Num(1.0));
        obj
    }

    /// Intern a string the caller already built, dropping the buffer when
    /// the content was interned before.
    pub fn take_string(&mut self, text: String) -> Rc<Obj> {
        let hash = fnv1a(text.as_bytes());
        if let Some(interned) = self.strings.find_string(&text, hash) {
            return interned;
        }
        let obj = self.register(Obj::Str(ObjString {
            chars: text.into_boxed_str(),
            hash,
        }));
        self.strings.set(Value::Obj(obj.clone()), Value::Num(1.0));
        obj
    }

    /// Register a finished function as a heap object.
    pub fn alloc_function(&mut self, function: ObjFunction) -> Rc<Obj> {
        self.register(Obj::Function(function))
    }

    /// Release every object and return the byte counter to zero.
    pub fn release_all(&mut self) {
        tracing::debug!(target: "mscript::mem", "freeing all objects");
        for obj in self.objects.drain(..) {
            self.bytes_used -= object_size(&obj);
        }
        self.strings = Table::new();
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        self.release_all();
        debug_assert_eq!(self.bytes_used, 0, "interpreter leaked memory");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    #[test]
    fn test_intern_returns_identical_references() {
        let mut heap = Heap::new();
        let a = heap.intern("hello");
        let b = heap.intern("hello");
        assert!(Rc::ptr_eq(&a, &b));
        assert_eq!(heap.object_count(), 1);

        let c = heap.intern("world");
        assert!(!Rc::ptr_eq(&a, &c));
        assert_eq!(heap.object_count(), 2);
    }

    #[test]
    fn test_take_string_interns() {
        let mut heap = Heap::new();
        let a = heap.intern("shared");
        let b = heap.take_string(String::from("shared"));
        assert!(Rc::ptr_eq(&a, &b));
        assert_eq!(heap.object_count(), 1);
    }

    #[test]
    fn test_byte_accounting_returns_to_zero() {
        let mut heap = Heap::new();
        assert_eq!(heap.bytes_used(), 0);

        heap.intern("some text");
        let mut function = ObjFunction::new();
        function.chunk.write(0, 1);
        function.chunk.add_constant(Value::Num(1.0));
        heap.alloc_function(function);
        assert!(heap.bytes_used() > 0);

        heap.release_all();
        assert_eq!(heap.bytes_used(), 0);
        assert_eq!(heap.object_count(), 0);
    }

    #[test]
    fn test_fnv1a_known_values() {
        // reference vectors for 32-bit FNV-1a
        assert_eq!(fnv1a(b""), 2166136261);
        assert_eq!(fnv1a(b"a"), 0xe40c292c);
        assert_eq!(fnv1a(b"foobar"), 0xbf9cf968);
    }
}
