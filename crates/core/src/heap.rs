//! The managed heap
//!
//! All objects live in a slot vector owned by the heap; an `ObjRef` is a
//! stable index into it. The sweeper vacates dead slots onto a free list
//! and the allocator recycles them, which plays the role of the classic
//! intrusive all-objects list. The string intern table is owned here too:
//! it holds weak entries that the sweeper prunes before freeing slots, so
//! table keys never dangle.
//!
//! Collection is stop-the-world mark-sweep with an explicit gray worklist
//! (no marking recursion, so reference cycles are fine). The heap itself
//! never decides to collect: the VM polls `should_collect` at allocation
//! safepoints, marks its roots, then runs `trace_references` and `sweep`.

use tracing::{debug, trace};

use crate::object::{Obj, ObjString, ObjUpvalue};
use crate::table::{StringKey, Table};
use crate::value::Value;

/// Collection is first considered once a megabyte is live.
const INITIAL_GC_THRESHOLD: usize = 1024 * 1024;
const HEAP_GROW_FACTOR: usize = 2;

/// Handle to a heap object. Identity (`==`) is object identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef(u32);

impl ObjRef {
    pub(crate) fn from_raw(raw: u32) -> Self {
        ObjRef(raw)
    }

    fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug)]
struct Slot {
    marked: bool,
    obj: Option<Obj>,
}

/// FNV-1a, 32 bit. Cached on every `ObjString`.
pub fn hash_string(text: &str) -> u32 {
    let mut hash: u32 = 2166136261;
    for byte in text.bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

#[derive(Debug, Default)]
pub struct Heap {
    slots: Vec<Slot>,
    free: Vec<u32>,
    /// Intern set: every live string appears here exactly once. Entries are
    /// weak; the sweeper deletes keys that did not survive marking.
    strings: Table,
    gray: Vec<ObjRef>,
    bytes_allocated: usize,
    next_gc: usize,
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            slots: Vec::new(),
            free: Vec::new(),
            strings: Table::new(),
            gray: Vec::new(),
            bytes_allocated: 0,
            next_gc: INITIAL_GC_THRESHOLD,
        }
    }

    /// Create an object. The new slot starts unmarked; only the sweeper
    /// destroys objects.
    pub fn alloc(&mut self, obj: Obj) -> ObjRef {
        self.bytes_allocated += obj.approximate_size();
        let slot = Slot {
            marked: false,
            obj: Some(obj),
        };
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = slot;
                index
            }
            None => {
                self.slots.push(slot);
                (self.slots.len() - 1) as u32
            }
        };
        trace!(slot = index, bytes = self.bytes_allocated, "alloc");
        ObjRef(index)
    }

    /// Intern `text`, returning the canonical handle for its bytes.
    pub fn intern(&mut self, text: &str) -> ObjRef {
        let hash = hash_string(text);
        if let Some(existing) = self.find_interned(text, hash) {
            return existing;
        }
        let string = self.alloc(Obj::String(ObjString {
            chars: text.into(),
            hash,
        }));
        self.strings.set(StringKey { string, hash }, Value::Nil);
        string
    }

    /// Intern-set lookup by bytes, the primitive consulted before any
    /// string allocation.
    fn find_interned(&self, text: &str, hash: u32) -> Option<ObjRef> {
        self.strings
            .find_key(hash, |string| {
                let interned = self.string(string);
                interned.chars.len() == text.len() && &*interned.chars == text
            })
            .map(|key| key.string)
    }

    /// Key for table operations: the handle plus its cached hash.
    pub fn key(&self, string: ObjRef) -> StringKey {
        StringKey {
            string,
            hash: self.string(string).hash,
        }
    }

    pub fn get(&self, r: ObjRef) -> &Obj {
        match &self.slots[r.index()].obj {
            Some(obj) => obj,
            None => panic!("use of a freed heap slot"),
        }
    }

    pub fn get_mut(&mut self, r: ObjRef) -> &mut Obj {
        match &mut self.slots[r.index()].obj {
            Some(obj) => obj,
            None => panic!("use of a freed heap slot"),
        }
    }

    pub fn string(&self, r: ObjRef) -> &ObjString {
        match self.get(r) {
            Obj::String(s) => s,
            _ => panic!("heap handle does not refer to a string"),
        }
    }

    pub fn function(&self, r: ObjRef) -> &crate::object::ObjFunction {
        match self.get(r) {
            Obj::Function(f) => f,
            _ => panic!("heap handle does not refer to a function"),
        }
    }

    pub fn closure(&self, r: ObjRef) -> &crate::object::ObjClosure {
        match self.get(r) {
            Obj::Closure(c) => c,
            _ => panic!("heap handle does not refer to a closure"),
        }
    }

    pub fn closure_mut(&mut self, r: ObjRef) -> &mut crate::object::ObjClosure {
        match self.get_mut(r) {
            Obj::Closure(c) => c,
            _ => panic!("heap handle does not refer to a closure"),
        }
    }

    pub fn class(&self, r: ObjRef) -> &crate::object::ObjClass {
        match self.get(r) {
            Obj::Class(c) => c,
            _ => panic!("heap handle does not refer to a class"),
        }
    }

    pub fn class_mut(&mut self, r: ObjRef) -> &mut crate::object::ObjClass {
        match self.get_mut(r) {
            Obj::Class(c) => c,
            _ => panic!("heap handle does not refer to a class"),
        }
    }

    pub fn instance(&self, r: ObjRef) -> &crate::object::ObjInstance {
        match self.get(r) {
            Obj::Instance(i) => i,
            _ => panic!("heap handle does not refer to an instance"),
        }
    }

    pub fn instance_mut(&mut self, r: ObjRef) -> &mut crate::object::ObjInstance {
        match self.get_mut(r) {
            Obj::Instance(i) => i,
            _ => panic!("heap handle does not refer to an instance"),
        }
    }

    pub fn array(&self, r: ObjRef) -> &crate::object::ObjArray {
        match self.get(r) {
            Obj::Array(a) => a,
            _ => panic!("heap handle does not refer to an array"),
        }
    }

    pub fn upvalue(&self, r: ObjRef) -> &ObjUpvalue {
        match self.get(r) {
            Obj::Upvalue(u) => u,
            _ => panic!("heap handle does not refer to an upvalue"),
        }
    }

    pub fn upvalue_mut(&mut self, r: ObjRef) -> &mut ObjUpvalue {
        match self.get_mut(r) {
            Obj::Upvalue(u) => u,
            _ => panic!("heap handle does not refer to an upvalue"),
        }
    }

    /// Number of live objects, free slots excluded.
    pub fn object_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.obj.is_some()).count()
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    // ---- collection ----

    /// Whether the VM should run a collection at its next safepoint. Under
    /// the `gc-stress` feature every safepoint collects.
    pub fn should_collect(&self) -> bool {
        cfg!(feature = "gc-stress") || self.bytes_allocated > self.next_gc
    }

    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(r) = value {
            self.mark_object(r);
        }
    }

    pub fn mark_object(&mut self, r: ObjRef) {
        let slot = &mut self.slots[r.index()];
        if slot.marked || slot.obj.is_none() {
            return;
        }
        slot.marked = true;
        self.gray.push(r);
    }

    /// Drain the gray worklist, darkening each object's outgoing
    /// references. Iterative, so arbitrarily deep object graphs and cycles
    /// are safe.
    pub fn trace_references(&mut self) {
        while let Some(r) = self.gray.pop() {
            self.blacken(r);
        }
    }

    fn blacken(&mut self, r: ObjRef) {
        let mut children: Vec<Value> = Vec::new();
        match self.get(r) {
            Obj::String(_) | Obj::Native(_) => {}
            Obj::Function(f) => {
                if let Some(name) = f.name {
                    children.push(Value::Obj(name));
                }
                children.extend_from_slice(&f.chunk.constants);
            }
            Obj::Closure(c) => {
                children.push(Value::Obj(c.function));
                children.extend(c.upvalues.iter().map(|&u| Value::Obj(u)));
            }
            Obj::Upvalue(upvalue) => {
                if let ObjUpvalue::Closed(value) = upvalue {
                    children.push(*value);
                }
            }
            Obj::Class(class) => {
                children.push(Value::Obj(class.name));
                for (key, value) in class.methods.iter() {
                    children.push(Value::Obj(key.string));
                    children.push(value);
                }
            }
            Obj::Instance(instance) => {
                children.push(Value::Obj(instance.class));
                for (key, value) in instance.fields.iter() {
                    children.push(Value::Obj(key.string));
                    children.push(value);
                }
            }
            Obj::BoundMethod(bound) => {
                children.push(bound.receiver);
                children.push(Value::Obj(bound.method));
            }
            Obj::Array(array) => children.extend_from_slice(&array.values),
        }
        for child in children {
            self.mark_value(child);
        }
    }

    /// Free everything the mark phase did not reach. The intern table is
    /// pruned first so no table key outlives its string.
    pub fn sweep(&mut self) {
        let dead_strings: Vec<StringKey> = self
            .strings
            .iter()
            .filter(|(key, _)| !self.slots[key.string.index()].marked)
            .map(|(key, _)| key)
            .collect();
        for key in dead_strings {
            self.strings.delete(key);
        }

        let mut freed = 0usize;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            match &slot.obj {
                Some(obj) if !slot.marked => {
                    self.bytes_allocated = self.bytes_allocated.saturating_sub(obj.approximate_size());
                    slot.obj = None;
                    self.free.push(index as u32);
                    freed += 1;
                }
                _ => slot.marked = false,
            }
        }

        self.next_gc = self.bytes_allocated * HEAP_GROW_FACTOR;
        debug!(
            freed,
            live = self.object_count(),
            bytes = self.bytes_allocated,
            next_gc = self.next_gc,
            "gc sweep complete"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{ObjArray, ObjBoundMethod, ObjClass, ObjClosure, ObjFunction, ObjInstance};

    #[test]
    fn test_intern_returns_canonical_handle() {
        let mut heap = Heap::new();
        let a = heap.intern("salmon");
        let b = heap.intern("salmon");
        assert_eq!(a, b);
        assert_eq!(heap.object_count(), 1);
        let c = heap.intern("trout");
        assert_ne!(a, c);
    }

    #[test]
    fn test_hash_is_fnv1a() {
        // Published FNV-1a test vectors.
        assert_eq!(hash_string(""), 2166136261);
        assert_eq!(hash_string("a"), 0xe40c292c);
        assert_eq!(hash_string("foobar"), 0xbf9cf968);
    }

    #[test]
    fn test_sweep_frees_unreachable_and_prunes_interns() {
        let mut heap = Heap::new();
        let keep = heap.intern("keep");
        let _drop = heap.intern("drop");
        assert_eq!(heap.object_count(), 2);

        heap.mark_object(keep);
        heap.trace_references();
        heap.sweep();

        assert_eq!(heap.object_count(), 1);
        // The surviving string is still interned, the dead one is gone and
        // its bytes can be re-interned into a fresh slot.
        assert_eq!(heap.intern("keep"), keep);
        let revived = heap.intern("drop");
        assert_eq!(heap.object_count(), 2);
        assert_eq!(heap.intern("drop"), revived);
    }

    #[test]
    fn test_marks_reset_after_sweep() {
        let mut heap = Heap::new();
        let s = heap.intern("still here");
        heap.mark_object(s);
        heap.trace_references();
        heap.sweep();
        // A second collection with no roots must now free it.
        heap.trace_references();
        heap.sweep();
        assert_eq!(heap.object_count(), 0);
    }

    #[test]
    fn test_closed_upvalue_keeps_its_value_alive() {
        let mut heap = Heap::new();
        let s = heap.intern("captured");
        let upvalue = heap.alloc(Obj::Upvalue(ObjUpvalue::Closed(Value::Obj(s))));
        heap.mark_object(upvalue);
        heap.trace_references();
        heap.sweep();
        assert_eq!(heap.object_count(), 2);
        assert_eq!(heap.intern("captured"), s);
    }

    #[test]
    fn test_cyclic_graph_terminates_and_survives() {
        let mut heap = Heap::new();
        let name = heap.intern("Cycle");
        let class = heap.alloc(Obj::Class(ObjClass {
            name,
            methods: Table::new(),
        }));
        let instance = heap.alloc(Obj::Instance(ObjInstance {
            class,
            fields: Table::new(),
        }));
        // instance.self = instance
        let field = heap.intern("self");
        let key = heap.key(field);
        match heap.get_mut(instance) {
            Obj::Instance(i) => {
                i.fields.set(key, Value::Obj(instance));
            }
            _ => unreachable!(),
        }

        heap.mark_object(instance);
        heap.trace_references();
        heap.sweep();
        assert_eq!(heap.object_count(), 4);
    }

    #[test]
    fn test_function_constants_are_roots_of_closure() {
        let mut heap = Heap::new();
        let literal = heap.intern("literal");
        let mut function = ObjFunction::new();
        function.chunk.add_constant(Value::Obj(literal));
        let function = heap.alloc(Obj::Function(function));
        let closure = heap.alloc(Obj::Closure(ObjClosure {
            function,
            upvalues: Vec::new(),
        }));
        let receiver = heap.alloc(Obj::Array(ObjArray { values: Vec::new() }));
        let bound = heap.alloc(Obj::BoundMethod(ObjBoundMethod {
            receiver: Value::Obj(receiver),
            method: closure,
        }));

        heap.mark_object(bound);
        heap.trace_references();
        heap.sweep();
        assert_eq!(heap.object_count(), 5);
    }

    #[test]
    fn test_bytes_allocated_shrinks_on_sweep() {
        let mut heap = Heap::new();
        let before = heap.bytes_allocated();
        heap.alloc(Obj::Array(ObjArray {
            values: vec![Value::Nil; 64],
        }));
        assert!(heap.bytes_allocated() > before);
        heap.trace_references();
        heap.sweep();
        assert_eq!(heap.bytes_allocated(), before);
    }
}
