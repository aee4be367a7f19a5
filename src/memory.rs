// File: src/memory.rs
//
// The memory manager: a precise, non-moving, tri-color mark-sweep
// collector. Objects live in a slab (`Heap::slots`)
// addressed by stable `ObjRef` indices, so "non-moving" falls out of the
// representation for free rather than requiring raw pointers — indices
// are never reused while the object they name is still reachable, and a
// freed slot's index only becomes available again once the sweep that
// freed it has run.
//
// `reallocate`'s role in the original design — "collect before growing,
// if past the threshold" — is played here by `Heap::note_allocation`,
// called by every `alloc_*` constructor before the new slot is written.

use crate::object::{
    BoundMethodObj, ClassObj, ClosureObj, FunctionObj, InstanceObj, NativeObj, ObjKind, ObjRef,
    StringObj, UpvalueLocation, UpvalueObj,
};
use crate::table::Table;
use crate::value::Value;

const HEAP_GROW_FACTOR: usize = 2;
const INITIAL_NEXT_GC: usize = 1024 * 1024;

struct HeapCell {
    marked: bool,
    kind: ObjKind,
}

pub struct Heap {
    slots: Vec<Option<HeapCell>>,
    free_list: Vec<u32>,
    /// Weak set of interned strings: ObjRef -> (). Not a GC root (§4.3 step 1).
    strings: Table<()>,
    bytes_allocated: usize,
    next_gc: usize,
    pub stress_gc: bool,
    /// Diagnostics: how many collections have run, and bytes reclaimed
    /// by the most recent one. Exposed for the `profiler`-style test and
    /// the `--gc-stats` CLI flag.
    pub collections_run: usize,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            slots: Vec::new(),
            free_list: Vec::new(),
            strings: Table::new(),
            bytes_allocated: 0,
            next_gc: INITIAL_NEXT_GC,
            stress_gc: false,
            collections_run: 0,
        }
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn object_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn should_collect(&self) -> bool {
        self.stress_gc || self.bytes_allocated >= self.next_gc
    }

    fn approx_size(kind: &ObjKind) -> usize {
        let base = std::mem::size_of::<HeapCell>();
        base + match kind {
            ObjKind::String(s) => s.bytes.len(),
            ObjKind::Function(f) => f.chunk.code.len() + f.chunk.constants.len() * 16,
            ObjKind::Native(_) => 0,
            ObjKind::Upvalue(_) => 0,
            ObjKind::Closure(c) => c.upvalues.len() * 4,
            ObjKind::Class(_) => 0,
            ObjKind::Instance(_) => 0,
            ObjKind::BoundMethod(_) => 0,
        }
    }

    /// Inserts `kind` into the first free slot (or a fresh one), updating
    /// the allocation counters. Collection, if warranted, must already
    /// have happened — callers go through `Vm::maybe_collect` first so
    /// every other still-live object is reachable from a root when this
    /// runs.
    fn insert(&mut self, kind: ObjKind) -> ObjRef {
        self.bytes_allocated += Self::approx_size(&kind);
        let cell = HeapCell { marked: false, kind };
        if let Some(index) = self.free_list.pop() {
            self.slots[index as usize] = Some(cell);
            ObjRef(index)
        } else {
            self.slots.push(Some(cell));
            ObjRef((self.slots.len() - 1) as u32)
        }
    }

    pub fn alloc_string_raw(&mut self, bytes: Vec<u8>, hash: u32) -> ObjRef {
        let r = self.insert(ObjKind::String(StringObj { hash, bytes }));
        self.strings.set(r, hash, ());
        r
    }

    /// Interns `bytes`, returning the existing String object if content
    /// already matches one, allocating a new one otherwise. This is the
    /// entry point natives and the VM's string concatenation use; the
    /// compiler additionally needs GC-safepoint cooperation around the
    /// call (see `Vm::alloc_string`), which only it can provide since it
    /// alone knows about the value-stack root.
    pub fn intern(&mut self, bytes: &[u8]) -> ObjRef {
        let hash = crate::object::fnv1a_hash(bytes);
        if let Some(existing) = self.find_interned(hash, bytes) {
            return existing;
        }
        self.alloc_string_raw(bytes.to_vec(), hash)
    }

    pub fn alloc_function(&mut self, f: FunctionObj) -> ObjRef {
        self.insert(ObjKind::Function(f))
    }

    pub fn alloc_native(&mut self, n: NativeObj) -> ObjRef {
        self.insert(ObjKind::Native(n))
    }

    pub fn alloc_upvalue(&mut self, stack_index: usize) -> ObjRef {
        self.insert(ObjKind::Upvalue(UpvalueObj {
            location: UpvalueLocation::Stack(stack_index),
            closed: Value::Nil,
            next: None,
        }))
    }

    pub fn alloc_closure(&mut self, c: ClosureObj) -> ObjRef {
        self.insert(ObjKind::Closure(c))
    }

    pub fn alloc_class(&mut self, c: ClassObj) -> ObjRef {
        self.insert(ObjKind::Class(c))
    }

    pub fn alloc_instance(&mut self, i: InstanceObj) -> ObjRef {
        self.insert(ObjKind::Instance(i))
    }

    pub fn alloc_bound_method(&mut self, b: BoundMethodObj) -> ObjRef {
        self.insert(ObjKind::BoundMethod(b))
    }

    pub fn find_interned(&self, hash: u32, bytes: &[u8]) -> Option<ObjRef> {
        self.strings.find_by_hash(hash, |r| self.get_string(r).bytes == bytes)
    }

    pub fn get(&self, r: ObjRef) -> &ObjKind {
        &self.slots[r.index()].as_ref().expect("dangling ObjRef").kind
    }

    pub fn get_mut(&mut self, r: ObjRef) -> &mut ObjKind {
        &mut self.slots[r.index()].as_mut().expect("dangling ObjRef").kind
    }

    pub fn get_string(&self, r: ObjRef) -> &StringObj {
        match self.get(r) {
            ObjKind::String(s) => s,
            other => panic!("expected string, found {}", other.type_name()),
        }
    }

    pub fn get_function(&self, r: ObjRef) -> &FunctionObj {
        match self.get(r) {
            ObjKind::Function(f) => f,
            other => panic!("expected function, found {}", other.type_name()),
        }
    }

    pub fn get_function_mut(&mut self, r: ObjRef) -> &mut FunctionObj {
        match self.get_mut(r) {
            ObjKind::Function(f) => f,
            other => panic!("expected function, found {}", other.type_name()),
        }
    }

    pub fn get_closure(&self, r: ObjRef) -> &ClosureObj {
        match self.get(r) {
            ObjKind::Closure(c) => c,
            other => panic!("expected closure, found {}", other.type_name()),
        }
    }

    pub fn get_upvalue(&self, r: ObjRef) -> &UpvalueObj {
        match self.get(r) {
            ObjKind::Upvalue(u) => u,
            other => panic!("expected upvalue, found {}", other.type_name()),
        }
    }

    pub fn get_upvalue_mut(&mut self, r: ObjRef) -> &mut UpvalueObj {
        match self.get_mut(r) {
            ObjKind::Upvalue(u) => u,
            other => panic!("expected upvalue, found {}", other.type_name()),
        }
    }

    pub fn get_class(&self, r: ObjRef) -> &ClassObj {
        match self.get(r) {
            ObjKind::Class(c) => c,
            other => panic!("expected class, found {}", other.type_name()),
        }
    }

    pub fn get_class_mut(&mut self, r: ObjRef) -> &mut ClassObj {
        match self.get_mut(r) {
            ObjKind::Class(c) => c,
            other => panic!("expected class, found {}", other.type_name()),
        }
    }

    pub fn get_instance(&self, r: ObjRef) -> &InstanceObj {
        match self.get(r) {
            ObjKind::Instance(i) => i,
            other => panic!("expected instance, found {}", other.type_name()),
        }
    }

    pub fn get_instance_mut(&mut self, r: ObjRef) -> &mut InstanceObj {
        match self.get_mut(r) {
            ObjKind::Instance(i) => i,
            other => panic!("expected instance, found {}", other.type_name()),
        }
    }

    // ---- Mark phase -----------------------------------------------------

    pub fn mark_value(&mut self, value: &Value, gray: &mut Vec<ObjRef>) {
        if let Value::Obj(r) = value {
            self.mark_object(*r, gray);
        }
    }

    pub fn mark_object(&mut self, r: ObjRef, gray: &mut Vec<ObjRef>) {
        if let Some(cell) = self.slots[r.index()].as_mut() {
            if !cell.marked {
                cell.marked = true;
                gray.push(r);
            }
        }
    }

    /// Blackens one gray object: marks everything it directly references.
    fn blacken(&mut self, r: ObjRef, gray: &mut Vec<ObjRef>) {
        // Take the outgoing-reference list first so we don't hold a
        // borrow of `self` while recursively marking through it.
        enum Refs {
            None,
            One(ObjRef),
            FunctionRefs { name: Option<ObjRef>, consts: Vec<Value> },
            ClosureRefs { function: ObjRef, upvalues: Vec<ObjRef> },
            UpvalueRef(Value),
            ClassRefs { name: ObjRef, methods: Vec<ObjRef> },
            InstanceRefs { class: ObjRef, fields: Vec<Value> },
            BoundMethodRefs { receiver: Value, method: ObjRef },
        }

        let refs = match self.get(r) {
            ObjKind::String(_) | ObjKind::Native(_) => Refs::None,
            ObjKind::Function(f) => Refs::FunctionRefs {
                name: f.name,
                consts: f.chunk.constants.clone(),
            },
            ObjKind::Closure(c) => {
                Refs::ClosureRefs { function: c.function, upvalues: c.upvalues.clone() }
            }
            ObjKind::Upvalue(u) => Refs::UpvalueRef(u.closed),
            ObjKind::Class(c) => Refs::ClassRefs {
                name: c.name,
                methods: c.methods.iter().map(|(_, v)| *v).collect(),
            },
            ObjKind::Instance(i) => Refs::InstanceRefs {
                class: i.class,
                fields: i.fields.iter().map(|(_, v)| *v).collect(),
            },
            ObjKind::BoundMethod(b) => {
                Refs::BoundMethodRefs { receiver: b.receiver, method: b.method }
            }
        };

        match refs {
            Refs::None => {}
            Refs::One(o) => self.mark_object(o, gray),
            Refs::FunctionRefs { name, consts } => {
                if let Some(n) = name {
                    self.mark_object(n, gray);
                }
                for c in &consts {
                    self.mark_value(c, gray);
                }
            }
            Refs::ClosureRefs { function, upvalues } => {
                self.mark_object(function, gray);
                for u in upvalues {
                    self.mark_object(u, gray);
                }
            }
            Refs::UpvalueRef(v) => self.mark_value(&v, gray),
            Refs::ClassRefs { name, methods } => {
                self.mark_object(name, gray);
                for m in methods {
                    self.mark_object(m, gray);
                }
            }
            Refs::InstanceRefs { class, fields } => {
                self.mark_object(class, gray);
                for f in fields {
                    self.mark_value(&f, gray);
                }
            }
            Refs::BoundMethodRefs { receiver, method } => {
                self.mark_value(&receiver, gray);
                self.mark_object(method, gray);
            }
        }
    }

    /// Runs a full collection. `mark_roots` is responsible for marking
    /// every root external to the heap (VM stack, call frames, globals,
    /// open upvalues, the in-progress compiler chain) by calling back
    /// into `mark_value`/`mark_object`.
    pub fn collect_garbage(&mut self, mark_roots: impl FnOnce(&mut Heap, &mut Vec<ObjRef>)) {
        let mut gray = Vec::new();
        mark_roots(self, &mut gray);
        while let Some(r) = gray.pop() {
            self.blacken(r, &mut gray);
        }

        // Weak-sweep the intern table before the real sweep frees the
        // strings it would otherwise keep referring to.
        let marked = |r: ObjRef| self.slots[r.index()].as_ref().map(|c| c.marked).unwrap_or(false);
        self.strings.retain_marked(marked);

        let before = self.bytes_allocated;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            match slot {
                Some(cell) if cell.marked => cell.marked = false,
                Some(cell) => {
                    self.bytes_allocated = self.bytes_allocated.saturating_sub(Self::approx_size(&cell.kind));
                    *slot = None;
                    self.free_list.push(index as u32);
                }
                None => {}
            }
        }
        let _reclaimed = before.saturating_sub(self.bytes_allocated);
        self.next_gc = self.bytes_allocated * HEAP_GROW_FACTOR;
        self.next_gc = self.next_gc.max(INITIAL_NEXT_GC / 4);
        self.collections_run += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Chunk;

    #[test]
    fn unreachable_string_is_collected() {
        let mut heap = Heap::new();
        let r = heap.alloc_string_raw(b"hello".to_vec(), crate::object::fnv1a_hash(b"hello"));
        assert_eq!(heap.object_count(), 1);
        heap.collect_garbage(|_heap, _gray| {
            // no roots: `r` is unreachable
        });
        assert_eq!(heap.object_count(), 0);
        let _ = r;
    }

    #[test]
    fn rooted_string_survives_collection() {
        let mut heap = Heap::new();
        let r = heap.alloc_string_raw(b"kept".to_vec(), crate::object::fnv1a_hash(b"kept"));
        heap.collect_garbage(|heap, gray| heap.mark_object(r, gray));
        assert_eq!(heap.object_count(), 1);
        assert_eq!(heap.get_string(r).bytes, b"kept");
    }

    #[test]
    fn interning_deduplicates_equal_content() {
        let mut heap = Heap::new();
        let hash = crate::object::fnv1a_hash(b"dup");
        let a = heap.alloc_string_raw(b"dup".to_vec(), hash);
        assert_eq!(heap.find_interned(hash, b"dup"), Some(a));
    }

    #[test]
    fn reachable_via_function_constants_survives() {
        let mut heap = Heap::new();
        let s = heap.alloc_string_raw(b"payload".to_vec(), crate::object::fnv1a_hash(b"payload"));
        let mut chunk = Chunk::new();
        chunk.add_constant(Value::Obj(s));
        let f = heap.alloc_function(FunctionObj {
            arity: 0,
            upvalue_count: 0,
            name: None,
            chunk,
        });
        heap.collect_garbage(|heap, gray| heap.mark_object(f, gray));
        assert_eq!(heap.object_count(), 2);
    }

    #[test]
    fn freed_slots_are_recycled() {
        let mut heap = Heap::new();
        let _a = heap.alloc_string_raw(b"a".to_vec(), 1);
        heap.collect_garbage(|_, _| {});
        let b = heap.alloc_string_raw(b"b".to_vec(), 2);
        assert_eq!(b.index(), 0, "freed slot 0 should be reused");
    }
}
