// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Object arena and mark-sweep garbage collector.
//!
//! Every heap object lives in a slot of the arena and is addressed by an
//! [`ObjRef`] handle. Collection is precise, non-moving mark-sweep with a
//! tricolor worklist: roots are marked grey, the worklist is drained by
//! tracing each object's outgoing references, and the sweep frees every
//! slot left unmarked and recycles it through a free list.
//!
//! The heap also owns the string interner: a weak-keyed [`Table`] whose
//! entries are dropped after marking when their key was not reached, so
//! the interner never resurrects dead strings.
//!
//! Root discovery belongs to the VM, which knows about its stack, frames,
//! globals and compiler state; the heap exposes `mark_*`,
//! [`Heap::trace_references`], [`Heap::sweep_interned`] and
//! [`Heap::sweep`] as the phases of a cycle, plus [`Heap::should_collect`]
//! for the trigger decision. Allocation itself never collects.

#[cfg(test)]
mod heap_test;

use tracing::{debug, trace};

use crate::object::{
    Class, Closure, Function, Instance, LoxStr, Obj, ObjRef, StrRef, Upvalue, UpvalueState,
    hash_continue, hash_str,
};
use crate::table::Table;
use crate::value::Value;

/// First collection happens once this many bytes are live.
const FIRST_GC_THRESHOLD: usize = 1024 * 1024;

/// Lower bound for the next-collection threshold, so a tiny live set
/// after a cycle does not degrade into collecting on every allocation.
const MIN_GC_THRESHOLD: usize = 1024 * 1024;

/// Heap growth factor applied after each cycle.
const GC_GROWTH_FACTOR: usize = 2;

/// One arena slot: the object (if the slot is live) plus its mark bit.
struct Slot {
    marked: bool,
    obj: Option<Obj>,
}

/// The object arena, interner and collector state.
pub struct Heap {
    slots: Vec<Slot>,
    /// Indices of freed slots available for reuse.
    free: Vec<u32>,
    /// Grey worklist: marked objects whose references are not yet traced.
    grey: Vec<ObjRef>,
    /// Scratch buffer for one object's outgoing references during tracing.
    trace_buf: Vec<Value>,
    /// Weak intern table: every live string, keys not treated as roots.
    strings: Table,
    bytes_allocated: usize,
    next_gc: usize,
    stress: bool,
}

impl Heap {
    /// Create an empty heap.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            grey: Vec::new(),
            trace_buf: Vec::new(),
            strings: Table::new(),
            bytes_allocated: 0,
            next_gc: FIRST_GC_THRESHOLD,
            stress: cfg!(feature = "gc-stress"),
        }
    }

    /// Force a collection before every allocation.
    ///
    /// The single most effective way to catch a missed root: anything not
    /// reachable at an allocation point is freed immediately.
    pub fn set_stress(&mut self, stress: bool) {
        self.stress = stress;
    }

    /// Bytes of live heap data as of the last accounting point.
    #[must_use]
    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// Number of live objects in the arena.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.obj.is_some()).count()
    }

    /// Whether the caller should run a collection cycle before its next
    /// allocation.
    #[must_use]
    pub fn should_collect(&self) -> bool {
        self.stress || self.bytes_allocated > self.next_gc
    }

    /// Move an object into the arena and return its handle.
    pub fn alloc(&mut self, obj: Obj) -> ObjRef {
        self.bytes_allocated += obj.heap_size();
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Slot {
                    marked: false,
                    obj: Some(obj),
                };
                index
            }
            None => {
                self.slots.push(Slot {
                    marked: false,
                    obj: Some(obj),
                });
                (self.slots.len() - 1) as u32
            }
        };
        let r = ObjRef(index);
        trace!(slot = index, bytes = self.bytes_allocated, "allocate");
        r
    }

    /// Intern a string: return the existing handle for equal content, or
    /// allocate and register a new one.
    ///
    /// Does not trigger collection; callers that want the usual
    /// collect-before-allocate behavior go through the VM.
    pub fn intern(&mut self, chars: &str) -> StrRef {
        let hash = hash_str(chars);
        if let Some(existing) = self.find_interned(chars, hash) {
            return existing;
        }
        let r = self.alloc(Obj::Str(LoxStr {
            chars: chars.into(),
            hash,
        }));
        let key = StrRef { index: r.0, hash };
        self.strings.set(key, Value::Nil);
        key
    }

    /// Intern the concatenation of two interned strings.
    ///
    /// The combined hash continues the left operand's FNV-1a state over
    /// the right operand's bytes, and the intern table is probed with a
    /// two-part comparison before any new string is built.
    pub fn concat(&mut self, a: StrRef, b: StrRef) -> StrRef {
        let a_chars = self.str_chars(a);
        let b_chars = self.str_chars(b);
        let hash = hash_continue(a.hash(), b_chars.as_bytes());
        if let Some(existing) = self.find_interned_concat(a_chars, b_chars, hash) {
            return existing;
        }

        let mut chars = String::with_capacity(a_chars.len() + b_chars.len());
        chars.push_str(a_chars);
        chars.push_str(b_chars);

        let r = self.alloc(Obj::Str(LoxStr {
            chars: chars.into_boxed_str(),
            hash,
        }));
        let key = StrRef { index: r.0, hash };
        self.strings.set(key, Value::Nil);
        key
    }

    /// Look up interned content.
    #[must_use]
    pub fn find_interned(&self, chars: &str, hash: u32) -> Option<StrRef> {
        let slots = &self.slots;
        self.strings.find_key(hash, |key| {
            matches!(
                slots.get(key.index()).and_then(|slot| slot.obj.as_ref()),
                Some(Obj::Str(s)) if &*s.chars == chars
            )
        })
    }

    fn find_interned_concat(&self, a: &str, b: &str, hash: u32) -> Option<StrRef> {
        let slots = &self.slots;
        let length = a.len() + b.len();
        self.strings.find_key(hash, |key| {
            match slots.get(key.index()).and_then(|slot| slot.obj.as_ref()) {
                Some(Obj::Str(s)) => {
                    s.chars.len() == length
                        && s.chars.as_bytes()[..a.len()] == *a.as_bytes()
                        && s.chars.as_bytes()[a.len()..] == *b.as_bytes()
                }
                _ => false,
            }
        })
    }

    // --- accessors -------------------------------------------------------

    /// The object behind a handle, if the slot is live.
    #[must_use]
    pub fn obj(&self, r: ObjRef) -> Option<&Obj> {
        self.slots.get(r.index()).and_then(|slot| slot.obj.as_ref())
    }

    fn obj_mut(&mut self, r: ObjRef) -> Option<&mut Obj> {
        self.slots
            .get_mut(r.index())
            .and_then(|slot| slot.obj.as_mut())
    }

    /// Content of an interned string. Renders as an empty string if the
    /// handle is stale, which the interner's lifecycle rules out.
    #[must_use]
    pub fn str_chars(&self, r: StrRef) -> &str {
        match self.obj(r.as_obj()) {
            Some(Obj::Str(s)) => &s.chars,
            _ => "",
        }
    }

    /// Reconstruct a string reference from a value, if it holds one.
    #[must_use]
    pub fn as_str_ref(&self, value: Value) -> Option<StrRef> {
        let r = value.as_obj()?;
        match self.obj(r)? {
            Obj::Str(s) => Some(StrRef {
                index: r.0,
                hash: s.hash,
            }),
            _ => None,
        }
    }

    /// Typed function accessor.
    #[must_use]
    pub fn function(&self, r: ObjRef) -> Option<&Function> {
        match self.obj(r)? {
            Obj::Function(f) => Some(f),
            _ => None,
        }
    }

    pub(crate) fn function_mut(&mut self, r: ObjRef) -> Option<&mut Function> {
        match self.obj_mut(r)? {
            Obj::Function(f) => Some(f),
            _ => None,
        }
    }

    /// Typed closure accessor.
    #[must_use]
    pub fn closure(&self, r: ObjRef) -> Option<&Closure> {
        match self.obj(r)? {
            Obj::Closure(c) => Some(c),
            _ => None,
        }
    }

    pub(crate) fn closure_mut(&mut self, r: ObjRef) -> Option<&mut Closure> {
        match self.obj_mut(r)? {
            Obj::Closure(c) => Some(c),
            _ => None,
        }
    }

    /// Typed class accessor.
    #[must_use]
    pub fn class(&self, r: ObjRef) -> Option<&Class> {
        match self.obj(r)? {
            Obj::Class(c) => Some(c),
            _ => None,
        }
    }

    pub(crate) fn class_mut(&mut self, r: ObjRef) -> Option<&mut Class> {
        match self.obj_mut(r)? {
            Obj::Class(c) => Some(c),
            _ => None,
        }
    }

    /// Typed instance accessor.
    #[must_use]
    pub fn instance(&self, r: ObjRef) -> Option<&Instance> {
        match self.obj(r)? {
            Obj::Instance(i) => Some(i),
            _ => None,
        }
    }

    pub(crate) fn instance_mut(&mut self, r: ObjRef) -> Option<&mut Instance> {
        match self.obj_mut(r)? {
            Obj::Instance(i) => Some(i),
            _ => None,
        }
    }

    /// Typed upvalue accessor.
    #[must_use]
    pub fn upvalue(&self, r: ObjRef) -> Option<&Upvalue> {
        match self.obj(r)? {
            Obj::Upvalue(u) => Some(u),
            _ => None,
        }
    }

    pub(crate) fn upvalue_mut(&mut self, r: ObjRef) -> Option<&mut Upvalue> {
        match self.obj_mut(r)? {
            Obj::Upvalue(u) => Some(u),
            _ => None,
        }
    }

    /// Stack slot of an open upvalue. Closed upvalues never appear on the
    /// VM's open list; a stale handle sorts last.
    #[must_use]
    pub(crate) fn open_slot(&self, r: ObjRef) -> usize {
        match self.upvalue(r) {
            Some(Upvalue {
                state: UpvalueState::Open(slot),
            }) => *slot,
            _ => usize::MAX,
        }
    }

    // --- collection ------------------------------------------------------

    /// Mark a value grey if it references an unmarked live object.
    pub fn mark_value(&mut self, value: Value) {
        if let Value::Obj(r) = value {
            self.mark_object(r);
        }
    }

    /// Mark an object grey if it is live and not yet marked.
    pub fn mark_object(&mut self, r: ObjRef) {
        let Some(slot) = self.slots.get_mut(r.index()) else {
            return;
        };
        if slot.obj.is_none() || slot.marked {
            return;
        }
        slot.marked = true;
        trace!(slot = r.0, "mark");
        self.grey.push(r);
    }

    /// Drain the grey worklist, marking every object reachable from the
    /// roots marked so far.
    pub fn trace_references(&mut self) {
        while let Some(r) = self.grey.pop() {
            self.blacken(r);
        }
    }

    /// Drop intern-table entries whose string was not marked.
    pub fn sweep_interned(&mut self) {
        let Heap { strings, slots, .. } = self;
        strings.sweep_unmarked(|key| {
            slots
                .get(key.index())
                .is_some_and(|slot| slot.obj.is_some() && slot.marked)
        });
    }

    /// Free every unmarked object, clear the marks on survivors and
    /// update the accounting and the next collection threshold.
    pub fn sweep(&mut self) {
        let mut live_bytes = 0;
        for index in 0..self.slots.len() {
            let survivor_size = {
                let slot = &self.slots[index];
                match &slot.obj {
                    None => None,
                    Some(obj) if slot.marked => Some(obj.heap_size()),
                    Some(obj) => {
                        trace!(slot = index, kind = obj.kind_name(), "free");
                        None
                    }
                }
            };
            match survivor_size {
                Some(size) => {
                    live_bytes += size;
                    self.slots[index].marked = false;
                }
                None => {
                    if self.slots[index].obj.take().is_some() {
                        self.free.push(index as u32);
                    }
                }
            }
        }

        self.bytes_allocated = live_bytes;
        self.next_gc = (live_bytes * GC_GROWTH_FACTOR).max(MIN_GC_THRESHOLD);
        debug!(
            live_bytes,
            next_gc = self.next_gc,
            objects = self.object_count(),
            "gc cycle done"
        );
    }

    /// Push one object's outgoing references and mark them.
    fn blacken(&mut self, r: ObjRef) {
        {
            let Some(slot) = self.slots.get(r.index()) else {
                return;
            };
            let Some(obj) = slot.obj.as_ref() else {
                return;
            };
            match obj {
                Obj::Str(_) | Obj::Native(_) => {}
                Obj::Upvalue(u) => {
                    if let UpvalueState::Closed(value) = u.state {
                        self.trace_buf.push(value);
                    }
                }
                Obj::Function(f) => {
                    if let Some(name) = f.name {
                        self.trace_buf.push(Value::Obj(name.as_obj()));
                    }
                    for &constant in &f.chunk.constants {
                        self.trace_buf.push(constant);
                    }
                }
                Obj::Closure(c) => {
                    self.trace_buf.push(Value::Obj(c.function));
                    for &upvalue in &c.upvalues {
                        self.trace_buf.push(Value::Obj(upvalue));
                    }
                }
                Obj::Class(c) => {
                    self.trace_buf.push(Value::Obj(c.name.as_obj()));
                    for (key, value) in c.methods.iter() {
                        self.trace_buf.push(Value::Obj(key.as_obj()));
                        self.trace_buf.push(value);
                    }
                }
                Obj::Instance(i) => {
                    self.trace_buf.push(Value::Obj(i.class));
                    for (key, value) in i.fields.iter() {
                        self.trace_buf.push(Value::Obj(key.as_obj()));
                        self.trace_buf.push(value);
                    }
                }
                Obj::BoundMethod(b) => {
                    self.trace_buf.push(b.receiver);
                    self.trace_buf.push(Value::Obj(b.method));
                }
            }
        }

        while let Some(value) = self.trace_buf.pop() {
            self.mark_value(value);
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}
