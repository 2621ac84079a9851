//! Object arena and the mark-and-sweep collector.
//!
//! Every object lives in a slot of [`Heap`] and is addressed by an
//! [`ObjRef`]. The heap never decides on its own to collect: the VM checks
//! [`Heap::should_collect`] before allocating, marks its roots with
//! [`Heap::mark`] and then calls [`Heap::collect`], which traces from the
//! gray worklist, drops dead strings from the intern table and sweeps.

use crate::{
    object::{Closure, Function, ObjRef, ObjString, Object, Upvalue},
    table::{hash_str, MapKey, StrKey, Table},
    value::{format_number, Value},
};
use log::debug;
use std::{
    env,
    ops::{Index, IndexMut},
};

const INITIAL_THRESHOLD: usize = 1024 * 1024;
const GROW_FACTOR: usize = 2;

/// Anything that holds object handles the collector must follow
pub trait Trace {
    /// Pushes every directly referenced object onto `gray`
    fn trace(&self, gray: &mut Vec<ObjRef>);
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GcConfig {
    /// Collect before every allocation
    pub stress: bool,
    pub initial_threshold: usize,
    pub grow_factor: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            stress: false,
            initial_threshold: INITIAL_THRESHOLD,
            grow_factor: GROW_FACTOR,
        }
    }
}

impl GcConfig {
    /// Reads `VIPER_STRESS_GC` and `VIPER_GC_THRESHOLD`, falling back to the
    /// defaults for anything unset or unparsable
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(v) = env::var("VIPER_STRESS_GC") {
            config.stress = matches!(v.as_str(), "1" | "true" | "yes");
        }
        if let Some(threshold) = env::var("VIPER_GC_THRESHOLD")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.initial_threshold = threshold;
        }
        config
    }
}

#[derive(Debug)]
struct Slot {
    marked: bool,
    size: usize,
    object: Object,
}

#[derive(Debug)]
pub struct Heap {
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    gray: Vec<ObjRef>,
    /// Weak: entries die with their string
    strings: Table<StrKey, ()>,
    bytes_allocated: usize,
    next_gc: usize,
    config: GcConfig,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new(GcConfig::default())
    }
}

impl Heap {
    pub fn new(config: GcConfig) -> Self {
        Self {
            slots: Vec::default(),
            free: Vec::default(),
            gray: Vec::default(),
            strings: Table::default(),
            bytes_allocated: 0,
            next_gc: config.initial_threshold,
            config,
        }
    }

    /// Number of live objects
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn should_collect(&self) -> bool {
        self.config.stress || self.bytes_allocated > self.next_gc
    }

    pub fn contains(&self, r: ObjRef) -> bool {
        matches!(self.slots.get(r.0), Some(Some(_)))
    }

    /// Places an object in the arena. Never collects.
    pub fn alloc(&mut self, object: Object) -> ObjRef {
        let size = object.size();
        self.bytes_allocated += size;
        let slot = Some(Slot {
            marked: false,
            size,
            object,
        });
        let r = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = slot;
                ObjRef(idx)
            }
            None => {
                self.slots.push(slot);
                ObjRef(self.slots.len() - 1)
            }
        };
        debug!("Allocated {} ({size} bytes) at {r:?}", self[r].kind());
        r
    }

    /// Re-measures an object after it grew or shrank in place, keeping
    /// `bytes_allocated` in step with what the heap actually owns
    pub fn remeasure(&mut self, r: ObjRef) {
        let Some(Some(slot)) = self.slots.get_mut(r.0) else {
            return;
        };
        let size = slot.object.size();
        self.bytes_allocated = self.bytes_allocated - slot.size + size;
        slot.size = size;
    }

    pub fn find_interned(&self, s: &str) -> Option<ObjRef> {
        let hash = hash_str(s);
        self.strings
            .find_key(hash, |key| self.string(key.obj).chars == s)
            .map(|key| key.obj)
    }

    /// Returns the canonical string object for `s`, allocating it if needed.
    /// Never collects.
    pub fn intern(&mut self, s: &str) -> ObjRef {
        if let Some(r) = self.find_interned(s) {
            return r;
        }
        let hash = hash_str(s);
        let obj = self.alloc(Object::Str(ObjString {
            chars: s.to_string(),
            hash,
        }));
        self.strings.insert(StrKey { obj, hash }, ());
        obj
    }

    pub fn str_key(&self, r: ObjRef) -> StrKey {
        StrKey {
            obj: r,
            hash: self.string(r).hash,
        }
    }

    pub fn string(&self, r: ObjRef) -> &ObjString {
        match &self[r] {
            Object::Str(s) => s,
            o => unreachable!("expected string, found {}", o.kind()),
        }
    }

    pub fn function(&self, r: ObjRef) -> &Function {
        match &self[r] {
            Object::Function(f) => f,
            o => unreachable!("expected function, found {}", o.kind()),
        }
    }

    pub fn closure(&self, r: ObjRef) -> &Closure {
        match &self[r] {
            Object::Closure(c) => c,
            o => unreachable!("expected closure, found {}", o.kind()),
        }
    }

    pub fn upvalue_mut(&mut self, r: ObjRef) -> &mut Upvalue {
        match &mut self[r] {
            Object::Upvalue(u) => u,
            o => unreachable!("expected upvalue, found {}", o.kind()),
        }
    }

    /// Marks the objects referenced by a root
    pub fn mark<T: Trace + ?Sized>(&mut self, root: &T) {
        let mut refs = Vec::default();
        root.trace(&mut refs);
        for r in refs {
            self.mark_object(r);
        }
    }

    pub fn mark_object(&mut self, r: ObjRef) {
        if let Some(Some(slot)) = self.slots.get_mut(r.0) {
            if !slot.marked {
                slot.marked = true;
                self.gray.push(r);
            }
        }
    }

    /// Finishes a cycle started by marking the roots. Returns the number of
    /// bytes freed.
    pub fn collect(&mut self) -> usize {
        let before = self.bytes_allocated;
        let objects = self.len();

        self.trace_references();
        let Self { strings, slots, .. } = &mut *self;
        strings.retain(|key, _| matches!(&slots[key.obj.0], Some(slot) if slot.marked));
        self.sweep();

        self.next_gc = self.bytes_allocated * self.config.grow_factor;
        let freed = before - self.bytes_allocated;
        debug!(
            "GC: freed {freed} bytes and {} objects, {} bytes in use, next at {}",
            objects - self.len(),
            self.bytes_allocated,
            self.next_gc
        );
        freed
    }

    fn trace_references(&mut self) {
        let mut children = Vec::default();
        while let Some(r) = self.gray.pop() {
            self[r].trace(&mut children);
            for child in children.drain(..) {
                self.mark_object(child);
            }
        }
    }

    fn sweep(&mut self) {
        for (idx, entry) in self.slots.iter_mut().enumerate() {
            let Some(slot) = entry else { continue };
            if slot.marked {
                slot.marked = false;
                continue;
            }
            self.bytes_allocated -= slot.size;
            *entry = None;
            self.free.push(idx);
        }
    }

    /// Renders a value the way `print` shows it
    pub fn format_value(&self, value: Value) -> String {
        let mut out = String::default();
        self.write_value(value, &mut Vec::default(), &mut out);
        out
    }

    fn write_value(&self, value: Value, path: &mut Vec<ObjRef>, out: &mut String) {
        match value {
            Value::Number(n) => out.push_str(&format_number(n)),
            Value::Boolean(b) => out.push_str(&b.to_string()),
            Value::Null => out.push_str("null"),
            Value::Object(r) => self.write_object(r, path, out),
        }
    }

    fn write_object(&self, r: ObjRef, path: &mut Vec<ObjRef>, out: &mut String) {
        match &self[r] {
            Object::Str(s) => out.push_str(&s.chars),
            Object::Function(f) => out.push_str(&self.function_name(f)),
            Object::Native(_) => out.push_str("<native fn>"),
            Object::Closure(c) => out.push_str(&self.function_name(self.function(c.function))),
            Object::Upvalue(_) => out.push_str("upvalue"),
            Object::Class(c) => out.push_str(&self.string(c.name).chars),
            Object::Instance(i) => {
                let Object::Class(class) = &self[i.class] else {
                    unreachable!("instance of a non-class")
                };
                out.push_str(&self.string(class.name).chars);
                out.push_str(" instance");
            }
            Object::BoundMethod(b) => self.write_object(b.method, path, out),
            Object::List(items) => {
                if path.contains(&r) {
                    return out.push_str("[...]");
                }
                path.push(r);
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    self.write_value(*item, path, out);
                }
                out.push(']');
                path.pop();
            }
            Object::Map(map) => {
                if path.contains(&r) {
                    return out.push_str("{...}");
                }
                path.push(r);
                out.push('{');
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    let key = match k {
                        MapKey::Number(n) => Value::Number(*n),
                        MapKey::Str(s) => Value::Object(s.obj),
                    };
                    self.write_value(key, path, out);
                    out.push_str(": ");
                    self.write_value(*v, path, out);
                }
                out.push('}');
                path.pop();
            }
        }
    }

    pub fn function_name(&self, f: &Function) -> String {
        match f.name {
            Some(name) => format!("<fn {}>", self.string(name).chars),
            None => "<script>".to_string(),
        }
    }
}

impl Index<ObjRef> for Heap {
    type Output = Object;

    fn index(&self, r: ObjRef) -> &Self::Output {
        match &self.slots[r.0] {
            Some(slot) => &slot.object,
            None => panic!("use of freed object {r:?}"),
        }
    }
}

impl IndexMut<ObjRef> for Heap {
    fn index_mut(&mut self, r: ObjRef) -> &mut Self::Output {
        match &mut self.slots[r.0] {
            Some(slot) => &mut slot.object,
            None => panic!("use of freed object {r:?}"),
        }
    }
}

impl Trace for ObjRef {
    fn trace(&self, gray: &mut Vec<ObjRef>) {
        gray.push(*self);
    }
}

impl Trace for Value {
    fn trace(&self, gray: &mut Vec<ObjRef>) {
        if let Value::Object(r) = self {
            gray.push(*r);
        }
    }
}

impl Trace for () {
    fn trace(&self, _: &mut Vec<ObjRef>) {}
}

impl<T: Trace> Trace for [T] {
    fn trace(&self, gray: &mut Vec<ObjRef>) {
        self.iter().for_each(|item| item.trace(gray));
    }
}

impl<T: Trace> Trace for Vec<T> {
    fn trace(&self, gray: &mut Vec<ObjRef>) {
        self.as_slice().trace(gray);
    }
}

impl<T: Trace> Trace for Option<T> {
    fn trace(&self, gray: &mut Vec<ObjRef>) {
        if let Some(inner) = self {
            inner.trace(gray);
        }
    }
}

impl Trace for Function {
    fn trace(&self, gray: &mut Vec<ObjRef>) {
        self.name.trace(gray);
        self.chunk.constants.trace(gray);
    }
}

impl Trace for Object {
    fn trace(&self, gray: &mut Vec<ObjRef>) {
        match self {
            Object::Str(_) | Object::Native(_) => (),
            Object::Function(f) => f.trace(gray),
            Object::Closure(c) => {
                gray.push(c.function);
                c.upvalues.trace(gray);
            }
            Object::Upvalue(Upvalue::Closed(v)) => v.trace(gray),
            Object::Upvalue(Upvalue::Open(_)) => (),
            Object::Class(c) => {
                gray.push(c.name);
                c.methods.trace(gray);
            }
            Object::Instance(i) => {
                gray.push(i.class);
                i.fields.trace(gray);
            }
            Object::BoundMethod(b) => {
                b.receiver.trace(gray);
                gray.push(b.method);
            }
            Object::List(items) => items.trace(gray),
            Object::Map(map) => map.trace(gray),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{Class, Instance};

    fn class_named(heap: &mut Heap, name: &str) -> ObjRef {
        let name = heap.intern(name);
        heap.alloc(Object::Class(Class {
            name,
            methods: Table::default(),
        }))
    }

    #[test]
    fn interning_is_content_unique() {
        let mut heap = Heap::default();
        let a = heap.intern("hello");
        let b = heap.intern("hello");
        let c = heap.intern("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(heap.len(), 2);
    }

    #[test]
    fn unreachable_objects_are_swept() {
        let mut heap = Heap::default();
        let kept = heap.intern("kept");
        heap.intern("dropped");
        heap.mark_object(kept);
        heap.collect();
        assert_eq!(heap.len(), 1);
        assert!(heap.contains(kept));
        // The intern table must not hand back the freed string
        assert_eq!(heap.find_interned("dropped"), None);
        assert_eq!(heap.find_interned("kept"), Some(kept));
    }

    #[test]
    fn children_are_traced() {
        let mut heap = Heap::default();
        let class = class_named(&mut heap, "Point");
        let instance = heap.alloc(Object::Instance(Instance {
            class,
            fields: Table::default(),
        }));
        let list = heap.alloc(Object::List(vec![Value::Object(instance)]));
        heap.mark(&Value::Object(list));
        heap.collect();
        // list, instance, class and its name
        assert_eq!(heap.len(), 4);
    }

    #[test]
    fn cycles_are_collected() {
        let mut heap = Heap::default();
        let a = heap.alloc(Object::List(Vec::default()));
        let b = heap.alloc(Object::List(vec![Value::Object(a)]));
        if let Object::List(items) = &mut heap[a] {
            items.push(Value::Object(b));
        }
        heap.collect();
        assert!(heap.is_empty());
        assert_eq!(heap.bytes_allocated(), 0);
    }

    #[test]
    fn growth_in_place_is_counted() {
        let mut heap = Heap::default();
        let list = heap.alloc(Object::List(Vec::default()));
        let before = heap.bytes_allocated();
        if let Object::List(items) = &mut heap[list] {
            items.extend((0..1000).map(|n| Value::Number(n as f64)));
        }
        heap.remeasure(list);
        let grown = heap.bytes_allocated();
        assert!(grown >= before + 1000 * std::mem::size_of::<Value>());

        if let Object::List(items) = &mut heap[list] {
            items.clear();
            items.shrink_to_fit();
        }
        heap.remeasure(list);
        assert_eq!(heap.bytes_allocated(), before);

        heap.collect();
        assert_eq!(heap.bytes_allocated(), 0);
    }

    #[test]
    fn slots_are_recycled() {
        let mut heap = Heap::default();
        let first = heap.intern("first");
        heap.collect();
        let second = heap.intern("second");
        assert_eq!(first, second);
    }

    #[test]
    fn threshold_grows_after_collection() {
        let mut heap = Heap::new(GcConfig {
            initial_threshold: 0,
            ..GcConfig::default()
        });
        let s = heap.intern("live");
        assert!(heap.should_collect());
        heap.mark_object(s);
        heap.collect();
        assert!(!heap.should_collect());
    }

    #[test]
    fn formats_collections() {
        let mut heap = Heap::default();
        let s = heap.intern("a");
        let list = heap.alloc(Object::List(vec![
            Value::Number(1.0),
            Value::Object(s),
            Value::Null,
        ]));
        assert_eq!(heap.format_value(Value::Object(list)), "[1, a, null]");
        if let Object::List(items) = &mut heap[list] {
            items.push(Value::Object(list));
        }
        assert_eq!(heap.format_value(Value::Object(list)), "[1, a, null, [...]]");
    }
}
