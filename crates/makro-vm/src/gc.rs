use std::fmt::{self, Display, Formatter};

use crate::config::Config;
use crate::object::{
    Object, ObjectClass, ObjectClosure, ObjectFunction, ObjectInstance, ObjectNative,
    ObjectString, ObjectUpvalue,
};
use crate::table::{StrKey, Table};
use crate::value::Value;

/// A non-owning handle to an object in the [`Gc`] arena.
///
/// Slots are recycled after a collection; the generation counter makes a
/// handle to a freed object distinguishable from a handle to whatever now
/// lives in the same slot.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ObjectRef {
    idx: u32,
    generation: u32,
}

impl Trace for ObjectRef {
    fn trace(&self, gc: &mut Gc) {
        gc.mark(*self);
    }
}

/// Anything that holds references to heap objects. Tracing marks every
/// directly reachable object gray.
pub trait Trace {
    fn trace(&self, gc: &mut Gc);
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    is_marked: bool,
    size: usize,
    object: Option<Object>,
}

/// Owns every heap object, and the weak table of interned strings.
///
/// The collector never runs on its own: callers ask [`Gc::should_collect`]
/// before allocating, mark their roots, and then call
/// [`Gc::collect_garbage`].
#[derive(Debug)]
pub struct Gc {
    slots: Vec<Slot>,
    free_slots: Vec<u32>,
    object_count: usize,
    strings: Table,
    gray_objects: Vec<ObjectRef>,
    bytes_allocated: usize,
    next_gc: usize,
    growth_factor: usize,
    stress: bool,
}

impl Default for Gc {
    fn default() -> Self {
        Self::new(&Config::default())
    }
}

impl Gc {
    pub fn new(config: &Config) -> Self {
        Self {
            slots: Vec::new(),
            free_slots: Vec::new(),
            object_count: 0,
            strings: Table::default(),
            gray_objects: Vec::new(),
            bytes_allocated: 0,
            next_gc: config.gc_initial_threshold,
            growth_factor: config.gc_growth_factor,
            stress: config.gc_stress,
        }
    }

    /// Moves `object` into the arena. Never collects. Strings are registered
    /// in the intern table, so callers must check [`Gc::find_interned`]
    /// first (or use [`Gc::intern`]).
    pub fn alloc(&mut self, object: impl Into<Object>) -> ObjectRef {
        let object = object.into();
        let size = object.size();
        let str_hash = match &object {
            Object::String(string) => Some(string.hash),
            _ => None,
        };
        tracing::trace!(size, type_ = %object.type_(), "allocate");

        let object_ref = match self.free_slots.pop() {
            Some(idx) => {
                let slot = &mut self.slots[idx as usize];
                slot.is_marked = false;
                slot.size = size;
                slot.object = Some(object);
                ObjectRef { idx, generation: slot.generation }
            }
            None => {
                let idx = self.slots.len() as u32;
                self.slots.push(Slot { generation: 0, is_marked: false, size, object: Some(object) });
                ObjectRef { idx, generation: 0 }
            }
        };
        self.bytes_allocated += size;
        self.object_count += 1;

        if let Some(hash) = str_hash {
            let key = StrKey { object: object_ref, hash };
            self.strings.set(key, Value::Null);
        }
        object_ref
    }

    /// Returns the canonical string object for `value`, allocating it if
    /// needed. Never collects.
    pub fn intern(&mut self, value: &str) -> ObjectRef {
        match self.find_interned(value) {
            Some(object) => object,
            None => self.alloc(ObjectString::new(value)),
        }
    }

    pub fn find_interned(&self, value: &str) -> Option<ObjectRef> {
        let hash = hash_str(value);
        self.strings.find_interned(value, hash, |object| self.string(object).as_str())
    }

    /// Whether an allocation of `size` bytes should be preceded by a
    /// collection.
    pub fn should_collect(&self, size: usize) -> bool {
        if cfg!(feature = "gc-off") {
            return false;
        }
        self.stress || self.bytes_allocated + size > self.next_gc
    }

    /// Marks `object` gray, unless it is already marked.
    pub fn mark(&mut self, object: ObjectRef) {
        let slot = self.slot_mut(object);
        if slot.is_marked {
            return;
        }
        slot.is_marked = true;
        self.gray_objects.push(object);
    }

    /// Traces everything reachable from the gray objects, drops unmarked
    /// strings from the intern table, then frees every unmarked object.
    /// Roots must have been marked beforehand.
    pub fn collect_garbage(&mut self) {
        let bytes_before = self.bytes_allocated;
        tracing::debug!(bytes_allocated = bytes_before, "gc begin");

        self.trace_references();
        let slots = &self.slots;
        self.strings.remove_unmarked(|object| slots[object.idx as usize].is_marked);
        let freed = self.sweep();

        self.next_gc = self.bytes_allocated * self.growth_factor;
        tracing::debug!(
            freed,
            collected = bytes_before - self.bytes_allocated,
            bytes_allocated = self.bytes_allocated,
            next_gc = self.next_gc,
            "gc end"
        );
    }

    fn trace_references(&mut self) {
        while let Some(object_ref) = self.gray_objects.pop() {
            let idx = object_ref.idx as usize;
            // The object is taken out of its slot while it is traced, so that
            // tracing can borrow the collector mutably.
            if let Some(object) = self.slots[idx].object.take() {
                object.trace(self);
                self.slots[idx].object = Some(object);
            }
        }
    }

    fn sweep(&mut self) -> usize {
        let mut freed = 0;
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            if slot.object.is_none() {
                continue;
            }
            if slot.is_marked {
                slot.is_marked = false;
                continue;
            }
            slot.object = None;
            slot.generation = slot.generation.wrapping_add(1);
            self.bytes_allocated -= slot.size;
            self.free_slots.push(idx as u32);
            freed += 1;
        }
        self.object_count -= freed;
        freed
    }

    /// Re-measures an object whose size changed after allocation, such as an
    /// instance that grew its field table.
    pub fn resize(&mut self, object: ObjectRef) {
        let slot = self.slot_mut(object);
        let Some(new_size) = slot.object.as_ref().map(Object::size) else {
            return;
        };
        let old_size = std::mem::replace(&mut slot.size, new_size);
        self.bytes_allocated = self.bytes_allocated + new_size - old_size;
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn object_count(&self) -> usize {
        self.object_count
    }

    /// Whether `object` still refers to a live object.
    pub fn contains(&self, object: ObjectRef) -> bool {
        self.slots.get(object.idx as usize).map_or(false, |slot| {
            slot.generation == object.generation && slot.object.is_some()
        })
    }

    pub fn str_key(&self, object: ObjectRef) -> StrKey {
        StrKey { object, hash: self.string(object).hash }
    }

    fn slot(&self, object: ObjectRef) -> &Slot {
        let slot = &self.slots[object.idx as usize];
        assert_eq!(slot.generation, object.generation, "use of freed object {object:?}");
        slot
    }

    fn slot_mut(&mut self, object: ObjectRef) -> &mut Slot {
        let slot = &mut self.slots[object.idx as usize];
        assert_eq!(slot.generation, object.generation, "use of freed object {object:?}");
        slot
    }

    pub fn get(&self, object: ObjectRef) -> &Object {
        match &self.slot(object).object {
            Some(object) => object,
            None => panic!("use of freed object"),
        }
    }

    pub fn get_mut(&mut self, object: ObjectRef) -> &mut Object {
        match &mut self.slot_mut(object).object {
            Some(object) => object,
            None => panic!("use of freed object"),
        }
    }

    pub fn type_name(&self, value: Value) -> &'static str {
        match value {
            Value::Bool(_) => "bool",
            Value::Null => "null",
            Value::Number(_) => "number",
            Value::Object(object) => self.get(object).type_().name(),
        }
    }

    /// Formats a value the way `print` shows it.
    pub fn display(&self, value: Value) -> ValueDisplay<'_> {
        ValueDisplay { gc: self, value }
    }
}

macro_rules! impl_accessors {
    ($($variant:ident => $name:ident, $name_mut:ident: $type_:ty;)+) => {
        impl Gc {$(
            pub fn $name(&self, object: ObjectRef) -> &$type_ {
                match self.get(object) {
                    Object::$variant(inner) => inner,
                    object => unreachable!(concat!("expected ", stringify!($variant), ", got {:?}"), object.type_()),
                }
            }

            pub fn $name_mut(&mut self, object: ObjectRef) -> &mut $type_ {
                match self.get_mut(object) {
                    Object::$variant(inner) => inner,
                    object => unreachable!(concat!("expected ", stringify!($variant), ", got {:?}"), object.type_()),
                }
            }
        )+}
    };
}

impl_accessors! {
    Class => class, class_mut: ObjectClass;
    Closure => closure, closure_mut: ObjectClosure;
    Function => function, function_mut: ObjectFunction;
    Instance => instance, instance_mut: ObjectInstance;
    Native => native, native_mut: ObjectNative;
    String => string, string_mut: ObjectString;
    Upvalue => upvalue, upvalue_mut: ObjectUpvalue;
}

pub struct ValueDisplay<'a> {
    gc: &'a Gc,
    value: Value,
}

impl Display for ValueDisplay<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let gc = self.gc;
        let object = match self.value {
            Value::Bool(bool) => return write!(f, "{bool}"),
            Value::Null => return write!(f, "null"),
            Value::Number(number) => return write!(f, "{number}"),
            Value::Object(object) => object,
        };
        match gc.get(object) {
            Object::Class(class) => write!(f, "{}", gc.string(class.name)),
            Object::Closure(closure) => fmt_function(f, gc, gc.function(closure.function)),
            Object::Function(function) => fmt_function(f, gc, function),
            Object::Instance(instance) => {
                write!(f, "{} instance", gc.string(gc.class(instance.class).name))
            }
            Object::Native(_) => write!(f, "<native fn>"),
            Object::String(string) => write!(f, "{string}"),
            Object::Upvalue(_) => write!(f, "upvalue"),
        }
    }
}

fn fmt_function(f: &mut Formatter<'_>, gc: &Gc, function: &ObjectFunction) -> fmt::Result {
    match function.name {
        Some(name) => write!(f, "<fn {}>", gc.string(name)),
        None => write!(f, "<script>"),
    }
}

/// 32-bit FNV-1a.
pub fn hash_str(value: &str) -> u32 {
    let mut hash: u32 = 2_166_136_261;
    for &byte in value.as_bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(16_777_619);
    }
    hash
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn collect(gc: &mut Gc, roots: &[ObjectRef]) {
        for &root in roots {
            gc.mark(root);
        }
        gc.collect_garbage();
    }

    #[test]
    fn fnv1a() {
        assert_eq!(hash_str(""), 2_166_136_261);
        assert_eq!(hash_str("a"), 0xe40c_292c);
        assert_eq!(hash_str("foobar"), 0xbf9c_f968);
    }

    #[test]
    fn intern_returns_same_object() {
        let mut gc = Gc::default();
        let a = gc.intern("hello");
        let b = gc.intern(&(String::from("hel") + "lo"));
        let c = gc.intern("world");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(gc.object_count(), 2);
        assert_eq!(gc.string(a).as_str(), "hello");
        assert_eq!(gc.find_interned("hello"), Some(a));
        assert_eq!(gc.find_interned("nope"), None);
    }

    #[test]
    fn sweep_frees_unreachable() {
        let mut gc = Gc::default();
        let kept = gc.intern("kept");
        let dropped = gc.intern("dropped");
        let bytes_before = gc.bytes_allocated();

        collect(&mut gc, &[kept]);

        assert!(gc.contains(kept));
        assert!(!gc.contains(dropped));
        assert_eq!(gc.object_count(), 1);
        assert!(gc.bytes_allocated() < bytes_before);
        assert_eq!(gc.next_gc, gc.bytes_allocated() * 2);
    }

    #[test]
    fn intern_table_is_weak() {
        let mut gc = Gc::default();
        gc.intern("ephemeral");
        collect(&mut gc, &[]);

        assert_eq!(gc.find_interned("ephemeral"), None);
        assert_eq!(gc.object_count(), 0);

        // The freed slot is reused under a new generation.
        let fresh = gc.intern("ephemeral");
        assert!(gc.contains(fresh));
        assert_eq!(gc.find_interned("ephemeral"), Some(fresh));
    }

    #[test]
    fn stale_handle_is_detected() {
        let mut gc = Gc::default();
        let stale = gc.intern("a");
        collect(&mut gc, &[]);
        let fresh = gc.intern("b");

        assert_eq!(stale.idx, fresh.idx);
        assert_ne!(stale, fresh);
        assert!(!gc.contains(stale));
    }

    #[test]
    fn cycles_are_collected() {
        let mut gc = Gc::default();
        let name = gc.intern("Node");
        let class = gc.alloc(ObjectClass { name });
        let a = gc.alloc(ObjectInstance::new(class));
        let b = gc.alloc(ObjectInstance::new(class));
        let next = gc.intern("next");
        let key = gc.str_key(next);
        gc.instance_mut(a).fields.set(key, b.into());
        gc.instance_mut(b).fields.set(key, a.into());

        collect(&mut gc, &[a]);
        assert!(gc.contains(a));
        assert!(gc.contains(b));
        assert!(gc.contains(class));
        assert!(gc.contains(name));
        assert!(gc.contains(next));

        collect(&mut gc, &[]);
        assert!(!gc.contains(a));
        assert!(!gc.contains(b));
        assert_eq!(gc.object_count(), 0);
        assert_eq!(gc.bytes_allocated(), 0);
    }

    #[test]
    fn marking_is_idempotent() {
        let mut gc = Gc::default();
        let a = gc.intern("a");
        gc.mark(a);
        gc.mark(a);
        assert_eq!(gc.gray_objects.len(), 1);
        gc.collect_garbage();
        assert!(gc.contains(a));
    }

    #[test]
    fn display_values() {
        let mut gc = Gc::default();
        let name = gc.intern("Point");
        let class = gc.alloc(ObjectClass { name });
        let instance = gc.alloc(ObjectInstance::new(class));

        assert_eq!(gc.display(Value::Number(3.0)).to_string(), "3");
        assert_eq!(gc.display(Value::Number(2.5)).to_string(), "2.5");
        assert_eq!(gc.display(Value::Null).to_string(), "null");
        assert_eq!(gc.display(Value::TRUE).to_string(), "true");
        assert_eq!(gc.display(name.into()).to_string(), "Point");
        assert_eq!(gc.display(class.into()).to_string(), "Point");
        assert_eq!(gc.display(instance.into()).to_string(), "Point instance");
        assert_eq!(gc.type_name(instance.into()), "instance");
    }
}
