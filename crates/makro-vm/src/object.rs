use std::fmt::{self, Debug, Display, Formatter};
use std::mem;

use crate::chunk::Chunk;
use crate::gc::{hash_str, Gc, ObjectRef, Trace};
use crate::native::NativeFn;
use crate::table::Table;
use crate::value::Value;

/// A heap object. Every variant is owned by the [`Gc`] arena and addressed
/// through an [`ObjectRef`].
#[derive(Debug)]
pub enum Object {
    Class(ObjectClass),
    Closure(ObjectClosure),
    Function(ObjectFunction),
    Instance(ObjectInstance),
    Native(ObjectNative),
    String(ObjectString),
    Upvalue(ObjectUpvalue),
}

impl Object {
    pub fn type_(&self) -> ObjectType {
        match self {
            Object::Class(_) => ObjectType::Class,
            Object::Closure(_) => ObjectType::Closure,
            Object::Function(_) => ObjectType::Function,
            Object::Instance(_) => ObjectType::Instance,
            Object::Native(_) => ObjectType::Native,
            Object::String(_) => ObjectType::String,
            Object::Upvalue(_) => ObjectType::Upvalue,
        }
    }

    /// Approximate number of bytes owned by this object, used to pace the
    /// collector.
    pub fn size(&self) -> usize {
        let extra = match self {
            Object::Closure(closure) => closure.upvalues.capacity() * mem::size_of::<ObjectRef>(),
            Object::Function(function) => function.chunk.size(),
            Object::Instance(instance) => instance.fields.size(),
            Object::String(string) => string.value.len(),
            Object::Class(_) | Object::Native(_) | Object::Upvalue(_) => 0,
        };
        mem::size_of::<Object>() + extra
    }
}

impl Trace for Object {
    fn trace(&self, gc: &mut Gc) {
        match self {
            Object::Class(class) => class.trace(gc),
            Object::Closure(closure) => closure.trace(gc),
            Object::Function(function) => function.trace(gc),
            Object::Instance(instance) => instance.trace(gc),
            Object::Upvalue(upvalue) => upvalue.trace(gc),
            Object::Native(_) | Object::String(_) => {}
        }
    }
}

macro_rules! impl_from_object {
    ($($variant:ident($type_:ty)),+) => {$(
        impl From<$type_> for Object {
            fn from(object: $type_) -> Self {
                Object::$variant(object)
            }
        }
    )+};
}

impl_from_object!(
    Class(ObjectClass),
    Closure(ObjectClosure),
    Function(ObjectFunction),
    Instance(ObjectInstance),
    Native(ObjectNative),
    String(ObjectString),
    Upvalue(ObjectUpvalue)
);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ObjectType {
    Class,
    Closure,
    Function,
    Instance,
    Native,
    String,
    Upvalue,
}

impl ObjectType {
    /// The name used for this type in error messages.
    pub fn name(self) -> &'static str {
        match self {
            ObjectType::Class => "class",
            ObjectType::Closure | ObjectType::Function => "function",
            ObjectType::Instance => "instance",
            ObjectType::Native => "native",
            ObjectType::String => "string",
            ObjectType::Upvalue => "upvalue",
        }
    }
}

impl Display for ObjectType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug)]
pub struct ObjectClass {
    pub name: ObjectRef,
}

impl Trace for ObjectClass {
    fn trace(&self, gc: &mut Gc) {
        gc.mark(self.name);
    }
}

/// A function together with the variables it captured.
#[derive(Debug)]
pub struct ObjectClosure {
    pub function: ObjectRef,
    pub upvalues: Vec<ObjectRef>,
}

impl Trace for ObjectClosure {
    fn trace(&self, gc: &mut Gc) {
        gc.mark(self.function);
        for &upvalue in &self.upvalues {
            gc.mark(upvalue);
        }
    }
}

#[derive(Debug, Default)]
pub struct ObjectFunction {
    /// `None` for the top-level script.
    pub name: Option<ObjectRef>,
    pub arity: u8,
    pub upvalue_count: u16,
    pub chunk: Chunk,
}

impl Trace for ObjectFunction {
    fn trace(&self, gc: &mut Gc) {
        if let Some(name) = self.name {
            gc.mark(name);
        }
        self.chunk.trace(gc);
    }
}

#[derive(Debug)]
pub struct ObjectInstance {
    pub class: ObjectRef,
    pub fields: Table,
}

impl ObjectInstance {
    pub fn new(class: ObjectRef) -> Self {
        Self { class, fields: Table::default() }
    }
}

impl Trace for ObjectInstance {
    fn trace(&self, gc: &mut Gc) {
        gc.mark(self.class);
        self.fields.trace(gc);
    }
}

pub struct ObjectNative {
    pub name: &'static str,
    pub function: NativeFn,
}

impl Debug for ObjectNative {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectNative").field("name", &self.name).finish_non_exhaustive()
    }
}

/// An immutable, interned string. The hash is computed once, at creation.
#[derive(Debug)]
pub struct ObjectString {
    pub value: Box<str>,
    pub hash: u32,
}

impl ObjectString {
    pub fn new(value: impl Into<Box<str>>) -> Self {
        let value = value.into();
        let hash = hash_str(&value);
        Self { value, hash }
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }
}

impl Display for ObjectString {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

/// A captured variable. While open it names a slot on the VM stack; once
/// the slot goes out of scope the value moves into the upvalue itself.
#[derive(Debug)]
pub enum ObjectUpvalue {
    Open(usize),
    Closed(Value),
}

impl Trace for ObjectUpvalue {
    fn trace(&self, gc: &mut Gc) {
        if let ObjectUpvalue::Closed(value) = self {
            value.trace(gc);
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn string_hash_is_cached() {
        let string = ObjectString::new("foobar");
        assert_eq!(string.hash, hash_str("foobar"));
        assert_eq!(string.to_string(), "foobar");
    }

    #[test]
    fn closed_upvalue_keeps_value_alive() {
        let mut gc = Gc::default();
        let value = gc.intern("captured");
        let upvalue = gc.alloc(ObjectUpvalue::Closed(value.into()));
        let open = gc.alloc(ObjectUpvalue::Open(0));

        gc.mark(upvalue);
        gc.mark(open);
        gc.collect_garbage();

        assert!(gc.contains(value));
        assert!(gc.contains(open));
        assert_eq!(gc.get(upvalue).type_(), ObjectType::Upvalue);
    }

    #[test]
    fn size_accounts_for_payload() {
        let short = Object::from(ObjectString::new("a"));
        let long = Object::from(ObjectString::new("a".repeat(100)));
        assert_eq!(long.size() - short.size(), 99);
    }
}
