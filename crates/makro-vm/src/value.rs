use crate::gc::{Gc, ObjectRef, Trace};

/// The universal operand type. Copying a [`Value`] never allocates; heap
/// objects are referred to by handle.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum Value {
    Bool(bool),
    #[default]
    Null,
    Number(f64),
    Object(ObjectRef),
}

impl Value {
    pub const TRUE: Self = Self::Bool(true);
    pub const FALSE: Self = Self::Bool(false);

    /// `null` and `false` are falsey, everything else is truthy.
    pub fn is_falsey(self) -> bool {
        matches!(self, Value::Null | Value::Bool(false))
    }

    pub fn as_number(self) -> Option<f64> {
        match self {
            Value::Number(number) => Some(number),
            _ => None,
        }
    }

    pub fn as_object(self) -> Option<ObjectRef> {
        match self {
            Value::Object(object) => Some(object),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(bool: bool) -> Self {
        Value::Bool(bool)
    }
}

impl From<f64> for Value {
    fn from(number: f64) -> Self {
        Value::Number(number)
    }
}

impl From<ObjectRef> for Value {
    fn from(object: ObjectRef) -> Self {
        Value::Object(object)
    }
}

impl Trace for Value {
    fn trace(&self, gc: &mut Gc) {
        if let Value::Object(object) = self {
            gc.mark(*object);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falsey_values() {
        assert!(Value::Null.is_falsey());
        assert!(Value::FALSE.is_falsey());
        assert!(!Value::TRUE.is_falsey());
        assert!(!Value::Number(0.0).is_falsey());
    }

    #[test]
    fn equality_is_by_value_or_identity() {
        let mut gc = Gc::default();
        let foo = gc.intern("foo");
        let bar = gc.intern("bar");

        assert_eq!(Value::Number(1.0), Value::Number(1.0));
        assert_eq!(Value::Null, Value::Null);
        assert_ne!(Value::Null, Value::FALSE);
        assert_ne!(Value::Number(0.0), Value::FALSE);
        assert_eq!(Value::from(foo), Value::from(gc.intern("foo")));
        assert_ne!(Value::from(foo), Value::from(bar));
    }
}
