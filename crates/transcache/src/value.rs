//! Opaque value holder and the deep-clone capability

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};

/// Capability for cached values that can produce an independent deep copy.
///
/// Values stored through [`Value::cloneable`] become readable through
/// `TransCache::get_cloned`; the copy must not share mutable state with the
/// original.
pub trait Cloneable: Any + Send + Sync {
    /// Produce an independent copy of the value.
    fn deep_clone(&self) -> Result<Value>;

    /// Upcast used by [`Value::downcast_ref`].
    fn as_any(&self) -> &dyn Any;
}

enum Holder {
    Opaque(Box<dyn Any + Send + Sync>),
    Cloneable(Box<dyn Cloneable>),
}

/// Handle to a cached value.
///
/// A `Value` is nil, an arbitrary opaque object, or an object carrying the
/// [`Cloneable`] capability. Cloning a `Value` is cheap and shares the
/// underlying object; the cache itself never mutates it.
#[derive(Clone, Default)]
pub struct Value(Option<Arc<Holder>>);

impl Value {
    /// The nil value. A cached nil is distinct from an absent item.
    pub fn nil() -> Self {
        Value(None)
    }

    /// Wrap an arbitrary object without the clone capability.
    pub fn opaque<T: Any + Send + Sync>(v: T) -> Self {
        Value(Some(Arc::new(Holder::Opaque(Box::new(v)))))
    }

    /// Wrap an object that supports [`Cloneable::deep_clone`].
    pub fn cloneable<T: Cloneable>(v: T) -> Self {
        Value(Some(Arc::new(Holder::Cloneable(Box::new(v)))))
    }

    /// True when the value is nil.
    pub fn is_nil(&self) -> bool {
        self.0.is_none()
    }

    /// Borrow the underlying object as `T`, if it has that type.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self.0.as_deref()? {
            Holder::Opaque(b) => (&**b as &dyn Any).downcast_ref(),
            Holder::Cloneable(b) => b.as_any().downcast_ref(),
        }
    }

    /// Deep-copy the value through its [`Cloneable`] capability.
    ///
    /// Nil clones to nil. Opaque values fail with [`Error::NotClonable`].
    /// Errors from the capability itself propagate unchanged.
    pub fn deep_clone(&self) -> Result<Value> {
        match self.0.as_deref() {
            None => Ok(Value::nil()),
            Some(Holder::Cloneable(b)) => b.deep_clone(),
            Some(Holder::Opaque(_)) => Err(Error::NotClonable),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.as_deref() {
            None => f.write_str("Value(nil)"),
            Some(Holder::Opaque(_)) => f.write_str("Value(opaque)"),
            Some(Holder::Cloneable(_)) => f.write_str("Value(cloneable)"),
        }
    }
}
