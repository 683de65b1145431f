//! Type-erased handler output

use std::any::Any;

/// Value produced by a handler. Callers of `ask` downcast it to the type the
/// query promises.
pub struct Reply(Box<dyn Any + Send>);

impl Reply {
    pub fn new<T: Any + Send>(value: T) -> Self {
        Self(Box::new(value))
    }

    /// Reply for handlers with nothing to report
    pub fn empty() -> Self {
        Self::new(())
    }

    pub fn is<T: Any>(&self) -> bool {
        self.0.is::<T>()
    }

    pub fn downcast<T: Any>(self) -> Result<T, Self> {
        self.0.downcast::<T>().map(|v| *v).map_err(Reply)
    }
}

impl std::fmt::Debug for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Reply(..)")
    }
}
