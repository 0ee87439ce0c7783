use crate::{CellstoreResult, ErrString};

/// Extension trait for CellstoreResult
pub trait ResultExt<T>: private::Sealed {
    /// Wrap the error, if any, in a [`crate::CellstoreError::Context`] whose message is only
    /// built on failure.
    fn with_context<M: Into<ErrString>>(self, msg: impl FnOnce() -> M) -> CellstoreResult<T>;
}

mod private {
    use crate::CellstoreResult;

    pub trait Sealed {}

    impl<T> Sealed for CellstoreResult<T> {}
}

impl<T> ResultExt<T> for CellstoreResult<T> {
    fn with_context<M: Into<ErrString>>(self, msg: impl FnOnce() -> M) -> CellstoreResult<T> {
        self.map_err(|e| e.with_context(msg()))
    }
}
