#![deny(missing_docs)]

//! Error handling for the cellstore workspace.
//!
//! Errors fall into a small taxonomy that mirrors how the persistence core reacts to them:
//! programming errors and configuration overflow abort immediately, schema mismatches and
//! unmatched entities are resolved by the matcher, and IO errors abort the whole run.

mod ext;

use std::backtrace::Backtrace;
use std::borrow::Cow;
use std::fmt::{Debug, Display, Formatter};
use std::ops::Deref;
use std::{env, fmt, io};

pub use ext::*;

/// A string that can be used as an error message.
#[derive(Debug)]
pub struct ErrString(Cow<'static, str>);

#[allow(clippy::fallible_impl_from)]
impl<T> From<T> for ErrString
where
    T: Into<Cow<'static, str>>,
{
    #[allow(clippy::panic)]
    fn from(msg: T) -> Self {
        if env::var("CELLSTORE_PANIC_ON_ERR").as_deref().unwrap_or("") == "1" {
            panic!("{}\nBacktrace:\n{}", msg.into(), Backtrace::capture());
        } else {
            Self(msg.into())
        }
    }
}

impl AsRef<str> for ErrString {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Deref for ErrString {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for ErrString {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// The top-level error type for cellstore.
#[derive(thiserror::Error)]
#[non_exhaustive]
pub enum CellstoreError {
    /// An internal invariant was violated, e.g. a checkpoint without an owner or an
    /// indirect length that was never populated.
    #[error("programming error: {0}\nBacktrace:\n{1}")]
    Programming(ErrString, Box<Backtrace>),
    /// An accumulated length exceeded the representable range.
    #[error("configuration overflow: {0}\nBacktrace:\n{1}")]
    Overflow(ErrString, Box<Backtrace>),
    /// A required header field was missing or a field had an incompatible wire type.
    #[error("schema mismatch: {0}\nBacktrace:\n{1}")]
    SchemaMismatch(ErrString, Box<Backtrace>),
    /// No compatible on-disk block was found for an entity whose restore was mandatory.
    #[error("unmatched entity: {0}\nBacktrace:\n{1}")]
    Unmatched(ErrString, Box<Backtrace>),
    /// An invalid argument was provided.
    #[error("{0}\nBacktrace:\n{1}")]
    InvalidArgument(ErrString, Box<Backtrace>),
    /// A wrapped error with additional context.
    #[error("{0}: {1}")]
    Context(ErrString, Box<CellstoreError>),
    /// A wrapper for IO errors: short reads, failed opens and broken channels.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// A wrapper for timestamp errors from the identification header.
    #[error(transparent)]
    Jiff(#[from] jiff::Error),
    /// A wrapper for JSON errors when loading model descriptions.
    #[cfg(feature = "serde")]
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl CellstoreError {
    /// Adds additional context to an error.
    pub fn with_context<T: Into<ErrString>>(self, msg: T) -> Self {
        CellstoreError::Context(msg.into(), Box::new(self))
    }

    /// Returns the innermost error, looking through any [`CellstoreError::Context`] layers.
    pub fn root(&self) -> &CellstoreError {
        match self {
            CellstoreError::Context(_, inner) => inner.root(),
            other => other,
        }
    }

    /// Whether the root cause is a [`CellstoreError::SchemaMismatch`].
    pub fn is_schema_mismatch(&self) -> bool {
        matches!(self.root(), CellstoreError::SchemaMismatch(..))
    }
}

impl Debug for CellstoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

/// A type alias for Results that return [`CellstoreError`]s as their error type.
pub type CellstoreResult<T> = Result<T, CellstoreError>;

/// A convenient macro for creating a [`CellstoreError`].
#[macro_export]
macro_rules! cellstore_err {
    ($variant:ident: $fmt:literal $(, $arg:expr)* $(,)?) => {{
        use std::backtrace::Backtrace;
        $crate::__private::must_use(
            $crate::CellstoreError::$variant(format!($fmt, $($arg),*).into(), Box::new(Backtrace::capture()))
        )
    }};
    ($variant:ident: $err:expr $(,)?) => {{
        use std::backtrace::Backtrace;
        $crate::__private::must_use(
            $crate::CellstoreError::$variant($err.into(), Box::new(Backtrace::capture()))
        )
    }};
    ($fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::cellstore_err!(InvalidArgument: $fmt, $($arg),*)
    };
}

/// A convenient macro for returning a [`CellstoreError`].
#[macro_export]
macro_rules! cellstore_bail {
    ($($tt:tt)+) => {
        return Err($crate::cellstore_err!($($tt)+))
    };
}

/// A convenient macro for panicking with a [`CellstoreError`] in the presence of a programmer
/// error (e.g., an invariant has been violated).
#[macro_export]
macro_rules! cellstore_panic {
    ($variant:ident: $fmt:literal $(, $arg:expr)* $(,)?) => {{
        let err = $crate::cellstore_err!($variant: $fmt, $($arg),*);
        $crate::cellstore_panic!(err)
    }};
    ($err:expr, $fmt:literal $(, $arg:expr)* $(,)?) => {{
        let err: $crate::CellstoreError = $err;
        $crate::cellstore_panic!(err.with_context(format!($fmt, $($arg),*)))
    }};
    ($fmt:literal $(, $arg:expr)* $(,)?) => {
        $crate::cellstore_panic!(Programming: $fmt, $($arg),*)
    };
    ($err:expr) => {{
        #[allow(clippy::panic)]
        {
            let err: $crate::CellstoreError = $err;
            panic!("{}", err)
        }
    }};
}

/// A trait for unwrapping a result or option, panicking with a [`CellstoreError`] on failure.
pub trait CellstoreExpect {
    /// The type of the value being unwrapped.
    type Output;

    /// Returns the value of the result if it is Ok, otherwise panics with the error.
    /// Should be called only in contexts where the error condition represents a bug
    /// (programmer error).
    fn cellstore_expect(self, msg: &str) -> Self::Output;
}

impl<T, E> CellstoreExpect for Result<T, E>
where
    E: Into<CellstoreError>,
{
    type Output = T;

    #[inline(always)]
    fn cellstore_expect(self, msg: &str) -> Self::Output {
        self.map_err(Into::<CellstoreError>::into)
            .unwrap_or_else(|e| cellstore_panic!(e.with_context(msg.to_string())))
    }
}

impl<T> CellstoreExpect for Option<T> {
    type Output = T;

    #[inline(always)]
    fn cellstore_expect(self, msg: &str) -> Self::Output {
        self.unwrap_or_else(|| {
            let err =
                CellstoreError::Programming(msg.to_string().into(), Box::new(Backtrace::capture()));
            cellstore_panic!(err)
        })
    }
}

#[doc(hidden)]
pub mod __private {
    #[doc(hidden)]
    #[inline]
    #[must_use]
    pub const fn must_use(error: crate::CellstoreError) -> crate::CellstoreError {
        error
    }
}
