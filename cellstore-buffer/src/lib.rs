#![deny(missing_docs)]

//! Alignment arithmetic and fixed-width byte helpers for cellstore.
//!
//! # Alignment
//!
//! Record layouts place every fixed-length field at a multiple of its documented alignment
//! (see [`Alignment::of_length`]). Variable-length fields never force alignment; enclosing
//! scopes pad to the widest alignment reported by the fields they contain.

mod alignment;
mod fixed;

pub use alignment::*;
pub use fixed::*;
