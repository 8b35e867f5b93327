//! Defines the field, polynomial and root finding algebra used by the mixing
//! rounds

mod field;
pub use field::*;
mod poly;
pub use poly::*;

pub mod graeffe;
pub mod newton;

mod macros;
