//! Shared identifiers, entities, and the error taxonomy. Every other module
//! depends on this one; it depends on nothing else in the crate.

mod entities;
mod error;
mod ids;

pub use entities::*;
pub use error::*;
pub use ids::*;
