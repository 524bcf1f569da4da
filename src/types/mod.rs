mod context;
mod schema;
mod value;

pub use context::{Context, TARGETING_KEY};
pub use schema::{Mismatch, Schema, TypeMismatch};
pub use value::Value;
