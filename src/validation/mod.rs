pub mod engine;

pub use engine::{check_required_fields, ValidationEngine};
