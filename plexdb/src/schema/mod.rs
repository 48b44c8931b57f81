pub mod parser;
pub mod types;

pub use parser::{parse_schema, parse_schema_str, SCHEMA_FILE};
pub use types::*;
