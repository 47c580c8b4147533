pub mod json_schema;
pub mod model_mapping;
pub mod utils;
