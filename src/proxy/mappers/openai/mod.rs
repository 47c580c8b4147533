pub mod models;
pub mod request;
pub mod streaming;

pub use request::{openai_to_claude_request, claude_to_openai_response};
pub use streaming::create_openai_sse_stream;
