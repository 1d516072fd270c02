pub mod content;
pub use content::{Annotations, Content, EmbeddedResource, ImageContent, TextContent};
pub mod handler;
pub use handler::ToolError;
pub mod protocol;
pub mod role;
pub mod tool;
pub use tool::{Tool, ToolAnnotations};
