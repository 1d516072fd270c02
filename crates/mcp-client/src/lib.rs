pub mod client;
pub mod service;
pub mod transport;

pub use client::{Error, McpClient, McpClientTrait};
pub use service::McpService;
pub use transport::{StdioTransport, StreamableHttpTransport, Transport, TransportHandle};
