pub mod codec;
pub mod line;
pub mod stdio;
pub mod traits;

pub use codec::JsonLineCodec;
pub use line::LineTransport;
pub use stdio::{StdioTransport, StdioTransportFactory};
pub use traits::{Transport, TransportFactory};
