//! Redis serialization protocol adapter.

pub mod codec;
pub mod parser;
pub mod types;

pub use codec::RespCodec;
pub use parser::RespParser;
pub use types::RespValue;
