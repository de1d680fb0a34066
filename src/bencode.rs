//! Bencode codec for KRPC datagrams and extension-protocol payloads.

mod decode;
mod encode;
mod error;
mod value;

#[cfg(test)]
mod tests;

pub use decode::{decode, decode_prefix};
pub use encode::encode;
pub use error::BencodeError;
pub use value::Value;
