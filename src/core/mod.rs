//! # Core Components
//!
//! Field values, the serialization engine, and transport packet framing.
//!
//! ## Components
//! - **Value**: the closed set of field types and their binary form
//! - **Serialization**: descriptor registry encoding typed values
//! - **Packet / Codec**: stream framing for transports
//!
//! ## Packet Wire Format
//! ```text
//! [Magic(4)] [Version(1)] [Length(4)] [Payload(N)]
//! ```

pub mod codec;
pub mod packet;
pub mod serialization;
pub mod value;
