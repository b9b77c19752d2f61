//! Logic Module - agent engines
//!
//! - `collector` - system monitor producer
//! - `connections` - socket-table producer
//! - `record` - wire records shared by both producers
//! - `crypto` - frame sealing
//! - `sender` - framed, reconnecting delivery to the server

pub mod collector;
pub mod connections;
pub mod crypto;
pub mod record;
pub mod sender;
