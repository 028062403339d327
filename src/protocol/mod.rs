//! Pure encode / decode of the wire format. No I/O, no state - the collector
//!  and the client both build on these types.

pub mod frame;
pub mod mac_addr;
pub mod message_kind;
