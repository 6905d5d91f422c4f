//! Response metadata for delivered media. Nothing here touches the byte
//! stream itself.

pub mod disposition;
