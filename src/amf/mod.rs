//! AMF0 serialization for RTMP command and data messages
//!
//! Publishing only needs AMF0: `connect`, `createStream`, `publish` and the
//! `@setDataFrame` metadata are all AMF0-encoded, and servers answer in AMF0
//! as long as `objectEncoding` is 0.

pub mod amf0;
pub mod value;

pub use amf0::{Amf0Decoder, Amf0Encoder};
pub use value::AmfValue;
