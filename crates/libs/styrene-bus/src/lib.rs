//! # styrene-bus
//!
//! Wire codec for a peer-to-peer message bus: method calls, method
//! returns, errors and signals carried as self-describing binary messages.
//!
//! ## Wire Format
//!
//! ```text
//! [fixed header:16][header fields:header_len][pad to 8][body:body_len]
//!   endian,type,flags,version,body_len,serial,header_len
//! ```
//!
//! Every multi-byte value is written in the byte order named by the first
//! header byte and aligned to its natural boundary from the start of the
//! message. Body values are described by a type signature such as `a{sv}`.
//!
//! ## Example
//!
//! ```rust
//! use styrene_bus::{Arg, CodecConfig, HeaderChecks, Message, MessageBuilder};
//!
//! let call = MessageBuilder::method_call("com.example.Foo", "/obj", "com.example.Iface", "Ping")
//!     .serial(1)
//!     .args("s", vec![Arg::string("hello").unwrap()])
//!     .build()
//!     .unwrap();
//! let decoded = Message::from_wire(call.as_bytes().to_vec(), &HeaderChecks::default()).unwrap();
//! assert_eq!(decoded.member(), "Ping");
//! # let _ = CodecConfig::default();
//! ```

pub mod arg;
pub mod buffer;
pub mod checks;
pub mod config;
pub mod context;
pub mod crypt;
pub mod error;
pub mod header;
pub mod io;
mod marshal;
pub mod message;
pub mod names;
pub mod signature;
mod unmarshal;

pub use arg::{Arg, ArgArray, FromArg, IntoArg, MAX_ARRAY_LEN};
pub use buffer::{set_outbound_endianness, Endianness};
pub use checks::HeaderChecks;
pub use config::{CodecConfig, EndiannessSetting};
pub use context::BusContext;
pub use crypt::{BodyCipher, CipherContext, SessionKeyCipher};
pub use error::BusError;
pub use header::{HeaderFieldId, HeaderFields, MessageFlags, MessageHeader, MessageType};
pub use io::{IoSink, IoSource, MessageReader, MessageWriter, ReadState, Sink, Source, WriteState};
#[cfg(feature = "tokio")]
pub use io::{read_message_async, write_message_async};
pub use marshal::MAX_ARGS;
pub use message::{Message, MessageBuilder, MAX_PACKET_LEN};
