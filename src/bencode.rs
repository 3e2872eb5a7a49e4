//! Bencode encoding and decoding ([BEP-3]).
//!
//! Bencode is the serialization format used throughout BitTorrent: torrent
//! files, extension-protocol handshakes, and metadata-exchange payloads are
//! all bencoded. Four data types exist:
//!
//! | Type | Format | Example |
//! |------|--------|---------|
//! | Integer | `i<number>e` | `i42e` → 42 |
//! | Byte String | `<length>:<data>` | `4:spam` → "spam" |
//! | List | `l<items>e` | `l4:spami42ee` → ["spam", 42] |
//! | Dictionary | `d<key><value>...e` | `d3:foo3:bare` → {"foo": "bar"} |
//!
//! [`decode`] requires the input to be exactly one value. [`decode_prefix`]
//! decodes a value from the front of a buffer and reports how many bytes it
//! consumed, which is what metadata-exchange messages need (a bencoded dict
//! followed by raw piece bytes).
//!
//! # Examples
//!
//! ```
//! use snarl::bencode::{decode, encode, Value};
//!
//! let value = decode(b"d3:foo3:bare").unwrap();
//! assert_eq!(value.get(b"foo").and_then(|v| v.as_str()), Some("bar"));
//!
//! let encoded = encode(&Value::List(vec![Value::Integer(1), Value::string("two")]));
//! assert_eq!(&encoded[..], b"li1e3:twoe");
//! ```
//!
//! [BEP-3]: http://bittorrent.org/beps/bep_0003.html

mod decode;
mod encode;
mod error;
mod value;

pub use decode::{decode, decode_prefix};
pub use encode::encode;
pub use error::BencodeError;
pub use value::Value;

#[cfg(test)]
mod tests;
