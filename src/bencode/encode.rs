use super::value::Value;
use bytes::{BufMut, Bytes, BytesMut};

/// Encodes a bencode value into its canonical byte form.
///
/// Dictionaries encode with keys in lexicographic order (the `BTreeMap`
/// iteration order), so re-encoding a decoded canonical value reproduces
/// the original bytes. The info-hash computation relies on this.
///
/// # Examples
///
/// ```
/// use snarl::bencode::{encode, Value};
///
/// assert_eq!(&encode(&Value::Integer(42))[..], b"i42e");
/// assert_eq!(&encode(&Value::string("hello"))[..], b"5:hello");
/// ```
pub fn encode(value: &Value) -> Bytes {
    let mut buf = BytesMut::new();
    encode_into(value, &mut buf);
    buf.freeze()
}

fn encode_into(value: &Value, buf: &mut BytesMut) {
    match value {
        Value::Integer(i) => {
            buf.put_u8(b'i');
            buf.put_slice(i.to_string().as_bytes());
            buf.put_u8(b'e');
        }
        Value::Bytes(b) => {
            buf.put_slice(b.len().to_string().as_bytes());
            buf.put_u8(b':');
            buf.put_slice(b);
        }
        Value::List(l) => {
            buf.put_u8(b'l');
            for item in l {
                encode_into(item, buf);
            }
            buf.put_u8(b'e');
        }
        Value::Dict(d) => {
            buf.put_u8(b'd');
            for (key, val) in d {
                buf.put_slice(key.len().to_string().as_bytes());
                buf.put_u8(b':');
                buf.put_slice(key);
                encode_into(val, buf);
            }
            buf.put_u8(b'e');
        }
    }
}
