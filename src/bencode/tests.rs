use super::*;
use bytes::Bytes;
use std::collections::BTreeMap;

#[test]
fn test_decode_integer() {
    assert_eq!(decode(b"i42e").unwrap().as_integer(), Some(42));
    assert_eq!(decode(b"i-7e").unwrap().as_integer(), Some(-7));
    assert_eq!(decode(b"i0e").unwrap().as_integer(), Some(0));
}

#[test]
fn test_decode_integer_rejects_leading_zeros() {
    assert!(decode(b"i01e").is_err());
    assert!(decode(b"i-0e").is_err());
    assert!(decode(b"ie").is_err());
}

#[test]
fn test_decode_bytes() {
    let value = decode(b"4:spam").unwrap();
    assert_eq!(value.as_str(), Some("spam"));
    assert_eq!(decode(b"0:").unwrap().as_bytes().map(|b| b.len()), Some(0));
}

#[test]
fn test_decode_bytes_truncated() {
    assert!(decode(b"5:spam").is_err());
    assert!(decode(b"4spam").is_err());
}

#[test]
fn test_decode_list() {
    let value = decode(b"l4:spami42ee").unwrap();
    let list = value.as_list().unwrap();
    assert_eq!(list.len(), 2);
    assert_eq!(list[0].as_str(), Some("spam"));
    assert_eq!(list[1].as_integer(), Some(42));
}

#[test]
fn test_decode_dict() {
    let value = decode(b"d3:bari1e3:foo3:baze").unwrap();
    assert_eq!(value.get(b"bar").and_then(|v| v.as_integer()), Some(1));
    assert_eq!(value.get(b"foo").and_then(|v| v.as_str()), Some("baz"));
    assert_eq!(value.get(b"missing"), None);
}

#[test]
fn test_decode_dict_rejects_non_string_key() {
    assert!(decode(b"di1ei2ee").is_err());
}

#[test]
fn test_decode_rejects_trailing_data() {
    assert!(matches!(
        decode(b"i42eX"),
        Err(BencodeError::TrailingData)
    ));
}

#[test]
fn test_decode_prefix_leaves_trailing_data() {
    let (value, consumed) = decode_prefix(b"d5:piecei0eeRAWDATA").unwrap();
    assert_eq!(value.get(b"piece").and_then(|v| v.as_integer()), Some(0));
    assert_eq!(consumed, 12);
    assert_eq!(&b"d5:piecei0eeRAWDATA"[consumed..], b"RAWDATA");
}

#[test]
fn test_decode_nesting_limit() {
    let mut data = Vec::new();
    data.extend(std::iter::repeat(b'l').take(200));
    data.extend(std::iter::repeat(b'e').take(200));
    assert!(matches!(
        decode(&data),
        Err(BencodeError::NestingTooDeep)
    ));
}

#[test]
fn test_encode_roundtrip() {
    let mut info = BTreeMap::new();
    info.insert(Bytes::from_static(b"length"), Value::Integer(1024));
    info.insert(Bytes::from_static(b"name"), Value::string("example.txt"));
    let value = Value::Dict(info);

    let encoded = encode(&value);
    assert_eq!(&encoded[..], b"d6:lengthi1024e4:name11:example.txte");
    assert_eq!(decode(&encoded).unwrap(), value);
}

#[test]
fn test_encode_sorts_dict_keys() {
    let mut dict = Value::dict();
    dict.insert(b"zz", Value::Integer(1));
    dict.insert(b"aa", Value::Integer(2));
    assert_eq!(&encode(&dict)[..], b"d2:aai2e2:zzi1ee");
}

#[test]
fn test_canonical_reencode_is_identity() {
    let original = b"d4:infod6:lengthi3e4:name1:a12:piece lengthi2eee";
    let decoded = decode(original).unwrap();
    assert_eq!(&encode(&decoded)[..], &original[..]);
}
