use std::collections::BTreeMap;

use bytes::Bytes;

use super::*;

#[test]
fn decodes_integers() {
    assert_eq!(decode(b"i42e").unwrap(), Value::Int(42));
    assert_eq!(decode(b"i-42e").unwrap(), Value::Int(-42));
    assert_eq!(decode(b"i0e").unwrap(), Value::Int(0));
}

#[test]
fn rejects_malformed_integers() {
    let cases: &[&[u8]] = &[
        b"i-0e",
        b"i03e",
        b"ie",
        b"i-e",
        b"i42",
        b"i12x4e",
        // One past i64::MAX.
        b"i9223372036854775808e",
    ];
    for case in cases {
        assert!(decode(case).is_err(), "{:?} should fail", case);
    }
}

#[test]
fn decodes_strings() {
    assert_eq!(
        decode(b"4:spam").unwrap(),
        Value::Bytes(Bytes::from_static(b"spam"))
    );
    assert_eq!(decode(b"0:").unwrap(), Value::Bytes(Bytes::from_static(b"")));
}

#[test]
fn rejects_bad_string_lengths() {
    assert!(decode(b"10:short").is_err());
    assert!(decode(b"4").is_err());
    assert!(decode(b"4spam").is_err());
    // A length prefix near usize::MAX must not overflow the cursor.
    assert!(decode(b"18446744073709551615:x").is_err());
}

#[test]
fn decodes_lists() {
    let value = decode(b"l4:spami42ee").unwrap();
    let items = value.as_list().unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].as_bytes(), Some(b"spam".as_slice()));
    assert_eq!(items[1].as_int(), Some(42));
}

#[test]
fn decodes_dicts() {
    let value = decode(b"d3:cow3:moo4:spam4:eggse").unwrap();
    let entries = value.as_dict().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(value.utf8_at(b"cow"), Some("moo"));
    assert_eq!(value.utf8_at(b"spam"), Some("eggs"));
}

#[test]
fn first_key_occurrence_wins() {
    // A repeated key must not overwrite the first occurrence.
    let value = decode(b"d3:key5:first3:key6:seconde").unwrap();
    assert_eq!(value.utf8_at(b"key"), Some("first"));
}

#[test]
fn rejects_non_string_keys() {
    assert_eq!(decode(b"di5ei6ee").unwrap_err(), BencodeError::NonStringKey);
    assert!(decode(b"di5e").is_err());
}

#[test]
fn encodes_canonically() {
    assert_eq!(encode(&Value::Int(42)), b"i42e");
    assert_eq!(encode(&Value::Int(-42)), b"i-42e");
    assert_eq!(encode(&Value::Bytes(Bytes::from_static(b"spam"))), b"4:spam");

    let mut entries = BTreeMap::new();
    entries.insert(Bytes::from_static(b"zz"), Value::Int(1));
    entries.insert(Bytes::from_static(b"aa"), Value::Int(2));
    // Keys come out sorted regardless of insertion order.
    assert_eq!(encode(&Value::Dict(entries)), b"d2:aai2e2:zzi1ee");
}

#[test]
fn roundtrip() {
    let cases: &[&[u8]] = &[
        b"i42e",
        b"4:spam",
        b"l4:spami42ee",
        b"d8:announce15:http://test.com4:infod4:name4:test12:piece lengthi16384eee",
        b"d4:listl4:spami42eee",
    ];
    for case in cases {
        let decoded = decode(case).unwrap();
        assert_eq!(encode(&decoded), *case);
    }
}

#[test]
fn rejects_trailing_bytes() {
    assert_eq!(
        decode(b"i42eextra").unwrap_err(),
        BencodeError::TrailingBytes(5)
    );
}

#[test]
fn prefix_reports_split_point() {
    let payload = b"d5:piecei0ee<raw piece bytes>";
    let (value, used) = decode_prefix(payload).unwrap();
    assert_eq!(used, 12);
    assert_eq!(value.int_at(b"piece"), Some(0));
    assert_eq!(&payload[used..], b"<raw piece bytes>");
}

#[test]
fn depth_is_bounded() {
    let mut deep = Vec::new();
    deep.extend(std::iter::repeat(b'l').take(100));
    deep.extend(std::iter::repeat(b'e').take(100));
    assert!(matches!(decode(&deep), Err(BencodeError::TooDeep(_))));
}

#[test]
fn typed_accessors() {
    let value = decode(b"d3:agei30e4:name5:Alice4:tagsl1:xee").unwrap();
    assert_eq!(value.int_at(b"age"), Some(30));
    assert_eq!(value.utf8_at(b"name"), Some("Alice"));
    assert_eq!(value.bytes_at(b"name"), Some(b"Alice".as_slice()));
    assert_eq!(value.list_at(b"tags").map(|items| items.len()), Some(1));
    // Type mismatches and absent keys are both just None.
    assert_eq!(value.int_at(b"name"), None);
    assert_eq!(value.get(b"missing"), None);

    assert!(Value::Int(1).as_bytes().is_none());
    assert_eq!(Value::text("hi").as_utf8(), Some("hi"));
    assert!(Value::List(vec![]).as_dict().is_none());
}
