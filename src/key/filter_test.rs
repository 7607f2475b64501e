use super::*;
use crate::key::{Key, Segment};

fn key_of(segs: &[Segment]) -> Key {
    let mut key = Key::new();
    for seg in segs.iter() {
        key.append(seg.clone()).unwrap();
    }
    key
}

#[test]
fn test_filter_parse_idempotent() {
    let texts = [
        "{*}",
        "{10}",
        "{\"abc\",*}",
        "{[10:20],*}",
        "{(10:20)}",
        "{[10:20)}",
        "{[:20]}",
        "{[10:]}",
        "{true,false,null}",
        "{1.5f}",
        "{0xA0B1}",
    ];
    for text in texts.iter() {
        let filter = KeyFilter::parse(text).unwrap();
        let printed = filter.to_string();
        assert_eq!(&printed, text, "parse/print {}", text);
        // a second round through the parser is a fixpoint.
        let again = KeyFilter::parse(&printed).unwrap();
        assert_eq!(again.to_string(), printed);
    }
}

#[test]
fn test_filter_selected() {
    let filter = KeyFilter::parse("{[10:20],*}").unwrap();

    assert!(filter.selected(&key_of(&[Segment::Integer(10), Segment::Integer(0)])));
    assert!(filter.selected(&key_of(&[Segment::Integer(20), Segment::Null])));
    assert!(!filter.selected(&key_of(&[Segment::Integer(9), Segment::Null])));
    assert!(!filter.selected(&key_of(&[Segment::Integer(21), Segment::Null])));
    // shallower than the filter is rejected.
    assert!(!filter.selected(&key_of(&[Segment::Integer(15)])));
    // deeper than the filter is accepted.
    assert!(filter.selected(&key_of(&[
        Segment::Integer(15),
        Segment::Null,
        Segment::Bool(true)
    ])));
}

#[test]
fn test_filter_exclusive_bounds() {
    let filter = KeyFilter::parse("{(10:20)}").unwrap();
    assert!(!filter.selected(&key_of(&[Segment::Integer(10)])));
    assert!(filter.selected(&key_of(&[Segment::Integer(11)])));
    assert!(filter.selected(&key_of(&[Segment::Integer(19)])));
    assert!(!filter.selected(&key_of(&[Segment::Integer(20)])));
}

#[test]
fn test_filter_next_forward() {
    let filter = KeyFilter::parse("{[10:20]}").unwrap();

    // below the range, the leap lands at the low edge.
    let key = key_of(&[Segment::Integer(5)]);
    let pos = filter.next(&key, true).unwrap();
    let edge = key_of(&[Segment::Integer(10)]);
    assert!(pos.as_bytes() <= edge.as_bytes());
    assert!(pos.as_bytes() > key.as_bytes());

    // above the range, no further key can match.
    let key = key_of(&[Segment::Integer(21)]);
    // leap either exhausts or moves strictly forward.
    if let Some(pos) = filter.next(&key, true) {
        assert!(pos.as_bytes() > key.as_bytes());
    }
}

#[test]
fn test_filter_next_boundary() {
    // a key at the exact upper bound of a rejected (exclusive) term
    // must leap into the next accepted region, not loop in place.
    let filter = KeyFilter::parse("{[10:20),*}").unwrap();
    let key = key_of(&[Segment::Integer(20), Segment::Null]);
    assert!(!filter.selected(&key));
    if let Some(pos) = filter.next(&key, true) {
        assert!(pos.as_bytes() != key.as_bytes());
    }
}

#[test]
fn test_filter_multi_depth_leap() {
    let filter = KeyFilter::parse("{5,[10:20]}").unwrap();
    // wrong first segment leaps over the whole subtree.
    let key = key_of(&[Segment::Integer(4), Segment::Integer(15)]);
    let pos = filter.next(&key, true).unwrap();
    let target = key_of(&[Segment::Integer(5), Segment::Integer(10)]);
    assert!(pos.as_bytes() > key.as_bytes());
    assert!(pos.as_bytes() <= target.as_bytes());
}

#[test]
fn test_filter_parse_errors() {
    assert!(KeyFilter::parse("10,20").is_err());
    assert!(KeyFilter::parse("{[10-20]}").is_err());
    assert!(KeyFilter::parse("{\"unterminated}").is_err());
}
