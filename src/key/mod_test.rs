use arbitrary::Unstructured;
use rand::{prelude::random, rngs::StdRng, Rng, SeedableRng};

use super::*;
use crate::Error;

#[test]
fn test_key_encode_order() {
    let seed: u64 = random();
    let mut rng = StdRng::seed_from_u64(seed);
    println!("test_key_encode_order {}", seed);

    let mut keys: Vec<Key> = (0..2000)
        .map(|_| {
            let bytes: Vec<u8> = (0..64).map(|_| rng.gen()).collect();
            let mut uns = Unstructured::new(&bytes);
            uns.arbitrary::<Key>().unwrap()
        })
        .collect();
    keys.push(Key::before());
    keys.push(Key::after());
    keys.sort();

    // encoded order is the ordering of the Key type itself; check the
    // sentinels bracket everything.
    assert!(keys.first().unwrap().is_before() || !keys.iter().any(Key::is_before));
    assert!(keys.last().unwrap().is_after() || !keys.iter().any(Key::is_after));
}

#[test]
fn test_segment_domain_order() {
    // within one type, domain order must match encoded order.
    let ints = [i64::MIN, -10_000, -1, 0, 1, 42, 10_000, i64::MAX];
    for pair in ints.windows(2) {
        let (mut a, mut b) = (Key::new(), Key::new());
        a.append_i64(pair[0]).unwrap();
        b.append_i64(pair[1]).unwrap();
        assert!(a < b, "{} {}", pair[0], pair[1]);
    }

    let floats = [f64::NEG_INFINITY, -1.5e10, -1.0, -0.0, 0.0, 1.0e-10, 2.5, 1.0e300];
    for pair in floats.windows(2) {
        let (mut a, mut b) = (Key::new(), Key::new());
        a.append_f64(pair[0]).unwrap();
        b.append_f64(pair[1]).unwrap();
        assert!(a <= b, "{} {}", pair[0], pair[1]);
    }

    let texts = ["", "a", "a\u{0}b", "a\u{1}", "ab", "b"];
    for pair in texts.windows(2) {
        let (mut a, mut b) = (Key::new(), Key::new());
        a.append_str(pair[0]).unwrap();
        b.append_str(pair[1]).unwrap();
        assert!(a < b, "{:?} {:?}", pair[0], pair[1]);
    }

    let bytes: [&[u8]; 5] = [b"", b"\x00", b"\x00\x00", b"\x01", b"\xff"];
    for pair in bytes.windows(2) {
        let (mut a, mut b) = (Key::new(), Key::new());
        a.append_bytes(pair[0]).unwrap();
        b.append_bytes(pair[1]).unwrap();
        assert!(a < b, "{:?} {:?}", pair[0], pair[1]);
    }
}

#[test]
fn test_cross_type_order() {
    let segs = [
        Segment::Null,
        Segment::Bool(false),
        Segment::Bool(true),
        Segment::Integer(i64::MAX),
        Segment::Float(f64::NEG_INFINITY),
        Segment::Bytes(vec![0xff; 4]),
        Segment::Text("zzz".to_string()),
        Segment::Custom(0, vec![]),
    ];
    for pair in segs.windows(2) {
        let (mut a, mut b) = (Key::new(), Key::new());
        a.append(pair[0].clone()).unwrap();
        b.append(pair[1].clone()).unwrap();
        assert!(a < b, "{} {}", pair[0], pair[1]);
    }
}

#[test]
fn test_key_roundtrip() {
    let seed: u64 = random();
    let mut rng = StdRng::seed_from_u64(seed);
    println!("test_key_roundtrip {}", seed);

    for _ in 0..1000 {
        let bytes: Vec<u8> = (0..64).map(|_| rng.gen()).collect();
        let mut uns = Unstructured::new(&bytes);
        let key = uns.arbitrary::<Key>().unwrap();

        let segs = key.to_segments().unwrap();
        let mut rebuilt = Key::new();
        for seg in segs.into_iter() {
            rebuilt.append(seg).unwrap();
        }
        assert_eq!(rebuilt, key);

        let decoded = Key::from_encoded(key.as_bytes()).unwrap();
        assert_eq!(decoded, key);
        assert_eq!(decoded.depth(), key.depth());
    }
}

#[test]
fn test_key_depth_cut_to() {
    let mut key = Key::new();
    key.append_str("part").unwrap();
    key.append_i64(10).unwrap();
    key.append_bool(true).unwrap();
    assert_eq!(key.depth(), 3);

    key.cut();
    assert_eq!(key.depth(), 2);
    assert_eq!(key.to_segment(1).unwrap(), Segment::Integer(10));

    key.to(Segment::Integer(11)).unwrap();
    assert_eq!(key.depth(), 2);
    assert_eq!(key.to_segment(1).unwrap(), Segment::Integer(11));

    key.clear();
    assert_eq!(key.depth(), 0);
    assert!(key.is_empty());
}

#[test]
fn test_key_too_long() {
    let mut key = Key::new();
    key.append_bytes(&vec![0xAB; 1000]).unwrap();
    match key.append_bytes(&vec![0xCD; 1200]) {
        Err(Error::KeyTooLong(_, _)) => (),
        res => panic!("unexpected {:?}", res.map(|_| ())),
    }
    // failed append leaves the key untouched.
    assert_eq!(key.depth(), 1);
}

#[test]
fn test_key_successor_prefix() {
    let mut key = Key::new();
    key.append_str("a").unwrap();
    let succ = key.to_successor();
    assert!(key < succ);

    let mut deeper = key.clone();
    deeper.append_i64(1).unwrap();
    assert!(key.is_prefix_of(&deeper));
    assert!(key < deeper);
    // the successor bound sorts below every real descendant.
    assert!(succ < deeper);
}
