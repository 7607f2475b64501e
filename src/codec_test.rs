use std::any::Any;

use super::*;
use crate::{key::Key, Error};

// a big-endian u32 coder, byte order matches numeric order.
fn encode_u32(value: &dyn Any, out: &mut Vec<u8>) -> Result<()> {
    match value.downcast_ref::<u32>() {
        Some(val) => {
            out.extend_from_slice(&val.to_be_bytes());
            Ok(())
        }
        None => err_at!(InvalidInput, msg: "coder expects u32"),
    }
}

fn decode_u32(data: &[u8]) -> Result<Box<dyn Any>> {
    check_remaining!(data, 4, "u32-coder")?;
    let mut scratch = [0_u8; 4];
    scratch.copy_from_slice(&data[..4]);
    Ok(Box::new(u32::from_be_bytes(scratch)))
}

fn u32_coder() -> Coder {
    Coder {
        name: "u32-be".to_string(),
        encode: encode_u32,
        decode: decode_u32,
    }
}

#[test]
fn test_register_lookup() {
    let mut registry = Registry::new();
    registry.register(7, u32_coder()).unwrap();
    assert_eq!(registry.lookup(7).unwrap().name, "u32-be");

    // descriptors are single-occupancy.
    match registry.register(7, u32_coder()) {
        Err(Error::InvalidInput(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }
    assert!(registry.lookup(8).is_err());
    assert!(registry.decode(8, &[0, 0, 0, 1]).is_err());
}

#[test]
fn test_custom_segment_roundtrip() {
    let mut registry = Registry::new();
    registry.register(7, u32_coder()).unwrap();

    let seg = registry.encode_segment(7, &10_u32).unwrap();
    let mut key = Key::new();
    key.append(seg.clone()).unwrap();

    // the segment survives the key encoding verbatim.
    let got = key.to_segment(0).unwrap();
    assert_eq!(got, seg);
    let decoded = Key::from_encoded(key.as_bytes()).unwrap();
    assert_eq!(decoded.to_segment(0).unwrap(), seg);

    // and decodes back through the registry.
    let val = registry.decode_segment(&got).unwrap();
    assert_eq!(*val.downcast_ref::<u32>().unwrap(), 10_u32);

    // only custom segments dispatch through the registry.
    assert!(registry.decode_segment(&crate::key::Segment::Null).is_err());
}

#[test]
fn test_custom_segment_order() {
    let mut registry = Registry::new();
    registry.register(7, u32_coder()).unwrap();

    let vals = [0_u32, 1, 255, 256, 70_000, u32::MAX];
    for pair in vals.windows(2) {
        let (mut a, mut b) = (Key::new(), Key::new());
        a.append(registry.encode_segment(7, &pair[0]).unwrap()).unwrap();
        b.append(registry.encode_segment(7, &pair[1]).unwrap()).unwrap();
        assert!(a < b, "{} {}", pair[0], pair[1]);
    }

    // a lower descriptor sorts its whole domain first.
    registry.register(3, u32_coder()).unwrap();
    let (mut a, mut b) = (Key::new(), Key::new());
    a.append(registry.encode_segment(3, &u32::MAX).unwrap()).unwrap();
    b.append(registry.encode_segment(7, &0_u32).unwrap()).unwrap();
    assert!(a < b);
}
