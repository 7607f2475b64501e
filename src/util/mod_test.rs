use cbordata::Cborize;

use std::env;

use super::*;

#[derive(Clone, Debug, Eq, PartialEq, Cborize)]
struct Probe {
    name: String,
    num: u64,
}

impl Probe {
    const ID: u32 = 0x77;
}

#[test]
fn test_cbor_bytes() {
    let probe = Probe {
        name: "hello-world".to_string(),
        num: 0xdeadbeef,
    };
    let data = into_cbor_bytes(probe.clone()).unwrap();
    let (value, n): (Probe, usize) = from_cbor_bytes(&data).unwrap();
    assert_eq!(n, data.len());
    assert_eq!(value, probe);
}

#[test]
fn test_file_helpers() {
    let mut loc = env::temp_dir();
    loc.push(format!("mvbt-util-{}", rand::random::<u64>()));
    loc.push("file.data");
    let loc = loc.into_os_string();

    let mut fd = create_file_rw(&loc, true).unwrap();
    write_at(&mut fd, 0, b"0123456789").unwrap();
    write_at(&mut fd, 4, b"xy").unwrap();

    let mut fd = open_file_r(&loc).unwrap();
    assert_eq!(read_at(&mut fd, 0, 10).unwrap(), b"0123xy6789".to_vec());
    assert_eq!(read_at(&mut fd, 4, 2).unwrap(), b"xy".to_vec());
    assert!(read_at(&mut fd, 8, 10).is_err());

    let mut fd = open_file_rw(&loc).unwrap();
    assert_eq!(sync_write(&mut fd, b"ab").unwrap(), 2);
}

#[test]
fn test_create_file_rw_exclusive() {
    let mut loc = env::temp_dir();
    loc.push(format!("mvbt-util-{}", rand::random::<u64>()));
    loc.push("x.data");
    let loc = loc.into_os_string();

    create_file_rw(&loc, false).unwrap();
    assert!(create_file_rw(&loc, false).is_err());
    create_file_rw(&loc, true).unwrap();
}
