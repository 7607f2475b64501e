use std::env;

use super::*;
use crate::{page::NIL_PAGE, Error};

fn scratch(name: &str) -> ffi::OsString {
    let mut loc = env::temp_dir();
    loc.push(format!("mvbt-vol-{}-{}", name, rand::random::<u64>()));
    loc.push("vol.mvbt");
    loc.into_os_string()
}

#[test]
fn test_volume_spec_parse() {
    let text = "main.mvbt,create,pageSize:4096,initialPages:4,extensionPages:16,\
                maximumPages:1000,alias:main";
    let spec = VolumeSpec::parse(text).unwrap();
    assert_eq!(spec.path, ffi::OsString::from("main.mvbt"));
    assert!(spec.create);
    assert!(!spec.create_only);
    assert!(!spec.read_only);
    assert!(!spec.transient);
    assert_eq!(spec.page_size, 4096);
    assert_eq!(spec.initial_pages, 4);
    assert_eq!(spec.extension_pages, 16);
    assert_eq!(spec.maximum_pages, 1000);
    assert_eq!(spec.alias.as_deref(), Some("main"));
    assert_eq!(spec.to_name(), "main");

    let spec = VolumeSpec::parse("x.mvbt,readOnly,transient").unwrap();
    assert!(spec.read_only && spec.transient);
    assert_eq!(spec.to_name(), "x");

    assert!(VolumeSpec::parse("").is_err());
    assert!(VolumeSpec::parse("x.mvbt,bogus").is_err());
    assert!(VolumeSpec::parse("x.mvbt,pageSize:100").is_err());
    assert!(VolumeSpec::parse("x.mvbt,create,createOnly").is_err());
}

#[test]
fn test_volume_create_load() {
    let loc = scratch("create");
    let spec = VolumeSpec::new(&loc).set_create(true).set_page_size(1024);

    let uuid = {
        let vol = Volume::open(spec.clone(), 1).unwrap();
        assert_eq!(vol.page_size(), 1024);
        assert_eq!(vol.to_id(), 1);
        assert_eq!(vol.to_page_count(), 1);
        let head = vol.read_head();
        assert_eq!(head.directory_root, NIL_PAGE);
        assert_eq!(head.garbage_root, NIL_PAGE);
        let uuid = vol.to_uuid();
        vol.close().unwrap();
        uuid
    };

    // reload sees the same identity.
    let vol = Volume::open(VolumeSpec::new(&loc).set_page_size(1024), 1).unwrap();
    assert_eq!(vol.to_uuid(), uuid);
    vol.close().unwrap();

    // createOnly refuses an existing file.
    let spec = VolumeSpec::new(&loc).set_create_only(true).set_page_size(1024);
    assert!(Volume::open(spec, 1).is_err());

    // missing volume without create fails.
    let spec = VolumeSpec::new(&scratch("missing")).set_page_size(1024);
    assert!(Volume::open(spec, 1).is_err());
}

#[test]
fn test_volume_page_roundtrip() {
    let loc = scratch("pages");
    let spec = VolumeSpec::new(&loc).set_create(true).set_page_size(1024);
    let vol = Volume::open(spec, 1).unwrap();

    // make page 1 addressable.
    let (_, mut head_page) = vol
        .with_head(|head| {
            head.next_page = 2;
            Ok(())
        })
        .unwrap();
    vol.write_page(&mut head_page).unwrap();

    let mut page = Page::new(1024, PageType::Data, 1, 1);
    page.set_generation(7);
    vol.write_page(&mut page).unwrap();

    let got = vol.read_page(1).unwrap();
    assert_eq!(got.to_type(), PageType::Data);
    assert_eq!(got.to_address(), 1);
    assert_eq!(got.to_generation(), 7);

    // out of range addresses are rejected.
    assert!(vol.read_page(5).is_err());

    vol.close().unwrap();
}

#[test]
fn test_volume_head_persistence() {
    let loc = scratch("head");
    let spec = VolumeSpec::new(&loc).set_create(true).set_page_size(1024);
    {
        let vol = Volume::open(spec, 1).unwrap();
        let (_, mut head_page) = vol
            .with_head(|head| {
                head.directory_root = 3;
                head.garbage_root = 9;
                head.next_page = 17;
                head.stats.pages_allocated = 5;
                Ok(())
            })
            .unwrap();
        vol.write_page(&mut head_page).unwrap();
        vol.close().unwrap();
    }
    let vol = Volume::open(VolumeSpec::new(&loc).set_page_size(1024), 1).unwrap();
    let head = vol.read_head();
    assert_eq!(head.directory_root, 3);
    assert_eq!(head.garbage_root, 9);
    assert_eq!(head.next_page, 17);
    assert_eq!(head.stats.pages_allocated, 5);
    vol.close().unwrap();
}

#[test]
fn test_volume_read_only() {
    let loc = scratch("ro");
    {
        let spec = VolumeSpec::new(&loc).set_create(true).set_page_size(1024);
        Volume::open(spec, 1).unwrap().close().unwrap();
    }
    let spec = VolumeSpec::new(&loc).set_read_only(true).set_page_size(1024);
    let vol = Volume::open(spec, 1).unwrap();
    let mut page = Page::new(1024, PageType::Data, 0, 1);
    match vol.write_page(&mut page) {
        Err(Error::ReadOnlyVolume(_, _)) => (),
        res => panic!("unexpected {:?}", res),
    }
    vol.close().unwrap();
}

#[test]
fn test_volume_set() {
    let (loc_a, loc_b) = (scratch("set-a"), scratch("set-b"));
    let specs = vec![
        VolumeSpec::new(&loc_a).set_create(true).set_page_size(1024),
        VolumeSpec::new(&loc_b).set_create(true).set_page_size(1024).set_alias("other"),
    ];
    let set = VolumeSet::open(specs).unwrap();
    assert_eq!(set.by_name("vol").unwrap().to_id(), 1);
    assert_eq!(set.by_name("other").unwrap().to_id(), 2);
    assert!(set.by_name("nope").is_err());
    assert_eq!(set.by_id(2).unwrap().to_name(), "other");
    assert!(set.by_id(9).is_err());
    set.close().unwrap();
}
