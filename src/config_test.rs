use std::time::Duration;

use super::*;

#[test]
fn test_memory_spec() {
    assert_eq!(parse_memory_spec("4096").unwrap(), 4096);
    assert_eq!(parse_memory_spec("64K").unwrap(), 64 * 1024);
    assert_eq!(parse_memory_spec("16M").unwrap(), 16 * 1024 * 1024);
    assert_eq!(parse_memory_spec("1G").unwrap(), 1024 * 1024 * 1024);
    assert_eq!(
        parse_memory_spec("1M,10M,2M,0.5").unwrap(),
        10 * 1024 * 1024
    );
    assert!(parse_memory_spec("10Q").is_err());
    assert!(parse_memory_spec("a,b").is_err());
}

#[test]
fn test_from_toml() {
    let text = r#"
        datapath = "/opt/data"
        volume = [
            "main.mvbt,create,pageSize:4096",
            "side.mvbt,create,pageSize:4096,alias:side",
        ]
        journalpath = "/opt/data/wal/engine"
        journalsize = 1048576
        logfile = "/opt/data/engine.log"
        tmpvoldir = "/tmp/scratch"
        timeout = 2500
        appendonly = true
        rmiport = 1099

        [buffer.count]
        4096 = 512
    "#;
    let config = Config::from_toml(text).unwrap();

    assert_eq!(config.datapath, std::ffi::OsString::from("/opt/data"));
    assert_eq!(config.volumes.len(), 2);
    assert_eq!(config.volumes[0].page_size, 4096);
    assert!(config.volumes[0].create);
    assert_eq!(config.volumes[1].alias.as_deref(), Some("side"));
    assert_eq!(config.journalsize, 1048576);
    assert_eq!(config.timeout, Duration::from_millis(2500));
    assert!(config.appendonly);
    assert_eq!(config.buffer_count.get(&4096), Some(&512));

    let (dir, name) = config.to_journal_location();
    assert_eq!(dir, std::ffi::OsString::from("/opt/data/wal"));
    assert_eq!(name, "engine");

    let pconfig = config.to_pool_config(4096);
    assert_eq!(pconfig.frames, 512);
    assert_eq!(pconfig.timeout, Duration::from_millis(2500));
}

#[test]
fn test_buffer_memory_sizing() {
    let text = r#"
        datapath = "/opt/data"
        volume = ["main.mvbt,create,pageSize:4096"]

        [buffer.memory]
        4096 = "1M"
    "#;
    let config = Config::from_toml(text).unwrap();
    assert_eq!(config.to_pool_config(4096).frames, 256);
}

#[test]
fn test_conflicting_buffer_directives() {
    let text = r#"
        datapath = "/opt/data"
        volume = ["main.mvbt,create,pageSize:4096"]

        [buffer.count]
        4096 = 100
        [buffer.memory]
        4096 = "1M"
    "#;
    assert!(Config::from_toml(text).is_err());
}

#[test]
fn test_missing_pieces() {
    assert!(Config::from_toml("volume = []").is_err());
    assert!(Config::from_toml("datapath = \"/x\"").is_err()); // no volume
    assert!(Config::from_toml("datapath = \"/x\"\nvolume = [\"v,pageSize:17\"]").is_err());
}

#[test]
fn test_builder_defaults() {
    let mut config = Config::new("/data".as_ref());
    config
        .add_volume(crate::vol::VolumeSpec::new("main.mvbt".as_ref()).set_create(true))
        .set_journalsize(1 << 20)
        .set_timeout(Duration::from_secs(1));
    config.validate().unwrap();

    let (dir, name) = config.to_journal_location();
    assert_eq!(dir, std::ffi::OsString::from("/data"));
    assert_eq!(name, "mvbt");
}
