//! Engine configuration.
//!
//! A [Config] is built programmatically through the `set_*`/`add_*`
//! methods, or loaded from a TOML document recognizing the classic
//! option names:
//!
//! ```toml
//! datapath = "/opt/data"
//! volume = ["main.mvbt,create,pageSize:16384", "archive.mvbt,readOnly"]
//! journalpath = "/opt/data/wal/mvbt"
//! journalsize = 1073741824
//! logfile = "/opt/data/mvbt.log"
//! tmpvoldir = "/tmp"
//! timeout = 10000
//! appendonly = false
//!
//! [buffer.count]
//! 16384 = 4096
//! # or [buffer.memory] 16384 = "64M"
//! ```
//!
//! Exactly one of `buffer.count` / `buffer.memory` may be given per
//! page size. `rmiport`/`jmx` keys are accepted and ignored, the
//! management surface is outside the storage core.

use std::{collections::HashMap, convert::TryFrom, ffi, path, time::Duration};

use crate::{pool, vol::VolumeSpec, Error, Result};

/// Engine configuration, refer to the module documentation.
#[derive(Clone, Debug)]
pub struct Config {
    /// Directory for volume and journal files.
    pub datapath: ffi::OsString,
    /// Volume specifications, slot order assigns volume ids.
    pub volumes: Vec<VolumeSpec>,
    /// Frame count per page size.
    pub buffer_count: HashMap<usize, usize>,
    /// Memory budget per page size, exclusive with `buffer_count`.
    pub buffer_memory: HashMap<usize, usize>,
    /// Journal location prefix, `<datapath>/mvbt` unless set.
    pub journalpath: Option<ffi::OsString>,
    /// Journal segment size.
    pub journalsize: usize,
    /// Operational log file, consumed by the embedder's logger setup.
    pub logfile: Option<ffi::OsString>,
    /// Scratch directory for transient volumes.
    pub tmpvoldir: Option<ffi::OsString>,
    /// Latch/flush wait bound.
    pub timeout: Duration,
    /// Archive mode, disable the journal copier.
    pub appendonly: bool,
}

impl Config {
    pub fn new(datapath: &ffi::OsStr) -> Config {
        Config {
            datapath: datapath.to_os_string(),
            volumes: vec![],
            buffer_count: HashMap::new(),
            buffer_memory: HashMap::new(),
            journalpath: None,
            journalsize: crate::journal::SEGMENT_SIZE,
            logfile: None,
            tmpvoldir: None,
            timeout: pool::TIMEOUT,
            appendonly: false,
        }
    }

    pub fn add_volume(&mut self, spec: VolumeSpec) -> &mut Self {
        self.volumes.push(spec);
        self
    }

    pub fn set_buffer_count(&mut self, page_size: usize, frames: usize) -> &mut Self {
        self.buffer_count.insert(page_size, frames);
        self
    }

    pub fn set_buffer_memory(&mut self, page_size: usize, bytes: usize) -> &mut Self {
        self.buffer_memory.insert(page_size, bytes);
        self
    }

    pub fn set_journalpath(&mut self, journalpath: &ffi::OsStr) -> &mut Self {
        self.journalpath = Some(journalpath.to_os_string());
        self
    }

    pub fn set_journalsize(&mut self, journalsize: usize) -> &mut Self {
        self.journalsize = journalsize;
        self
    }

    pub fn set_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.timeout = timeout;
        self
    }

    pub fn set_appendonly(&mut self, appendonly: bool) -> &mut Self {
        self.appendonly = appendonly;
        self
    }

    pub fn set_tmpvoldir(&mut self, tmpvoldir: &ffi::OsStr) -> &mut Self {
        self.tmpvoldir = Some(tmpvoldir.to_os_string());
        self
    }

    /// Validate cross-option constraints.
    pub fn validate(&self) -> Result<()> {
        if self.volumes.is_empty() {
            return err_at!(InvalidInput, msg: "configuration needs a volume");
        }
        for spec in self.volumes.iter() {
            spec.validate()?;
            let (count, memory) = (
                self.buffer_count.contains_key(&spec.page_size),
                self.buffer_memory.contains_key(&spec.page_size),
            );
            if count && memory {
                return err_at!(
                    InvalidInput, msg: "buffer.count and buffer.memory for {}",
                    spec.page_size
                );
            }
        }
        Ok(())
    }

    /// Pool sizing for `page_size`, from `buffer.count`/`buffer.memory`
    /// or the built-in default.
    pub fn to_pool_config(&self, page_size: usize) -> pool::Config {
        let config = pool::Config::new(page_size).set_timeout(self.timeout);
        match (
            self.buffer_count.get(&page_size),
            self.buffer_memory.get(&page_size),
        ) {
            (Some(frames), _) => config.set_frames(*frames),
            (None, Some(bytes)) => config.set_memory(*bytes),
            (None, None) => config,
        }
    }

    /// Journal `(dir, name)` derived from `journalpath`/`datapath`.
    pub fn to_journal_location(&self) -> (ffi::OsString, String) {
        let prefix = match &self.journalpath {
            Some(journalpath) => path::PathBuf::from(journalpath),
            None => path::Path::new(&self.datapath).join("mvbt"),
        };
        let dir = prefix
            .parent()
            .map(|p| p.as_os_str().to_os_string())
            .unwrap_or_else(|| self.datapath.clone());
        let name = prefix
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "mvbt".to_string());
        (dir, name)
    }
}

// toml loading.
impl Config {
    pub fn from_toml(text: &str) -> Result<Config> {
        let value: toml::Value = err_at!(InvalidInput, text.parse())?;
        let table = match value.as_table() {
            Some(table) => table,
            None => return err_at!(InvalidInput, msg: "configuration not a table"),
        };

        let datapath = match table.get("datapath").and_then(toml::Value::as_str) {
            Some(datapath) => datapath,
            None => return err_at!(InvalidInput, msg: "configuration needs datapath"),
        };
        let mut config = Config::new(datapath.as_ref());

        if let Some(volumes) = table.get("volume") {
            let volumes = match volumes.as_array() {
                Some(volumes) => volumes,
                None => return err_at!(InvalidInput, msg: "volume must be an array"),
            };
            for spec in volumes.iter() {
                match spec.as_str() {
                    Some(spec) => {
                        config.volumes.push(VolumeSpec::parse(spec)?);
                    }
                    None => {
                        return err_at!(InvalidInput, msg: "volume entries are strings")
                    }
                }
            }
        }

        if let Some(buffer) = table.get("buffer").and_then(toml::Value::as_table) {
            if let Some(counts) = buffer.get("count").and_then(toml::Value::as_table) {
                for (page_size, frames) in counts.iter() {
                    let page_size: usize = err_at!(InvalidInput, page_size.parse())?;
                    let frames = match frames.as_integer() {
                        Some(frames) => err_at!(FailConvert, usize::try_from(frames))?,
                        None => {
                            return err_at!(InvalidInput, msg: "buffer.count not integer")
                        }
                    };
                    config.buffer_count.insert(page_size, frames);
                }
            }
            if let Some(memory) = buffer.get("memory").and_then(toml::Value::as_table) {
                for (page_size, spec) in memory.iter() {
                    let page_size: usize = err_at!(InvalidInput, page_size.parse())?;
                    let bytes = match spec {
                        toml::Value::Integer(n) => {
                            err_at!(FailConvert, usize::try_from(*n))?
                        }
                        toml::Value::String(s) => parse_memory_spec(s)?,
                        _ => {
                            return err_at!(InvalidInput, msg: "bad buffer.memory spec")
                        }
                    };
                    config.buffer_memory.insert(page_size, bytes);
                }
            }
        }

        if let Some(journalpath) = table.get("journalpath").and_then(toml::Value::as_str) {
            config.journalpath = Some(journalpath.into());
        }
        if let Some(journalsize) = table.get("journalsize").and_then(toml::Value::as_integer)
        {
            config.journalsize = err_at!(FailConvert, usize::try_from(journalsize))?;
        }
        if let Some(logfile) = table.get("logfile").and_then(toml::Value::as_str) {
            config.logfile = Some(logfile.into());
        }
        if let Some(tmpvoldir) = table.get("tmpvoldir").and_then(toml::Value::as_str) {
            config.tmpvoldir = Some(tmpvoldir.into());
        }
        if let Some(timeout) = table.get("timeout").and_then(toml::Value::as_integer) {
            let timeout = err_at!(FailConvert, u64::try_from(timeout))?;
            config.timeout = Duration::from_millis(timeout);
        }
        if let Some(appendonly) = table.get("appendonly").and_then(toml::Value::as_bool) {
            config.appendonly = appendonly;
        }
        // management-surface keys, accepted and ignored by the core.
        for key in ["rmiport", "jmx"].iter() {
            if table.contains_key(*key) {
                log::warn!(target: "config", "{} ignored by storage core", key);
            }
        }

        config.validate()?;
        Ok(config)
    }
}

/// Parse a memory budget: `4096`, `64K`, `16M`, `1G`, or the
/// `"min,max,reserve,fraction"` form of which `max` is taken.
pub fn parse_memory_spec(text: &str) -> Result<usize> {
    let text = text.trim();
    if text.contains(',') {
        let parts: Vec<&str> = text.split(',').map(str::trim).collect();
        if parts.len() != 4 {
            return err_at!(InvalidInput, msg: "memory spec {}", text);
        }
        return parse_memory_spec(parts[1]);
    }
    let (num, mult) = match text.char_indices().last() {
        Some((i, 'K')) => (&text[..i], 1024),
        Some((i, 'M')) => (&text[..i], 1024 * 1024),
        Some((i, 'G')) => (&text[..i], 1024 * 1024 * 1024),
        _ => (text, 1),
    };
    let num: usize = err_at!(InvalidInput, num.trim().parse())?;
    Ok(num * mult)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;
