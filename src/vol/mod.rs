//! Module implement volumes, the files backing a set of btrees.
//!
//! A volume is a single file made up of fixed-size pages, addressed
//! 0..N. Page 0 is the head page carrying the volume magic, version,
//! page size, 128-bit internal id, the root of the directory tree, the
//! garbage chain head and the next-available-page counter. All other
//! pages are btree INDEX/DATA pages, LONG record chunks or members of
//! the garbage chain.
//!
//! Volumes never interpret btree content, they read and write whole
//! pages, verifying the page checksum on the way in. Page allocation
//! policy, the garbage chain walk, lives with the btree layer; this
//! module only guards the head-page fields behind the head latch.

use fs2::FileExt;
use uuid::Uuid;

use std::{
    convert::TryFrom,
    ffi, fmt, fs,
    path::Path,
    result,
    sync::{Arc, Mutex},
};

use crate::{
    page::{Page, PageType, MAX_PAGE_SIZE, MIN_PAGE_SIZE, NIL_PAGE},
    util::{self, Spinlock},
    Error, Result,
};

/// Volume format magic, first body bytes of every head page.
pub const MAGIC: &[u8; 8] = b"mvbtvol\0";
/// Volume format version.
pub const VERSION: u32 = 1;
/// Default page size.
pub const PAGE_SIZE: usize = 16 * 1024;
/// Default number of pages a volume grows by.
pub const EXTENSION_PAGES: u64 = 32;
/// Default cap on the number of pages per volume.
pub const MAXIMUM_PAGES: u64 = u64::MAX;

// head-page body offsets, relative to the page header.
const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 8;
const OFF_PAGE_SIZE: usize = 12;
const OFF_UUID: usize = 16;
const OFF_CREATED: usize = 32;
const OFF_DIRECTORY: usize = 40;
const OFF_GARBAGE: usize = 48;
const OFF_NEXT_PAGE: usize = 56;
const OFF_ID: usize = 64;
const OFF_STATS: usize = 72;

/// Specification for one volume slot, either built programmatically via
/// the `set_*` methods or parsed from the configuration comma-string
/// `path,flags,pageSize:S,initialPages:I,extensionPages:E,maximumPages:M
/// [,alias:A][,transient]`.
#[derive(Clone, Debug)]
pub struct VolumeSpec {
    /// Path to the volume file.
    pub path: ffi::OsString,
    /// Name used by sessions to address this volume, file-stem of
    /// `path` unless an `alias` was supplied.
    pub alias: Option<String>,
    /// Create the volume if missing.
    pub create: bool,
    /// Fail if the volume already exists.
    pub create_only: bool,
    /// Reject every mutating operation.
    pub read_only: bool,
    /// Skip journaling for this volume, content is lost on crash.
    pub transient: bool,
    pub page_size: usize,
    pub initial_pages: u64,
    pub extension_pages: u64,
    pub maximum_pages: u64,
}

impl VolumeSpec {
    pub fn new(path: &ffi::OsStr) -> VolumeSpec {
        VolumeSpec {
            path: path.to_os_string(),
            alias: None,
            create: false,
            create_only: false,
            read_only: false,
            transient: false,
            page_size: PAGE_SIZE,
            initial_pages: 1,
            extension_pages: EXTENSION_PAGES,
            maximum_pages: MAXIMUM_PAGES,
        }
    }

    pub fn set_create(mut self, create: bool) -> VolumeSpec {
        self.create = create;
        self
    }

    pub fn set_create_only(mut self, create_only: bool) -> VolumeSpec {
        self.create_only = create_only;
        self
    }

    pub fn set_read_only(mut self, read_only: bool) -> VolumeSpec {
        self.read_only = read_only;
        self
    }

    pub fn set_transient(mut self, transient: bool) -> VolumeSpec {
        self.transient = transient;
        self
    }

    pub fn set_page_size(mut self, page_size: usize) -> VolumeSpec {
        self.page_size = page_size;
        self
    }

    pub fn set_alias(mut self, alias: &str) -> VolumeSpec {
        self.alias = Some(alias.to_string());
        self
    }

    pub fn set_pages(mut self, initial: u64, extension: u64, maximum: u64) -> VolumeSpec {
        self.initial_pages = initial;
        self.extension_pages = extension;
        self.maximum_pages = maximum;
        self
    }

    /// Parse the configuration comma-string form.
    pub fn parse(text: &str) -> Result<VolumeSpec> {
        let mut parts = text.split(',').map(str::trim);
        let path = match parts.next() {
            Some(path) if !path.is_empty() => path,
            _ => return err_at!(InvalidInput, msg: "volume spec needs path {}", text),
        };
        let mut spec = VolumeSpec::new(path.as_ref());

        for part in parts {
            match part {
                "create" => spec.create = true,
                "createOnly" => spec.create_only = true,
                "readOnly" => spec.read_only = true,
                "transient" => spec.transient = true,
                part => match part.split_once(':') {
                    Some(("pageSize", val)) => {
                        spec.page_size = err_at!(InvalidInput, val.parse())?
                    }
                    Some(("initialPages", val)) => {
                        spec.initial_pages = err_at!(InvalidInput, val.parse())?
                    }
                    Some(("extensionPages", val)) => {
                        spec.extension_pages = err_at!(InvalidInput, val.parse())?
                    }
                    Some(("maximumPages", val)) => {
                        spec.maximum_pages = err_at!(InvalidInput, val.parse())?
                    }
                    Some(("alias", val)) => spec.alias = Some(val.to_string()),
                    _ => {
                        return err_at!(
                            InvalidInput, msg: "bad volume spec field {}", part
                        )
                    }
                },
            }
        }
        spec.validate()?;
        Ok(spec)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two()
            || self.page_size < MIN_PAGE_SIZE
            || self.page_size > MAX_PAGE_SIZE
        {
            return err_at!(
                InvalidInput, msg: "page size {} not a power of two within [{}, {}]",
                self.page_size, MIN_PAGE_SIZE, MAX_PAGE_SIZE
            );
        }
        if self.create && self.create_only {
            return err_at!(InvalidInput, msg: "create and createOnly are exclusive");
        }
        if self.initial_pages < 1 || self.maximum_pages < self.initial_pages {
            return err_at!(
                InvalidInput, msg: "bad page counts {}..{}",
                self.initial_pages, self.maximum_pages
            );
        }
        Ok(())
    }

    /// Name sessions use to address this volume.
    pub fn to_name(&self) -> String {
        match &self.alias {
            Some(alias) => alias.clone(),
            None => Path::new(&self.path)
                .file_stem()
                .map(|stem| stem.to_string_lossy().to_string())
                .unwrap_or_else(|| self.path.to_string_lossy().to_string()),
        }
    }
}

impl fmt::Display for VolumeSpec {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(f, "volume<{:?} pageSize:{}>", self.path, self.page_size)
    }
}

// mutable head-page fields, guarded by the volume head latch.
#[derive(Clone, Debug)]
pub struct Head {
    pub directory_root: u64,
    pub garbage_root: u64,
    pub next_page: u64,
    pub stats: Stats,
}

/// Per-volume counters, persisted in the head page.
#[derive(Clone, Debug, Default)]
pub struct Stats {
    pub pages_allocated: u64,
    pub pages_freed: u64,
    pub extensions: u64,
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(
            f,
            "{{ allocated = {}, freed = {}, extensions = {} }}",
            self.pages_allocated, self.pages_freed, self.extensions
        )
    }
}

/// A single open volume file.
pub struct Volume {
    spec: VolumeSpec,
    name: String,
    id: u32,
    uuid: Uuid,
    created: u64,
    page_size: usize,

    file: Mutex<fs::File>,
    head: Spinlock<Head>,
    // serializes allocate/deallocate walks over the garbage chain.
    alloc_mu: Mutex<()>,
}

impl fmt::Display for Volume {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(f, "volume<{} id:{} pageSize:{}>", self.name, self.id, self.page_size)
    }
}

impl Volume {
    /// Open, or create per `spec`, a volume file. `id` is the short
    /// volume id stamped into page headers, assigned by configuration
    /// slot order and stable across restarts.
    pub fn open(spec: VolumeSpec, id: u32) -> Result<Volume> {
        spec.validate()?;
        let exists = Path::new(&spec.path).exists();

        match (exists, spec.create, spec.create_only) {
            (true, _, true) => {
                err_at!(InvalidFile, msg: "volume exists {:?}", spec.path)
            }
            (true, _, _) => Self::load(spec, id),
            (false, true, _) | (false, _, true) => Self::create(spec, id),
            (false, false, false) => {
                err_at!(InvalidFile, msg: "volume not found {:?}", spec.path)
            }
        }
    }

    fn create(spec: VolumeSpec, id: u32) -> Result<Volume> {
        let mut file = util::create_file_rw(&spec.path, spec.transient)?;
        err_at!(IOError, file.try_lock_exclusive(), "volume {:?}", spec.path)?;

        let uuid = Uuid::new_v4();
        let created = err_at!(
            FailConvert,
            u64::try_from(chrono::Utc::now().timestamp())
        )?;
        let head = Head {
            directory_root: NIL_PAGE,
            garbage_root: NIL_PAGE,
            next_page: 1,
            stats: Stats::default(),
        };

        let mut page = Page::new(spec.page_size, PageType::Head, 0, id);
        marshal_head(&mut page, &uuid, created, spec.page_size, id, &head)?;
        page.seal();
        util::write_at(&mut file, 0, page.as_bytes())?;
        err_at!(IOError, file.sync_all())?;

        log::info!(target: "vol", "created volume {:?} uuid {}", spec.path, uuid);

        let vol = Volume {
            name: spec.to_name(),
            page_size: spec.page_size,
            spec,
            id,
            uuid,
            created,
            file: Mutex::new(file),
            head: Spinlock::new(head),
            alloc_mu: Mutex::new(()),
        };
        Ok(vol)
    }

    fn load(spec: VolumeSpec, id: u32) -> Result<Volume> {
        let mut file = match spec.read_only {
            true => util::open_file_r(&spec.path)?,
            false => util::open_file_rw(&spec.path)?,
        };
        err_at!(IOError, file.try_lock_exclusive(), "volume {:?}", spec.path)?;

        let buf = util::read_at(&mut file, 0, spec.page_size)?;
        let page = Page::from_buffer(buf)?;
        if page.to_type() != PageType::Head {
            return err_at!(CorruptPage, msg: "page 0 not a head page {:?}", spec.path);
        }
        let (uuid, created, page_size, head) = unmarshal_head(&page, &spec)?;

        let vol = Volume {
            name: spec.to_name(),
            page_size,
            spec,
            id,
            uuid,
            created,
            file: Mutex::new(file),
            head: Spinlock::new(head),
            alloc_mu: Mutex::new(()),
        };
        Ok(vol)
    }

    pub fn close(&self) -> Result<()> {
        self.sync()?;
        let file = err_at!(Fatal, self.file.lock())?;
        err_at!(IOError, file.unlock())?;
        Ok(())
    }

    /// Remove the backing file, transient volumes are purged on close.
    pub fn purge(&self) -> Result<()> {
        err_at!(IOError, fs::remove_file(&self.spec.path))?;
        Ok(())
    }
}

impl Volume {
    pub fn to_name(&self) -> String {
        self.name.clone()
    }

    pub fn to_id(&self) -> u32 {
        self.id
    }

    pub fn to_uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn to_location(&self) -> ffi::OsString {
        self.spec.path.clone()
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn is_read_only(&self) -> bool {
        self.spec.read_only
    }

    pub fn is_transient(&self) -> bool {
        self.spec.transient
    }

    pub fn to_spec(&self) -> &VolumeSpec {
        &self.spec
    }

    /// Serialize garbage-chain and next-page manipulation, refer to the
    /// btree allocation paths.
    pub fn alloc_lock(&self) -> Result<std::sync::MutexGuard<()>> {
        err_at!(Fatal, self.alloc_mu.lock())
    }

    /// Pages currently addressable, the next-available-page counter.
    pub fn to_page_count(&self) -> u64 {
        self.head.read().next_page
    }

    pub fn to_stats(&self) -> Stats {
        self.head.read().stats.clone()
    }

    /// Run `mutate` under the head latch and return a sealed image of
    /// the head page, for the caller to journal and write back.
    pub fn with_head<F, T>(&self, mutate: F) -> Result<(T, Page)>
    where
        F: FnOnce(&mut Head) -> Result<T>,
    {
        let mut head = self.head.write();
        let val = mutate(&mut head)?;
        let mut page = Page::new(self.page_size, PageType::Head, 0, self.id);
        marshal_head(&mut page, &self.uuid, self.created, self.page_size, self.id, &head)?;
        Ok((val, page))
    }

    /// Read head fields without latching for write.
    pub fn read_head(&self) -> Head {
        self.head.read().clone()
    }
}

// page granularity file io.
impl Volume {
    /// Read and verify the page at `address`.
    pub fn read_page(&self, address: u64) -> Result<Page> {
        if address >= self.to_page_count() {
            return err_at!(
                InvalidInput, msg: "page {} out of range on {}", address, self.name
            );
        }
        let fpos = address * (self.page_size as u64);
        let buf = {
            let mut file = err_at!(Fatal, self.file.lock())?;
            util::read_at(&mut file, fpos, self.page_size)?
        };
        let page = Page::from_buffer(buf).map_err(|err| match err {
            Error::CorruptPage(p, m) => {
                Error::CorruptPage(p, format!("{} in volume {}", m, self.name))
            }
            err => err,
        })?;
        if page.to_address() != address {
            return err_at!(
                CorruptPage, msg: "page address {} != {} in {}",
                page.to_address(), address, self.name
            );
        }
        Ok(page)
    }

    /// Seal and write `page` at its address. Callers must have flushed
    /// the journal upto the page's generation beforehand, write-ahead
    /// ordering is owned by the journal manager.
    pub fn write_page(&self, page: &mut Page) -> Result<()> {
        if self.spec.read_only {
            return err_at!(ReadOnlyVolume, msg: "{}", self.name);
        }
        let address = page.to_address();
        if address >= self.to_page_count() {
            return err_at!(
                InvalidInput, msg: "page {} out of range on {}", address, self.name
            );
        }
        page.seal();
        let fpos = address * (self.page_size as u64);
        let mut file = err_at!(Fatal, self.file.lock())?;
        util::write_at(&mut file, fpos, page.as_bytes())
    }

    pub fn sync(&self) -> Result<()> {
        let file = err_at!(Fatal, self.file.lock())?;
        err_at!(IOError, file.sync_all())?;
        Ok(())
    }

    /// Recovery-time page write, skips the next-page range check since
    /// the image may lie past the last durable extension.
    pub fn restore_page(&self, page: &mut Page) -> Result<()> {
        if self.spec.read_only {
            return err_at!(ReadOnlyVolume, msg: "{}", self.name);
        }
        page.seal();
        let fpos = page.to_address() * (self.page_size as u64);
        let mut file = err_at!(Fatal, self.file.lock())?;
        util::write_at(&mut file, fpos, page.as_bytes())
    }

    /// Re-read head fields from page 0, recovery calls this after
    /// applying journaled head-page images.
    pub fn reload_head(&self) -> Result<()> {
        let buf = {
            let mut file = err_at!(Fatal, self.file.lock())?;
            util::read_at(&mut file, 0, self.page_size)?
        };
        let page = Page::from_buffer(buf)?;
        let (_, _, _, head) = unmarshal_head(&page, &self.spec)?;
        *self.head.write() = head;
        Ok(())
    }

}

fn marshal_head(
    page: &mut Page,
    uuid: &Uuid,
    created: u64,
    page_size: usize,
    id: u32,
    head: &Head,
) -> Result<()> {
    let mut body = vec![0_u8; OFF_STATS + 24];
    body[OFF_MAGIC..OFF_MAGIC + 8].copy_from_slice(MAGIC);
    body[OFF_VERSION..OFF_VERSION + 4].copy_from_slice(&VERSION.to_be_bytes());
    let psize = err_at!(FailConvert, u32::try_from(page_size))?;
    body[OFF_PAGE_SIZE..OFF_PAGE_SIZE + 4].copy_from_slice(&psize.to_be_bytes());
    body[OFF_UUID..OFF_UUID + 16].copy_from_slice(uuid.as_bytes());
    body[OFF_CREATED..OFF_CREATED + 8].copy_from_slice(&created.to_be_bytes());
    body[OFF_DIRECTORY..OFF_DIRECTORY + 8]
        .copy_from_slice(&head.directory_root.to_be_bytes());
    body[OFF_GARBAGE..OFF_GARBAGE + 8].copy_from_slice(&head.garbage_root.to_be_bytes());
    body[OFF_NEXT_PAGE..OFF_NEXT_PAGE + 8].copy_from_slice(&head.next_page.to_be_bytes());
    body[OFF_ID..OFF_ID + 4].copy_from_slice(&id.to_be_bytes());
    body[OFF_STATS..OFF_STATS + 8].copy_from_slice(&head.stats.pages_allocated.to_be_bytes());
    body[OFF_STATS + 8..OFF_STATS + 16].copy_from_slice(&head.stats.pages_freed.to_be_bytes());
    body[OFF_STATS + 16..OFF_STATS + 24].copy_from_slice(&head.stats.extensions.to_be_bytes());

    page.set_head_body(&body)
}

fn unmarshal_head(page: &Page, spec: &VolumeSpec) -> Result<(Uuid, u64, usize, Head)> {
    let body = page.as_head_body();

    if &body[OFF_MAGIC..OFF_MAGIC + 8] != MAGIC {
        return err_at!(CorruptPage, msg: "bad volume magic {:?}", spec.path);
    }
    let get_u32 = |off: usize| -> u32 {
        let mut scratch = [0_u8; 4];
        scratch.copy_from_slice(&body[off..off + 4]);
        u32::from_be_bytes(scratch)
    };
    let get_u64 = |off: usize| -> u64 {
        let mut scratch = [0_u8; 8];
        scratch.copy_from_slice(&body[off..off + 8]);
        u64::from_be_bytes(scratch)
    };

    let version = get_u32(OFF_VERSION);
    if version != VERSION {
        return err_at!(
            CorruptPage, msg: "volume version {} != {} {:?}", version, VERSION, spec.path
        );
    }
    let page_size = get_u32(OFF_PAGE_SIZE) as usize;
    if page_size != spec.page_size {
        return err_at!(
            WrongVolume, msg: "page size {} != {} {:?}",
            page_size, spec.page_size, spec.path
        );
    }
    let mut scratch = [0_u8; 16];
    scratch.copy_from_slice(&body[OFF_UUID..OFF_UUID + 16]);
    let uuid = Uuid::from_bytes(scratch);
    let created = get_u64(OFF_CREATED);

    let head = Head {
        directory_root: get_u64(OFF_DIRECTORY),
        garbage_root: get_u64(OFF_GARBAGE),
        next_page: get_u64(OFF_NEXT_PAGE),
        stats: Stats {
            pages_allocated: get_u64(OFF_STATS),
            pages_freed: get_u64(OFF_STATS + 8),
            extensions: get_u64(OFF_STATS + 16),
        },
    };
    Ok((uuid, created, page_size, head))
}

/// The set of volumes opened by an engine instance, addressable by
/// name or by short volume id.
pub struct VolumeSet {
    volumes: Vec<Arc<Volume>>,
}

impl VolumeSet {
    pub fn open(specs: Vec<VolumeSpec>) -> Result<VolumeSet> {
        let mut volumes = vec![];
        for (slot, spec) in specs.into_iter().enumerate() {
            let id = err_at!(FailConvert, u32::try_from(slot + 1))?;
            volumes.push(Arc::new(Volume::open(spec, id)?));
        }

        let mut names: Vec<String> = volumes.iter().map(|v| v.to_name()).collect();
        names.sort();
        names.dedup();
        if names.len() != volumes.len() {
            return err_at!(InvalidInput, msg: "duplicate volume names");
        }
        Ok(VolumeSet { volumes })
    }

    pub fn by_name(&self, name: &str) -> Result<Arc<Volume>> {
        match self.volumes.iter().find(|v| v.to_name() == name) {
            Some(vol) => Ok(Arc::clone(vol)),
            None => err_at!(InvalidInput, msg: "no volume named {}", name),
        }
    }

    pub fn by_id(&self, id: u32) -> Result<Arc<Volume>> {
        match self.volumes.iter().find(|v| v.to_id() == id) {
            Some(vol) => Ok(Arc::clone(vol)),
            None => err_at!(WrongVolume, msg: "no volume with id {}", id),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Volume>> {
        self.volumes.iter()
    }

    pub fn close(&self) -> Result<()> {
        for vol in self.volumes.iter() {
            vol.close()?;
            if vol.is_transient() {
                vol.purge()?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod mod_test;
