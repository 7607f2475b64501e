//! Page allocation and the per-volume garbage chain.
//!
//! Free pages form a singly-linked chain through their `right_sibling`
//! field, the chain head lives in the volume head page. Allocation pops
//! the chain, falling back to extending the file by one page through
//! the next-available-page counter; deallocation pushes onto the chain.
//! Every step mutates pages through the buffer pool and journals the
//! images, so that the chain is exactly as recoverable as the btrees
//! referencing it.
//!
//! The volume's alloc lock serializes chain walks; the head latch is
//! only held across the field mutation itself.

use crate::{
    journal::Journal,
    page::{Page, PageType, NIL_PAGE},
    pool::{PageExcl, Pool},
    vol::Volume,
    Error, Result,
};

/// Allocate a page of `typ`, returning it latched exclusive, installed
/// in the pool, journaled and marked dirty.
pub(crate) fn allocate_page<'a>(
    vol: &Volume,
    pool: &'a Pool,
    journal: &Journal,
    typ: PageType,
    ts: u64,
) -> Result<PageExcl<'a>> {
    if vol.is_read_only() {
        return err_at!(ReadOnlyVolume, msg: "{}", vol.to_name());
    }
    let _alloc = vol.alloc_lock()?;

    let garbage_root = vol.read_head().garbage_root;
    let (address, head_page) = match garbage_root {
        NIL_PAGE => vol.with_head(|head| {
            if head.next_page >= vol.to_spec().maximum_pages {
                return err_at!(
                    VolumeFull, msg: "{} at {} pages", vol.to_name(), head.next_page
                );
            }
            let address = head.next_page;
            head.next_page += 1;
            head.stats.pages_allocated += 1;
            Ok(address)
        })?,
        address => {
            // pop the chain head, its right sibling is the next link.
            let next = {
                let guard = pool.pin_exclusive(vol.to_id(), address)?;
                if guard.page().to_type() != PageType::Garbage {
                    return err_at!(
                        CorruptPage, msg: "garbage chain hits {:?}", guard.page()
                    );
                }
                guard.page().to_right_sibling()
            };
            let (_, head_page) = vol.with_head(|head| {
                head.garbage_root = next;
                head.stats.pages_allocated += 1;
                Ok(())
            })?;
            (address, head_page)
        }
    };
    publish_head(vol, pool, journal, head_page, ts)?;

    let mut page = Page::new(vol.page_size(), typ, address, vol.to_id());
    page.set_generation(ts);
    let mut guard = pool.install(vol.to_id(), page)?;
    if !vol.is_transient() {
        journal.append_page_image(vol.to_id(), guard.page())?;
    }
    guard.mark_dirty(ts);
    Ok(guard)
}

/// Chain the latched page onto the garbage chain.
pub(crate) fn free_page(
    vol: &Volume,
    pool: &Pool,
    journal: &Journal,
    guard: &mut PageExcl,
    ts: u64,
) -> Result<()> {
    let _alloc = vol.alloc_lock()?;

    let old_root = vol.read_head().garbage_root;
    let address = guard.page().to_address();

    let page = guard.page_mut();
    page.set_type(PageType::Garbage);
    page.set_entries(&[])?;
    page.set_right_sibling(old_root);
    page.set_left_sibling(NIL_PAGE);
    page.set_generation(ts);
    if !vol.is_transient() {
        journal.append_page_image(vol.to_id(), guard.page())?;
    }
    guard.mark_dirty(ts);

    let (_, head_page) = vol.with_head(|head| {
        head.garbage_root = address;
        head.stats.pages_freed += 1;
        Ok(())
    })?;
    publish_head(vol, pool, journal, head_page, ts)
}

/// Install a freshly marshalled head page into the pool, journaled and
/// dirty, for the copier to write back.
pub(crate) fn publish_head(
    vol: &Volume,
    pool: &Pool,
    journal: &Journal,
    mut head_page: Page,
    ts: u64,
) -> Result<()> {
    head_page.set_generation(ts);
    let mut guard = pool.install(vol.to_id(), head_page)?;
    if !vol.is_transient() {
        journal.append_page_image(vol.to_id(), guard.page())?;
    }
    guard.mark_dirty(ts);
    Ok(())
}

#[cfg(test)]
#[path = "alloc_test.rs"]
mod alloc_test;
