use std::ops::Range;

use tracing::trace;

use super::pager::{PageStore, WriteLog};
use crate::primitives::bytes::buf::{get_u32, get_u64, set_u32, set_u64};
use crate::primitives::journal::PageOp;
use crate::types::{
    page::{self, PageKind, PAGE_HDR_LEN},
    ArbolError, PageId, Result,
};

const FREE_NEXT: Range<usize> = PAGE_HDR_LEN..PAGE_HDR_LEN + 8;
const FREE_COUNT: Range<usize> = PAGE_HDR_LEN + 8..PAGE_HDR_LEN + 12;
const FREE_ENTRIES: usize = PAGE_HDR_LEN + 16;

/// Free page numbers one free-list page can hold.
pub fn free_page_capacity(page_size: usize) -> usize {
    (page_size - FREE_ENTRIES) / 8
}

fn entry_offset(idx: usize) -> usize {
    FREE_ENTRIES + idx * 8
}

impl PageStore {
    /// Hands out a page, reusing the free list before growing the file.
    ///
    /// The returned page keeps whatever bytes it had; callers format it with a
    /// full image through [`PageStore::write_page`].
    pub fn allocate_page(&self, log: &mut dyn WriteLog) -> Result<PageId> {
        log.prepare_write()?;
        let mut meta = self.meta()?;
        let id = if meta.free_head.is_none() {
            let id = meta.next_page;
            meta.next_page = PageId(id.0 + 1);
            id
        } else {
            let head = meta.free_head;
            let mut image = self.read_page(head)?;
            if page::page_kind(&image)? != PageKind::FreeList {
                return Err(ArbolError::Corruption("free-list head is not a free-list page"));
            }
            let count = get_u32(&image, FREE_COUNT.start) as usize;
            meta.free_pages = meta.free_pages.saturating_sub(1);
            if count > 0 {
                let slot = entry_offset(count - 1);
                let id = PageId(get_u64(&image, slot));
                set_u64(&mut image, slot, 0);
                set_u32(&mut image, FREE_COUNT.start, (count - 1) as u32);
                self.write_page(log, head, PageOp::FreeList, &image)?;
                id
            } else {
                meta.free_head = PageId(get_u64(&image, FREE_NEXT.start));
                head
            }
        };
        self.write_meta(log, &meta)?;
        trace!(page = id.0, "pager.allocate");
        Ok(id)
    }

    /// Returns a page to the free list.
    pub fn free_page(&self, log: &mut dyn WriteLog, id: PageId) -> Result<()> {
        log.prepare_write()?;
        let mut meta = self.meta()?;
        if id.is_none() || id >= meta.next_page {
            return Err(ArbolError::Invalid("freeing a page that was never allocated"));
        }
        #[cfg(debug_assertions)]
        if self.free_list()?.contains(&id) {
            return Err(ArbolError::Invalid("freeing a page that is already free"));
        }
        let capacity = free_page_capacity(self.page_size());
        let head = meta.free_head;
        let head_image = if head.is_none() {
            None
        } else {
            Some(self.read_page(head)?)
        };
        match head_image {
            Some(mut image) if (get_u32(&image, FREE_COUNT.start) as usize) < capacity => {
                let count = get_u32(&image, FREE_COUNT.start) as usize;
                set_u64(&mut image, entry_offset(count), id.0);
                set_u32(&mut image, FREE_COUNT.start, (count + 1) as u32);
                self.write_page(log, head, PageOp::FreeList, &image)?;
            }
            _ => {
                let mut image = vec![0u8; self.page_size()];
                page::format_page(&mut image, id, PageKind::FreeList)?;
                set_u64(&mut image, FREE_NEXT.start, head.0);
                self.write_page(log, id, PageOp::FreeList, &image)?;
                meta.free_head = id;
            }
        }
        meta.free_pages += 1;
        self.write_meta(log, &meta)?;
        trace!(page = id.0, "pager.free");
        Ok(())
    }

    /// Every page currently on the free list, head page first.
    pub fn free_list(&self) -> Result<Vec<PageId>> {
        let meta = self.meta()?;
        let mut out = Vec::new();
        let mut next = meta.free_head;
        let mut hops = 0u64;
        while !next.is_none() {
            hops += 1;
            if hops > meta.next_page.0 {
                return Err(ArbolError::Corruption("free-list chain has a cycle"));
            }
            let image = self.read_page(next)?;
            if page::page_kind(&image)? != PageKind::FreeList {
                return Err(ArbolError::Corruption("free-list chain reaches a non free-list page"));
            }
            out.push(next);
            let count = get_u32(&image, FREE_COUNT.start) as usize;
            for idx in 0..count {
                out.push(PageId(get_u64(&image, entry_offset(idx))));
            }
            next = PageId(get_u64(&image, FREE_NEXT.start));
        }
        Ok(out)
    }
}
