use std::convert::TryInto;
use std::ops::Range;

use rand::{rngs::OsRng, RngCore};

use crate::primitives::io::FileIo;
use crate::types::{
    page::{self, PageHeader, PageKind, MAX_PAGE_SIZE, MIN_PAGE_SIZE, PAGE_HDR_LEN},
    ArbolError, PageId, Result,
};

const META_PAGE_SIZE: Range<usize> = PAGE_HDR_LEN..PAGE_HDR_LEN + 4;
const META_FORMAT_VERSION: Range<usize> = PAGE_HDR_LEN + 4..PAGE_HDR_LEN + 6;
const META_RESERVED: Range<usize> = PAGE_HDR_LEN + 6..PAGE_HDR_LEN + 8;
const META_SALT: Range<usize> = PAGE_HDR_LEN + 8..PAGE_HDR_LEN + 16;
const META_FREE_HEAD: Range<usize> = PAGE_HDR_LEN + 16..PAGE_HDR_LEN + 24;
const META_NEXT_PAGE: Range<usize> = PAGE_HDR_LEN + 24..PAGE_HDR_LEN + 32;
const META_FREE_PAGES: Range<usize> = PAGE_HDR_LEN + 32..PAGE_HDR_LEN + 40;
const META_COLLECTIONS_ROOT: Range<usize> = PAGE_HDR_LEN + 40..PAGE_HDR_LEN + 48;
const META_DOCUMENTS_ROOT: Range<usize> = PAGE_HDR_LEN + 48..PAGE_HDR_LEN + 56;
const META_NODE_INDEX_ROOT: Range<usize> = PAGE_HDR_LEN + 56..PAGE_HDR_LEN + 64;
const META_NEXT_COLLECTION_ID: Range<usize> = PAGE_HDR_LEN + 64..PAGE_HDR_LEN + 68;
const META_NEXT_DOC_ID: Range<usize> = PAGE_HDR_LEN + 68..PAGE_HDR_LEN + 72;

/// Bytes of page 0 that hold meta fields. Page 0 must fit them in one sector.
pub const META_LEN: usize = PAGE_HDR_LEN + 72;

/// Store metadata kept in page 0.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Meta {
    /// Page size in bytes.
    pub page_size: u32,
    /// Page format version.
    pub format_version: u16,
    /// Per-store checksum salt.
    pub salt: u64,
    /// Head of the free-list chain, `PageId::NONE` when empty.
    pub free_head: PageId,
    /// First never-allocated page.
    pub next_page: PageId,
    /// Pages currently on the free list, including free-list pages.
    pub free_pages: u64,
    /// Root of the collection catalog tree.
    pub collections_root: PageId,
    /// Root of the document catalog tree.
    pub documents_root: PageId,
    /// Root of the node index tree.
    pub node_index_root: PageId,
    /// Next collection id to assign.
    pub next_collection_id: u32,
    /// Next document id to assign.
    pub next_doc_id: u32,
}

impl Meta {
    fn fresh(page_size: u32, salt: u64) -> Self {
        Self {
            page_size,
            format_version: page::PAGE_FORMAT_VERSION,
            salt,
            free_head: PageId::NONE,
            next_page: PageId(1),
            free_pages: 0,
            collections_root: PageId::NONE,
            documents_root: PageId::NONE,
            node_index_root: PageId::NONE,
            next_collection_id: 1,
            next_doc_id: 1,
        }
    }
}

/// Validates a configured page size.
pub fn check_page_size(page_size: u32) -> Result<()> {
    if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) || !page_size.is_power_of_two() {
        return Err(ArbolError::InvalidOwned(format!(
            "page size {page_size} must be a power of two between {MIN_PAGE_SIZE} and {MAX_PAGE_SIZE}"
        )));
    }
    Ok(())
}

/// Formats page 0 of an empty file and syncs it.
pub fn create_meta(io: &dyn FileIo, page_size: u32) -> Result<Meta> {
    check_page_size(page_size)?;
    let meta = Meta::fresh(page_size, OsRng.next_u64());
    let mut buf = vec![0u8; page_size as usize];
    PageHeader::new(PageId(0), PageKind::Meta).encode(&mut buf)?;
    encode_meta(&mut buf, &meta);
    page::seal_page(&mut buf, PageId(0), meta.salt);
    io.write_at(0, &buf)?;
    io.sync_all()?;
    Ok(meta)
}

/// Reads page 0 from disk.
///
/// With `tolerate_crc` a checksum mismatch is accepted; recovery rewrites the
/// page from the journal afterwards.
pub fn load_meta(io: &dyn FileIo, tolerate_crc: bool) -> Result<(Meta, Vec<u8>)> {
    let mut head = [0u8; META_LEN];
    io.read_at(0, &mut head)
        .map_err(|_| ArbolError::Corruption("meta page truncated"))?;
    let probe = decode_meta(&head)?;
    check_page_size(probe.page_size)?;
    let mut buf = vec![0u8; probe.page_size as usize];
    io.read_at(0, &mut buf)
        .map_err(|_| ArbolError::Corruption("meta page truncated"))?;
    match page::verify_page(&mut buf, PageId(0), probe.salt) {
        Ok(true) => {}
        Ok(false) => return Err(ArbolError::Corruption("meta page blank")),
        Err(err) if tolerate_crc && err.is_corruption() => {
            tracing::warn!(error = %err, "pager.meta.crc_tolerated");
        }
        Err(err) => return Err(err),
    }
    Ok((decode_meta(&buf)?, buf))
}

/// Writes meta fields into a page buffer, leaving the header untouched.
pub fn encode_meta(buf: &mut [u8], meta: &Meta) {
    buf[META_PAGE_SIZE].copy_from_slice(&meta.page_size.to_be_bytes());
    buf[META_FORMAT_VERSION].copy_from_slice(&meta.format_version.to_be_bytes());
    buf[META_RESERVED].fill(0);
    buf[META_SALT].copy_from_slice(&meta.salt.to_be_bytes());
    buf[META_FREE_HEAD].copy_from_slice(&meta.free_head.0.to_be_bytes());
    buf[META_NEXT_PAGE].copy_from_slice(&meta.next_page.0.to_be_bytes());
    buf[META_FREE_PAGES].copy_from_slice(&meta.free_pages.to_be_bytes());
    buf[META_COLLECTIONS_ROOT].copy_from_slice(&meta.collections_root.0.to_be_bytes());
    buf[META_DOCUMENTS_ROOT].copy_from_slice(&meta.documents_root.0.to_be_bytes());
    buf[META_NODE_INDEX_ROOT].copy_from_slice(&meta.node_index_root.0.to_be_bytes());
    buf[META_NEXT_COLLECTION_ID].copy_from_slice(&meta.next_collection_id.to_be_bytes());
    buf[META_NEXT_DOC_ID].copy_from_slice(&meta.next_doc_id.to_be_bytes());
}

/// Parses meta fields from page 0.
pub fn decode_meta(buf: &[u8]) -> Result<Meta> {
    if buf.len() < META_LEN {
        return Err(ArbolError::Corruption("meta page truncated"));
    }
    if page::page_kind(buf)? != PageKind::Meta {
        return Err(ArbolError::Corruption("page 0 is not a meta page"));
    }
    let format_version = u16::from_be_bytes(buf[META_FORMAT_VERSION].try_into().unwrap());
    if format_version != page::PAGE_FORMAT_VERSION {
        return Err(ArbolError::Corruption("unsupported store format version"));
    }
    Ok(Meta {
        page_size: u32::from_be_bytes(buf[META_PAGE_SIZE].try_into().unwrap()),
        format_version,
        salt: get_u64(buf, META_SALT),
        free_head: PageId(get_u64(buf, META_FREE_HEAD)),
        next_page: PageId(get_u64(buf, META_NEXT_PAGE)),
        free_pages: get_u64(buf, META_FREE_PAGES),
        collections_root: PageId(get_u64(buf, META_COLLECTIONS_ROOT)),
        documents_root: PageId(get_u64(buf, META_DOCUMENTS_ROOT)),
        node_index_root: PageId(get_u64(buf, META_NODE_INDEX_ROOT)),
        next_collection_id: u32::from_be_bytes(buf[META_NEXT_COLLECTION_ID].try_into().unwrap()),
        next_doc_id: u32::from_be_bytes(buf[META_NEXT_DOC_ID].try_into().unwrap()),
    })
}

fn get_u64(buf: &[u8], range: Range<usize>) -> u64 {
    u64::from_be_bytes(buf[range].try_into().unwrap())
}
