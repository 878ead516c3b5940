//! Shared on-disk page header used by every page kind.

use core::convert::{TryFrom, TryInto};

use super::{page_crc32, ArbolError, Lsn, PageId, Result};

/// Magic bytes opening every written page.
pub const PAGE_MAGIC: [u8; 4] = *b"ARBP";
/// Page format version written into the meta page.
pub const PAGE_FORMAT_VERSION: u16 = 1;
/// Default page size in bytes.
pub const DEFAULT_PAGE_SIZE: u32 = 4096;
/// Smallest supported page size.
pub const MIN_PAGE_SIZE: u32 = 1024;
/// Largest supported page size.
pub const MAX_PAGE_SIZE: u32 = 65536;
/// Length of the common page header.
pub const PAGE_HDR_LEN: usize = 32;

pub mod header {
    //! Byte offsets for fixed header fields.
    use core::ops::Range;

    /// Page magic.
    pub const MAGIC: Range<usize> = 0..4;
    /// Page kind byte.
    pub const PAGE_KIND: usize = 4;
    /// Kind-specific flags.
    pub const FLAGS: usize = 5;
    /// Reserved, zero.
    pub const RESERVED: Range<usize> = 6..8;
    /// Page number, checked against the slot the page was read from.
    pub const PAGE_NO: Range<usize> = 8..16;
    /// LSN of the last journaled mutation.
    pub const LSN: Range<usize> = 16..24;
    /// CRC over the whole page with this field zeroed.
    pub const CRC32: Range<usize> = 24..28;
    /// Reserved, zero.
    pub const RESERVED_2: Range<usize> = 28..32;
}

/// Page kinds stored in the header.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PageKind {
    /// Page 0.
    Meta = 1,
    /// Free-list chain page.
    FreeList = 2,
    /// B-tree leaf.
    BTreeLeaf = 3,
    /// B-tree internal node.
    BTreeInternal = 4,
    /// Node record data page.
    DomData = 5,
    /// Overflow chain page.
    Overflow = 6,
}

impl PageKind {
    /// Raw tag.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for PageKind {
    type Error = ArbolError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(PageKind::Meta),
            2 => Ok(PageKind::FreeList),
            3 => Ok(PageKind::BTreeLeaf),
            4 => Ok(PageKind::BTreeInternal),
            5 => Ok(PageKind::DomData),
            6 => Ok(PageKind::Overflow),
            _ => Err(ArbolError::Corruption("unknown page kind")),
        }
    }
}

/// Decoded page header.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PageHeader {
    /// Page kind.
    pub kind: PageKind,
    /// Kind-specific flags.
    pub flags: u8,
    /// Page number.
    pub page_no: PageId,
    /// LSN of the last mutation.
    pub lsn: Lsn,
    /// Stored checksum.
    pub crc32: u32,
}

impl PageHeader {
    /// Header for a freshly formatted page.
    pub fn new(page_no: PageId, kind: PageKind) -> Self {
        Self {
            kind,
            flags: 0,
            page_no,
            lsn: Lsn::ZERO,
            crc32: 0,
        }
    }

    /// Writes the header into the first [`PAGE_HDR_LEN`] bytes of `dst`.
    pub fn encode(&self, dst: &mut [u8]) -> Result<()> {
        if dst.len() < PAGE_HDR_LEN {
            return Err(ArbolError::Invalid("page header buffer too small"));
        }
        let hdr = &mut dst[..PAGE_HDR_LEN];
        hdr[header::MAGIC].copy_from_slice(&PAGE_MAGIC);
        hdr[header::PAGE_KIND] = self.kind.as_u8();
        hdr[header::FLAGS] = self.flags;
        hdr[header::RESERVED].fill(0);
        hdr[header::PAGE_NO].copy_from_slice(&self.page_no.0.to_be_bytes());
        hdr[header::LSN].copy_from_slice(&self.lsn.0.to_be_bytes());
        hdr[header::CRC32].copy_from_slice(&self.crc32.to_be_bytes());
        hdr[header::RESERVED_2].fill(0);
        Ok(())
    }

    /// Parses a header, rejecting bad magic or unknown kinds.
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < PAGE_HDR_LEN {
            return Err(ArbolError::Corruption("page header truncated"));
        }
        let hdr = &src[..PAGE_HDR_LEN];
        if hdr[header::MAGIC] != PAGE_MAGIC {
            return Err(ArbolError::Corruption("invalid page magic"));
        }
        let kind = PageKind::try_from(hdr[header::PAGE_KIND])?;
        Ok(Self {
            kind,
            flags: hdr[header::FLAGS],
            page_no: PageId(read_u64(&hdr[header::PAGE_NO])),
            lsn: Lsn(read_u64(&hdr[header::LSN])),
            crc32: u32::from_be_bytes(hdr[header::CRC32].try_into().unwrap()),
        })
    }
}

/// Formats `buf` as an empty page of the given kind.
pub fn format_page(buf: &mut [u8], page_no: PageId, kind: PageKind) -> Result<()> {
    buf.fill(0);
    PageHeader::new(page_no, kind).encode(buf)
}

/// Reads the kind of a formatted page.
pub fn page_kind(buf: &[u8]) -> Result<PageKind> {
    if buf.len() < PAGE_HDR_LEN || buf[header::MAGIC] != PAGE_MAGIC {
        return Err(ArbolError::Corruption("invalid page magic"));
    }
    PageKind::try_from(buf[header::PAGE_KIND])
}

/// Reads the header LSN without validating the rest of the header.
pub fn page_lsn(buf: &[u8]) -> Lsn {
    Lsn(read_u64(&buf[header::LSN]))
}

/// Stamps the header LSN.
pub fn set_page_lsn(buf: &mut [u8], lsn: Lsn) {
    buf[header::LSN].copy_from_slice(&lsn.0.to_be_bytes());
}

/// Computes and stores the page checksum before the page goes to disk.
pub fn seal_page(buf: &mut [u8], page_no: PageId, salt: u64) {
    buf[header::CRC32].fill(0);
    let crc = page_crc32(page_no.0, salt, buf);
    buf[header::CRC32].copy_from_slice(&crc.to_be_bytes());
}

/// Verifies a page read from disk. Returns `Ok(false)` for a never-written
/// (all-zero) page.
pub fn verify_page(buf: &mut [u8], page_no: PageId, salt: u64) -> Result<bool> {
    if buf.iter().all(|&b| b == 0) {
        return Ok(false);
    }
    let header = PageHeader::decode(buf)?;
    if header.page_no != page_no {
        return Err(ArbolError::Corruption("page number mismatch"));
    }
    buf[header::CRC32].fill(0);
    let crc = page_crc32(page_no.0, salt, buf);
    buf[header::CRC32].copy_from_slice(&header.crc32.to_be_bytes());
    if crc != header.crc32 {
        return Err(ArbolError::Corruption("page checksum mismatch"));
    }
    Ok(true)
}

fn read_u64(src: &[u8]) -> u64 {
    u64::from_be_bytes(src[..8].try_into().unwrap())
}
