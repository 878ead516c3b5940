#![forbid(unsafe_code)]
//! Page store: fixed-size pages over one file, an LRU frame cache, a free
//! list threaded through freed pages, and write-ahead journaling of every
//! page mutation.

mod frame;
mod freelist;
mod meta;
mod pager;

pub use freelist::free_page_capacity;
pub use meta::{check_page_size, decode_meta, load_meta, Meta, META_LEN};
pub use pager::{LoggedWrite, PageStore, PagerOptions, PagerStats, WriteLog};
