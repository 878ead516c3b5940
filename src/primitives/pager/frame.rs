use crate::types::{page, Lsn};

/// Cached copy of one page.
pub(super) struct Frame {
    pub data: Box<[u8]>,
    pub dirty: bool,
}

impl Frame {
    pub fn clean(data: Vec<u8>) -> Self {
        Self {
            data: data.into_boxed_slice(),
            dirty: false,
        }
    }

    pub fn lsn(&self) -> Lsn {
        page::page_lsn(&self.data)
    }
}
