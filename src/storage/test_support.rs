use std::sync::{Arc, Once};

use tempfile::{tempdir, TempDir};

use crate::primitives::io::{FileIo, StdFileIo};
use crate::primitives::journal::{Journal, JournalOptions, JournalReader};
use crate::primitives::pager::{LoggedWrite, PageStore, PagerOptions, WriteLog};
use crate::types::{Result, TxnId};

pub(crate) fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Page store over a scratch directory.
pub(crate) struct Scratch {
    pub dir: TempDir,
    pub store: Arc<PageStore>,
}

pub(crate) fn scratch_store(page_size: u32) -> Result<Scratch> {
    init_tracing();
    let dir = tempdir()?;
    let jdir = dir.path().join("journal");
    let scan = JournalReader::open(&jdir)?.scan(|_| Ok(()))?;
    let journal = Arc::new(Journal::open(&jdir, JournalOptions::default(), &scan)?);
    let io: Arc<dyn FileIo> = Arc::new(StdFileIo::open(dir.path().join("store.dbx"))?);
    let options = PagerOptions {
        page_size,
        cache_pages: 256,
    };
    let (store, _) = PageStore::open(io, journal, &options, false)?;
    Ok(Scratch {
        dir,
        store: Arc::new(store),
    })
}

/// Write log that only records undo information.
#[derive(Default)]
pub(crate) struct ScratchLog {
    pub writes: Vec<LoggedWrite>,
}

impl WriteLog for ScratchLog {
    fn txn_id(&self) -> TxnId {
        TxnId(1)
    }

    fn prepare_write(&mut self) -> Result<()> {
        Ok(())
    }

    fn logged(&mut self, write: LoggedWrite) {
        self.writes.push(write);
    }
}
