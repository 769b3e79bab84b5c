use std::{
    collections::{HashMap, HashSet},
    sync::MutexGuard,
};

use log::{debug, error};

use crate::{
    error::Error,
    page::chain,
    record_manager::{RecordManager, TreeState, WriterCore},
    Result,
};

/// Root pointer and element count of one tree as a transaction sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeRoot {
    pub root: u64,
    pub count: u64,
}

/// Read access shared by read and write transactions.
///
/// A read transaction resolves roots from its snapshot; a write
/// transaction resolves them from its own uncommitted working set, so the
/// writer observes its own modifications and nobody else does.
pub trait TxView {
    #[doc(hidden)]
    fn read_record(&self, offset: u64) -> Result<Vec<u8>>;

    #[doc(hidden)]
    fn tree_root(&self, name: &str) -> Result<TreeRoot>;

    /// The revision this transaction observes (reads) or builds (writes).
    fn revision(&self) -> u64;
}

/// A snapshot-bound read transaction.
///
/// Holds a pin on its revision; the reclaimer will not free any page the
/// snapshot can still reach until the pin is dropped.
pub struct ReadTx<'m> {
    rm: &'m RecordManager,
    revision: u64,
    tot_root: u64,
    trees: HashMap<String, TreeState>,
}

impl<'m> ReadTx<'m> {
    pub(crate) fn new(
        rm: &'m RecordManager,
        revision: u64,
        tot_root: u64,
        trees: HashMap<String, TreeState>,
    ) -> Self {
        Self {
            rm,
            revision,
            tot_root,
            trees,
        }
    }
}

impl TxView for ReadTx<'_> {
    fn read_record(&self, offset: u64) -> Result<Vec<u8>> {
        self.rm.read_record_at(offset)
    }

    fn tree_root(&self, name: &str) -> Result<TreeRoot> {
        if name.is_empty() {
            return Ok(TreeRoot {
                root: self.tot_root,
                count: 0,
            });
        }
        match self.trees.get(name) {
            Some(state) => Ok(TreeRoot {
                root: state.root,
                count: state.count,
            }),
            None => Err(Error::corrupt(format!(
                "tree `{}` is not managed at revision {}",
                name, self.revision
            ))),
        }
    }

    fn revision(&self) -> u64 {
        self.revision
    }
}

impl Drop for ReadTx<'_> {
    fn drop(&mut self) {
        self.rm.release_pin(self.revision);
    }
}

/// The single write transaction building the next revision.
///
/// Every page it writes lands on a free or appended offset, never on a
/// page any committed revision can reach, so an abort (or a crash) leaves
/// the published state untouched. Dropping the transaction without
/// committing aborts it.
pub struct WriteTx<'m> {
    rm: &'m RecordManager,
    pub(crate) core: MutexGuard<'m, WriterCore>,
    revision: u64,

    // committed state at begin, copied lazily into `working` on first touch
    base_trees: HashMap<String, TreeState>,

    pub(crate) working: HashMap<String, TreeState>,
    pub(crate) working_tot_root: u64,

    // offsets this transaction allocated, still referenced by its pages
    allocated: HashSet<u64>,
    // allocated by this transaction, then superseded by it: free at commit
    pub(crate) immediate_free: Vec<u64>,
    // replaced pages of older revisions, handed to the reclaimer at commit
    pub(crate) superseded: Vec<u64>,

    finished: bool,
}

impl<'m> WriteTx<'m> {
    pub(crate) fn new(
        rm: &'m RecordManager,
        core: MutexGuard<'m, WriterCore>,
        revision: u64,
        base_tot_root: u64,
        base_trees: HashMap<String, TreeState>,
    ) -> Self {
        Self {
            rm,
            core,
            revision,
            working_tot_root: base_tot_root,
            base_trees,
            working: HashMap::new(),
            allocated: HashSet::new(),
            immediate_free: Vec::new(),
            superseded: Vec::new(),
            finished: false,
        }
    }

    /// Write a logical record onto freshly allocated pages, returning its
    /// head offset.
    pub(crate) fn write_record_pages(&mut self, data: &[u8]) -> Result<u64> {
        let page_size = self.rm.page_size();
        let n = chain::chain_page_count(data.len(), page_size);
        let offsets = self.core.free_list.allocate_chain(n);
        self.allocated.extend(offsets.iter().copied());

        self.rm.with_file(|file| chain::write_record(file, &offsets, data))?;
        Ok(offsets[0])
    }

    /// Mark every page of the record at `offset` as replaced by this
    /// transaction.
    pub(crate) fn supersede_record(&mut self, offset: u64) -> Result<()> {
        let offsets = self.rm.with_file(|file| {
            chain::read_record_with_offsets(file, offset).map(|(_, o)| o)
        })?;
        for o in offsets {
            if self.allocated.remove(&o) {
                self.immediate_free.push(o);
            } else {
                self.superseded.push(o);
            }
        }
        Ok(())
    }

    pub(crate) fn entry(&mut self, name: &str) -> Result<&mut TreeState> {
        if !self.working.contains_key(name) {
            let state = self.base_trees.get(name).cloned().ok_or_else(|| {
                Error::corrupt(format!("tree `{}` is not managed", name))
            })?;
            self.working.insert(name.to_string(), state);
        }
        Ok(self.working.get_mut(name).unwrap())
    }

    /// Stage a new root (and element-count delta) for a tree. The change
    /// is published at commit.
    pub(crate) fn update_tree_root(
        &mut self,
        name: &str,
        root: u64,
        count_delta: i64,
    ) -> Result<()> {
        if name.is_empty() {
            self.working_tot_root = root;
            return Ok(());
        }
        let revision = self.revision;
        let state = self.entry(name)?;
        state.root = root;
        state.count = (state.count as i64 + count_delta) as u64;
        state.revision = revision;
        state.dirty = true;
        Ok(())
    }

    /// Seed a brand-new tree into the working set (add_tree path).
    pub(crate) fn register_tree(&mut self, state: TreeState, name: &str) {
        debug!("registering tree `{}` at revision {}", name, self.revision);
        self.working.insert(name.to_string(), state);
    }

    pub(crate) fn take_allocated(&mut self) -> Vec<u64> {
        self.allocated.drain().collect()
    }

    pub fn commit(mut self) -> Result<()> {
        self.rm.commit_write(&mut self)?;
        self.finished = true;
        Ok(())
    }

    pub fn abort(mut self) -> Result<()> {
        self.finished = true;
        self.rm.abort_write(&mut self)
    }
}

impl TxView for WriteTx<'_> {
    fn read_record(&self, offset: u64) -> Result<Vec<u8>> {
        self.rm.read_record_at(offset)
    }

    fn tree_root(&self, name: &str) -> Result<TreeRoot> {
        if name.is_empty() {
            return Ok(TreeRoot {
                root: self.working_tot_root,
                count: 0,
            });
        }
        let state = self
            .working
            .get(name)
            .or_else(|| self.base_trees.get(name))
            .ok_or_else(|| {
                Error::corrupt(format!("tree `{}` is not managed", name))
            })?;
        Ok(TreeRoot {
            root: state.root,
            count: state.count,
        })
    }

    fn revision(&self) -> u64 {
        self.revision
    }
}

impl Drop for WriteTx<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.rm.abort_write(self) {
                error!("abort on drop failed: {}", e);
            }
        }
    }
}
