use std::{
    cmp::Ordering,
    collections::{BTreeMap, HashMap, HashSet},
    path::Path,
    sync::{Mutex, RwLock},
};

use bytes::{Buf, BufMut, BytesMut};
use log::{debug, info};

use crate::{
    btree::{
        page::{BTreePage, LeafPage, ValueSlot},
        BTree, TreeConfig,
    },
    error::Error,
    io::{CacheStats, PageFile},
    page::{chain, FileHeader, FreeList},
    reclaimer::Reclaimer,
    serializer::{Serializer, StringSerializer},
    transaction::{ReadTx, TxView, WriteTx},
    utils::HandyRwLock,
    Result, NO_PAGE,
};

#[derive(Debug, Clone, Copy)]
pub struct RecordManagerConfig {
    /// On-disk page-image size in bytes, fixed at file creation.
    pub page_size: usize,
    /// Page-images kept in the LRU cache.
    pub cache_capacity: usize,
    /// Run the reclaimer release pass every this many commits.
    pub reclaimer_threshold: usize,
}

impl Default for RecordManagerConfig {
    fn default() -> Self {
        Self {
            page_size: 512,
            cache_capacity: 256,
            reclaimer_threshold: 1,
        }
    }
}

/// Identity of a managed tree, persisted in its header record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TreeMeta {
    pub name: String,
    pub key_tag: u8,
    pub value_tag: u8,
    pub allow_dups: bool,
    pub page_size: u32,
}

/// One tree as known to a committed revision or a working set.
#[derive(Debug, Clone)]
pub(crate) struct TreeState {
    pub meta: TreeMeta,
    pub header_offset: u64,
    pub root: u64,
    pub count: u64,
    pub revision: u64,
    pub dirty: bool,
}

fn encode_tree_header(state: &TreeState) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u32(state.meta.name.len() as u32);
    buf.put_slice(state.meta.name.as_bytes());
    buf.put_u8(state.meta.key_tag);
    buf.put_u8(state.meta.value_tag);
    buf.put_u8(state.meta.allow_dups as u8);
    buf.put_u32(state.meta.page_size);
    buf.put_u64(state.root);
    buf.put_u64(state.count);
    buf.put_u64(state.revision);
    buf.to_vec()
}

fn decode_tree_header(bytes: &[u8], header_offset: u64) -> Result<TreeState> {
    let mut buf = bytes;
    if buf.remaining() < 4 {
        return Err(Error::corrupt("tree header truncated"));
    }
    let name_len = buf.get_u32() as usize;
    if buf.remaining() < name_len + 3 + 4 + 24 {
        return Err(Error::corrupt("tree header truncated"));
    }
    let name = String::from_utf8(buf[..name_len].to_vec())
        .map_err(|_| Error::corrupt("tree name is not utf-8"))?;
    buf.advance(name_len);

    Ok(TreeState {
        meta: TreeMeta {
            name,
            key_tag: buf.get_u8(),
            value_tag: buf.get_u8(),
            allow_dups: buf.get_u8() != 0,
            page_size: buf.get_u32(),
        },
        root: buf.get_u64(),
        count: buf.get_u64(),
        revision: buf.get_u64(),
        header_offset,
        dirty: false,
    })
}

/// Value of a tree-of-trees entry: tree header offset and latest revision.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct TreeInfoSerializer;

impl Serializer for TreeInfoSerializer {
    type Item = (u64, u64);

    fn type_tag(&self) -> u8 {
        0xf0
    }

    fn serialize(&self, item: &(u64, u64)) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(16);
        buf.put_u64(item.0);
        buf.put_u64(item.1);
        buf.to_vec()
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<(u64, u64)> {
        if bytes.len() != 16 {
            return Err(Error::corrupt("tree-of-trees value must be 16 bytes"));
        }
        let mut buf = bytes;
        Ok((buf.get_u64(), buf.get_u64()))
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Result<Ordering> {
        Ok(a.cmp(b))
    }
}

/// State owned by the single writer.
pub(crate) struct WriterCore {
    pub free_list: FreeList,
    pub reclaimer: Reclaimer,
}

/// The published state every new transaction starts from.
struct CommittedState {
    revision: u64,
    header_seq: u64,
    authoritative_slot: usize,
    tot_root: u64,
    trees: HashMap<String, TreeState>,
}

#[derive(Clone)]
struct SnapshotState {
    tot_root: u64,
    trees: HashMap<String, TreeState>,
}

/// Read pins plus the retained per-revision snapshots. One mutex keeps
/// pin registration and the reclaimer's pin computation atomic with
/// respect to each other.
struct ReaderTable {
    pins: BTreeMap<u64, usize>,
    snapshots: BTreeMap<u64, SnapshotState>,
}

/// The record manager: one backing file, many named B+trees, one writer
/// at a time, any number of snapshot readers.
pub struct RecordManager {
    page_size: usize,
    file: Mutex<PageFile>,
    state: RwLock<CommittedState>,
    writer: Mutex<WriterCore>,
    readers: Mutex<ReaderTable>,
    tot: BTree<StringSerializer, TreeInfoSerializer>,
}

impl RecordManager {
    /// Open an existing file or create a new one.
    pub fn open<P: AsRef<Path>>(
        path: P,
        config: RecordManagerConfig,
    ) -> Result<Self> {
        let path = path.as_ref();
        let exists = path
            .metadata()
            .map(|meta| meta.len() > 0)
            .unwrap_or(false);

        if exists {
            Self::open_existing(path, config)
        } else {
            Self::create(path, config)
        }
    }

    fn create(path: &Path, config: RecordManagerConfig) -> Result<Self> {
        if config.page_size < 64 {
            return Err(Error::corrupt(format!(
                "page size {} is below the 64-byte minimum",
                config.page_size
            )));
        }

        let mut file =
            PageFile::open(path, config.page_size, config.cache_capacity)?;

        // reserve the two header slots before any allocation
        let zeros = vec![0u8; config.page_size];
        file.write_page(0, &zeros)?;
        file.write_page(config.page_size as u64, &zeros)?;

        let mut free_list = FreeList::new_empty(&file);

        // the tree-of-trees starts as an empty leaf
        let tot = BTreePage::Leaf(LeafPage::default()).encode();
        let offsets =
            free_list.allocate_chain(chain::chain_page_count(tot.len(), config.page_size));
        chain::write_record(&mut file, &offsets, &tot)?;
        let tot_root = offsets[0];

        let header = FileHeader {
            seq: 1,
            page_size: config.page_size as u32,
            tree_of_trees_root: tot_root,
            free_list_head: free_list.head(),
            revision: 0,
        };
        header.store(&mut file, 0)?;
        file.sync()?;

        info!(
            "created record manager at {:?}, page size {}",
            path, config.page_size
        );

        let mut snapshots = BTreeMap::new();
        snapshots.insert(
            0,
            SnapshotState {
                tot_root,
                trees: HashMap::new(),
            },
        );

        Ok(Self {
            page_size: config.page_size,
            file: Mutex::new(file),
            state: RwLock::new(CommittedState {
                revision: 0,
                header_seq: 1,
                authoritative_slot: 0,
                tot_root,
                trees: HashMap::new(),
            }),
            writer: Mutex::new(WriterCore {
                free_list,
                reclaimer: Reclaimer::new(config.reclaimer_threshold),
            }),
            readers: Mutex::new(ReaderTable {
                pins: BTreeMap::new(),
                snapshots,
            }),
            tot: Self::tot_handle(),
        })
    }

    fn open_existing(path: &Path, config: RecordManagerConfig) -> Result<Self> {
        let page_size = crate::page::read_page_size(path)? as usize;
        if page_size < 64 {
            return Err(Error::corrupt("stored page size is invalid"));
        }

        let mut file = PageFile::open(path, page_size, config.cache_capacity)?;
        let (header, slot) = FileHeader::load(&mut file)?;
        let free_list = FreeList::load(&mut file, header.free_list_head)?;

        // rebuild the registry from the tree-of-trees
        let mut entries = Vec::new();
        collect_tree_entries(&mut file, header.tree_of_trees_root, &mut entries)?;

        let mut trees = HashMap::new();
        for (name, header_offset) in entries {
            let bytes = chain::read_record(&mut file, header_offset)?;
            let state = decode_tree_header(&bytes, header_offset)?;
            if state.meta.name != name {
                return Err(Error::corrupt(format!(
                    "tree header at {:#x} names `{}`, catalogue says `{}`",
                    header_offset, state.meta.name, name
                )));
            }
            trees.insert(name, state);
        }

        info!(
            "opened record manager at {:?}: revision {}, {} trees, {} free pages",
            path,
            header.revision,
            trees.len(),
            free_list.len()
        );

        let mut snapshots = BTreeMap::new();
        snapshots.insert(
            header.revision,
            SnapshotState {
                tot_root: header.tree_of_trees_root,
                trees: trees.clone(),
            },
        );

        Ok(Self {
            page_size,
            file: Mutex::new(file),
            state: RwLock::new(CommittedState {
                revision: header.revision,
                header_seq: header.seq,
                authoritative_slot: slot,
                tot_root: header.tree_of_trees_root,
                trees,
            }),
            writer: Mutex::new(WriterCore {
                free_list,
                reclaimer: Reclaimer::new(config.reclaimer_threshold),
            }),
            readers: Mutex::new(ReaderTable {
                pins: BTreeMap::new(),
                snapshots,
            }),
            tot: Self::tot_handle(),
        })
    }

    fn tot_handle() -> BTree<StringSerializer, TreeInfoSerializer> {
        BTree::new(
            String::new(),
            StringSerializer,
            TreeInfoSerializer,
            TreeConfig {
                page_size: 16,
                allow_dups: false,
                ..TreeConfig::default()
            },
        )
    }

    // ------------------------------------------------------------------
    // transactions

    /// Snapshot the current committed state for reading. Never blocks on
    /// the writer.
    pub fn begin_read(&self) -> ReadTx<'_> {
        let state = self.state.rl();
        let mut table = self.readers.lock().unwrap();
        *table.pins.entry(state.revision).or_insert(0) += 1;
        ReadTx::new(self, state.revision, state.tot_root, state.trees.clone())
    }

    /// Open a read transaction at an earlier revision still retained in
    /// memory. Fails once the revision has been reclaimed (or after a
    /// reopen, which keeps only the latest revision).
    pub fn begin_read_at(&self, revision: u64) -> Result<ReadTx<'_>> {
        let mut table = self.readers.lock().unwrap();
        let snapshot = table
            .snapshots
            .get(&revision)
            .cloned()
            .ok_or(Error::RevisionUnavailable(revision))?;
        *table.pins.entry(revision).or_insert(0) += 1;
        Ok(ReadTx::new(
            self,
            revision,
            snapshot.tot_root,
            snapshot.trees,
        ))
    }

    /// Start the write transaction for the next revision, blocking until
    /// no other writer is active.
    pub fn begin_write(&self) -> Result<WriteTx<'_>> {
        let core = self.writer.lock().unwrap();
        let state = self.state.rl();
        Ok(WriteTx::new(
            self,
            core,
            state.revision + 1,
            state.tot_root,
            state.trees.clone(),
        ))
    }

    pub(crate) fn release_pin(&self, revision: u64) {
        let mut table = self.readers.lock().unwrap();
        if let Some(count) = table.pins.get_mut(&revision) {
            *count -= 1;
            if *count == 0 {
                table.pins.remove(&revision);
            }
        }
    }

    /// Make the transaction's work durable and publish its revision.
    pub(crate) fn commit_write(&self, tx: &mut WriteTx<'_>) -> Result<()> {
        let revision = tx.revision();

        // persist a fresh header record for every touched tree and point
        // the catalogue at it
        let dirty: Vec<String> = tx
            .working
            .iter()
            .filter(|(_, state)| state.dirty)
            .map(|(name, _)| name.clone())
            .collect();
        for name in dirty {
            let state = tx.working.get(&name).unwrap().clone();
            let bytes = encode_tree_header(&state);
            let new_offset = tx.write_record_pages(&bytes)?;
            if state.header_offset != NO_PAGE {
                tx.supersede_record(state.header_offset)?;
            }
            tx.working.get_mut(&name).unwrap().header_offset = new_offset;
            self.tot.insert(tx, &name, &(new_offset, revision))?;
        }

        // pages this transaction both wrote and replaced are garbage now
        let immediate = std::mem::take(&mut tx.immediate_free);
        if !immediate.is_empty() {
            let core = &mut *tx.core;
            self.with_file(|file| core.free_list.release(file, &immediate))?;
        }

        self.with_file(|file| file.sync())?;

        // flip to the non-authoritative header slot
        let (seq, slot) = {
            let state = self.state.rl();
            (state.header_seq + 1, 1 - state.authoritative_slot)
        };
        let header = FileHeader {
            seq,
            page_size: self.page_size as u32,
            tree_of_trees_root: tx.working_tot_root,
            free_list_head: tx.core.free_list.head(),
            revision,
        };
        self.with_file(|file| {
            header.store(file, slot)?;
            file.sync()
        })?;

        // the new header is durable: from here on nothing may be undone,
        // so strip the transaction of its abort state
        tx.take_allocated();

        // publish, then run the release pass under the same locks that
        // guard pin registration
        let superseded = std::mem::take(&mut tx.superseded);
        let released = {
            let mut state = self.state.wl();
            state.revision = revision;
            state.header_seq = seq;
            state.authoritative_slot = slot;
            state.tot_root = tx.working_tot_root;
            for (name, tree) in tx.working.drain() {
                let mut tree = tree;
                tree.dirty = false;
                state.trees.insert(name, tree);
            }

            let mut table = self.readers.lock().unwrap();
            table.snapshots.insert(
                revision,
                SnapshotState {
                    tot_root: state.tot_root,
                    trees: state.trees.clone(),
                },
            );

            tx.core.reclaimer.enqueue(revision, superseded);
            debug!(
                "reclaimer backlog: {} pages",
                tx.core.reclaimer.pending_pages()
            );
            if tx.core.reclaimer.note_commit() {
                let pin =
                    table.pins.keys().next().copied().unwrap_or(revision);
                let released = tx.core.reclaimer.collect_releasable(pin);
                table.snapshots.retain(|rev, _| *rev >= pin);
                released
            } else {
                Vec::new()
            }
        };

        if !released.is_empty() {
            let core = &mut *tx.core;
            self.with_file(|file| core.free_list.release(file, &released))?;
        }

        debug!("committed revision {}", revision);
        Ok(())
    }

    /// Return every page the transaction allocated to the free list; the
    /// published state was never touched.
    pub(crate) fn abort_write(&self, tx: &mut WriteTx<'_>) -> Result<()> {
        let mut orphans = tx.take_allocated();
        orphans.extend(std::mem::take(&mut tx.immediate_free));
        debug!(
            "aborting revision {}, {} pages returned",
            tx.revision(),
            orphans.len()
        );
        let core = &mut *tx.core;
        self.with_file(|file| core.free_list.release(file, &orphans))
    }

    // ------------------------------------------------------------------
    // tree registry

    /// Create and register a new named tree. Fails with `AlreadyManaged`
    /// when the name is taken.
    pub fn add_tree<KS, VS>(
        &self,
        name: &str,
        key_serializer: KS,
        value_serializer: VS,
        config: TreeConfig,
    ) -> Result<BTree<KS, VS>>
    where
        KS: Serializer,
        VS: Serializer,
    {
        if name.is_empty() {
            return Err(Error::corrupt("tree name must not be empty"));
        }
        if config.page_size < 4 {
            return Err(Error::corrupt(
                "tree page size must be at least 4 elements",
            ));
        }

        let mut tx = self.begin_write()?;
        if tx.tree_root(name).is_ok() {
            return Err(Error::AlreadyManaged(name.to_string()));
        }

        let revision = tx.revision();
        let leaf = BTreePage::Leaf(LeafPage {
            revision,
            ..LeafPage::default()
        });
        let root = tx.write_record_pages(&leaf.encode())?;

        tx.register_tree(
            TreeState {
                meta: TreeMeta {
                    name: name.to_string(),
                    key_tag: key_serializer.type_tag(),
                    value_tag: value_serializer.type_tag(),
                    allow_dups: config.allow_dups,
                    page_size: config.page_size as u32,
                },
                header_offset: NO_PAGE,
                root,
                count: 0,
                revision,
                dirty: true,
            },
            name,
        );
        tx.commit()?;

        Ok(BTree::new(
            name.to_string(),
            key_serializer,
            value_serializer,
            config,
        ))
    }

    /// Look up a managed tree by name. The supplied serializers must match
    /// the ones the tree was created with.
    pub fn get_tree<KS, VS>(
        &self,
        name: &str,
        key_serializer: KS,
        value_serializer: VS,
    ) -> Result<Option<BTree<KS, VS>>>
    where
        KS: Serializer,
        VS: Serializer,
    {
        let state = self.state.rl();
        let tree = match state.trees.get(name) {
            Some(tree) => tree,
            None => return Ok(None),
        };

        if tree.meta.key_tag != key_serializer.type_tag()
            || tree.meta.value_tag != value_serializer.type_tag()
        {
            return Err(Error::corrupt(format!(
                "tree `{}` was created with different serializers \
                 (stored tags {}/{}, supplied {}/{})",
                name,
                tree.meta.key_tag,
                tree.meta.value_tag,
                key_serializer.type_tag(),
                value_serializer.type_tag()
            )));
        }

        Ok(Some(BTree::new(
            name.to_string(),
            key_serializer,
            value_serializer,
            TreeConfig {
                page_size: tree.meta.page_size as usize,
                allow_dups: tree.meta.allow_dups,
                ..TreeConfig::default()
            },
        )))
    }

    /// Names of every managed tree.
    pub fn tree_names(&self) -> Vec<String> {
        let state = self.state.rl();
        let mut names: Vec<String> = state.trees.keys().cloned().collect();
        names.sort();
        names
    }

    // ------------------------------------------------------------------
    // observation

    pub fn current_revision(&self) -> u64 {
        self.state.rl().revision
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.file.lock().unwrap().cache_stats()
    }

    pub fn free_page_count(&self) -> usize {
        self.writer.lock().unwrap().free_list.len()
    }

    pub fn file_page_count(&self) -> u64 {
        self.file.lock().unwrap().len() / self.page_size as u64
    }

    /// Pages reachable from the current committed revision: catalogue,
    /// tree headers, tree pages and duplicate sub-trees, chains included.
    pub fn reachable_page_count(&self) -> Result<u64> {
        let (tot_root, trees) = {
            let state = self.state.rl();
            (state.tot_root, state.trees.clone())
        };

        let mut seen = HashSet::new();
        self.visit_tree_pages(tot_root, &mut seen)?;
        for tree in trees.values() {
            self.with_file(|file| {
                chain::read_record_with_offsets(file, tree.header_offset)
                    .map(|(_, offsets)| seen.extend(offsets))
            })?;
            self.visit_tree_pages(tree.root, &mut seen)?;
        }
        Ok(seen.len() as u64)
    }

    fn visit_tree_pages(
        &self,
        root: u64,
        seen: &mut HashSet<u64>,
    ) -> Result<()> {
        let mut stack = vec![root];
        while let Some(offset) = stack.pop() {
            if seen.contains(&offset) {
                continue;
            }
            let (bytes, offsets) = self.with_file(|file| {
                chain::read_record_with_offsets(file, offset)
            })?;
            seen.extend(offsets);
            match BTreePage::decode(&bytes)? {
                BTreePage::Node(node) => stack.extend(node.children),
                BTreePage::Leaf(leaf) => {
                    for slot in &leaf.values {
                        if let ValueSlot::SubTree(sub) = slot {
                            stack.push(*sub);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Persist the latest free-list head and sync the file.
    pub fn close(self) -> Result<()> {
        {
            let core = self.writer.lock().unwrap();
            let state = self.state.rl();
            let header = FileHeader {
                seq: state.header_seq + 1,
                page_size: self.page_size as u32,
                tree_of_trees_root: state.tot_root,
                free_list_head: core.free_list.head(),
                revision: state.revision,
            };
            let slot = 1 - state.authoritative_slot;
            self.with_file(|file| {
                header.store(file, slot)?;
                file.sync()
            })?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // internals shared with transactions and tree code

    pub(crate) fn page_size(&self) -> usize {
        self.page_size
    }

    pub(crate) fn with_file<R>(
        &self,
        f: impl FnOnce(&mut PageFile) -> Result<R>,
    ) -> Result<R> {
        let mut file = self.file.lock().unwrap();
        f(&mut file)
    }

    pub(crate) fn read_record_at(&self, offset: u64) -> Result<Vec<u8>> {
        self.with_file(|file| chain::read_record(file, offset))
    }
}

/// Depth-first walk of the tree-of-trees collecting (name, header offset)
/// pairs. Used at open, before any transaction machinery exists.
fn collect_tree_entries(
    file: &mut PageFile,
    root: u64,
    out: &mut Vec<(String, u64)>,
) -> Result<()> {
    let bytes = chain::read_record(file, root)?;
    match BTreePage::decode(&bytes)? {
        BTreePage::Node(node) => {
            for child in node.children {
                collect_tree_entries(file, child, out)?;
            }
        }
        BTreePage::Leaf(leaf) => {
            for (key, slot) in leaf.keys.iter().zip(leaf.values.iter()) {
                let name = String::from_utf8(key.clone())
                    .map_err(|_| Error::corrupt("tree name is not utf-8"))?;
                match slot {
                    ValueSlot::Inline(value) => {
                        let (header_offset, _) =
                            TreeInfoSerializer.deserialize(value)?;
                        out.push((name, header_offset));
                    }
                    ValueSlot::SubTree(_) => {
                        return Err(Error::corrupt(
                            "tree-of-trees must not hold sub-trees",
                        ));
                    }
                }
            }
        }
    }
    Ok(())
}
