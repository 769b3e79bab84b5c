//! An embedded, single-file, append-oriented storage engine exposing named
//! ordered maps backed by copy-on-write B+trees.
//!
//! A [`RecordManager`] owns one backing file and a catalogue of named trees.
//! Readers open cheap snapshot transactions bound to a committed revision;
//! a single writer builds the next revision by copying every touched page,
//! then publishes it with an atomic header swap.

mod error;
mod io;
mod serializer;
mod utils;

mod page;

mod btree;

mod reclaimer;
mod record_manager;
mod transaction;

pub use crate::{
    btree::{BTree, Cursor, TreeConfig},
    error::{Error, Result},
    io::CacheStats,
    record_manager::{RecordManager, RecordManagerConfig},
    serializer::{
        BytesSerializer, IntSerializer, LongSerializer, Serializer,
        StringSerializer,
    },
    transaction::{ReadTx, TxView, WriteTx},
    utils::init_log,
};

/// Sentinel offset meaning "no page".
pub(crate) const NO_PAGE: u64 = u64::MAX;
