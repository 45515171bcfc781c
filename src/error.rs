//! Error types for problems that may arise when reading or storing wallet data to SQLite.

use std::error;
use std::fmt;
use std::ops::Range;

use zcash_protocol::consensus::BlockHeight;

use crate::AccountId;

/// The primary error type for the SQLite Orchard storage backend.
#[derive(Debug)]
pub enum Error {
    /// The underlying database could not be opened, or its schema could not be
    /// initialized. This is fatal for the storage instance that produced it.
    DbInit(rusqlite::Error),

    /// A lookup was made for an account that has not been registered.
    AccountUnknown(AccountId),

    /// A read or write statement failed in the underlying database.
    Db(rusqlite::Error),

    /// The transactional envelope for a multi-statement write could not be created.
    TransactionBegin(rusqlite::Error),

    /// The transactional envelope for a multi-statement write could not be committed.
    /// All writes made inside the transaction have been rolled back.
    TransactionCommit(rusqlite::Error),

    /// Decoding of a stored value from its serialized form has failed.
    CorruptedData(String),

    /// An anchor or checkpoint query was made against an empty checkpoint store.
    NoCheckpoints,

    /// Raised when the caller attempts to add a checkpoint whose identifier does not
    /// exceed the highest checkpoint identifier already in the store. Checkpoint
    /// identifiers are block heights and must be strictly increasing; a non-increasing
    /// identifier indicates that the wallet failed to truncate the tree after a chain
    /// reorg.
    CheckpointConflict {
        checkpoint_id: BlockHeight,
        max_checkpoint_id: BlockHeight,
    },

    /// Raised when attempting to add shards or subtree roots to the database that are
    /// discontinuous with the existing range of shard indices.
    SubtreeDiscontinuity {
        attempted_insertion_range: Range<u64>,
        existing_range: Range<u64>,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self {
            Error::DbInit(err) => write!(f, "Failed to initialize the storage database: {}", err),
            Error::AccountUnknown(account_id) => write!(
                f,
                "Account {} does not belong to this wallet.",
                account_id.0
            ),
            Error::Db(err) => write!(f, "{}", err),
            Error::TransactionBegin(err) => {
                write!(f, "Failed to create a database transaction: {}", err)
            }
            Error::TransactionCommit(err) => {
                write!(f, "Failed to commit a database transaction: {}", err)
            }
            Error::CorruptedData(reason) => write!(f, "Data DB is corrupted: {}", reason),
            Error::NoCheckpoints => write!(f, "The checkpoint store contains no checkpoints."),
            Error::CheckpointConflict {
                checkpoint_id,
                max_checkpoint_id,
            } => {
                write!(
                    f,
                    "Tried to insert checkpoint {}, which does not exceed the current maximum checkpoint id {}",
                    checkpoint_id, max_checkpoint_id
                )
            }
            Error::SubtreeDiscontinuity {
                attempted_insertion_range,
                existing_range,
            } => {
                write!(
                    f,
                    "Attempted to write subtrees with indices {:?} which is discontinuous with existing subtree range {:?}",
                    attempted_insertion_range, existing_range,
                )
            }
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self {
            Error::DbInit(e) => Some(e),
            Error::Db(e) => Some(e),
            Error::TransactionBegin(e) => Some(e),
            Error::TransactionCommit(e) => Some(e),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Db(e)
    }
}
