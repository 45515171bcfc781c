//! *An SQLite-based storage backend for Zcash Orchard note scanning.*
//!
//! This crate persists the data structures produced and consumed by an Orchard
//! note scanner:
//!
//! - the scanner's incrementally-built note commitment tree, partitioned into
//!   subtrees ("shards") rooted at a fixed level, plus the "cap" of the tree
//!   above the shard roots;
//! - the spendable notes and nullifiers discovered while scanning;
//! - the checkpoints recorded at scanned block boundaries, which serve both as
//!   anchors for spend proofs and as rollback points;
//! - per-account scan progress (birthday height and last-scanned block).
//!
//! It performs no networking, no trial decryption, and no proof computation;
//! those belong to the scanner and transaction builder that sit on either side
//! of this storage boundary.
//!
//! # Design
//!
//! All state lives in a single SQLite database, owned exclusively by one
//! [`OrchardStorage`] value. The compound write paths,
//! [`OrchardStorage::update_notes`] and [`OrchardStorage::handle_chain_reorg`],
//! each execute as a single database transaction, so a failure in any step
//! leaves every table in its pre-call state. This is the central reliability contract of the crate: the note,
//! nullifier, checkpoint, and tree tables are never left in different epochs.
//!
//! The storage engine is designed for exactly one logical writer per account.
//! Every mutating operation takes `&mut self`, so confinement of writes to a
//! single owner is enforced by the borrow checker rather than by runtime
//! assertions. All I/O is synchronous and may block the calling thread;
//! callers needing responsiveness should run the engine on a dedicated worker
//! thread and communicate with it via message passing.
//!
//! The subset of operations consumed by the (out-of-scope) shard tree builder
//! is also exposed through the [`ShardTreeStore`] trait, implemented by
//! [`SqliteShardStore`] for both owned connections and borrowed transactions.
//!
//! [`ShardTreeStore`]: crate::wallet::commitment_tree::ShardTreeStore
//! [`SqliteShardStore`]: crate::wallet::commitment_tree::SqliteShardStore

use std::collections::BTreeSet;
use std::num::NonZeroU32;
use std::path::Path;

use incrementalmerkletree::{Address, Level, Position};
use rusqlite::Connection;
use shardtree::store::Checkpoint;
use tracing::debug;

use zcash_primitives::block::BlockHash;
use zcash_protocol::consensus::BlockHeight;

pub mod error;
pub mod wallet;

use error::Error;
use wallet::commitment_tree::{self, Shard, SubtreeRoot};

/// The level of the note commitment tree at which the roots of persisted shards are
/// located. Orchard uses a tree of depth 32 with subtrees of 2^16 leaves, matching the
/// subtree boundaries served by `lightwalletd`.
pub const ORCHARD_SHARD_HEIGHT: u8 = 16;

/// A newtype wrapper for the identifier of an account tracked by the storage database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccountId(pub u32);

/// The scan state recorded for a single account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountMeta {
    birthday_height: BlockHeight,
    latest_scanned_block: Option<BlockHeight>,
    latest_scanned_block_hash: Option<BlockHash>,
}

impl AccountMeta {
    /// The height below which the account is known to contain no notes, so scanning may
    /// begin there.
    pub fn birthday_height(&self) -> BlockHeight {
        self.birthday_height
    }

    /// The height of the last block scanned for this account, or `None` if scanning has
    /// not yet begun (or the sync state has been reset).
    pub fn latest_scanned_block(&self) -> Option<BlockHeight> {
        self.latest_scanned_block
    }

    /// The hash of the last block scanned for this account.
    pub fn latest_scanned_block_hash(&self) -> Option<BlockHash> {
        self.latest_scanned_block_hash
    }
}

/// A note discovered by the scanner, spendable by one of the wallet's accounts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Note {
    commitment: [u8; 32],
    position: Position,
    discovered_height: BlockHeight,
}

impl Note {
    /// Constructs a note record from the note commitment, the position of the
    /// commitment's leaf in the note commitment tree, and the height of the block in
    /// which the note was discovered.
    pub fn from_parts(
        commitment: [u8; 32],
        position: Position,
        discovered_height: BlockHeight,
    ) -> Self {
        Note {
            commitment,
            position,
            discovered_height,
        }
    }

    /// The note commitment that appears as a leaf of the note commitment tree.
    pub fn commitment(&self) -> &[u8; 32] {
        &self.commitment
    }

    /// The position of the note's commitment leaf in the note commitment tree.
    pub fn position(&self) -> Position {
        self.position
    }

    /// The height of the block in which this note was discovered.
    pub fn discovered_height(&self) -> BlockHeight {
        self.discovered_height
    }
}

/// A nullifier discovered by the scanner, revealing the spend of the note whose
/// commitment occupies the associated tree position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoteSpend {
    nullifier: [u8; 32],
    position: Position,
    discovered_height: BlockHeight,
}

impl NoteSpend {
    /// Constructs a spend record from the revealed nullifier, the tree position of the
    /// note it spends, and the height of the block in which it was discovered.
    pub fn from_parts(
        nullifier: [u8; 32],
        position: Position,
        discovered_height: BlockHeight,
    ) -> Self {
        NoteSpend {
            nullifier,
            position,
            discovered_height,
        }
    }

    /// The nullifier revealed by the spending transaction.
    pub fn nullifier(&self) -> &[u8; 32] {
        &self.nullifier
    }

    /// The position of the spent note's commitment leaf in the note commitment tree.
    pub fn position(&self) -> Position {
        self.position
    }

    /// The height of the block in which this spend was discovered.
    pub fn discovered_height(&self) -> BlockHeight {
        self.discovered_height
    }
}

/// A connection to the underlying storage database.
///
/// There must be at most one instance per database file; the instance exclusively owns
/// its connection, and hands out borrowed access to callers that need to compose
/// operations within one of its transactions.
pub struct OrchardStorage<C> {
    pub(crate) conn: C,
}

impl OrchardStorage<Connection> {
    /// Opens (creating if necessary) the storage database at the given path and ensures
    /// that its schema is up to date.
    pub fn for_path<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let conn = Connection::open(path).map_err(Error::DbInit)?;
        // The marks-removed table is cleaned up by cascading deletes from its parent
        // checkpoint rows; SQLite only honors the FK actions with this pragma set.
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(Error::DbInit)?;
        wallet::init::init_storage_db(&conn).map_err(Error::DbInit)?;
        Ok(OrchardStorage { conn })
    }

    /// Executes the provided closure in a single database transaction, committing on
    /// success and rolling back every write on failure.
    pub(crate) fn transactionally<F, A>(&mut self, f: F) -> Result<A, Error>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<A, Error>,
    {
        let tx = self.conn.transaction().map_err(Error::TransactionBegin)?;
        let result = f(&tx)?;
        tx.commit().map_err(Error::TransactionCommit)?;
        Ok(result)
    }

    /// Drops all storage tables and recreates the schema from scratch.
    ///
    /// This is a destructive full reset, distinct from [`Self::handle_chain_reorg`]: it
    /// discards account registrations along with all scanned state.
    pub fn reset_database(&mut self) -> Result<(), Error> {
        debug!("Resetting storage database");
        self.transactionally(|tx| {
            wallet::init::drop_storage_tables(tx).map_err(Error::Db)?;
            wallet::init::init_storage_db(tx).map_err(Error::Db)
        })
    }

    /// Adds an account to the database with the given birthday height, returning its
    /// metadata.
    ///
    /// This operation is idempotent: registering an account that already exists returns
    /// the existing metadata unchanged.
    pub fn register_account(
        &mut self,
        account: AccountId,
        birthday_height: BlockHeight,
    ) -> Result<AccountMeta, Error> {
        self.transactionally(|tx| wallet::register_account(tx, account, birthday_height))
    }

    /// Returns the scan state recorded for the given account.
    pub fn get_account_meta(&self, account: AccountId) -> Result<AccountMeta, Error> {
        wallet::get_account_meta(&self.conn, account)
    }

    /// Clears the account's last-scanned block pointer, forcing the next scan to begin
    /// from the account birthday.
    ///
    /// This does not remove notes, nullifiers, or tree state; callers forcing a full
    /// rescan must also reset the tree via [`Self::reset_database`] or targeted
    /// truncation.
    pub fn reset_account_sync_state(&mut self, account: AccountId) -> Result<(), Error> {
        wallet::reset_account_sync_state(&self.conn, account)
    }

    /// Records the results of scanning one or more blocks: the notes and nullifiers
    /// discovered, and the new last-scanned block for the account.
    ///
    /// This is the sole production write path for note data. All three writes execute
    /// in a single transaction; a failure in any step leaves the database unchanged.
    pub fn update_notes(
        &mut self,
        account: AccountId,
        notes: &[Note],
        spends: &[NoteSpend],
        latest_scanned_block: BlockHeight,
        latest_scanned_block_hash: BlockHash,
    ) -> Result<(), Error> {
        debug!(
            account = account.0,
            notes = notes.len(),
            spends = spends.len(),
            height = u32::from(latest_scanned_block),
            "Recording scan results"
        );
        self.transactionally(|tx| {
            wallet::put_received_notes(tx, account, notes)?;
            wallet::put_note_spends(tx, account, spends)?;
            wallet::update_last_scanned_block(
                tx,
                account,
                latest_scanned_block,
                latest_scanned_block_hash,
            )
        })
    }

    /// Returns the account's notes for which no spending nullifier has been discovered,
    /// in ascending order of tree position.
    pub fn get_spendable_notes(&self, account: AccountId) -> Result<Vec<Note>, Error> {
        wallet::get_spendable_notes(&self.conn, account)
    }

    /// Returns all discovered spends for the given account.
    pub fn get_nullifiers(&self, account: AccountId) -> Result<Vec<NoteSpend>, Error> {
        wallet::get_nullifiers(&self.conn, account)
    }

    /// Rolls the account's state back to the given block height in response to a chain
    /// reorganization.
    ///
    /// In a single transaction, this removes notes and nullifiers discovered above the
    /// reorg height, truncates tree state derived from blocks above it (including the
    /// cap, which the scanner must rebuild), removes checkpoints above it, and resets
    /// the account's last-scanned block to the reorg point.
    pub fn handle_chain_reorg(
        &mut self,
        account: AccountId,
        reorg_height: BlockHeight,
        reorg_block_hash: BlockHash,
    ) -> Result<(), Error> {
        self.transactionally(|tx| {
            wallet::truncate_to_height(tx, account, reorg_height, reorg_block_hash)
        })
    }

    /// Returns the serialized cap (the portion of the tree above the shard roots) for
    /// the given account, if one has been stored.
    pub fn get_cap(&self, account: AccountId) -> Result<Option<Vec<u8>>, Error> {
        commitment_tree::get_cap(&self.conn, account)
    }

    /// Replaces the stored cap for the given account.
    pub fn put_cap(&mut self, account: AccountId, cap: &[u8]) -> Result<(), Error> {
        commitment_tree::put_cap(&self.conn, account, cap)
    }

    /// Returns the shard with the given root address, if it has been stored.
    pub fn get_shard(&self, account: AccountId, addr: Address) -> Result<Option<Shard>, Error> {
        commitment_tree::get_shard(&self.conn, account, addr)
    }

    /// Returns the shard with the highest index at the given shard root level.
    pub fn last_shard(
        &self,
        account: AccountId,
        shard_root_level: Level,
    ) -> Result<Option<Shard>, Error> {
        commitment_tree::last_shard(&self.conn, account, shard_root_level)
    }

    /// Inserts or replaces the shard at the shard's address.
    ///
    /// Overwriting an incomplete shard with a completed one (whose root hash has become
    /// known) is valid and expected as scanning fills gaps.
    pub fn put_shard(&mut self, account: AccountId, shard: &Shard) -> Result<(), Error> {
        self.transactionally(|tx| commitment_tree::put_shard(tx, account, shard))
    }

    /// Returns the highest shard index stored at the shard root level, or `None` if no
    /// shards have been stored. The scanner uses this to know where to resume.
    pub fn get_latest_shard_index(&self, account: AccountId) -> Result<Option<u64>, Error> {
        commitment_tree::get_latest_shard_index(&self.conn, account)
    }

    /// Deletes all shards with index greater than or equal to `shard_index` at the
    /// shard root level.
    pub fn truncate_shards(&mut self, account: AccountId, shard_index: u64) -> Result<(), Error> {
        commitment_tree::truncate_shards(&self.conn, account, shard_index)
    }

    /// Records subtree roots discovered from compact block headers, beginning at
    /// `start_index`, ahead of full shard materialization.
    pub fn update_subtree_roots(
        &mut self,
        account: AccountId,
        start_index: u64,
        roots: &[SubtreeRoot],
    ) -> Result<(), Error> {
        self.transactionally(|tx| {
            commitment_tree::update_subtree_roots(tx, account, start_index, roots)
        })
    }

    /// Returns the addresses of all registered subtree roots at the given level, in
    /// ascending index order.
    pub fn get_shard_roots(
        &self,
        account: AccountId,
        shard_level: Level,
    ) -> Result<Vec<Address>, Error> {
        commitment_tree::get_shard_roots(&self.conn, account, shard_level)
    }

    /// Adds a checkpoint recording the tree state at the given block height.
    ///
    /// Checkpoint identifiers are block heights and must be strictly increasing;
    /// adding a checkpoint at or below the current maximum fails with
    /// [`Error::CheckpointConflict`] without modifying the store.
    pub fn add_checkpoint(
        &mut self,
        account: AccountId,
        checkpoint_id: BlockHeight,
        checkpoint: Checkpoint,
    ) -> Result<(), Error> {
        self.transactionally(|tx| {
            commitment_tree::add_checkpoint(tx, account, checkpoint_id, checkpoint)
        })
    }

    /// Removes the single checkpoint with the given identifier, if it exists.
    pub fn remove_checkpoint(
        &mut self,
        account: AccountId,
        checkpoint_id: BlockHeight,
    ) -> Result<(), Error> {
        self.transactionally(|tx| commitment_tree::remove_checkpoint(tx, account, checkpoint_id))
    }

    /// Removes all checkpoints with identifiers greater than or equal to the given
    /// identifier.
    pub fn truncate_checkpoints(
        &mut self,
        account: AccountId,
        checkpoint_id: BlockHeight,
    ) -> Result<(), Error> {
        self.transactionally(|tx| commitment_tree::truncate_checkpoints(tx, account, checkpoint_id))
    }

    /// Returns the number of checkpoints in the store for the given account.
    pub fn checkpoint_count(&self, account: AccountId) -> Result<usize, Error> {
        commitment_tree::checkpoint_count(&self.conn, account)
    }

    /// Returns the lowest checkpoint identifier in the store.
    pub fn min_checkpoint_id(&self, account: AccountId) -> Result<Option<BlockHeight>, Error> {
        commitment_tree::min_checkpoint_id(&self.conn, account)
    }

    /// Returns the highest checkpoint identifier in the store.
    pub fn max_checkpoint_id(&self, account: AccountId) -> Result<Option<BlockHeight>, Error> {
        commitment_tree::max_checkpoint_id(&self.conn, account)
    }

    /// Returns the checkpoint with the given identifier, if it exists.
    pub fn get_checkpoint(
        &self,
        account: AccountId,
        checkpoint_id: BlockHeight,
    ) -> Result<Option<Checkpoint>, Error> {
        commitment_tree::get_checkpoint(&self.conn, account, checkpoint_id)
    }

    /// Returns up to `limit` checkpoints, most recent first.
    pub fn get_checkpoints(
        &self,
        account: AccountId,
        limit: usize,
    ) -> Result<Vec<(BlockHeight, Checkpoint)>, Error> {
        commitment_tree::get_checkpoints(&self.conn, account, limit)
    }

    /// Returns the checkpoint that is `checkpoint_depth` checkpoints back from the
    /// most recent; depth 0 is the most recent checkpoint itself.
    pub fn get_checkpoint_at_depth(
        &self,
        account: AccountId,
        checkpoint_depth: usize,
    ) -> Result<Option<(BlockHeight, Checkpoint)>, Error> {
        commitment_tree::get_checkpoint_at_depth(&self.conn, account, checkpoint_depth)
    }

    /// Returns the set of note positions whose spend became known at the given
    /// checkpoint, or `None` if no such checkpoint exists.
    pub fn get_marks_removed(
        &self,
        account: AccountId,
        checkpoint_id: BlockHeight,
    ) -> Result<Option<BTreeSet<Position>>, Error> {
        commitment_tree::get_marks_removed(&self.conn, account, checkpoint_id)
    }

    /// Returns the highest checkpointed block height that is safe to use as a spend
    /// proof anchor, given the current chain tip and a required number of
    /// confirmations: the highest checkpoint identifier not exceeding
    /// `chain_tip_height - min_confirmations`.
    ///
    /// Returns `Ok(None)` if checkpoints exist but none is old enough to qualify, and
    /// fails with [`Error::NoCheckpoints`] if the store contains no checkpoints at all.
    pub fn get_max_checkpointed_height(
        &self,
        account: AccountId,
        chain_tip_height: BlockHeight,
        min_confirmations: NonZeroU32,
    ) -> Result<Option<BlockHeight>, Error> {
        commitment_tree::get_max_checkpointed_height(
            &self.conn,
            account,
            chain_tip_height,
            min_confirmations,
        )
    }
}
