//! SQLite persistence for the shard-partitioned note commitment tree.
//!
//! The tree itself is built and interpreted by a component outside this crate; shard
//! and cap payloads are opaque byte strings here. This module stores them, the subtree
//! roots learned from compact block headers, and the checkpoints recorded at scanned
//! block boundaries, and exposes the whole surface through the [`ShardTreeStore`]
//! capability trait so that the tree builder can be tested against an in-memory
//! substitute.

use rusqlite::{self, named_params, OptionalExtension};
use std::collections::BTreeSet;
use std::num::NonZeroU32;
use std::ops::Range;

use incrementalmerkletree::{Address, Level, Position};
use shardtree::store::{Checkpoint, TreeState};

use zcash_protocol::consensus::BlockHeight;

use crate::{error::Error, wallet, AccountId, AccountMeta, ORCHARD_SHARD_HEIGHT};

pub(crate) const SHARD_ROOT_LEVEL: Level = Level::new(ORCHARD_SHARD_HEIGHT);

/// A subtree of the note commitment tree, rooted at the shard root level.
///
/// The subtree contents are an opaque serialization produced by the tree builder; the
/// root hash is present only once every leaf of the subtree is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shard {
    address: Address,
    root_hash: Option<Vec<u8>>,
    shard_data: Vec<u8>,
    subtree_end_height: Option<BlockHeight>,
}

impl Shard {
    /// Constructs a shard record from its constituent parts.
    pub fn from_parts(
        address: Address,
        root_hash: Option<Vec<u8>>,
        shard_data: Vec<u8>,
        subtree_end_height: Option<BlockHeight>,
    ) -> Self {
        Shard {
            address,
            root_hash,
            shard_data,
            subtree_end_height,
        }
    }

    /// The address of the subtree's root node.
    pub fn address(&self) -> Address {
        self.address
    }

    /// The root hash of the subtree, if the subtree has been completed.
    pub fn root_hash(&self) -> Option<&[u8]> {
        self.root_hash.as_deref()
    }

    /// The opaque serialized subtree.
    pub fn shard_data(&self) -> &[u8] {
        &self.shard_data
    }

    /// The height of the block containing the subtree's rightmost known leaf.
    pub fn subtree_end_height(&self) -> Option<BlockHeight> {
        self.subtree_end_height
    }
}

/// The root of a completed subtree, as learned from a compact block header ahead of
/// full shard materialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubtreeRoot {
    subtree_end_height: BlockHeight,
    root_hash: Vec<u8>,
}

impl SubtreeRoot {
    /// Constructs a subtree root record from the height of the block completing the
    /// subtree and the subtree's root hash.
    pub fn from_parts(subtree_end_height: BlockHeight, root_hash: Vec<u8>) -> Self {
        SubtreeRoot {
            subtree_end_height,
            root_hash,
        }
    }

    /// The height of the block in which the last leaf of the subtree appeared.
    pub fn subtree_end_height(&self) -> BlockHeight {
        self.subtree_end_height
    }

    /// The root hash of the completed subtree.
    pub fn root_hash(&self) -> &[u8] {
        &self.root_hash
    }
}

/// The persistent storage capability consumed by the shard tree builder.
///
/// A value implementing this trait is scoped to a single account's tree; per-account
/// state is a non-shareable unit (see the crate-level discussion of writer
/// confinement). [`SqliteShardStore`] implements it against the storage database, for
/// both an owned connection and a transaction borrowed from [`OrchardStorage`]; tests
/// of tree-building logic can substitute an in-memory implementation.
///
/// [`OrchardStorage`]: crate::OrchardStorage
pub trait ShardTreeStore {
    /// The error type produced by storage operations.
    type Error: std::error::Error;

    /// Adds the store's account with the given birthday height, returning its
    /// metadata. Idempotent: an already-registered account is returned unchanged.
    fn register_account(&mut self, birthday_height: BlockHeight)
        -> Result<AccountMeta, Self::Error>;

    /// Returns the scan state recorded for the store's account.
    fn get_account_meta(&self) -> Result<AccountMeta, Self::Error>;

    /// Clears the account's last-scanned block pointer, forcing the next scan to
    /// begin from the account birthday.
    fn reset_account_sync_state(&mut self) -> Result<(), Self::Error>;

    /// Returns the serialized cap, if one has been stored.
    fn get_cap(&self) -> Result<Option<Vec<u8>>, Self::Error>;

    /// Replaces the stored cap.
    fn put_cap(&mut self, cap: &[u8]) -> Result<(), Self::Error>;

    /// Returns the shard with the given root address, if it has been stored.
    fn get_shard(&self, addr: Address) -> Result<Option<Shard>, Self::Error>;

    /// Returns the shard with the highest index at the given shard root level.
    fn last_shard(&self, shard_root_level: Level) -> Result<Option<Shard>, Self::Error>;

    /// Inserts or replaces the shard at the shard's address.
    fn put_shard(&mut self, shard: &Shard) -> Result<(), Self::Error>;

    /// Returns the highest shard index stored at the shard root level.
    fn get_latest_shard_index(&self) -> Result<Option<u64>, Self::Error>;

    /// Deletes all shards with index `>= shard_index` at the shard root level.
    fn truncate_shards(&mut self, shard_index: u64) -> Result<(), Self::Error>;

    /// Records subtree roots discovered from compact block headers, beginning at
    /// `start_index`.
    fn update_subtree_roots(
        &mut self,
        start_index: u64,
        roots: &[SubtreeRoot],
    ) -> Result<(), Self::Error>;

    /// Returns the addresses of all registered subtree roots at the given level.
    fn get_shard_roots(&self, shard_level: Level) -> Result<Vec<Address>, Self::Error>;

    /// Adds a checkpoint at the given block height. Checkpoint identifiers must be
    /// strictly increasing.
    fn add_checkpoint(
        &mut self,
        checkpoint_id: BlockHeight,
        checkpoint: Checkpoint,
    ) -> Result<(), Self::Error>;

    /// Removes the checkpoint with the given identifier, if it exists.
    fn remove_checkpoint(&mut self, checkpoint_id: BlockHeight) -> Result<(), Self::Error>;

    /// Removes all checkpoints with identifiers `>= checkpoint_id`.
    fn truncate_checkpoints(&mut self, checkpoint_id: BlockHeight) -> Result<(), Self::Error>;

    /// Returns the number of checkpoints in the store.
    fn checkpoint_count(&self) -> Result<usize, Self::Error>;

    /// Returns the lowest checkpoint identifier in the store.
    fn min_checkpoint_id(&self) -> Result<Option<BlockHeight>, Self::Error>;

    /// Returns the highest checkpoint identifier in the store.
    fn max_checkpoint_id(&self) -> Result<Option<BlockHeight>, Self::Error>;

    /// Returns the checkpoint with the given identifier, if it exists.
    fn get_checkpoint(&self, checkpoint_id: BlockHeight)
        -> Result<Option<Checkpoint>, Self::Error>;

    /// Returns up to `limit` checkpoints, most recent first.
    fn get_checkpoints(&self, limit: usize)
        -> Result<Vec<(BlockHeight, Checkpoint)>, Self::Error>;

    /// Returns the checkpoint `checkpoint_depth` checkpoints back from the most
    /// recent; depth 0 is the most recent checkpoint.
    fn get_checkpoint_at_depth(
        &self,
        checkpoint_depth: usize,
    ) -> Result<Option<(BlockHeight, Checkpoint)>, Self::Error>;

    /// Returns the note positions whose spend became known at the given checkpoint,
    /// or `None` if no such checkpoint exists.
    fn get_marks_removed(
        &self,
        checkpoint_id: BlockHeight,
    ) -> Result<Option<BTreeSet<Position>>, Self::Error>;

    /// Returns the highest checkpoint identifier not exceeding
    /// `chain_tip_height - min_confirmations`, or `None` if no checkpoint qualifies.
    /// Fails if the store contains no checkpoints at all.
    fn get_max_checkpointed_height(
        &self,
        chain_tip_height: BlockHeight,
        min_confirmations: NonZeroU32,
    ) -> Result<Option<BlockHeight>, Self::Error>;
}

/// A [`ShardTreeStore`] implementation backed by the storage database, scoped to a
/// single account.
pub struct SqliteShardStore<C> {
    pub(crate) conn: C,
    account: AccountId,
}

impl<C> SqliteShardStore<C> {
    /// Constructs a store for the given account over the provided connection or
    /// borrowed transaction.
    pub fn from_connection(conn: C, account: AccountId) -> Self {
        SqliteShardStore { conn, account }
    }
}

impl<'conn, 'a> ShardTreeStore for SqliteShardStore<&'a rusqlite::Transaction<'conn>> {
    type Error = Error;

    fn register_account(&mut self, birthday_height: BlockHeight) -> Result<AccountMeta, Error> {
        wallet::register_account(self.conn, self.account, birthday_height)
    }

    fn get_account_meta(&self) -> Result<AccountMeta, Error> {
        wallet::get_account_meta(self.conn, self.account)
    }

    fn reset_account_sync_state(&mut self) -> Result<(), Error> {
        wallet::reset_account_sync_state(self.conn, self.account)
    }

    fn get_cap(&self) -> Result<Option<Vec<u8>>, Error> {
        get_cap(self.conn, self.account)
    }

    fn put_cap(&mut self, cap: &[u8]) -> Result<(), Error> {
        put_cap(self.conn, self.account, cap)
    }

    fn get_shard(&self, addr: Address) -> Result<Option<Shard>, Error> {
        get_shard(self.conn, self.account, addr)
    }

    fn last_shard(&self, shard_root_level: Level) -> Result<Option<Shard>, Error> {
        last_shard(self.conn, self.account, shard_root_level)
    }

    fn put_shard(&mut self, shard: &Shard) -> Result<(), Error> {
        put_shard(self.conn, self.account, shard)
    }

    fn get_latest_shard_index(&self) -> Result<Option<u64>, Error> {
        get_latest_shard_index(self.conn, self.account)
    }

    fn truncate_shards(&mut self, shard_index: u64) -> Result<(), Error> {
        truncate_shards(self.conn, self.account, shard_index)
    }

    fn update_subtree_roots(
        &mut self,
        start_index: u64,
        roots: &[SubtreeRoot],
    ) -> Result<(), Error> {
        update_subtree_roots(self.conn, self.account, start_index, roots)
    }

    fn get_shard_roots(&self, shard_level: Level) -> Result<Vec<Address>, Error> {
        get_shard_roots(self.conn, self.account, shard_level)
    }

    fn add_checkpoint(
        &mut self,
        checkpoint_id: BlockHeight,
        checkpoint: Checkpoint,
    ) -> Result<(), Error> {
        add_checkpoint(self.conn, self.account, checkpoint_id, checkpoint)
    }

    fn remove_checkpoint(&mut self, checkpoint_id: BlockHeight) -> Result<(), Error> {
        remove_checkpoint(self.conn, self.account, checkpoint_id)
    }

    fn truncate_checkpoints(&mut self, checkpoint_id: BlockHeight) -> Result<(), Error> {
        truncate_checkpoints(self.conn, self.account, checkpoint_id)
    }

    fn checkpoint_count(&self) -> Result<usize, Error> {
        checkpoint_count(self.conn, self.account)
    }

    fn min_checkpoint_id(&self) -> Result<Option<BlockHeight>, Error> {
        min_checkpoint_id(self.conn, self.account)
    }

    fn max_checkpoint_id(&self) -> Result<Option<BlockHeight>, Error> {
        max_checkpoint_id(self.conn, self.account)
    }

    fn get_checkpoint(&self, checkpoint_id: BlockHeight) -> Result<Option<Checkpoint>, Error> {
        get_checkpoint(self.conn, self.account, checkpoint_id)
    }

    fn get_checkpoints(&self, limit: usize) -> Result<Vec<(BlockHeight, Checkpoint)>, Error> {
        get_checkpoints(self.conn, self.account, limit)
    }

    fn get_checkpoint_at_depth(
        &self,
        checkpoint_depth: usize,
    ) -> Result<Option<(BlockHeight, Checkpoint)>, Error> {
        get_checkpoint_at_depth(self.conn, self.account, checkpoint_depth)
    }

    fn get_marks_removed(
        &self,
        checkpoint_id: BlockHeight,
    ) -> Result<Option<BTreeSet<Position>>, Error> {
        get_marks_removed(self.conn, self.account, checkpoint_id)
    }

    fn get_max_checkpointed_height(
        &self,
        chain_tip_height: BlockHeight,
        min_confirmations: NonZeroU32,
    ) -> Result<Option<BlockHeight>, Error> {
        get_max_checkpointed_height(self.conn, self.account, chain_tip_height, min_confirmations)
    }
}

impl ShardTreeStore for SqliteShardStore<rusqlite::Connection> {
    type Error = Error;

    fn register_account(&mut self, birthday_height: BlockHeight) -> Result<AccountMeta, Error> {
        let tx = self.conn.transaction().map_err(Error::TransactionBegin)?;
        let meta = wallet::register_account(&tx, self.account, birthday_height)?;
        tx.commit().map_err(Error::TransactionCommit)?;
        Ok(meta)
    }

    fn get_account_meta(&self) -> Result<AccountMeta, Error> {
        wallet::get_account_meta(&self.conn, self.account)
    }

    fn reset_account_sync_state(&mut self) -> Result<(), Error> {
        wallet::reset_account_sync_state(&self.conn, self.account)
    }

    fn get_cap(&self) -> Result<Option<Vec<u8>>, Error> {
        get_cap(&self.conn, self.account)
    }

    fn put_cap(&mut self, cap: &[u8]) -> Result<(), Error> {
        put_cap(&self.conn, self.account, cap)
    }

    fn get_shard(&self, addr: Address) -> Result<Option<Shard>, Error> {
        get_shard(&self.conn, self.account, addr)
    }

    fn last_shard(&self, shard_root_level: Level) -> Result<Option<Shard>, Error> {
        last_shard(&self.conn, self.account, shard_root_level)
    }

    fn put_shard(&mut self, shard: &Shard) -> Result<(), Error> {
        let tx = self.conn.transaction().map_err(Error::TransactionBegin)?;
        put_shard(&tx, self.account, shard)?;
        tx.commit().map_err(Error::TransactionCommit)
    }

    fn get_latest_shard_index(&self) -> Result<Option<u64>, Error> {
        get_latest_shard_index(&self.conn, self.account)
    }

    fn truncate_shards(&mut self, shard_index: u64) -> Result<(), Error> {
        truncate_shards(&self.conn, self.account, shard_index)
    }

    fn update_subtree_roots(
        &mut self,
        start_index: u64,
        roots: &[SubtreeRoot],
    ) -> Result<(), Error> {
        let tx = self.conn.transaction().map_err(Error::TransactionBegin)?;
        update_subtree_roots(&tx, self.account, start_index, roots)?;
        tx.commit().map_err(Error::TransactionCommit)
    }

    fn get_shard_roots(&self, shard_level: Level) -> Result<Vec<Address>, Error> {
        get_shard_roots(&self.conn, self.account, shard_level)
    }

    fn add_checkpoint(
        &mut self,
        checkpoint_id: BlockHeight,
        checkpoint: Checkpoint,
    ) -> Result<(), Error> {
        let tx = self.conn.transaction().map_err(Error::TransactionBegin)?;
        add_checkpoint(&tx, self.account, checkpoint_id, checkpoint)?;
        tx.commit().map_err(Error::TransactionCommit)
    }

    fn remove_checkpoint(&mut self, checkpoint_id: BlockHeight) -> Result<(), Error> {
        let tx = self.conn.transaction().map_err(Error::TransactionBegin)?;
        remove_checkpoint(&tx, self.account, checkpoint_id)?;
        tx.commit().map_err(Error::TransactionCommit)
    }

    fn truncate_checkpoints(&mut self, checkpoint_id: BlockHeight) -> Result<(), Error> {
        let tx = self.conn.transaction().map_err(Error::TransactionBegin)?;
        truncate_checkpoints(&tx, self.account, checkpoint_id)?;
        tx.commit().map_err(Error::TransactionCommit)
    }

    fn checkpoint_count(&self) -> Result<usize, Error> {
        checkpoint_count(&self.conn, self.account)
    }

    fn min_checkpoint_id(&self) -> Result<Option<BlockHeight>, Error> {
        min_checkpoint_id(&self.conn, self.account)
    }

    fn max_checkpoint_id(&self) -> Result<Option<BlockHeight>, Error> {
        max_checkpoint_id(&self.conn, self.account)
    }

    fn get_checkpoint(&self, checkpoint_id: BlockHeight) -> Result<Option<Checkpoint>, Error> {
        get_checkpoint(&self.conn, self.account, checkpoint_id)
    }

    fn get_checkpoints(&self, limit: usize) -> Result<Vec<(BlockHeight, Checkpoint)>, Error> {
        get_checkpoints(&self.conn, self.account, limit)
    }

    fn get_checkpoint_at_depth(
        &self,
        checkpoint_depth: usize,
    ) -> Result<Option<(BlockHeight, Checkpoint)>, Error> {
        get_checkpoint_at_depth(&self.conn, self.account, checkpoint_depth)
    }

    fn get_marks_removed(
        &self,
        checkpoint_id: BlockHeight,
    ) -> Result<Option<BTreeSet<Position>>, Error> {
        get_marks_removed(&self.conn, self.account, checkpoint_id)
    }

    fn get_max_checkpointed_height(
        &self,
        chain_tip_height: BlockHeight,
        min_confirmations: NonZeroU32,
    ) -> Result<Option<BlockHeight>, Error> {
        get_max_checkpointed_height(&self.conn, self.account, chain_tip_height, min_confirmations)
    }
}

fn shard_from_row(
    addr: Address,
    root_hash: Option<Vec<u8>>,
    shard_data: Vec<u8>,
    subtree_end_height: Option<u32>,
) -> Shard {
    Shard::from_parts(
        addr,
        root_hash,
        shard_data,
        subtree_end_height.map(BlockHeight::from),
    )
}

pub(crate) fn get_shard(
    conn: &rusqlite::Connection,
    account: AccountId,
    shard_root_addr: Address,
) -> Result<Option<Shard>, Error> {
    conn.query_row(
        "SELECT root_hash, shard_data, subtree_end_height
         FROM orchard_tree_shards
         WHERE account_id = :account_id
         AND shard_level = :shard_level
         AND shard_index = :shard_index",
        named_params![
            ":account_id": account.0,
            ":shard_level": u8::from(shard_root_addr.level()),
            ":shard_index": shard_root_addr.index(),
        ],
        |row| {
            Ok(shard_from_row(
                shard_root_addr,
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
            ))
        },
    )
    .optional()
    .map_err(Error::Db)
}

pub(crate) fn last_shard(
    conn: &rusqlite::Connection,
    account: AccountId,
    shard_root_level: Level,
) -> Result<Option<Shard>, Error> {
    conn.query_row(
        "SELECT shard_index, root_hash, shard_data, subtree_end_height
         FROM orchard_tree_shards
         WHERE account_id = :account_id AND shard_level = :shard_level
         ORDER BY shard_index DESC
         LIMIT 1",
        named_params![
            ":account_id": account.0,
            ":shard_level": u8::from(shard_root_level),
        ],
        |row| {
            let shard_index: u64 = row.get(0)?;
            Ok(shard_from_row(
                Address::from_parts(shard_root_level, shard_index),
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
            ))
        },
    )
    .optional()
    .map_err(Error::Db)
}

/// Returns an error iff the proposed insertion range for the given subtree table would
/// create a discontinuity in the stored index range.
fn check_shard_discontinuity(
    conn: &rusqlite::Connection,
    table: &'static str,
    account: AccountId,
    shard_level: Level,
    proposed_insertion_range: Range<u64>,
) -> Result<(), Error> {
    if let Ok((Some(stored_min), Some(stored_max))) = conn
        .query_row(
            &format!(
                "SELECT MIN(shard_index), MAX(shard_index) FROM {}
                 WHERE account_id = :account_id AND shard_level = :shard_level",
                table
            ),
            named_params![
                ":account_id": account.0,
                ":shard_level": u8::from(shard_level),
            ],
            |row| {
                let min = row.get::<_, Option<u64>>(0)?;
                let max = row.get::<_, Option<u64>>(1)?;
                Ok((min, max))
            },
        )
        .map_err(Error::Db)
    {
        // If the ranges overlap, or are directly adjacent, then we aren't creating a
        // discontinuity. We can check this by comparing their start-inclusive,
        // end-exclusive bounds.
        let (cur_start, cur_end) = (stored_min, stored_max + 1);
        let (ins_start, ins_end) = (proposed_insertion_range.start, proposed_insertion_range.end);
        if cur_start > ins_end || ins_start > cur_end {
            return Err(Error::SubtreeDiscontinuity {
                attempted_insertion_range: proposed_insertion_range,
                existing_range: cur_start..cur_end,
            });
        }
    }

    Ok(())
}

pub(crate) fn put_shard(
    conn: &rusqlite::Transaction<'_>,
    account: AccountId,
    shard: &Shard,
) -> Result<(), Error> {
    let shard_index = shard.address().index();

    check_shard_discontinuity(
        conn,
        "orchard_tree_shards",
        account,
        shard.address().level(),
        shard_index..shard_index + 1,
    )?;

    let mut stmt_put_shard = conn.prepare_cached(
        "INSERT INTO orchard_tree_shards
         (account_id, shard_level, shard_index, subtree_end_height, root_hash, shard_data)
         VALUES (:account_id, :shard_level, :shard_index, :subtree_end_height, :root_hash, :shard_data)
         ON CONFLICT (account_id, shard_level, shard_index) DO UPDATE
         SET subtree_end_height = :subtree_end_height,
             root_hash = :root_hash,
             shard_data = :shard_data",
    )?;

    stmt_put_shard.execute(named_params![
        ":account_id": account.0,
        ":shard_level": u8::from(shard.address().level()),
        ":shard_index": shard_index,
        ":subtree_end_height": shard.subtree_end_height().map(u32::from),
        ":root_hash": shard.root_hash(),
        ":shard_data": shard.shard_data(),
    ])?;

    Ok(())
}

pub(crate) fn get_latest_shard_index(
    conn: &rusqlite::Connection,
    account: AccountId,
) -> Result<Option<u64>, Error> {
    conn.query_row(
        "SELECT MAX(shard_index) FROM orchard_tree_shards
         WHERE account_id = :account_id AND shard_level = :shard_level",
        named_params![
            ":account_id": account.0,
            ":shard_level": u8::from(SHARD_ROOT_LEVEL),
        ],
        |row| row.get::<_, Option<u64>>(0),
    )
    .map_err(Error::Db)
}

pub(crate) fn truncate_shards(
    conn: &rusqlite::Connection,
    account: AccountId,
    from_index: u64,
) -> Result<(), Error> {
    conn.execute(
        "DELETE FROM orchard_tree_shards
         WHERE account_id = :account_id
         AND shard_level = :shard_level
         AND shard_index >= :shard_index",
        named_params![
            ":account_id": account.0,
            ":shard_level": u8::from(SHARD_ROOT_LEVEL),
            ":shard_index": from_index,
        ],
    )
    .map_err(Error::Db)
    .map(|_| ())
}

pub(crate) fn get_cap(
    conn: &rusqlite::Connection,
    account: AccountId,
) -> Result<Option<Vec<u8>>, Error> {
    conn.query_row(
        "SELECT cap_data FROM orchard_tree_cap WHERE account_id = :account_id",
        named_params![":account_id": account.0],
        |row| row.get::<_, Vec<u8>>(0),
    )
    .optional()
    .map_err(Error::Db)
}

pub(crate) fn put_cap(
    conn: &rusqlite::Connection,
    account: AccountId,
    cap: &[u8],
) -> Result<(), Error> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO orchard_tree_cap (account_id, cap_data)
         VALUES (:account_id, :cap_data)
         ON CONFLICT (account_id) DO UPDATE
         SET cap_data = :cap_data",
    )?;
    stmt.execute(named_params![":account_id": account.0, ":cap_data": cap])?;

    Ok(())
}

pub(crate) fn update_subtree_roots(
    conn: &rusqlite::Transaction<'_>,
    account: AccountId,
    start_index: u64,
    roots: &[SubtreeRoot],
) -> Result<(), Error> {
    if roots.is_empty() {
        // nothing to do
        return Ok(());
    }

    check_shard_discontinuity(
        conn,
        "orchard_subtree_roots",
        account,
        SHARD_ROOT_LEVEL,
        start_index..start_index + (roots.len() as u64),
    )?;

    let mut stmt = conn.prepare_cached(
        "INSERT INTO orchard_subtree_roots
         (account_id, shard_level, shard_index, root_hash, subtree_end_height)
         VALUES (:account_id, :shard_level, :shard_index, :root_hash, :subtree_end_height)
         ON CONFLICT (account_id, shard_level, shard_index) DO UPDATE
         SET root_hash = :root_hash,
             subtree_end_height = :subtree_end_height",
    )?;

    for (root, i) in roots.iter().zip(0u64..) {
        stmt.execute(named_params![
            ":account_id": account.0,
            ":shard_level": u8::from(SHARD_ROOT_LEVEL),
            ":shard_index": start_index + i,
            ":root_hash": root.root_hash(),
            ":subtree_end_height": u32::from(root.subtree_end_height()),
        ])?;
    }

    Ok(())
}

pub(crate) fn get_shard_roots(
    conn: &rusqlite::Connection,
    account: AccountId,
    shard_level: Level,
) -> Result<Vec<Address>, Error> {
    let mut stmt = conn.prepare(
        "SELECT shard_index FROM orchard_subtree_roots
         WHERE account_id = :account_id AND shard_level = :shard_level
         ORDER BY shard_index",
    )?;
    let mut rows = stmt.query(named_params![
        ":account_id": account.0,
        ":shard_level": u8::from(shard_level),
    ])?;

    let mut res = vec![];
    while let Some(row) = rows.next()? {
        res.push(Address::from_parts(shard_level, row.get(0)?));
    }
    Ok(res)
}

pub(crate) fn min_checkpoint_id(
    conn: &rusqlite::Connection,
    account: AccountId,
) -> Result<Option<BlockHeight>, Error> {
    conn.query_row(
        "SELECT MIN(checkpoint_id) FROM orchard_tree_checkpoints
         WHERE account_id = :account_id",
        named_params![":account_id": account.0],
        |row| {
            row.get::<_, Option<u32>>(0)
                .map(|opt| opt.map(BlockHeight::from))
        },
    )
    .map_err(Error::Db)
}

pub(crate) fn max_checkpoint_id(
    conn: &rusqlite::Connection,
    account: AccountId,
) -> Result<Option<BlockHeight>, Error> {
    conn.query_row(
        "SELECT MAX(checkpoint_id) FROM orchard_tree_checkpoints
         WHERE account_id = :account_id",
        named_params![":account_id": account.0],
        |row| {
            row.get::<_, Option<u32>>(0)
                .map(|opt| opt.map(BlockHeight::from))
        },
    )
    .map_err(Error::Db)
}

pub(crate) fn add_checkpoint(
    conn: &rusqlite::Transaction<'_>,
    account: AccountId,
    checkpoint_id: BlockHeight,
    checkpoint: Checkpoint,
) -> Result<(), Error> {
    // Checkpoint identifiers are scanned block heights; a non-increasing identifier
    // means the wallet failed to truncate after a reorg, and accepting it would let
    // the checkpoint store and the tree silently diverge.
    if let Some(max_checkpoint_id) = max_checkpoint_id(conn, account)? {
        if checkpoint_id <= max_checkpoint_id {
            return Err(Error::CheckpointConflict {
                checkpoint_id,
                max_checkpoint_id,
            });
        }
    }

    let mut stmt_insert_checkpoint = conn.prepare_cached(
        "INSERT INTO orchard_tree_checkpoints (account_id, checkpoint_id, position)
         VALUES (:account_id, :checkpoint_id, :position)",
    )?;

    stmt_insert_checkpoint.execute(named_params![
        ":account_id": account.0,
        ":checkpoint_id": u32::from(checkpoint_id),
        ":position": checkpoint.position().map(u64::from),
    ])?;

    let mut stmt_insert_mark_removed = conn.prepare_cached(
        "INSERT INTO orchard_tree_checkpoint_marks_removed
         (account_id, checkpoint_id, mark_removed_position)
         VALUES (:account_id, :checkpoint_id, :position)",
    )?;

    for pos in checkpoint.marks_removed() {
        stmt_insert_mark_removed.execute(named_params![
            ":account_id": account.0,
            ":checkpoint_id": u32::from(checkpoint_id),
            ":position": u64::from(*pos),
        ])?;
    }

    Ok(())
}

pub(crate) fn checkpoint_count(
    conn: &rusqlite::Connection,
    account: AccountId,
) -> Result<usize, Error> {
    conn.query_row(
        "SELECT COUNT(*) FROM orchard_tree_checkpoints WHERE account_id = :account_id",
        named_params![":account_id": account.0],
        |row| row.get::<_, usize>(0),
    )
    .map_err(Error::Db)
}

fn checkpoint_marks_removed(
    conn: &rusqlite::Connection,
    account: AccountId,
    checkpoint_id: BlockHeight,
) -> Result<BTreeSet<Position>, Error> {
    let mut stmt = conn.prepare_cached(
        "SELECT mark_removed_position
         FROM orchard_tree_checkpoint_marks_removed
         WHERE account_id = :account_id AND checkpoint_id = :checkpoint_id",
    )?;
    let mark_removed_rows = stmt.query(named_params![
        ":account_id": account.0,
        ":checkpoint_id": u32::from(checkpoint_id),
    ])?;

    mark_removed_rows
        .mapped(|row| row.get::<_, u64>(0).map(Position::from))
        .collect::<Result<BTreeSet<_>, _>>()
        .map_err(Error::Db)
}

fn checkpoint_tree_state(position: Option<u64>) -> TreeState {
    position.map_or(TreeState::Empty, |pos| {
        TreeState::AtPosition(Position::from(pos))
    })
}

pub(crate) fn get_checkpoint(
    conn: &rusqlite::Connection,
    account: AccountId,
    checkpoint_id: BlockHeight,
) -> Result<Option<Checkpoint>, Error> {
    let checkpoint_position = conn
        .query_row(
            "SELECT position FROM orchard_tree_checkpoints
             WHERE account_id = :account_id AND checkpoint_id = :checkpoint_id",
            named_params![
                ":account_id": account.0,
                ":checkpoint_id": u32::from(checkpoint_id),
            ],
            |row| row.get::<_, Option<u64>>(0),
        )
        .optional()
        .map_err(Error::Db)?;

    checkpoint_position
        .map(|pos_opt| {
            Ok(Checkpoint::from_parts(
                checkpoint_tree_state(pos_opt),
                checkpoint_marks_removed(conn, account, checkpoint_id)?,
            ))
        })
        .transpose()
}

pub(crate) fn get_checkpoints(
    conn: &rusqlite::Connection,
    account: AccountId,
    limit: usize,
) -> Result<Vec<(BlockHeight, Checkpoint)>, Error> {
    let mut stmt_get_checkpoints = conn.prepare_cached(
        "SELECT checkpoint_id, position
         FROM orchard_tree_checkpoints
         WHERE account_id = :account_id
         ORDER BY checkpoint_id DESC
         LIMIT :limit",
    )?;

    let mut rows = stmt_get_checkpoints.query(named_params![
        ":account_id": account.0,
        ":limit": limit,
    ])?;

    let mut checkpoint_parts = vec![];
    while let Some(row) = rows.next()? {
        let checkpoint_id = BlockHeight::from(row.get::<_, u32>(0)?);
        let position: Option<u64> = row.get(1)?;
        checkpoint_parts.push((checkpoint_id, position));
    }

    checkpoint_parts
        .into_iter()
        .map(|(checkpoint_id, pos_opt)| {
            Ok((
                checkpoint_id,
                Checkpoint::from_parts(
                    checkpoint_tree_state(pos_opt),
                    checkpoint_marks_removed(conn, account, checkpoint_id)?,
                ),
            ))
        })
        .collect()
}

pub(crate) fn get_checkpoint_at_depth(
    conn: &rusqlite::Connection,
    account: AccountId,
    checkpoint_depth: usize,
) -> Result<Option<(BlockHeight, Checkpoint)>, Error> {
    let checkpoint_parts = conn
        .query_row(
            "SELECT checkpoint_id, position
             FROM orchard_tree_checkpoints
             WHERE account_id = :account_id
             ORDER BY checkpoint_id DESC
             LIMIT 1
             OFFSET :offset",
            named_params![":account_id": account.0, ":offset": checkpoint_depth],
            |row| {
                let checkpoint_id: u32 = row.get(0)?;
                let position: Option<u64> = row.get(1)?;
                Ok((BlockHeight::from(checkpoint_id), position))
            },
        )
        .optional()
        .map_err(Error::Db)?;

    checkpoint_parts
        .map(|(checkpoint_id, pos_opt)| {
            Ok((
                checkpoint_id,
                Checkpoint::from_parts(
                    checkpoint_tree_state(pos_opt),
                    checkpoint_marks_removed(conn, account, checkpoint_id)?,
                ),
            ))
        })
        .transpose()
}

pub(crate) fn get_marks_removed(
    conn: &rusqlite::Connection,
    account: AccountId,
    checkpoint_id: BlockHeight,
) -> Result<Option<BTreeSet<Position>>, Error> {
    let exists = conn
        .query_row(
            "SELECT 1 FROM orchard_tree_checkpoints
             WHERE account_id = :account_id AND checkpoint_id = :checkpoint_id",
            named_params![
                ":account_id": account.0,
                ":checkpoint_id": u32::from(checkpoint_id),
            ],
            |_| Ok(()),
        )
        .optional()
        .map_err(Error::Db)?;

    exists
        .map(|()| checkpoint_marks_removed(conn, account, checkpoint_id))
        .transpose()
}

pub(crate) fn remove_checkpoint(
    conn: &rusqlite::Transaction<'_>,
    account: AccountId,
    checkpoint_id: BlockHeight,
) -> Result<(), Error> {
    // cascading delete here obviates the need to manually delete from
    // `orchard_tree_checkpoint_marks_removed`
    let mut stmt_delete_checkpoint = conn.prepare_cached(
        "DELETE FROM orchard_tree_checkpoints
         WHERE account_id = :account_id AND checkpoint_id = :checkpoint_id",
    )?;

    stmt_delete_checkpoint.execute(named_params![
        ":account_id": account.0,
        ":checkpoint_id": u32::from(checkpoint_id),
    ])?;

    Ok(())
}

pub(crate) fn truncate_checkpoints(
    conn: &rusqlite::Transaction<'_>,
    account: AccountId,
    checkpoint_id: BlockHeight,
) -> Result<(), Error> {
    // cascading delete here obviates the need to manually delete from
    // `orchard_tree_checkpoint_marks_removed`
    conn.execute(
        "DELETE FROM orchard_tree_checkpoints
         WHERE account_id = :account_id AND checkpoint_id >= :checkpoint_id",
        named_params![
            ":account_id": account.0,
            ":checkpoint_id": u32::from(checkpoint_id),
        ],
    )?;

    Ok(())
}

pub(crate) fn get_max_checkpointed_height(
    conn: &rusqlite::Connection,
    account: AccountId,
    chain_tip_height: BlockHeight,
    min_confirmations: NonZeroU32,
) -> Result<Option<BlockHeight>, Error> {
    if checkpoint_count(conn, account)? == 0 {
        return Err(Error::NoCheckpoints);
    }

    let max_checkpoint_height =
        u32::from(chain_tip_height).saturating_sub(min_confirmations.get());

    // We exclude from consideration all checkpoints having heights greater than the
    // maximum checkpoint height.
    conn.query_row(
        "SELECT MAX(checkpoint_id)
         FROM orchard_tree_checkpoints
         WHERE account_id = :account_id
         AND checkpoint_id <= :max_checkpoint_height",
        named_params![
            ":account_id": account.0,
            ":max_checkpoint_height": max_checkpoint_height,
        ],
        |row| {
            row.get::<_, Option<u32>>(0)
                .map(|opt| opt.map(BlockHeight::from))
        },
    )
    .map_err(Error::Db)
}

/// Truncates tree state derived from blocks above the given height: shards whose
/// contents cannot be shown to predate the reorg point, the registered subtree roots
/// above it, all checkpoints above it, and the cap, which summarizes shard roots and
/// must be rebuilt by the scanner.
pub(crate) fn truncate_tree_state_to_height(
    conn: &rusqlite::Transaction<'_>,
    account: AccountId,
    block_height: BlockHeight,
) -> Result<(), Error> {
    // A shard with no recorded end height has not been completed; its contents cannot
    // be shown to predate the reorg point, so it is truncated along with everything
    // above the first invalidated index.
    let truncation_index = conn
        .query_row(
            "SELECT MIN(shard_index) FROM orchard_tree_shards
             WHERE account_id = :account_id
             AND shard_level = :shard_level
             AND (subtree_end_height IS NULL OR subtree_end_height > :block_height)",
            named_params![
                ":account_id": account.0,
                ":shard_level": u8::from(SHARD_ROOT_LEVEL),
                ":block_height": u32::from(block_height),
            ],
            |row| row.get::<_, Option<u64>>(0),
        )
        .map_err(Error::Db)?;

    if let Some(shard_index) = truncation_index {
        truncate_shards(conn, account, shard_index)?;
    }

    conn.execute(
        "DELETE FROM orchard_subtree_roots
         WHERE account_id = :account_id AND subtree_end_height > :block_height",
        named_params![
            ":account_id": account.0,
            ":block_height": u32::from(block_height),
        ],
    )?;

    conn.execute(
        "DELETE FROM orchard_tree_cap WHERE account_id = :account_id",
        named_params![":account_id": account.0],
    )?;

    truncate_checkpoints(conn, account, block_height + 1)
}
