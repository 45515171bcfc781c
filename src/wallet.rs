//! Functions for querying and updating account and note data in the storage database.
//!
//! These functions should generally not be used directly; their functionality is
//! available via [`OrchardStorage`], which provides the transactional boundary that the
//! compound operations (`update_notes`, `handle_chain_reorg`) rely on.
//!
//! [`OrchardStorage`]: crate::OrchardStorage

use incrementalmerkletree::Position;
use rusqlite::{self, named_params, OptionalExtension};
use tracing::debug;

use zcash_primitives::block::BlockHash;
use zcash_protocol::consensus::BlockHeight;

use crate::{
    error::Error,
    wallet::commitment_tree::truncate_tree_state_to_height,
    AccountId, AccountMeta, Note, NoteSpend,
};

pub mod commitment_tree;
pub mod init;

fn block_hash_from_bytes(data: Vec<u8>) -> Result<BlockHash, Error> {
    <[u8; 32]>::try_from(data)
        .map(BlockHash)
        .map_err(|data| Error::CorruptedData(format!("invalid block hash length: {}", data.len())))
}

fn hash_32_from_bytes(column: &str, data: Vec<u8>) -> Result<[u8; 32], Error> {
    <[u8; 32]>::try_from(data).map_err(|data| {
        Error::CorruptedData(format!("invalid {} length: {}", column, data.len()))
    })
}

/// Adds an account with the given birthday height, returning its metadata.
///
/// Registering an already-registered account leaves the existing row untouched and
/// returns it.
pub(crate) fn register_account(
    conn: &rusqlite::Transaction<'_>,
    account: AccountId,
    birthday_height: BlockHeight,
) -> Result<AccountMeta, Error> {
    conn.execute(
        "INSERT INTO accounts (account_id, birthday_height)
         VALUES (:account_id, :birthday_height)
         ON CONFLICT (account_id) DO NOTHING",
        named_params![
            ":account_id": account.0,
            ":birthday_height": u32::from(birthday_height),
        ],
    )?;

    get_account_meta(conn, account)
}

/// Returns the scan state recorded for the given account.
pub(crate) fn get_account_meta(
    conn: &rusqlite::Connection,
    account: AccountId,
) -> Result<AccountMeta, Error> {
    conn.query_row(
        "SELECT birthday_height, latest_scanned_block, latest_scanned_block_hash
         FROM accounts
         WHERE account_id = :account_id",
        named_params![":account_id": account.0],
        |row| {
            Ok((
                row.get::<_, u32>(0)?,
                row.get::<_, Option<u32>>(1)?,
                row.get::<_, Option<Vec<u8>>>(2)?,
            ))
        },
    )
    .optional()?
    .ok_or(Error::AccountUnknown(account))
    .and_then(|(birthday, scanned, hash)| {
        Ok(AccountMeta {
            birthday_height: BlockHeight::from(birthday),
            latest_scanned_block: scanned.map(BlockHeight::from),
            latest_scanned_block_hash: hash.map(block_hash_from_bytes).transpose()?,
        })
    })
}

/// Clears the account's last-scanned block pointer.
pub(crate) fn reset_account_sync_state(
    conn: &rusqlite::Connection,
    account: AccountId,
) -> Result<(), Error> {
    let affected = conn.execute(
        "UPDATE accounts
         SET latest_scanned_block = NULL, latest_scanned_block_hash = NULL
         WHERE account_id = :account_id",
        named_params![":account_id": account.0],
    )?;

    if affected == 0 {
        Err(Error::AccountUnknown(account))
    } else {
        Ok(())
    }
}

/// Advances the account's last-scanned block pointer.
pub(crate) fn update_last_scanned_block(
    conn: &rusqlite::Connection,
    account: AccountId,
    block_height: BlockHeight,
    block_hash: BlockHash,
) -> Result<(), Error> {
    let affected = conn.execute(
        "UPDATE accounts
         SET latest_scanned_block = :latest_scanned_block,
             latest_scanned_block_hash = :latest_scanned_block_hash
         WHERE account_id = :account_id",
        named_params![
            ":account_id": account.0,
            ":latest_scanned_block": u32::from(block_height),
            ":latest_scanned_block_hash": block_hash.0.as_slice(),
        ],
    )?;

    if affected == 0 {
        Err(Error::AccountUnknown(account))
    } else {
        Ok(())
    }
}

/// Inserts the notes discovered while scanning.
pub(crate) fn put_received_notes(
    conn: &rusqlite::Transaction<'_>,
    account: AccountId,
    notes: &[Note],
) -> Result<(), Error> {
    let mut stmt_insert_note = conn.prepare_cached(
        "INSERT INTO orchard_received_notes
         (account_id, commitment_tree_position, commitment, discovered_height)
         VALUES (:account_id, :commitment_tree_position, :commitment, :discovered_height)",
    )?;

    for note in notes {
        stmt_insert_note.execute(named_params![
            ":account_id": account.0,
            ":commitment_tree_position": u64::from(note.position()),
            ":commitment": note.commitment().as_slice(),
            ":discovered_height": u32::from(note.discovered_height()),
        ])?;
    }

    Ok(())
}

/// Inserts the nullifiers discovered while scanning.
pub(crate) fn put_note_spends(
    conn: &rusqlite::Transaction<'_>,
    account: AccountId,
    spends: &[NoteSpend],
) -> Result<(), Error> {
    let mut stmt_insert_spend = conn.prepare_cached(
        "INSERT INTO orchard_received_note_spends
         (account_id, nullifier, commitment_tree_position, discovered_height)
         VALUES (:account_id, :nullifier, :commitment_tree_position, :discovered_height)",
    )?;

    for spend in spends {
        stmt_insert_spend.execute(named_params![
            ":account_id": account.0,
            ":nullifier": spend.nullifier().as_slice(),
            ":commitment_tree_position": u64::from(spend.position()),
            ":discovered_height": u32::from(spend.discovered_height()),
        ])?;
    }

    Ok(())
}

/// Returns the account's notes whose tree positions do not appear among its discovered
/// spends, in ascending position order.
pub(crate) fn get_spendable_notes(
    conn: &rusqlite::Connection,
    account: AccountId,
) -> Result<Vec<Note>, Error> {
    let mut stmt_select_spendable = conn.prepare_cached(
        "SELECT commitment, commitment_tree_position, discovered_height
         FROM orchard_received_notes
         WHERE account_id = :account_id
         AND commitment_tree_position NOT IN (
             SELECT commitment_tree_position
             FROM orchard_received_note_spends
             WHERE account_id = :account_id
         )
         ORDER BY commitment_tree_position",
    )?;

    let rows = stmt_select_spendable.query(named_params![":account_id": account.0])?;
    rows.mapped(|row| {
        Ok((
            row.get::<_, Vec<u8>>(0)?,
            row.get::<_, u64>(1)?,
            row.get::<_, u32>(2)?,
        ))
    })
    .map(|row| {
        let (commitment, position, height) = row?;
        Ok(Note::from_parts(
            hash_32_from_bytes("note commitment", commitment)?,
            Position::from(position),
            BlockHeight::from(height),
        ))
    })
    .collect()
}

/// Returns all discovered spends for the given account, in ascending order of the spent
/// note's tree position.
pub(crate) fn get_nullifiers(
    conn: &rusqlite::Connection,
    account: AccountId,
) -> Result<Vec<NoteSpend>, Error> {
    let mut stmt_select_spends = conn.prepare_cached(
        "SELECT nullifier, commitment_tree_position, discovered_height
         FROM orchard_received_note_spends
         WHERE account_id = :account_id
         ORDER BY commitment_tree_position",
    )?;

    let rows = stmt_select_spends.query(named_params![":account_id": account.0])?;
    rows.mapped(|row| {
        Ok((
            row.get::<_, Vec<u8>>(0)?,
            row.get::<_, u64>(1)?,
            row.get::<_, u32>(2)?,
        ))
    })
    .map(|row| {
        let (nullifier, position, height) = row?;
        Ok(NoteSpend::from_parts(
            hash_32_from_bytes("nullifier", nullifier)?,
            Position::from(position),
            BlockHeight::from(height),
        ))
    })
    .collect()
}

/// Rolls the account's state back to the given block height.
///
/// Removes notes and nullifiers discovered above the reorg height, truncates tree
/// state derived from blocks above it, removes checkpoints above it, and resets the
/// account's last-scanned block to the reorg point. Must run within the caller's
/// transaction so that a failure in any step rolls back all of them.
pub(crate) fn truncate_to_height(
    conn: &rusqlite::Transaction<'_>,
    account: AccountId,
    block_height: BlockHeight,
    block_hash: BlockHash,
) -> Result<(), Error> {
    debug!(
        account = account.0,
        height = u32::from(block_height),
        "Truncating account state for chain reorg"
    );

    conn.execute(
        "DELETE FROM orchard_received_notes
         WHERE account_id = :account_id AND discovered_height > :block_height",
        named_params![
            ":account_id": account.0,
            ":block_height": u32::from(block_height),
        ],
    )?;

    conn.execute(
        "DELETE FROM orchard_received_note_spends
         WHERE account_id = :account_id AND discovered_height > :block_height",
        named_params![
            ":account_id": account.0,
            ":block_height": u32::from(block_height),
        ],
    )?;

    truncate_tree_state_to_height(conn, account, block_height)?;

    update_last_scanned_block(conn, account, block_height, block_hash)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use std::num::NonZeroU32;
    use tempfile::NamedTempFile;

    use incrementalmerkletree::Position;
    use rusqlite::Connection;
    use shardtree::store::Checkpoint;

    use zcash_primitives::block::BlockHash;
    use zcash_protocol::consensus::BlockHeight;

    use crate::{error::Error, AccountId, Note, NoteSpend, OrchardStorage};

    fn test_storage() -> (NamedTempFile, OrchardStorage<Connection>) {
        let data_file = NamedTempFile::new().unwrap();
        let db = OrchardStorage::for_path(data_file.path()).unwrap();
        (data_file, db)
    }

    fn note(position: u64, height: u32) -> Note {
        let mut commitment = [0u8; 32];
        commitment[..8].copy_from_slice(&position.to_le_bytes());
        Note::from_parts(
            commitment,
            Position::from(position),
            BlockHeight::from(height),
        )
    }

    fn spend(position: u64, height: u32) -> NoteSpend {
        let mut nullifier = [0xffu8; 32];
        nullifier[..8].copy_from_slice(&position.to_le_bytes());
        NoteSpend::from_parts(
            nullifier,
            Position::from(position),
            BlockHeight::from(height),
        )
    }

    #[test]
    fn account_registration_is_idempotent() {
        let (_data_file, mut db) = test_storage();
        let account = AccountId(7);

        let created = db
            .register_account(account, BlockHeight::from(419_200))
            .unwrap();
        assert_eq!(created.birthday_height(), BlockHeight::from(419_200));
        assert_eq!(created.latest_scanned_block(), None);
        assert_eq!(created.latest_scanned_block_hash(), None);

        // Re-registration with a different birthday must not overwrite the original.
        let existing = db
            .register_account(account, BlockHeight::from(500_000))
            .unwrap();
        assert_eq!(existing, created);
    }

    #[test]
    fn get_account_meta_unknown_account() {
        let (_data_file, db) = test_storage();
        assert_matches!(
            db.get_account_meta(AccountId(3)),
            Err(Error::AccountUnknown(AccountId(3)))
        );
    }

    #[test]
    fn reset_account_sync_state_clears_scan_pointer() {
        let (_data_file, mut db) = test_storage();
        let account = AccountId(0);
        db.register_account(account, BlockHeight::from(100)).unwrap();

        db.update_notes(
            account,
            &[note(0, 101)],
            &[],
            BlockHeight::from(101),
            BlockHash([1; 32]),
        )
        .unwrap();
        let meta = db.get_account_meta(account).unwrap();
        assert_eq!(meta.latest_scanned_block(), Some(BlockHeight::from(101)));

        db.reset_account_sync_state(account).unwrap();
        let meta = db.get_account_meta(account).unwrap();
        assert_eq!(meta.latest_scanned_block(), None);
        assert_eq!(meta.latest_scanned_block_hash(), None);
        // Notes survive a sync-state reset; only the pointer is cleared.
        assert_eq!(db.get_spendable_notes(account).unwrap().len(), 1);

        assert_matches!(
            db.reset_account_sync_state(AccountId(9)),
            Err(Error::AccountUnknown(AccountId(9)))
        );
    }

    #[test]
    fn spendable_notes_excludes_spent_positions() {
        let (_data_file, mut db) = test_storage();
        let account = AccountId(0);
        db.register_account(account, BlockHeight::from(100)).unwrap();

        db.update_notes(
            account,
            &[note(0, 101), note(1, 101), note(2, 101)],
            &[],
            BlockHeight::from(101),
            BlockHash([1; 32]),
        )
        .unwrap();
        assert_eq!(db.get_spendable_notes(account).unwrap().len(), 3);

        // A later batch reveals the spend of the note at position 1.
        db.update_notes(
            account,
            &[],
            &[spend(1, 102)],
            BlockHeight::from(102),
            BlockHash([2; 32]),
        )
        .unwrap();

        let spendable = db.get_spendable_notes(account).unwrap();
        assert_eq!(
            spendable.iter().map(|n| n.position()).collect::<Vec<_>>(),
            vec![Position::from(0), Position::from(2)]
        );

        let nullifiers = db.get_nullifiers(account).unwrap();
        assert_eq!(nullifiers, vec![spend(1, 102)]);

        // Notes belonging to other accounts are invisible.
        assert_eq!(db.get_spendable_notes(AccountId(1)).unwrap(), vec![]);
    }

    #[test]
    fn update_notes_is_atomic() {
        let (_data_file, mut db) = test_storage();
        let account = AccountId(0);
        db.register_account(account, BlockHeight::from(100)).unwrap();

        // The second spend row violates the nullifier uniqueness constraint, making
        // the nullifier-insert step fail partway through the transaction.
        let result = db.update_notes(
            account,
            &[note(0, 101), note(1, 101)],
            &[spend(5, 101), spend(5, 101)],
            BlockHeight::from(101),
            BlockHash([1; 32]),
        );
        assert_matches!(result, Err(Error::Db(_)));

        // Nothing from the failed call may be visible.
        assert_eq!(db.get_spendable_notes(account).unwrap(), vec![]);
        assert_eq!(db.get_nullifiers(account).unwrap(), vec![]);
        let meta = db.get_account_meta(account).unwrap();
        assert_eq!(meta.latest_scanned_block(), None);
    }

    #[test]
    fn update_notes_requires_registered_account() {
        let (_data_file, mut db) = test_storage();
        let account = AccountId(0);

        let result = db.update_notes(
            account,
            &[note(0, 101)],
            &[],
            BlockHeight::from(101),
            BlockHash([1; 32]),
        );
        assert_matches!(result, Err(Error::AccountUnknown(AccountId(0))));

        // The failed pointer update must also roll back the note insert.
        db.register_account(account, BlockHeight::from(100)).unwrap();
        assert_eq!(db.get_spendable_notes(account).unwrap(), vec![]);
    }

    #[test]
    fn chain_reorg_rolls_back_to_target_height() {
        let (_data_file, mut db) = test_storage();
        let account = AccountId(0);
        db.register_account(account, BlockHeight::from(100)).unwrap();

        // Scan blocks 101..=103, each adding one note and one checkpoint.
        for (i, height) in (101u32..=103).enumerate() {
            db.update_notes(
                account,
                &[note(i as u64, height)],
                &[],
                BlockHeight::from(height),
                BlockHash([height as u8; 32]),
            )
            .unwrap();
            db.add_checkpoint(
                account,
                BlockHeight::from(height),
                Checkpoint::at_position(Position::from(i as u64)),
            )
            .unwrap();
        }

        // With a chain tip of 110 and 5 confirmations required, the newest qualifying
        // anchor is checkpoint 103 (105 >= 103).
        assert_eq!(
            db.get_max_checkpointed_height(
                account,
                BlockHeight::from(110),
                NonZeroU32::new(5).unwrap()
            )
            .unwrap(),
            Some(BlockHeight::from(103))
        );

        let reorg_hash = BlockHash([0xab; 32]);
        db.handle_chain_reorg(account, BlockHeight::from(102), reorg_hash)
            .unwrap();

        // Checkpoint 103 is gone; 101 and 102 remain.
        assert_eq!(
            db.max_checkpoint_id(account).unwrap(),
            Some(BlockHeight::from(102))
        );
        assert_eq!(db.checkpoint_count(account).unwrap(), 2);

        // The note discovered in block 103 is gone.
        let spendable = db.get_spendable_notes(account).unwrap();
        assert_eq!(
            spendable.iter().map(|n| n.position()).collect::<Vec<_>>(),
            vec![Position::from(0), Position::from(1)]
        );

        let meta = db.get_account_meta(account).unwrap();
        assert_eq!(meta.latest_scanned_block(), Some(BlockHeight::from(102)));
        assert_eq!(meta.latest_scanned_block_hash(), Some(reorg_hash));
    }

    #[test]
    fn chain_reorg_removes_nullifiers_above_target() {
        let (_data_file, mut db) = test_storage();
        let account = AccountId(0);
        db.register_account(account, BlockHeight::from(100)).unwrap();

        db.update_notes(
            account,
            &[note(0, 101)],
            &[],
            BlockHeight::from(101),
            BlockHash([1; 32]),
        )
        .unwrap();
        db.update_notes(
            account,
            &[],
            &[spend(0, 105)],
            BlockHeight::from(105),
            BlockHash([5; 32]),
        )
        .unwrap();
        assert_eq!(db.get_spendable_notes(account).unwrap(), vec![]);

        // Rolling back past the spend's discovery height restores spendability.
        db.handle_chain_reorg(account, BlockHeight::from(103), BlockHash([3; 32]))
            .unwrap();
        assert_eq!(db.get_nullifiers(account).unwrap(), vec![]);
        assert_eq!(db.get_spendable_notes(account).unwrap().len(), 1);
    }
}
