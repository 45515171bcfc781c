//! Functions for initializing the storage database.

use rusqlite::Connection;
use tracing::debug;

/// Sets up the internal structure of the storage database.
///
/// Idempotent: every statement is a `CREATE TABLE IF NOT EXISTS`, so this may be called
/// on every open of an existing database.
pub fn init_storage_db(conn: &Connection) -> Result<(), rusqlite::Error> {
    debug!("Initializing storage database schema");
    conn.execute(
        "CREATE TABLE IF NOT EXISTS accounts (
            account_id INTEGER PRIMARY KEY,
            birthday_height INTEGER NOT NULL,
            latest_scanned_block INTEGER,
            latest_scanned_block_hash BLOB
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS orchard_tree_cap (
            account_id INTEGER PRIMARY KEY,
            cap_data BLOB NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS orchard_tree_shards (
            account_id INTEGER NOT NULL,
            shard_level INTEGER NOT NULL,
            shard_index INTEGER NOT NULL,
            subtree_end_height INTEGER,
            root_hash BLOB,
            shard_data BLOB NOT NULL,
            PRIMARY KEY (account_id, shard_level, shard_index)
        ) WITHOUT ROWID",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS orchard_subtree_roots (
            account_id INTEGER NOT NULL,
            shard_level INTEGER NOT NULL,
            shard_index INTEGER NOT NULL,
            root_hash BLOB NOT NULL,
            subtree_end_height INTEGER NOT NULL,
            PRIMARY KEY (account_id, shard_level, shard_index)
        ) WITHOUT ROWID",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS orchard_tree_checkpoints (
            account_id INTEGER NOT NULL,
            checkpoint_id INTEGER NOT NULL,
            position INTEGER,
            PRIMARY KEY (account_id, checkpoint_id)
        ) WITHOUT ROWID",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS orchard_tree_checkpoint_marks_removed (
            account_id INTEGER NOT NULL,
            checkpoint_id INTEGER NOT NULL,
            mark_removed_position INTEGER NOT NULL,
            PRIMARY KEY (account_id, checkpoint_id, mark_removed_position),
            FOREIGN KEY (account_id, checkpoint_id)
                REFERENCES orchard_tree_checkpoints (account_id, checkpoint_id)
                ON DELETE CASCADE
        ) WITHOUT ROWID",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS orchard_received_notes (
            account_id INTEGER NOT NULL,
            commitment_tree_position INTEGER NOT NULL,
            commitment BLOB NOT NULL,
            discovered_height INTEGER NOT NULL,
            PRIMARY KEY (account_id, commitment_tree_position)
        ) WITHOUT ROWID",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS orchard_received_note_spends (
            account_id INTEGER NOT NULL,
            nullifier BLOB NOT NULL,
            commitment_tree_position INTEGER NOT NULL,
            discovered_height INTEGER NOT NULL,
            PRIMARY KEY (account_id, nullifier)
        ) WITHOUT ROWID",
        [],
    )?;
    Ok(())
}

/// Drops every storage table, discarding all persisted state.
pub(crate) fn drop_storage_tables(conn: &Connection) -> Result<(), rusqlite::Error> {
    // Children before parents, so the drops succeed with foreign keys enforced.
    for table in [
        "orchard_tree_checkpoint_marks_removed",
        "orchard_tree_checkpoints",
        "orchard_subtree_roots",
        "orchard_tree_shards",
        "orchard_tree_cap",
        "orchard_received_note_spends",
        "orchard_received_notes",
        "accounts",
    ] {
        conn.execute(&format!("DROP TABLE IF EXISTS {}", table), [])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::NamedTempFile;

    use zcash_protocol::consensus::BlockHeight;

    use crate::{AccountId, OrchardStorage};

    use super::init_storage_db;

    #[test]
    fn init_storage_db_is_idempotent() {
        let data_file = NamedTempFile::new().unwrap();
        let db = OrchardStorage::for_path(data_file.path()).unwrap();

        // Re-running initialization against the already-initialized database must not
        // fail or disturb existing data.
        init_storage_db(&db.conn).unwrap();
        init_storage_db(&db.conn).unwrap();
    }

    #[test]
    fn schema_contains_expected_tables() {
        let data_file = NamedTempFile::new().unwrap();
        let db = OrchardStorage::for_path(data_file.path()).unwrap();

        let mut stmt = db
            .conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .unwrap();
        let tables = stmt
            .query([])
            .unwrap()
            .mapped(|row| row.get::<_, String>(0))
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        for expected in [
            "accounts",
            "orchard_received_note_spends",
            "orchard_received_notes",
            "orchard_subtree_roots",
            "orchard_tree_cap",
            "orchard_tree_checkpoint_marks_removed",
            "orchard_tree_checkpoints",
            "orchard_tree_shards",
        ] {
            assert!(
                tables.iter().any(|t| t == expected),
                "missing table {}",
                expected
            );
        }
    }

    #[test]
    fn reset_database_discards_all_state() {
        let data_file = NamedTempFile::new().unwrap();
        let mut db = OrchardStorage::for_path(data_file.path()).unwrap();

        let account = AccountId(0);
        db.register_account(account, BlockHeight::from(100)).unwrap();
        db.put_cap(account, &[1u8, 2, 3]).unwrap();

        db.reset_database().unwrap();

        // The schema is back, but the data is gone.
        assert!(db.get_account_meta(account).is_err());
        assert_eq!(db.get_cap(account).unwrap(), None);
    }
}
