//! SQLite chain store.
//!
//! Persists heads, scanned blocks, unparsed rows and every derived ledger row
//! to a single SQLite file through `sqlx`, with WAL mode for concurrent reads.
//! Each multi-row trait operation runs inside one SQLite transaction.
//!
//! Amounts are stored as decimal text, since base units overflow `INTEGER`.
//!
//! # Usage
//! ```rust,no_run
//! use chainledger_storage::sqlite::SqliteStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = SqliteStore::open("./chainledger.db").await?;
//! let ephemeral = SqliteStore::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeSet, HashSet};

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::debug;

use chainledger_core::amount::Amount;
use chainledger_core::error::LedgerError;
use chainledger_core::store::{ChainStore, ParseEffects, RollbackSummary};
use chainledger_core::types::{
    Account, AccountCurrency, Address, AddressLink, BlockchainHead, Direction, KeyBranch,
    OutPoint, PendingSnapshot, ScannedBlock, TransactionRecord, TxOutcome,
    UnparsedTransaction, Utxo,
};

/// SQLite allows at most 999 bound parameters on older builds.
const IN_CHUNK: usize = 400;

pub(crate) fn store_err(e: sqlx::Error) -> LedgerError {
    LedgerError::Store(e.to_string())
}

fn json_err(e: serde_json::Error) -> LedgerError {
    LedgerError::Store(e.to_string())
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn col<'r, T>(row: &'r SqliteRow, name: &str) -> Result<T, LedgerError>
where
    T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get::<T, _>(name).map_err(store_err)
}

fn amount_col(row: &SqliteRow, name: &str) -> Result<Amount, LedgerError> {
    col::<String>(row, name)?.parse()
}

fn opt_u64(row: &SqliteRow, name: &str) -> Result<Option<u64>, LedgerError> {
    Ok(col::<Option<i64>>(row, name)?.map(|v| v as u64))
}

fn direction_from(s: &str) -> Result<Direction, LedgerError> {
    match s {
        "in" => Ok(Direction::In),
        "out" => Ok(Direction::Out),
        "internal" => Ok(Direction::Internal),
        other => Err(LedgerError::Store(format!("unknown direction '{other}'"))),
    }
}

fn outcome_from(s: Option<String>) -> Result<Option<TxOutcome>, LedgerError> {
    match s.as_deref() {
        None => Ok(None),
        Some("success") => Ok(Some(TxOutcome::Success)),
        Some("failed") => Ok(Some(TxOutcome::Failed)),
        Some(other) => Err(LedgerError::Store(format!("unknown outcome '{other}'"))),
    }
}

fn branch_from(index: i64) -> Result<KeyBranch, LedgerError> {
    KeyBranch::from_chain_index(index as u32)
        .ok_or_else(|| LedgerError::Store(format!("unknown key branch {index}")))
}

// ─── Row mapping ─────────────────────────────────────────────────────────────

fn head_from(row: &SqliteRow) -> Result<BlockchainHead, LedgerError> {
    Ok(BlockchainHead {
        chain_id: col(row, "chain_id")?,
        height: col::<i64>(row, "height")? as u64,
        block_hash: col(row, "block_hash")?,
        avg_fee: opt_u64(row, "avg_fee")?,
        updated_at: col(row, "updated_at")?,
    })
}

fn block_from(row: &SqliteRow) -> Result<ScannedBlock, LedgerError> {
    Ok(ScannedBlock {
        chain_id: col(row, "chain_id")?,
        height: col::<i64>(row, "height")? as u64,
        block_hash: col(row, "block_hash")?,
        parent_hash: col(row, "parent_hash")?,
        timestamp: col(row, "timestamp")?,
        tx_ids: serde_json::from_str(&col::<String>(row, "tx_ids")?).map_err(json_err)?,
    })
}

fn unparsed_from(row: &SqliteRow) -> Result<UnparsedTransaction, LedgerError> {
    Ok(UnparsedTransaction {
        chain_id: col(row, "chain_id")?,
        txid: col(row, "txid")?,
        raw_payload: serde_json::from_str(&col::<String>(row, "raw_payload")?).map_err(json_err)?,
        block_height: opt_u64(row, "block_height")?,
        block_hash: col(row, "block_hash")?,
        timestamp: col(row, "timestamp")?,
        retry_count: col::<i64>(row, "retry_count")? as u32,
        last_retry_at: col(row, "last_retry_at")?,
        queued_at: col(row, "queued_at")?,
        job_queued: col(row, "job_queued")?,
    })
}

fn record_from(row: &SqliteRow) -> Result<TransactionRecord, LedgerError> {
    Ok(TransactionRecord {
        chain_id: col(row, "chain_id")?,
        txid: col(row, "txid")?,
        currency_id: col(row, "currency_id")?,
        kind: serde_json::from_str(&col::<String>(row, "kind")?).map_err(json_err)?,
        amount: amount_col(row, "amount")?,
        fee: amount_col(row, "fee")?,
        block_height: opt_u64(row, "block_height")?,
        timestamp: col(row, "timestamp")?,
        direction: direction_from(&col::<String>(row, "direction")?)?,
        outcome: outcome_from(col(row, "outcome")?)?,
        result: outcome_from(col(row, "result")?)?,
        source_addresses: serde_json::from_str(&col::<String>(row, "source_addresses")?)
            .map_err(json_err)?,
        destination_addresses: serde_json::from_str(&col::<String>(row, "destination_addresses")?)
            .map_err(json_err)?,
    })
}

fn link_from(row: &SqliteRow) -> Result<AddressLink, LedgerError> {
    Ok(AddressLink {
        chain_id: col(row, "chain_id")?,
        currency_id: col(row, "currency_id")?,
        address_id: col(row, "address_id")?,
        txid: col(row, "txid")?,
        amount: amount_col(row, "amount")?,
        direction: direction_from(&col::<String>(row, "direction")?)?,
    })
}

fn utxo_from(row: &SqliteRow) -> Result<Utxo, LedgerError> {
    Ok(Utxo {
        utxo_id: col(row, "utxo_id")?,
        chain_id: col(row, "chain_id")?,
        address_id: col(row, "address_id")?,
        txid: col(row, "txid")?,
        vout: col::<i64>(row, "vout")? as u32,
        amount: amount_col(row, "amount")?,
        script: col(row, "script")?,
        script_type: col(row, "script_type")?,
        block_height: opt_u64(row, "block_height")?,
        block_timestamp: col(row, "block_timestamp")?,
        spent_by: col(row, "spent_by")?,
    })
}

fn address_from(row: &SqliteRow) -> Result<Address, LedgerError> {
    Ok(Address {
        address_id: col(row, "address_id")?,
        account_id: col(row, "account_id")?,
        chain_id: col(row, "chain_id")?,
        branch: branch_from(col(row, "branch")?)?,
        key_index: col::<i64>(row, "key_index")? as u32,
        address: col(row, "address")?,
        public_key: col(row, "public_key")?,
    })
}

fn ledger_from(row: &SqliteRow) -> Result<AccountCurrency, LedgerError> {
    Ok(AccountCurrency {
        id: col(row, "id")?,
        account_id: col(row, "account_id")?,
        currency_id: col(row, "currency_id")?,
        balance: amount_col(row, "balance")?,
        external_key_count: col::<i64>(row, "external_key_count")? as u32,
        internal_key_count: col::<i64>(row, "internal_key_count")? as u32,
    })
}

fn snapshot_from(row: &SqliteRow) -> Result<PendingSnapshot, LedgerError> {
    Ok(PendingSnapshot {
        chain_id: col(row, "chain_id")?,
        block_height_asked: col::<i64>(row, "block_height_asked")? as u64,
        tx_ids: serde_json::from_str(&col::<String>(row, "tx_ids")?).map_err(json_err)?,
        timestamp: col(row, "timestamp")?,
    })
}

// ─── Connection-level helpers (usable inside a transaction) ──────────────────

async fn ensure_ledger(
    conn: &mut SqliteConnection,
    account_id: &str,
    currency_id: &str,
) -> Result<(), LedgerError> {
    sqlx::query(
        "INSERT OR IGNORE INTO account_currencies
            (id, account_id, currency_id, balance, external_key_count, internal_key_count)
         VALUES (?, ?, ?, '0', 0, 0)",
    )
    .bind(AccountCurrency::id_for(account_id, currency_id))
    .bind(account_id)
    .bind(currency_id)
    .execute(&mut *conn)
    .await
    .map_err(store_err)?;
    Ok(())
}

/// Balance = Σ incoming link amounts − Σ outgoing, over the account's addresses.
async fn recompute(
    conn: &mut SqliteConnection,
    account_id: &str,
    currency_id: &str,
) -> Result<(), LedgerError> {
    let rows = sqlx::query(
        "SELECT l.amount, l.direction
         FROM address_links l JOIN addresses a ON a.address_id = l.address_id
         WHERE a.account_id = ? AND l.currency_id = ?",
    )
    .bind(account_id)
    .bind(currency_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(store_err)?;

    let mut incoming = Amount::ZERO;
    let mut outgoing = Amount::ZERO;
    for row in &rows {
        let amount = amount_col(row, "amount")?;
        match direction_from(&col::<String>(row, "direction")?)? {
            Direction::Out => outgoing = outgoing.saturating_add(amount),
            _ => incoming = incoming.saturating_add(amount),
        }
    }

    ensure_ledger(conn, account_id, currency_id).await?;
    sqlx::query("UPDATE account_currencies SET balance = ? WHERE id = ?")
        .bind(incoming.saturating_sub(outgoing).to_string())
        .bind(AccountCurrency::id_for(account_id, currency_id))
        .execute(&mut *conn)
        .await
        .map_err(store_err)?;
    Ok(())
}

/// SQLite-backed [`ChainStore`].
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) a database at `path`.
    ///
    /// The path may be a plain file path (`"./chainledger.db"`) or a full
    /// SQLite URL (`"sqlite:./chainledger.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, LedgerError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect(&url)
            .await
            .map_err(store_err)?;
        Self::from_pool(pool).await
    }

    /// An in-memory database on a single connection. Lost when dropped.
    pub async fn in_memory() -> Result<Self, LedgerError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(store_err)?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self, LedgerError> {
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// The underlying pool, shared with [`crate::queue::SqliteJobQueue`].
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn exec(&self, sql: &str) -> Result<(), LedgerError> {
        sqlx::query(sql)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn init_schema(&self) -> Result<(), LedgerError> {
        self.exec("PRAGMA journal_mode=WAL;").await?;

        self.exec(
            "CREATE TABLE IF NOT EXISTS heads (
                chain_id   TEXT    PRIMARY KEY,
                height     INTEGER NOT NULL,
                block_hash TEXT,
                avg_fee    INTEGER,
                updated_at INTEGER NOT NULL
            );",
        )
        .await?;

        self.exec(
            "CREATE TABLE IF NOT EXISTS scanned_blocks (
                chain_id    TEXT    NOT NULL,
                height      INTEGER NOT NULL,
                block_hash  TEXT    NOT NULL,
                parent_hash TEXT,
                timestamp   INTEGER NOT NULL,
                tx_ids      TEXT    NOT NULL,
                PRIMARY KEY (chain_id, height)
            );",
        )
        .await?;

        self.exec(
            "CREATE TABLE IF NOT EXISTS unparsed_transactions (
                chain_id      TEXT    NOT NULL,
                txid          TEXT    NOT NULL,
                raw_payload   TEXT    NOT NULL,
                block_height  INTEGER,
                block_hash    TEXT,
                timestamp     INTEGER NOT NULL,
                retry_count   INTEGER NOT NULL DEFAULT 0,
                last_retry_at INTEGER,
                queued_at     INTEGER NOT NULL,
                job_queued    INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (chain_id, txid)
            );",
        )
        .await?;

        self.exec(
            "CREATE TABLE IF NOT EXISTS transactions (
                chain_id              TEXT    NOT NULL,
                txid                  TEXT    NOT NULL,
                currency_id           TEXT    NOT NULL,
                kind                  TEXT    NOT NULL,
                amount                TEXT    NOT NULL,
                fee                   TEXT    NOT NULL,
                block_height          INTEGER,
                timestamp             INTEGER NOT NULL,
                direction             TEXT    NOT NULL,
                outcome               TEXT,
                result                TEXT,
                source_addresses      TEXT    NOT NULL,
                destination_addresses TEXT    NOT NULL,
                PRIMARY KEY (chain_id, txid, currency_id)
            );",
        )
        .await?;

        self.exec(
            "CREATE TABLE IF NOT EXISTS address_links (
                chain_id    TEXT NOT NULL,
                currency_id TEXT NOT NULL,
                address_id  TEXT NOT NULL,
                txid        TEXT NOT NULL,
                amount      TEXT NOT NULL,
                direction   TEXT NOT NULL,
                PRIMARY KEY (currency_id, address_id, txid)
            );",
        )
        .await?;

        self.exec(
            "CREATE TABLE IF NOT EXISTS utxos (
                chain_id        TEXT    NOT NULL,
                utxo_id         TEXT    NOT NULL,
                address_id      TEXT    NOT NULL,
                txid            TEXT    NOT NULL,
                vout            INTEGER NOT NULL,
                amount          TEXT    NOT NULL,
                script          TEXT    NOT NULL,
                script_type     TEXT    NOT NULL,
                block_height    INTEGER,
                block_timestamp INTEGER NOT NULL,
                spent_by        TEXT,
                PRIMARY KEY (chain_id, utxo_id)
            );",
        )
        .await?;

        self.exec(
            "CREATE TABLE IF NOT EXISTS pending_snapshots (
                chain_id           TEXT    NOT NULL,
                block_height_asked INTEGER NOT NULL,
                tx_ids             TEXT    NOT NULL,
                timestamp          INTEGER NOT NULL,
                PRIMARY KEY (chain_id, block_height_asked)
            );",
        )
        .await?;

        self.exec(
            "CREATE TABLE IF NOT EXISTS accounts (
                account_id          TEXT PRIMARY KEY,
                chain_id            TEXT NOT NULL,
                extended_public_key TEXT NOT NULL
            );",
        )
        .await?;

        self.exec(
            "CREATE TABLE IF NOT EXISTS account_currencies (
                id                 TEXT    PRIMARY KEY,
                account_id         TEXT    NOT NULL,
                currency_id        TEXT    NOT NULL,
                balance            TEXT    NOT NULL,
                external_key_count INTEGER NOT NULL,
                internal_key_count INTEGER NOT NULL
            );",
        )
        .await?;

        self.exec(
            "CREATE TABLE IF NOT EXISTS addresses (
                address_id TEXT    PRIMARY KEY,
                account_id TEXT    NOT NULL,
                chain_id   TEXT    NOT NULL,
                branch     INTEGER NOT NULL,
                key_index  INTEGER NOT NULL,
                address    TEXT    NOT NULL,
                public_key TEXT    NOT NULL
            );",
        )
        .await?;

        self.exec("CREATE INDEX IF NOT EXISTS idx_addresses_lookup ON addresses (chain_id, address);")
            .await?;
        self.exec("CREATE INDEX IF NOT EXISTS idx_links_txid ON address_links (chain_id, txid);")
            .await?;
        self.exec("CREATE INDEX IF NOT EXISTS idx_utxos_address ON utxos (address_id);")
            .await?;
        self.exec("CREATE INDEX IF NOT EXISTS idx_utxos_spent ON utxos (chain_id, spent_by);")
            .await?;
        self.exec("CREATE INDEX IF NOT EXISTS idx_tx_height ON transactions (chain_id, block_height);")
            .await?;
        self.exec(
            "CREATE INDEX IF NOT EXISTS idx_unparsed_queue ON unparsed_transactions (chain_id, job_queued, retry_count);",
        )
        .await?;

        Ok(())
    }

    /// Heads of every chain, for status output.
    pub async fn heads(&self) -> Result<Vec<BlockchainHead>, LedgerError> {
        let rows = sqlx::query("SELECT * FROM heads ORDER BY chain_id")
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        rows.iter().map(head_from).collect()
    }

    /// Unparsed rows waiting on `chain_id`, abandoned ones included.
    pub async fn unparsed_count(&self, chain_id: &str) -> Result<usize, LedgerError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM unparsed_transactions WHERE chain_id = ?")
            .bind(chain_id)
            .fetch_one(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(col::<i64>(&row, "cnt")? as usize)
    }
}

#[async_trait]
impl ChainStore for SqliteStore {
    async fn head(&self, chain_id: &str) -> Result<Option<BlockchainHead>, LedgerError> {
        let row = sqlx::query("SELECT * FROM heads WHERE chain_id = ?")
            .bind(chain_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.as_ref().map(head_from).transpose()
    }

    async fn ensure_head(
        &self,
        chain_id: &str,
        start_height: u64,
    ) -> Result<BlockchainHead, LedgerError> {
        sqlx::query(
            "INSERT OR IGNORE INTO heads (chain_id, height, block_hash, avg_fee, updated_at)
             VALUES (?, ?, NULL, NULL, ?)",
        )
        .bind(chain_id)
        .bind(start_height as i64)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        self.head(chain_id)
            .await?
            .ok_or_else(|| LedgerError::Store(format!("head of {chain_id} missing after insert")))
    }

    async fn scanned_block(
        &self,
        chain_id: &str,
        height: u64,
    ) -> Result<Option<ScannedBlock>, LedgerError> {
        let row = sqlx::query("SELECT * FROM scanned_blocks WHERE chain_id = ? AND height = ?")
            .bind(chain_id)
            .bind(height as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.as_ref().map(block_from).transpose()
    }

    async fn scanned_heights(&self, chain_id: &str) -> Result<Vec<u64>, LedgerError> {
        let rows = sqlx::query("SELECT height FROM scanned_blocks WHERE chain_id = ? ORDER BY height")
            .bind(chain_id)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        rows.iter()
            .map(|r| col::<i64>(r, "height").map(|h| h as u64))
            .collect()
    }

    async fn commit_block(
        &self,
        block: ScannedBlock,
        transactions: Vec<UnparsedTransaction>,
    ) -> Result<Vec<String>, LedgerError> {
        let chain_id = block.chain_id.clone();
        let mut tx = self.pool.begin().await.map_err(store_err)?;

        let head = sqlx::query("SELECT * FROM heads WHERE chain_id = ?")
            .bind(&chain_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(store_err)?;
        if let Some(row) = head {
            let head = head_from(&row)?;
            if head.next_height() != block.height {
                return Err(LedgerError::Store(format!(
                    "block {} does not follow head {} of chain {chain_id}",
                    block.height, head.height
                )));
            }
        }

        let mut queued = Vec::new();
        for t in transactions {
            let existing = sqlx::query(
                "SELECT block_height FROM unparsed_transactions WHERE chain_id = ? AND txid = ?",
            )
            .bind(&chain_id)
            .bind(&t.txid)
            .fetch_optional(&mut *tx)
            .await
            .map_err(store_err)?;
            let replace = match existing {
                Some(row) => col::<Option<i64>>(&row, "block_height")?.is_none(),
                None => true,
            };
            if !replace {
                continue;
            }
            let payload = serde_json::to_string(&t.raw_payload).map_err(json_err)?;
            sqlx::query(
                "INSERT OR REPLACE INTO unparsed_transactions
                    (chain_id, txid, raw_payload, block_height, block_hash, timestamp,
                     retry_count, last_retry_at, queued_at, job_queued)
                 VALUES (?, ?, ?, ?, ?, ?, 0, NULL, ?, 0)",
            )
            .bind(&chain_id)
            .bind(&t.txid)
            .bind(payload)
            .bind(t.block_height.map(|h| h as i64))
            .bind(&t.block_hash)
            .bind(t.timestamp)
            .bind(t.queued_at)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
            queued.push(t.txid);
        }

        sqlx::query(
            "INSERT OR REPLACE INTO scanned_blocks
                (chain_id, height, block_hash, parent_hash, timestamp, tx_ids)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&chain_id)
        .bind(block.height as i64)
        .bind(&block.block_hash)
        .bind(&block.parent_hash)
        .bind(block.timestamp)
        .bind(serde_json::to_string(&block.tx_ids).map_err(json_err)?)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;

        sqlx::query(
            "INSERT INTO heads (chain_id, height, block_hash, avg_fee, updated_at)
             VALUES (?, ?, ?, NULL, ?)
             ON CONFLICT (chain_id) DO UPDATE SET
                height = excluded.height,
                block_hash = excluded.block_hash,
                updated_at = excluded.updated_at",
        )
        .bind(&chain_id)
        .bind(block.height as i64)
        .bind(&block.block_hash)
        .bind(chrono::Utc::now().timestamp())
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;

        tx.commit().await.map_err(store_err)?;
        debug!(chain = %chain_id, height = block.height, queued = queued.len(), "block committed");
        Ok(queued)
    }

    async fn update_fee(&self, chain_id: &str, avg_fee: u64) -> Result<(), LedgerError> {
        let done = sqlx::query("UPDATE heads SET avg_fee = ? WHERE chain_id = ?")
            .bind(avg_fee as i64)
            .bind(chain_id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        if done.rows_affected() == 0 {
            return Err(LedgerError::Store(format!("no head for chain {chain_id}")));
        }
        Ok(())
    }

    async fn rollback_to(
        &self,
        chain_id: &str,
        ancestor: Option<u64>,
    ) -> Result<RollbackSummary, LedgerError> {
        // Rows strictly above `floor` are dropped; -1 drops every recorded height.
        let floor = ancestor.map(|a| a as i64).unwrap_or(-1);
        let mut tx = self.pool.begin().await.map_err(store_err)?;

        let from_height = sqlx::query("SELECT height FROM heads WHERE chain_id = ?")
            .bind(chain_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(store_err)?
            .map(|r| col::<i64>(&r, "height"))
            .transpose()?
            .unwrap_or(0) as u64;
        let lowest: Option<i64> = col(
            &sqlx::query("SELECT MIN(height) AS lowest FROM scanned_blocks WHERE chain_id = ?")
                .bind(chain_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(store_err)?,
            "lowest",
        )?;

        const DOOMED: &str =
            "SELECT txid FROM transactions WHERE chain_id = ? AND block_height > ?";

        let transactions_removed: i64 = col(
            &sqlx::query(&format!("SELECT COUNT(*) AS cnt FROM ({DOOMED} GROUP BY txid)"))
                .bind(chain_id)
                .bind(floor)
                .fetch_one(&mut *tx)
                .await
                .map_err(store_err)?,
            "cnt",
        )?;

        let affected_rows = sqlx::query(&format!(
            "SELECT DISTINCT a.account_id, l.currency_id
             FROM address_links l JOIN addresses a ON a.address_id = l.address_id
             WHERE l.chain_id = ? AND l.txid IN ({DOOMED})"
        ))
        .bind(chain_id)
        .bind(chain_id)
        .bind(floor)
        .fetch_all(&mut *tx)
        .await
        .map_err(store_err)?;
        let mut affected = Vec::with_capacity(affected_rows.len());
        for row in &affected_rows {
            affected.push((col::<String>(row, "account_id")?, col::<String>(row, "currency_id")?));
        }

        sqlx::query(&format!(
            "DELETE FROM address_links WHERE chain_id = ? AND txid IN ({DOOMED})"
        ))
        .bind(chain_id)
        .bind(chain_id)
        .bind(floor)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;

        let utxos_removed = sqlx::query(&format!(
            "DELETE FROM utxos WHERE chain_id = ? AND txid IN ({DOOMED})"
        ))
        .bind(chain_id)
        .bind(chain_id)
        .bind(floor)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?
        .rows_affected();

        let utxos_restored = sqlx::query(&format!(
            "UPDATE utxos SET spent_by = NULL WHERE chain_id = ? AND spent_by IN ({DOOMED})"
        ))
        .bind(chain_id)
        .bind(chain_id)
        .bind(floor)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?
        .rows_affected();

        sqlx::query("DELETE FROM transactions WHERE chain_id = ? AND block_height > ?")
            .bind(chain_id)
            .bind(floor)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;

        let blocks_removed = sqlx::query("DELETE FROM scanned_blocks WHERE chain_id = ? AND height > ?")
            .bind(chain_id)
            .bind(floor)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?
            .rows_affected();

        let unparsed_removed = sqlx::query(
            "DELETE FROM unparsed_transactions WHERE chain_id = ? AND block_height > ?",
        )
        .bind(chain_id)
        .bind(floor)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?
        .rows_affected();

        let new_head = match ancestor {
            Some(a) => {
                let hash = sqlx::query("SELECT block_hash FROM scanned_blocks WHERE chain_id = ? AND height = ?")
                    .bind(chain_id)
                    .bind(a as i64)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(store_err)?
                    .map(|r| col::<String>(&r, "block_hash"))
                    .transpose()?;
                Some(match hash {
                    Some(hash) => (a, Some(hash)),
                    None => (a + 1, None),
                })
            }
            None => lowest.map(|h| (h as u64, None)),
        };
        let to_height = match &new_head {
            Some((height, Some(_))) => Some(*height),
            _ => None,
        };
        if let Some((height, hash)) = new_head {
            sqlx::query("UPDATE heads SET height = ?, block_hash = ?, updated_at = ? WHERE chain_id = ?")
                .bind(height as i64)
                .bind(hash)
                .bind(chrono::Utc::now().timestamp())
                .bind(chain_id)
                .execute(&mut *tx)
                .await
                .map_err(store_err)?;
        }

        for (account_id, currency_id) in &affected {
            recompute(&mut tx, account_id, currency_id).await?;
        }

        tx.commit().await.map_err(store_err)?;
        Ok(RollbackSummary {
            chain_id: chain_id.to_string(),
            from_height,
            to_height,
            blocks_removed: blocks_removed as usize,
            transactions_removed: transactions_removed as usize,
            utxos_removed: utxos_removed as usize,
            utxos_restored: utxos_restored as usize,
            unparsed_removed: unparsed_removed as usize,
        })
    }

    async fn insert_unparsed(&self, tx: UnparsedTransaction) -> Result<bool, LedgerError> {
        let payload = serde_json::to_string(&tx.raw_payload).map_err(json_err)?;
        let done = sqlx::query(
            "INSERT OR IGNORE INTO unparsed_transactions
                (chain_id, txid, raw_payload, block_height, block_hash, timestamp,
                 retry_count, last_retry_at, queued_at, job_queued)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&tx.chain_id)
        .bind(&tx.txid)
        .bind(payload)
        .bind(tx.block_height.map(|h| h as i64))
        .bind(&tx.block_hash)
        .bind(tx.timestamp)
        .bind(tx.retry_count as i64)
        .bind(tx.last_retry_at)
        .bind(tx.queued_at)
        .bind(tx.job_queued)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(done.rows_affected() == 1)
    }

    async fn unparsed(
        &self,
        chain_id: &str,
        txid: &str,
    ) -> Result<Option<UnparsedTransaction>, LedgerError> {
        let row = sqlx::query("SELECT * FROM unparsed_transactions WHERE chain_id = ? AND txid = ?")
            .bind(chain_id)
            .bind(txid)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.as_ref().map(unparsed_from).transpose()
    }

    async fn discard_unparsed(
        &self,
        chain_id: &str,
        txid: &str,
        block_hash: Option<&str>,
    ) -> Result<(), LedgerError> {
        sqlx::query(
            "DELETE FROM unparsed_transactions
             WHERE chain_id = ? AND txid = ? AND block_hash IS ?",
        )
        .bind(chain_id)
        .bind(txid)
        .bind(block_hash)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn mark_queued(
        &self,
        chain_id: &str,
        txids: &[String],
        at: i64,
    ) -> Result<usize, LedgerError> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        let mut marked = 0;
        for txid in txids {
            let done = sqlx::query(
                "UPDATE unparsed_transactions SET job_queued = 1, queued_at = ?
                 WHERE chain_id = ? AND txid = ? AND job_queued = 0 AND last_retry_at IS NULL",
            )
            .bind(at)
            .bind(chain_id)
            .bind(txid)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
            marked += done.rows_affected() as usize;
        }
        tx.commit().await.map_err(store_err)?;
        Ok(marked)
    }

    async fn release_job(&self, chain_id: &str, txid: &str) -> Result<(), LedgerError> {
        sqlx::query("UPDATE unparsed_transactions SET job_queued = 0 WHERE chain_id = ? AND txid = ?")
            .bind(chain_id)
            .bind(txid)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn record_parse_failure(
        &self,
        chain_id: &str,
        txid: &str,
        at: i64,
    ) -> Result<u32, LedgerError> {
        let row = sqlx::query(
            "UPDATE unparsed_transactions
             SET retry_count = retry_count + 1, last_retry_at = ?, job_queued = 0
             WHERE chain_id = ? AND txid = ?
             RETURNING retry_count",
        )
        .bind(at)
        .bind(chain_id)
        .bind(txid)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?
        .ok_or_else(|| LedgerError::Store(format!("unparsed {txid} not found")))?;
        Ok(col::<i64>(&row, "retry_count")? as u32)
    }

    async fn take_stale_unparsed(
        &self,
        chain_id: &str,
        max_retry: u32,
        older_than: i64,
        limit: usize,
    ) -> Result<Vec<UnparsedTransaction>, LedgerError> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        let rows = sqlx::query(
            "SELECT * FROM unparsed_transactions
             WHERE chain_id = ? AND job_queued = 0 AND retry_count < ?
               AND MAX(queued_at, COALESCE(last_retry_at, 0)) < ?
             ORDER BY block_height IS NULL, block_height, MAX(queued_at, COALESCE(last_retry_at, 0))
             LIMIT ?",
        )
        .bind(chain_id)
        .bind(max_retry as i64)
        .bind(older_than)
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(store_err)?;

        let mut stale = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut unparsed = unparsed_from(row)?;
            sqlx::query(
                "UPDATE unparsed_transactions SET queued_at = ?, job_queued = 1
                 WHERE chain_id = ? AND txid = ?",
            )
            .bind(now)
            .bind(chain_id)
            .bind(&unparsed.txid)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
            unparsed.queued_at = now;
            unparsed.job_queued = true;
            stale.push(unparsed);
        }
        tx.commit().await.map_err(store_err)?;
        Ok(stale)
    }

    async fn abandoned_unparsed(
        &self,
        chain_id: &str,
        max_retry: u32,
    ) -> Result<Vec<UnparsedTransaction>, LedgerError> {
        let rows = sqlx::query(
            "SELECT * FROM unparsed_transactions
             WHERE chain_id = ? AND retry_count >= ?
             ORDER BY block_height, txid",
        )
        .bind(chain_id)
        .bind(max_retry as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.iter().map(unparsed_from).collect()
    }

    async fn watched_addresses(
        &self,
        chain_id: &str,
        candidates: &[String],
    ) -> Result<Vec<Address>, LedgerError> {
        let mut found = Vec::new();
        for chunk in candidates.chunks(IN_CHUNK) {
            let sql = format!(
                "SELECT * FROM addresses WHERE chain_id = ? AND address IN ({})",
                placeholders(chunk.len())
            );
            let mut query = sqlx::query(&sql).bind(chain_id);
            for candidate in chunk {
                query = query.bind(candidate);
            }
            for row in query.fetch_all(&self.pool).await.map_err(store_err)? {
                found.push(address_from(&row)?);
            }
        }
        Ok(found)
    }

    async fn addresses_by_id(&self, address_ids: &[String]) -> Result<Vec<Address>, LedgerError> {
        let mut found = Vec::new();
        for chunk in address_ids.chunks(IN_CHUNK) {
            let sql = format!(
                "SELECT * FROM addresses WHERE address_id IN ({})",
                placeholders(chunk.len())
            );
            let mut query = sqlx::query(&sql);
            for id in chunk {
                query = query.bind(id);
            }
            for row in query.fetch_all(&self.pool).await.map_err(store_err)? {
                found.push(address_from(&row)?);
            }
        }
        Ok(found)
    }

    async fn spendable_utxos(
        &self,
        chain_id: &str,
        outpoints: &[OutPoint],
        spender: &str,
    ) -> Result<Vec<Utxo>, LedgerError> {
        let mut found = Vec::new();
        for outpoint in outpoints {
            let row = sqlx::query(
                "SELECT * FROM utxos
                 WHERE chain_id = ? AND utxo_id = ? AND (spent_by IS NULL OR spent_by = ?)",
            )
            .bind(chain_id)
            .bind(outpoint.utxo_id())
            .bind(spender)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
            if let Some(row) = row {
                found.push(utxo_from(&row)?);
            }
        }
        Ok(found)
    }

    async fn apply_parse(&self, effects: ParseEffects) -> Result<(), LedgerError> {
        let chain_id = effects.chain_id.as_str();
        let mut tx = self.pool.begin().await.map_err(store_err)?;

        // Writing first takes the database lock, so a rollback either lands
        // before this check or waits for the commit.
        let source = sqlx::query(
            "DELETE FROM unparsed_transactions WHERE chain_id = ? AND txid = ?
             RETURNING block_hash",
        )
        .bind(chain_id)
        .bind(&effects.txid)
        .fetch_optional(&mut *tx)
        .await
        .map_err(store_err)?;
        let current = source
            .as_ref()
            .map(|row| col::<Option<String>>(row, "block_hash"))
            .transpose()?;
        if current != Some(effects.block_hash.clone()) {
            return Err(LedgerError::StaleParse {
                txid: effects.txid.clone(),
            });
        }

        // (account, branch, index, currency) of every linked address.
        let mut owners = Vec::with_capacity(effects.links.len());
        for link in &effects.links {
            let row = sqlx::query("SELECT account_id, branch, key_index FROM addresses WHERE address_id = ?")
                .bind(&link.address_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(store_err)?
                .ok_or_else(|| LedgerError::Store(format!("unknown address {}", link.address_id)))?;
            owners.push((
                col::<String>(&row, "account_id")?,
                branch_from(col(&row, "branch")?)?,
                col::<i64>(&row, "key_index")? as u32,
                link.currency_id.clone(),
            ));
        }

        for mut record in effects.records {
            let existing = sqlx::query(
                "SELECT block_height, timestamp, result FROM transactions
                 WHERE chain_id = ? AND txid = ? AND currency_id = ?",
            )
            .bind(chain_id)
            .bind(&record.txid)
            .bind(&record.currency_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(store_err)?;
            if let Some(row) = existing {
                let height = opt_u64(&row, "block_height")?;
                if record.block_height.is_none() && height.is_some() {
                    record.block_height = height;
                    record.timestamp = col(&row, "timestamp")?;
                }
                if record.result.is_none() && record.block_height == height {
                    record.result = outcome_from(col(&row, "result")?)?;
                }
            }
            sqlx::query(
                "INSERT OR REPLACE INTO transactions
                    (chain_id, txid, currency_id, kind, amount, fee, block_height, timestamp,
                     direction, outcome, result, source_addresses, destination_addresses)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(chain_id)
            .bind(&record.txid)
            .bind(&record.currency_id)
            .bind(serde_json::to_string(&record.kind).map_err(json_err)?)
            .bind(record.amount.to_string())
            .bind(record.fee.to_string())
            .bind(record.block_height.map(|h| h as i64))
            .bind(record.timestamp)
            .bind(record.direction.to_string())
            .bind(record.outcome.map(|o| o.to_string()))
            .bind(record.result.map(|o| o.to_string()))
            .bind(serde_json::to_string(&record.source_addresses).map_err(json_err)?)
            .bind(serde_json::to_string(&record.destination_addresses).map_err(json_err)?)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
        }

        for link in &effects.links {
            sqlx::query(
                "INSERT OR REPLACE INTO address_links
                    (chain_id, currency_id, address_id, txid, amount, direction)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&link.chain_id)
            .bind(&link.currency_id)
            .bind(&link.address_id)
            .bind(&link.txid)
            .bind(link.amount.to_string())
            .bind(link.direction.to_string())
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
        }

        for utxo in &effects.created_utxos {
            sqlx::query(
                "INSERT INTO utxos
                    (chain_id, utxo_id, address_id, txid, vout, amount, script, script_type,
                     block_height, block_timestamp, spent_by)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)
                 ON CONFLICT (chain_id, utxo_id) DO UPDATE SET
                    block_height = COALESCE(excluded.block_height, utxos.block_height),
                    block_timestamp = excluded.block_timestamp",
            )
            .bind(chain_id)
            .bind(&utxo.utxo_id)
            .bind(&utxo.address_id)
            .bind(&utxo.txid)
            .bind(utxo.vout as i64)
            .bind(utxo.amount.to_string())
            .bind(&utxo.script)
            .bind(&utxo.script_type)
            .bind(utxo.block_height.map(|h| h as i64))
            .bind(utxo.block_timestamp)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
        }

        for utxo_id in &effects.spent_utxos {
            sqlx::query(
                "UPDATE utxos SET spent_by = ? WHERE chain_id = ? AND utxo_id = ? AND spent_by IS NULL",
            )
            .bind(&effects.txid)
            .bind(chain_id)
            .bind(utxo_id)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;
        }

        let mut touched = BTreeSet::new();
        for (account_id, branch, index, currency_id) in &owners {
            ensure_ledger(&mut tx, account_id, currency_id).await?;
            let sql = match branch {
                KeyBranch::External => {
                    "UPDATE account_currencies SET external_key_count = MAX(external_key_count, ?) WHERE id = ?"
                }
                KeyBranch::Internal => {
                    "UPDATE account_currencies SET internal_key_count = MAX(internal_key_count, ?) WHERE id = ?"
                }
            };
            sqlx::query(sql)
                .bind(*index as i64 + 1)
                .bind(AccountCurrency::id_for(account_id, currency_id))
                .execute(&mut *tx)
                .await
                .map_err(store_err)?;
            touched.insert((account_id.clone(), currency_id.clone()));
        }
        for (account_id, currency_id) in &touched {
            recompute(&mut tx, account_id, currency_id).await?;
        }

        tx.commit().await.map_err(store_err)?;
        Ok(())
    }

    async fn confirm_transactions(
        &self,
        chain_id: &str,
        up_to_height: u64,
    ) -> Result<u64, LedgerError> {
        let done = sqlx::query(
            "UPDATE transactions SET result = COALESCE(outcome, 'success')
             WHERE chain_id = ? AND result IS NULL
               AND block_height IS NOT NULL AND block_height <= ?",
        )
        .bind(chain_id)
        .bind(up_to_height as i64)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(done.rows_affected())
    }

    async fn known_txids(
        &self,
        chain_id: &str,
        candidates: &[String],
    ) -> Result<HashSet<String>, LedgerError> {
        let mut known = HashSet::new();
        for chunk in candidates.chunks(IN_CHUNK) {
            let marks = placeholders(chunk.len());
            let sql = format!(
                "SELECT txid FROM unparsed_transactions WHERE chain_id = ? AND txid IN ({marks})
                 UNION
                 SELECT txid FROM transactions WHERE chain_id = ? AND txid IN ({marks})"
            );
            let mut query = sqlx::query(&sql).bind(chain_id);
            for txid in chunk {
                query = query.bind(txid);
            }
            query = query.bind(chain_id);
            for txid in chunk {
                query = query.bind(txid);
            }
            for row in query.fetch_all(&self.pool).await.map_err(store_err)? {
                known.insert(col::<String>(&row, "txid")?);
            }
        }
        Ok(known)
    }

    async fn latest_pending_snapshot(
        &self,
        chain_id: &str,
    ) -> Result<Option<PendingSnapshot>, LedgerError> {
        let row = sqlx::query(
            "SELECT * FROM pending_snapshots WHERE chain_id = ?
             ORDER BY timestamp DESC, block_height_asked DESC LIMIT 1",
        )
        .bind(chain_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        row.as_ref().map(snapshot_from).transpose()
    }

    async fn save_pending_snapshot(&self, snapshot: PendingSnapshot) -> Result<(), LedgerError> {
        sqlx::query(
            "INSERT OR REPLACE INTO pending_snapshots (chain_id, block_height_asked, tx_ids, timestamp)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&snapshot.chain_id)
        .bind(snapshot.block_height_asked as i64)
        .bind(serde_json::to_string(&snapshot.tx_ids).map_err(json_err)?)
        .bind(snapshot.timestamp)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn recompute_balances(&self, chain_id: &str) -> Result<usize, LedgerError> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        let rows = sqlx::query(
            "SELECT ac.account_id, ac.currency_id
             FROM account_currencies ac JOIN accounts a ON a.account_id = ac.account_id
             WHERE a.chain_id = ?",
        )
        .bind(chain_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(store_err)?;
        for row in &rows {
            let account_id: String = col(row, "account_id")?;
            let currency_id: String = col(row, "currency_id")?;
            recompute(&mut tx, &account_id, &currency_id).await?;
        }
        tx.commit().await.map_err(store_err)?;
        Ok(rows.len())
    }

    async fn insert_account(&self, account: Account) -> Result<(), LedgerError> {
        sqlx::query(
            "INSERT OR REPLACE INTO accounts (account_id, chain_id, extended_public_key) VALUES (?, ?, ?)",
        )
        .bind(&account.account_id)
        .bind(&account.chain_id)
        .bind(&account.extended_public_key)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn account(&self, account_id: &str) -> Result<Option<Account>, LedgerError> {
        let row = sqlx::query("SELECT * FROM accounts WHERE account_id = ?")
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.map(|r| {
            Ok(Account {
                account_id: col(&r, "account_id")?,
                chain_id: col(&r, "chain_id")?,
                extended_public_key: col(&r, "extended_public_key")?,
            })
        })
        .transpose()
    }

    async fn account_currency(&self, id: &str) -> Result<Option<AccountCurrency>, LedgerError> {
        let row = sqlx::query("SELECT * FROM account_currencies WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.as_ref().map(ledger_from).transpose()
    }

    async fn ensure_account_currency(
        &self,
        account_id: &str,
        currency_id: &str,
    ) -> Result<AccountCurrency, LedgerError> {
        let mut conn = self.pool.acquire().await.map_err(store_err)?;
        ensure_ledger(&mut conn, account_id, currency_id).await?;
        drop(conn);
        self.account_currency(&AccountCurrency::id_for(account_id, currency_id))
            .await?
            .ok_or_else(|| LedgerError::Store(format!("ledger {account_id}/{currency_id} missing")))
    }

    async fn address_at(
        &self,
        account_id: &str,
        branch: KeyBranch,
        key_index: u32,
    ) -> Result<Option<Address>, LedgerError> {
        let row = sqlx::query("SELECT * FROM addresses WHERE address_id = ?")
            .bind(Address::id_for(account_id, branch, key_index))
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.as_ref().map(address_from).transpose()
    }

    async fn insert_address(&self, address: Address) -> Result<Address, LedgerError> {
        sqlx::query(
            "INSERT OR IGNORE INTO addresses
                (address_id, account_id, chain_id, branch, key_index, address, public_key)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&address.address_id)
        .bind(&address.account_id)
        .bind(&address.chain_id)
        .bind(address.branch.chain_index() as i64)
        .bind(address.key_index as i64)
        .bind(&address.address)
        .bind(&address.public_key)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        self.address_at(&address.account_id, address.branch, address.key_index)
            .await?
            .ok_or_else(|| LedgerError::Store(format!("address {} missing", address.address_id)))
    }

    async fn transactions(
        &self,
        chain_id: &str,
        txid: &str,
    ) -> Result<Vec<TransactionRecord>, LedgerError> {
        let rows = sqlx::query(
            "SELECT * FROM transactions WHERE chain_id = ? AND txid = ? ORDER BY currency_id",
        )
        .bind(chain_id)
        .bind(txid)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.iter().map(record_from).collect()
    }

    async fn transaction_count(&self, chain_id: &str) -> Result<usize, LedgerError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM transactions WHERE chain_id = ?")
            .bind(chain_id)
            .fetch_one(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(col::<i64>(&row, "cnt")? as usize)
    }

    async fn address_links(&self, address_id: &str) -> Result<Vec<AddressLink>, LedgerError> {
        let rows = sqlx::query("SELECT * FROM address_links WHERE address_id = ? ORDER BY txid")
            .bind(address_id)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        rows.iter().map(link_from).collect()
    }

    async fn unspent_utxos(&self, address_id: &str) -> Result<Vec<Utxo>, LedgerError> {
        let rows = sqlx::query(
            "SELECT * FROM utxos WHERE address_id = ? AND spent_by IS NULL ORDER BY utxo_id",
        )
        .bind(address_id)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.iter().map(utxo_from).collect()
    }
}
