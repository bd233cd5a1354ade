use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task;
use tracing::debug;

use crate::error::StoreError;
use crate::ledger::LedgerSnapshot;
use crate::models::{FetchCursor, Flow, TxKind, TxStatus, WalletTransaction};
use crate::store::LedgerStore;

const INIT_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS transactions (
  signature     TEXT PRIMARY KEY NOT NULL,
  slot          INTEGER NOT NULL,
  block_time    INTEGER,
  timestamp     TEXT,
  kind          TEXT NOT NULL CHECK (kind IN ('sent','received','unknown')),
  amount        TEXT NOT NULL, -- Decimal stored as string
  token         TEXT NOT NULL,
  token_mint    TEXT,
  wallet        TEXT NOT NULL,
  counterparty  TEXT,
  fee           TEXT NOT NULL, -- Decimal stored as string
  status        TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS fetch_cursor (
  id                   INTEGER PRIMARY KEY CHECK (id = 1),
  before_signature     TEXT,
  scan_complete        INTEGER NOT NULL,
  rescan               INTEGER NOT NULL,
  last_fetch_timestamp TEXT
);
"#;

/// Connect to SQLite (with WAL mode for performance)
pub fn connect(path: impl AsRef<Path>) -> Result<Connection, StoreError> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    Ok(conn)
}

/// Run schema migrations
pub fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(INIT_SQL)?;
    Ok(())
}

/// Insert or replace a transaction by signature
pub fn record_transaction(conn: &Connection, tx: &WalletTransaction) -> Result<(), StoreError> {
    conn.execute(
        r#"
        INSERT INTO transactions (
            signature, slot, block_time, timestamp,
            kind, amount, token, token_mint,
            wallet, counterparty, fee, status
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        ON CONFLICT(signature) DO UPDATE SET
            slot         = excluded.slot,
            block_time   = excluded.block_time,
            timestamp    = excluded.timestamp,
            kind         = excluded.kind,
            amount       = excluded.amount,
            token        = excluded.token,
            token_mint   = excluded.token_mint,
            wallet       = excluded.wallet,
            counterparty = excluded.counterparty,
            fee          = excluded.fee,
            status       = excluded.status
        "#,
        params![
            tx.signature,
            tx.slot as i64,
            tx.block_time,
            tx.timestamp.map(|t| t.to_rfc3339()),
            tx.kind().as_str(),
            tx.amount().to_string(),
            tx.token,
            tx.token_mint,
            tx.wallet,
            tx.counterparty(),
            tx.fee.to_string(),
            tx.status.as_str()
        ],
    )?;
    Ok(())
}

fn record_cursor(conn: &Connection, cursor: &FetchCursor) -> Result<(), StoreError> {
    conn.execute(
        r#"
        INSERT INTO fetch_cursor (id, before_signature, scan_complete, rescan, last_fetch_timestamp)
        VALUES (1, ?1, ?2, ?3, ?4)
        ON CONFLICT(id) DO UPDATE SET
            before_signature     = excluded.before_signature,
            scan_complete        = excluded.scan_complete,
            rescan               = excluded.rescan,
            last_fetch_timestamp = excluded.last_fetch_timestamp
        "#,
        params![
            cursor.before_signature,
            cursor.scan_complete,
            cursor.rescan,
            cursor.last_fetch_timestamp.map(|t| t.to_rfc3339())
        ],
    )?;
    Ok(())
}

/// Column type mismatches mean the stored state cannot be trusted
fn integrity(e: rusqlite::Error) -> StoreError {
    match e {
        rusqlite::Error::InvalidColumnType(..)
        | rusqlite::Error::FromSqlConversionFailure(..)
        | rusqlite::Error::IntegralValueOutOfRange(..) => StoreError::Corrupt(e.to_string()),
        other => StoreError::Database(other),
    }
}

fn parse_decimal(signature: &str, column: &str, raw: &str) -> Result<Decimal, StoreError> {
    Decimal::from_str(raw).map_err(|e| {
        StoreError::Corrupt(format!("{} of {} is not a decimal ({}): {}", column, signature, raw, e))
    })
}

fn parse_time(raw: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| StoreError::Corrupt(format!("bad timestamp '{}': {}", s, e)))
    })
    .transpose()
}

struct RawTransaction {
    signature: String,
    slot: i64,
    block_time: Option<i64>,
    timestamp: Option<String>,
    kind: String,
    amount: String,
    token: String,
    token_mint: Option<String>,
    wallet: String,
    counterparty: Option<String>,
    fee: String,
    status: String,
}

impl RawTransaction {
    fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            signature: r.get(0)?,
            slot: r.get(1)?,
            block_time: r.get(2)?,
            timestamp: r.get(3)?,
            kind: r.get(4)?,
            amount: r.get(5)?,
            token: r.get(6)?,
            token_mint: r.get(7)?,
            wallet: r.get(8)?,
            counterparty: r.get(9)?,
            fee: r.get(10)?,
            status: r.get(11)?,
        })
    }

    fn into_transaction(self) -> Result<WalletTransaction, StoreError> {
        let kind = TxKind::from_str(&self.kind).map_err(StoreError::Corrupt)?;
        let status = TxStatus::from_str(&self.status).map_err(StoreError::Corrupt)?;
        let amount = parse_decimal(&self.signature, "amount", &self.amount)?;
        let fee = parse_decimal(&self.signature, "fee", &self.fee)?;
        let slot = u64::try_from(self.slot)
            .map_err(|_| StoreError::Corrupt(format!("negative slot for {}", self.signature)))?;

        Ok(WalletTransaction {
            block_time: self.block_time,
            slot,
            timestamp: parse_time(self.timestamp)?,
            flow: Flow::from_parts(kind, amount, self.counterparty),
            token: self.token,
            token_mint: self.token_mint,
            wallet: self.wallet,
            fee,
            status,
            signature: self.signature,
        })
    }
}

fn load_snapshot(conn: &Connection) -> Result<Option<LedgerSnapshot>, StoreError> {
    let cursor_row = conn
        .query_row(
            "SELECT before_signature, scan_complete, rescan, last_fetch_timestamp
             FROM fetch_cursor WHERE id = 1",
            [],
            |r| {
                Ok((
                    r.get::<_, Option<String>>(0)?,
                    r.get::<_, bool>(1)?,
                    r.get::<_, bool>(2)?,
                    r.get::<_, Option<String>>(3)?,
                ))
            },
        )
        .optional()
        .map_err(integrity)?;

    let mut stmt = conn.prepare(
        "SELECT signature, slot, block_time, timestamp, kind, amount, token, token_mint,
                wallet, counterparty, fee, status
         FROM transactions
         ORDER BY slot DESC, signature ASC",
    )?;
    let transactions = stmt
        .query_map([], RawTransaction::from_row)?
        .map(|row| row.map_err(integrity)?.into_transaction())
        .collect::<Result<Vec<_>, _>>()?;

    let cursor = match cursor_row {
        Some((before_signature, scan_complete, rescan, last_fetch)) => FetchCursor {
            before_signature,
            scan_complete,
            rescan,
            last_fetch_timestamp: parse_time(last_fetch)?,
        },
        None if transactions.is_empty() => return Ok(None),
        None => FetchCursor::default(),
    };

    Ok(Some(LedgerSnapshot {
        transactions,
        cursor,
    }))
}

fn save_snapshot(conn: &mut Connection, snapshot: &LedgerSnapshot) -> Result<(), StoreError> {
    // batch writes
    let tx = conn.transaction()?;
    for wallet_tx in &snapshot.transactions {
        record_transaction(&tx, wallet_tx)?;
    }
    record_cursor(&tx, &snapshot.cursor)?;
    tx.commit()?;
    Ok(())
}

/// SQLite-backed ledger persistence
#[derive(Clone)]
pub struct SqliteLedgerStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLedgerStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = connect(path)?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

#[async_trait]
impl LedgerStore for SqliteLedgerStore {
    async fn load(&self) -> Result<Option<LedgerSnapshot>, StoreError> {
        let conn = Arc::clone(&self.conn);
        task::spawn_blocking(move || {
            let db = conn.lock().unwrap_or_else(PoisonError::into_inner);
            load_snapshot(&db)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }

    async fn save(&self, snapshot: &LedgerSnapshot) -> Result<(), StoreError> {
        let conn = Arc::clone(&self.conn);
        let snapshot = snapshot.clone();
        task::spawn_blocking(move || {
            let mut db = conn.lock().unwrap_or_else(PoisonError::into_inner);
            save_snapshot(&mut db, &snapshot)?;
            debug!("💾 Saved {} transactions", snapshot.transactions.len());
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }

    fn backend_type(&self) -> &'static str {
        "SQLite"
    }
}
