// src/models.rs
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Native token label used for lamport transfers
pub const NATIVE_TOKEN: &str = "SOL";

/// Direction of value movement relative to the tracked wallet
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxKind {
    Sent,
    Received,
    Unknown,
}

impl TxKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxKind::Sent => "sent",
            TxKind::Received => "received",
            TxKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for TxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TxKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sent" => Ok(TxKind::Sent),
            "received" => Ok(TxKind::Received),
            "unknown" => Ok(TxKind::Unknown),
            other => Err(format!("unknown transaction kind '{}'", other)),
        }
    }
}

/// Classified value movement. Each variant carries only what is meaningful to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Flow {
    Sent {
        amount: Decimal,    // display units, never negative
        to: Option<String>, // first account that gained, by account order
    },
    Received {
        amount: Decimal,
        from: Option<String>,
    },
    Unknown,
}

impl Flow {
    pub fn kind(&self) -> TxKind {
        match self {
            Flow::Sent { .. } => TxKind::Sent,
            Flow::Received { .. } => TxKind::Received,
            Flow::Unknown => TxKind::Unknown,
        }
    }

    pub fn amount(&self) -> Decimal {
        match self {
            Flow::Sent { amount, .. } | Flow::Received { amount, .. } => *amount,
            Flow::Unknown => Decimal::ZERO,
        }
    }

    pub fn counterparty(&self) -> Option<&str> {
        match self {
            Flow::Sent { to, .. } => to.as_deref(),
            Flow::Received { from, .. } => from.as_deref(),
            Flow::Unknown => None,
        }
    }

    /// Rebuild a flow from its flattened storage columns
    pub fn from_parts(kind: TxKind, amount: Decimal, counterparty: Option<String>) -> Self {
        match kind {
            TxKind::Sent => Flow::Sent { amount, to: counterparty },
            TxKind::Received => Flow::Received { amount, from: counterparty },
            TxKind::Unknown => Flow::Unknown,
        }
    }
}

/// Commitment level the transaction was fetched at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Confirmed,
    Finalized,
}

impl TxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Confirmed => "confirmed",
            TxStatus::Finalized => "finalized",
        }
    }
}

impl FromStr for TxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "confirmed" => Ok(TxStatus::Confirmed),
            "finalized" => Ok(TxStatus::Finalized),
            other => Err(format!("unknown commitment '{}'", other)),
        }
    }
}

/// A resolved, classified transaction of the tracked wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletTransaction {
    pub signature: String,
    pub block_time: Option<i64>,
    pub slot: u64,
    pub timestamp: Option<DateTime<Utc>>, // derived from block_time
    pub flow: Flow,
    pub token: String,              // "SOL", a known symbol, or the mint address
    pub token_mint: Option<String>, // None for native transfers
    pub wallet: String,             // the tracked side of the transfer
    pub fee: Decimal,
    pub status: TxStatus,
}

impl WalletTransaction {
    pub fn kind(&self) -> TxKind {
        self.flow.kind()
    }

    pub fn amount(&self) -> Decimal {
        self.flow.amount()
    }

    pub fn counterparty(&self) -> Option<&str> {
        self.flow.counterparty()
    }
}

/// Where the next backward page resumes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchCursor {
    pub before_signature: Option<String>, // None = start from the most recent signature
    pub scan_complete: bool,
    pub rescan: bool, // current scan is a full rescan (no caught-up early stop)
    pub last_fetch_timestamp: Option<DateTime<Utc>>,
}

impl FetchCursor {
    /// Cursor for a fresh full rescan from the head of history
    pub fn full_rescan() -> Self {
        Self {
            before_signature: None,
            scan_complete: false,
            rescan: true,
            last_fetch_timestamp: None,
        }
    }

    /// The `before` anchor the next page should use.
    /// A completed scan restarts from the head to pick up new activity.
    pub fn resume_point(&self) -> Option<&str> {
        if self.scan_complete {
            None
        } else {
            self.before_signature.as_deref()
        }
    }

    /// Cursor for a scan interrupted after `signature` was processed
    pub fn resume_from(&self, signature: &str) -> Self {
        Self {
            before_signature: Some(signature.to_string()),
            scan_complete: false,
            rescan: self.rescan && !self.scan_complete,
            last_fetch_timestamp: Some(Utc::now()),
        }
    }
}
