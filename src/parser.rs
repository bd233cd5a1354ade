// src/parser.rs
use rust_decimal::Decimal;
use std::collections::BTreeMap;

use crate::models::{Flow, NATIVE_TOKEN};
use crate::rpc::{RpcTransaction, TokenBalance};

/// Symbols for mints common enough to label
const KNOWN_MINTS: &[(&str, &str)] = &[
    ("EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v", "USDC"),
    ("Es9vMFrzaCERmJfrF4H2FYD4KCoNkY11McCe8BenwNYB", "USDT"),
    ("So11111111111111111111111111111111111111112", "wSOL"),
];

pub fn token_symbol(mint: &str) -> String {
    KNOWN_MINTS
        .iter()
        .find(|(m, _)| *m == mint)
        .map(|(_, symbol)| symbol.to_string())
        .unwrap_or_else(|| mint.to_string())
}

/// What moved, in which token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub flow: Flow,
    pub token: String,
    pub token_mint: Option<String>,
}

/// Raw integer units → display units
pub fn scale_amount(raw: u64, unit_scale: u64) -> Decimal {
    Decimal::from(raw) / Decimal::from(unit_scale.max(1))
}

fn balance_delta(pre: &[u64], post: &[u64], idx: usize) -> Option<i128> {
    Some(*post.get(idx)? as i128 - *pre.get(idx)? as i128)
}

/// Classify the native balance change of `wallet`.
///
/// The counterparty is the first account, in account-list order, whose
/// balance moved in the opposite direction. Amounts are not matched
/// exactly, since the fee payer's delta also includes the fee.
pub fn classify_native(
    wallet: &str,
    account_keys: &[String],
    pre: &[u64],
    post: &[u64],
    unit_scale: u64,
) -> Flow {
    let Some(idx) = account_keys.iter().position(|k| k == wallet) else {
        return Flow::Unknown;
    };
    let Some(delta) = balance_delta(pre, post, idx) else {
        return Flow::Unknown;
    };
    if delta == 0 {
        return Flow::Unknown;
    }

    let counterparty = account_keys
        .iter()
        .enumerate()
        .filter(|(j, _)| *j != idx)
        .find(|(j, _)| {
            balance_delta(pre, post, *j).is_some_and(|d| d != 0 && (d > 0) != (delta > 0))
        })
        .map(|(_, key)| key.clone());

    // both balances are u64, so the magnitude always fits
    let magnitude = u64::try_from(delta.unsigned_abs()).unwrap_or(u64::MAX);
    let amount = scale_amount(magnitude, unit_scale);
    if delta > 0 {
        Flow::Received { amount, from: counterparty }
    } else {
        Flow::Sent { amount, to: counterparty }
    }
}

#[derive(Debug)]
struct TokenDelta {
    account_index: usize,
    mint: String,
    owner: Option<String>,
    delta: i128,
    decimals: u32,
}

fn raw_amount(b: &TokenBalance) -> i128 {
    b.ui_token_amount.amount.parse::<i128>().unwrap_or(0)
}

/// Per-account token deltas, ordered by account index.
/// Accounts missing from one side count as zero there (opened or closed).
fn token_deltas(pre: &[TokenBalance], post: &[TokenBalance]) -> Vec<TokenDelta> {
    let mut by_index: BTreeMap<usize, TokenDelta> = BTreeMap::new();

    for b in post {
        by_index.insert(
            b.account_index,
            TokenDelta {
                account_index: b.account_index,
                mint: b.mint.clone(),
                owner: b.owner.clone(),
                delta: raw_amount(b),
                decimals: b.ui_token_amount.decimals,
            },
        );
    }
    for b in pre {
        let entry = by_index.entry(b.account_index).or_insert_with(|| TokenDelta {
            account_index: b.account_index,
            mint: b.mint.clone(),
            owner: b.owner.clone(),
            delta: 0,
            decimals: b.ui_token_amount.decimals,
        });
        entry.delta -= raw_amount(b);
        if entry.owner.is_none() {
            entry.owner = b.owner.clone();
        }
    }

    by_index.into_values().collect()
}

/// SPL fallback: the first wallet-owned token account with a non-zero delta
pub fn classify_token(
    wallet: &str,
    account_keys: &[String],
    pre: &[TokenBalance],
    post: &[TokenBalance],
) -> Option<Classification> {
    let deltas = token_deltas(pre, post);

    let own = deltas
        .iter()
        .find(|d| d.owner.as_deref() == Some(wallet) && d.delta != 0)?;

    let counterparty = deltas
        .iter()
        .filter(|d| d.account_index != own.account_index && d.mint == own.mint)
        .filter(|d| d.owner.as_deref() != Some(wallet))
        .find(|d| d.delta != 0 && (d.delta > 0) != (own.delta > 0))
        .and_then(|d| {
            d.owner
                .clone()
                .or_else(|| account_keys.get(d.account_index).cloned())
        });

    let amount = Decimal::try_from_i128_with_scale(own.delta.abs(), own.decimals).ok()?;
    let flow = if own.delta > 0 {
        Flow::Received { amount, from: counterparty }
    } else {
        Flow::Sent { amount, to: counterparty }
    };

    Some(Classification {
        flow,
        token: token_symbol(&own.mint),
        token_mint: Some(own.mint.clone()),
    })
}

/// Native classification first; token balances only when that yields nothing
pub fn classify(wallet: &str, tx: &RpcTransaction, unit_scale: u64) -> Classification {
    let keys = tx.account_keys();
    let native = match &tx.meta {
        Some(meta) => classify_native(wallet, &keys, &meta.pre_balances, &meta.post_balances, unit_scale),
        None => Flow::Unknown,
    };

    if native != Flow::Unknown {
        return Classification {
            flow: native,
            token: NATIVE_TOKEN.to_string(),
            token_mint: None,
        };
    }

    tx.meta
        .as_ref()
        .and_then(|meta| {
            classify_token(
                wallet,
                &keys,
                meta.pre_token_balances.as_deref().unwrap_or_default(),
                meta.post_token_balances.as_deref().unwrap_or_default(),
            )
        })
        .unwrap_or_else(|| Classification {
            flow: Flow::Unknown,
            token: NATIVE_TOKEN.to_string(),
            token_mint: None,
        })
}
