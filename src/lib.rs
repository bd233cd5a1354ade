pub mod aggregator;
pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod indexer;
pub mod ingest;
pub mod ledger;
pub mod limiter;
pub mod models;
pub mod notify;
pub mod pager;
pub mod parser;
pub mod resolver;
pub mod retry;
pub mod rpc;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;
