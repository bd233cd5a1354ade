use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::debug;

use crate::config::ScanHorizon;
use crate::error::LimiterError;
use crate::ledger::Ledger;
use crate::limiter::RateLimiter;
use crate::models::FetchCursor;
use crate::retry::RetryPolicy;
use crate::rpc::{RpcProvider, SignatureInfo};

/// Why a page reported `has_more = false`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PageEnd {
    /// Empty or short page: no older history upstream
    Exhausted,
    /// Oldest signature of the page is already in the ledger
    CaughtUp,
    /// Signatures older than the configured horizon appeared
    Horizon,
    /// The run's time budget ran out; the scan is paused, not complete
    Budget,
}

impl PageEnd {
    pub fn completes_scan(&self) -> bool {
        !matches!(self, PageEnd::Budget)
    }
}

#[derive(Debug, Clone)]
pub struct SignaturePage {
    pub signatures: Vec<SignatureInfo>, // newest first
    pub next_cursor: FetchCursor,
    pub has_more: bool,
    pub end: Option<PageEnd>,
}

/// Walks signature history backward, one page per call
pub struct SignaturePager {
    provider: Arc<dyn RpcProvider>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    ledger: Arc<Ledger>,
    horizon: ScanHorizon,
}

impl SignaturePager {
    pub fn new(
        provider: Arc<dyn RpcProvider>,
        limiter: Arc<RateLimiter>,
        retry: RetryPolicy,
        ledger: Arc<Ledger>,
        horizon: ScanHorizon,
    ) -> Self {
        Self {
            provider,
            limiter,
            retry,
            ledger,
            horizon,
        }
    }

    pub async fn fetch_page(
        &self,
        address: &str,
        cursor: &FetchCursor,
        page_size: usize,
        deadline: Option<Instant>,
    ) -> Result<SignaturePage, LimiterError> {
        let before = cursor.resume_point().map(str::to_string);
        // a completed scan restarts from the head as a normal refresh
        let rescan = cursor.rescan && !cursor.scan_complete;

        let mut signatures = self
            .retry
            .run("getSignaturesForAddress", || {
                self.limiter.submit(|| {
                    self.provider
                        .get_signatures_for_address(address, page_size, before.as_deref())
                })
            })
            .await?;
        let short_page = signatures.len() < page_size;

        let end = if let Some(pos) = signatures
            .iter()
            .position(|s| self.horizon.excludes(s.block_time))
        {
            signatures.truncate(pos);
            Some(PageEnd::Horizon)
        } else if signatures.is_empty() || short_page {
            Some(PageEnd::Exhausted)
        } else if !rescan
            && signatures
                .iter()
                .rev()
                .find(|s| !s.failed())
                .is_some_and(|s| self.ledger.has(&s.signature))
        {
            // failed entries never enter the ledger, so look past them
            Some(PageEnd::CaughtUp)
        } else if deadline.is_some_and(|d| Instant::now() >= d) {
            Some(PageEnd::Budget)
        } else {
            None
        };

        let scan_complete = end.is_some_and(|e| e.completes_scan());
        let next_cursor = FetchCursor {
            before_signature: signatures
                .last()
                .map(|s| s.signature.clone())
                .or(before),
            scan_complete,
            rescan: rescan && !scan_complete,
            last_fetch_timestamp: Some(Utc::now()),
        };

        debug!(
            "Fetched {} signatures (end: {:?}, next before: {:?})",
            signatures.len(),
            end,
            next_cursor.before_signature
        );

        Ok(SignaturePage {
            signatures,
            next_cursor,
            has_more: end.is_none(),
            end,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RpcError;
    use crate::ledger::tests::sample_tx;
    use crate::limiter::LimiterSettings;
    use crate::models::Flow;
    use crate::testing::MockProvider;
    use std::time::Duration;

    fn pager(provider: Arc<MockProvider>, ledger: Arc<Ledger>, horizon: ScanHorizon) -> SignaturePager {
        SignaturePager::new(
            provider,
            Arc::new(RateLimiter::new(LimiterSettings::default())),
            RetryPolicy::default(),
            ledger,
            horizon,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn full_page_has_more_and_points_at_oldest() {
        let provider = Arc::new(MockProvider::with_history(5));
        let p = pager(provider.clone(), Arc::new(Ledger::new()), ScanHorizon::Full);

        let page = p
            .fetch_page("Wallet", &FetchCursor::default(), 3, None)
            .await
            .unwrap();

        assert!(page.has_more);
        assert_eq!(page.end, None);
        assert_eq!(page.signatures.len(), 3);
        assert_eq!(page.next_cursor.before_signature.as_deref(), Some("sig3"));
        assert!(!page.next_cursor.scan_complete);

        let next = p.fetch_page("Wallet", &page.next_cursor, 3, None).await.unwrap();
        assert_eq!(next.end, Some(PageEnd::Exhausted));
        assert!(next.next_cursor.scan_complete);
        assert_eq!(provider.signature_requests(), vec![None, Some("sig3".to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_page_keeps_previous_anchor() {
        let provider = Arc::new(MockProvider::with_history(3));
        let p = pager(provider, Arc::new(Ledger::new()), ScanHorizon::Full);

        let cursor = FetchCursor {
            before_signature: Some("sig3".into()),
            ..FetchCursor::default()
        };
        let page = p.fetch_page("Wallet", &cursor, 3, None).await.unwrap();

        assert!(page.signatures.is_empty());
        assert_eq!(page.end, Some(PageEnd::Exhausted));
        assert_eq!(page.next_cursor.before_signature.as_deref(), Some("sig3"));
    }

    #[tokio::test(start_paused = true)]
    async fn stops_when_oldest_signature_is_known() {
        let provider = Arc::new(MockProvider::with_history(6));
        let ledger = Arc::new(Ledger::new());
        ledger.upsert(sample_tx("sig3", 3, Flow::Unknown));
        let p = pager(provider, ledger, ScanHorizon::Full);

        let page = p
            .fetch_page("Wallet", &FetchCursor::default(), 3, None)
            .await
            .unwrap();
        assert_eq!(page.end, Some(PageEnd::CaughtUp));
        assert!(page.next_cursor.scan_complete);

        // a rescan ignores known history
        let page = p
            .fetch_page("Wallet", &FetchCursor::full_rescan(), 3, None)
            .await
            .unwrap();
        assert!(page.has_more);
        assert!(page.next_cursor.rescan);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_oldest_entry_does_not_hide_known_history() {
        let provider = Arc::new(MockProvider::with_history(6).failed_on_chain("sig3"));
        let ledger = Arc::new(Ledger::new());
        ledger.upsert(sample_tx("sig2", 2, Flow::Unknown));
        let p = pager(provider, ledger, ScanHorizon::Full);

        let page = p
            .fetch_page("Wallet", &FetchCursor::default(), 3, None)
            .await
            .unwrap();
        assert_eq!(page.end, Some(PageEnd::CaughtUp));
        assert!(!page.has_more);
    }

    #[tokio::test(start_paused = true)]
    async fn horizon_truncates_and_completes() {
        // block times descend from the newest signature
        let provider = Arc::new(MockProvider::with_history(5));
        let oldest_kept = provider.history()[1].block_time.unwrap();
        let horizon = ScanHorizon::Since(chrono::DateTime::from_timestamp(oldest_kept, 0).unwrap());
        let p = pager(provider, Arc::new(Ledger::new()), horizon);

        let page = p
            .fetch_page("Wallet", &FetchCursor::default(), 5, None)
            .await
            .unwrap();
        assert_eq!(page.signatures.len(), 2);
        assert_eq!(page.end, Some(PageEnd::Horizon));
        assert!(page.next_cursor.scan_complete);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_deadline_pauses_without_completing() {
        let provider = Arc::new(MockProvider::with_history(10));
        let p = pager(provider, Arc::new(Ledger::new()), ScanHorizon::Full);

        let deadline = Instant::now();
        tokio::time::advance(Duration::from_millis(1)).await;
        let page = p
            .fetch_page("Wallet", &FetchCursor::default(), 3, Some(deadline))
            .await
            .unwrap();

        assert!(!page.has_more);
        assert_eq!(page.end, Some(PageEnd::Budget));
        assert!(!page.next_cursor.scan_complete);
    }

    #[tokio::test(start_paused = true)]
    async fn page_errors_are_retried_then_surface() {
        let provider = Arc::new(MockProvider::with_history(3));
        provider.fail_pages(vec![RpcError::Transient("reset".into())]);
        let p = pager(provider.clone(), Arc::new(Ledger::new()), ScanHorizon::Full);

        let page = p
            .fetch_page("Wallet", &FetchCursor::default(), 3, None)
            .await
            .unwrap();
        assert_eq!(page.signatures.len(), 3);

        provider.fail_pages(vec![RpcError::Terminal("bad address".into())]);
        let err = p
            .fetch_page("Wallet", &FetchCursor::default(), 3, None)
            .await
            .unwrap_err();
        assert_eq!(err, LimiterError::Rpc(RpcError::Terminal("bad address".into())));
    }
}
