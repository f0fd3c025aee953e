//! Process-wide one-time initialization.
//!
//! Building the descriptor sampling tables is the only expensive setup
//! the pipeline needs. [`ensure_ready`] performs it once, off the async
//! executor, no matter how many controllers race to start first.

use crackdiff_pipeline::features::orb;
use tokio::sync::OnceCell;

static READY: OnceCell<usize> = OnceCell::const_new();

/// Make sure shared tables exist, building them on first call.
///
/// Concurrent callers all wait for the same initialization. Returns the
/// number of rotated sampling patterns available.
pub async fn ensure_ready() -> usize {
    *READY
        .get_or_init(|| async {
            tracing::debug!("building descriptor tables");
            match tokio::task::spawn_blocking(orb::warm_tables).await {
                Ok(bins) => bins,
                Err(e) => {
                    // The tables are also built lazily on first use.
                    tracing::warn!(error = %e, "table warm-up did not finish");
                    0
                }
            }
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_share_one_initialization() {
        let handles: Vec<_> = (0..8).map(|_| tokio::spawn(ensure_ready())).collect();
        for handle in handles {
            assert_eq!(handle.await.ok(), Some(orb::ANGLE_BINS));
        }
        assert_eq!(ensure_ready().await, orb::ANGLE_BINS);
    }
}
