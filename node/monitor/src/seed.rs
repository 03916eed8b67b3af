use std::path::Path;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::evidence::append;

const SEED_LABEL: &str = "Seed: ";

/// Seed value from a labeled line within the first `window` lines
pub fn find_seed(log: &str, window: usize) -> Option<String> {
    log.lines()
        .take(window)
        .find_map(|line| line.split_once(SEED_LABEL))
        .map(|(_, seed)| seed.trim().to_string())
        .filter(|seed| !seed.is_empty())
}

/// Poll the generator log until it names its seed, noting each miss in `metadata`
pub async fn wait_for_seed(
    log: &Path,
    window: usize,
    attempts: u32,
    delay: Duration,
    metadata: &Path,
) -> Option<String> {
    for attempt in 1..=attempts {
        if let Ok(text) = tokio::fs::read_to_string(log).await {
            if let Some(seed) = find_seed(&text, window) {
                info!("Generator seed: {}", seed);
                return Some(seed);
            }
        }

        if let Err(e) = append(metadata, "waiting for seed\n").await {
            warn!("Failed to write monitor metadata: {}", e);
        }
        if attempt < attempts {
            sleep(delay).await;
        }
    }

    warn!("No seed in {} after {} attempts", log.display(), attempts);
    None
}
