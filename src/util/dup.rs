use std::time::Duration;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::trace;


/// Remembers message ids for a limited time so that copies of a message arriving over a second
///  path through the mesh can be dropped. Expired entries are purged lazily while tracking.
pub struct DupSuppressor {
    max_age: Duration,
    seen: FxHashMap<String, Instant>,
    last_purge: Instant,
}

impl DupSuppressor {
    pub fn new(max_age: Duration) -> DupSuppressor {
        DupSuppressor {
            max_age,
            seen: Default::default(),
            last_purge: Instant::now(),
        }
    }

    /// `true` if the id was tracked less than `max_age` ago
    pub fn check(&self, id: &str) -> bool {
        match self.seen.get(id) {
            Some(at) => at.elapsed() < self.max_age,
            None => false,
        }
    }

    pub fn track(&mut self, id: &str) {
        self.purge_expired();
        self.seen.insert(id.to_string(), Instant::now());
    }

    /// returns `true` for a duplicate, and starts tracking the id otherwise
    pub fn check_and_track(&mut self, id: &str) -> bool {
        if self.check(id) {
            return true;
        }
        self.track(id);
        false
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn purge_expired(&mut self) {
        if self.last_purge.elapsed() < self.max_age / 4 {
            return;
        }
        self.last_purge = Instant::now();

        let max_age = self.max_age;
        let before = self.seen.len();
        self.seen.retain(|_, at| at.elapsed() < max_age);
        trace!("purged {} expired message ids", before - self.seen.len());
    }
}


#[cfg(test)]
mod tests {
    use tokio::time::advance;
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_check_and_track() {
        let mut dup = DupSuppressor::new(Duration::from_secs(27));

        assert!(!dup.check("a"));
        assert!(!dup.check_and_track("a"));
        assert!(dup.check("a"));
        assert!(dup.check_and_track("a"));
        assert!(!dup.check("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry() {
        let mut dup = DupSuppressor::new(Duration::from_secs(27));
        dup.track("a");

        advance(Duration::from_secs(26)).await;
        assert!(dup.check("a"));

        advance(Duration::from_secs(1)).await;
        assert!(!dup.check("a"));
        assert!(!dup.check_and_track("a"));
        assert!(dup.check("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge() {
        let mut dup = DupSuppressor::new(Duration::from_secs(20));
        dup.track("a");
        dup.track("b");
        assert_eq!(dup.len(), 2);

        advance(Duration::from_secs(21)).await;
        dup.track("c");
        assert_eq!(dup.len(), 1);
        assert!(dup.check("c"));
    }
}
