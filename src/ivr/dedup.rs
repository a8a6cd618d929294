//! Suppression of retransmitted IVR events
//!
//! The system under test repeats each IVR event a few times with the same RTP
//! timestamp. Both the templater and the replaying channel run the events they
//! see through an [`IvrDedup`] so the repeats are counted once.

/// How many repeats of one event are absorbed before it counts as new again
pub const IVR_EVENT_DUP_TIMES: u32 = 8;

#[derive(Debug, Clone)]
pub struct IvrDedup {
    last_timestamp: i64,
    last_content: String,
    ignored: u32,
    bound: u32,
}

impl Default for IvrDedup {
    fn default() -> Self {
        Self::with_bound(IVR_EVENT_DUP_TIMES)
    }
}

impl IvrDedup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bound(bound: u32) -> Self {
        Self {
            last_timestamp: -1,
            last_content: String::new(),
            ignored: 0,
            bound,
        }
    }

    /// Forgets the last event, used when a new dialog starts.
    pub fn reset(&mut self) {
        self.last_timestamp = -1;
        self.last_content.clear();
        self.ignored = 0;
    }

    /// Returns true when the event repeats the previous one and must be dropped.
    ///
    /// A zero RTP timestamp is never treated as a repeat.
    pub fn is_duplicate(&mut self, timestamp: u32, content: &str) -> bool {
        let timestamp = i64::from(timestamp);
        if timestamp != 0
            && content == self.last_content
            && timestamp <= self.last_timestamp
            && self.ignored < self.bound
        {
            self.ignored += 1;
            return true;
        }

        self.last_timestamp = timestamp;
        self.last_content.clear();
        self.last_content.push_str(content);
        self.ignored = 0;
        false
    }

    pub fn ignored(&self) -> u32 {
        self.ignored
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suppresses_bounded_repeats() {
        let mut dedup = IvrDedup::new();
        assert!(!dedup.is_duplicate(4000, "p:welcome"));

        for _ in 0..IVR_EVENT_DUP_TIMES {
            assert!(dedup.is_duplicate(4000, "p:welcome"));
        }
        assert_eq!(dedup.ignored(), IVR_EVENT_DUP_TIMES);

        // The ninth repeat is accepted as a new event
        assert!(!dedup.is_duplicate(4000, "p:welcome"));
        assert_eq!(dedup.ignored(), 0);
        assert!(dedup.is_duplicate(4000, "p:welcome"));
    }

    #[test]
    fn test_advancing_timestamp_is_new() {
        let mut dedup = IvrDedup::new();
        assert!(!dedup.is_duplicate(4000, "p:welcome"));
        assert!(!dedup.is_duplicate(4160, "p:welcome"));
        assert!(dedup.is_duplicate(4100, "p:welcome"));
    }

    #[test]
    fn test_different_content_is_new() {
        let mut dedup = IvrDedup::new();
        assert!(!dedup.is_duplicate(4000, "p:welcome"));
        assert!(!dedup.is_duplicate(4000, "p:goodbye"));
    }

    #[test]
    fn test_zero_timestamp_never_duplicate() {
        let mut dedup = IvrDedup::new();
        assert!(!dedup.is_duplicate(0, "r:file"));
        assert!(!dedup.is_duplicate(0, "r:file"));
    }

    #[test]
    fn test_reset() {
        let mut dedup = IvrDedup::new();
        assert!(!dedup.is_duplicate(10, "s:x"));
        dedup.reset();
        assert!(!dedup.is_duplicate(10, "s:x"));
    }
}
