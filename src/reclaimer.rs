use log::debug;

/// Deferred release of replaced pages.
///
/// A page superseded while building revision `r` stays readable for every
/// transaction pinned below `r`. It is handed back to the free list once
/// the pin (the lowest revision any live reader holds) has reached `r`.
/// The release pass runs at commit, gated by a threshold so reclamation
/// work per commit stays bounded.
pub(crate) struct Reclaimer {
    threshold: usize,
    commits_since_pass: usize,
    // (superseding revision, replaced page offsets)
    pending: Vec<(u64, Vec<u64>)>,
}

impl Reclaimer {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold: threshold.max(1),
            commits_since_pass: 0,
            pending: Vec::new(),
        }
    }

    pub fn enqueue(&mut self, revision: u64, offsets: Vec<u64>) {
        if !offsets.is_empty() {
            self.pending.push((revision, offsets));
        }
    }

    /// Count one commit; true when a release pass is due.
    pub fn note_commit(&mut self) -> bool {
        self.commits_since_pass += 1;
        if self.commits_since_pass >= self.threshold {
            self.commits_since_pass = 0;
            true
        } else {
            false
        }
    }

    /// Drain every batch whose superseding revision the pin has reached.
    pub fn collect_releasable(&mut self, pin: u64) -> Vec<u64> {
        let mut released = Vec::new();
        self.pending.retain(|(revision, offsets)| {
            if *revision <= pin {
                released.extend(offsets.iter().copied());
                false
            } else {
                true
            }
        });
        if !released.is_empty() {
            debug!(
                "reclaimer releasing {} pages at pin {}",
                released.len(),
                pin
            );
        }
        released
    }

    pub fn pending_pages(&self) -> usize {
        self.pending.iter().map(|(_, offsets)| offsets.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_gates_passes() {
        let mut reclaimer = Reclaimer::new(3);
        assert!(!reclaimer.note_commit());
        assert!(!reclaimer.note_commit());
        assert!(reclaimer.note_commit());
        assert!(!reclaimer.note_commit());
    }

    #[test]
    fn test_pin_holds_back_release() {
        let mut reclaimer = Reclaimer::new(1);
        reclaimer.enqueue(5, vec![0x200, 0x400]);
        reclaimer.enqueue(7, vec![0x600]);

        assert_eq!(reclaimer.collect_releasable(4), Vec::<u64>::new());
        assert_eq!(reclaimer.collect_releasable(5), vec![0x200, 0x400]);
        assert_eq!(reclaimer.pending_pages(), 1);
        assert_eq!(reclaimer.collect_releasable(9), vec![0x600]);
        assert_eq!(reclaimer.pending_pages(), 0);
    }
}
