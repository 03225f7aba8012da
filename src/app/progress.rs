use std::sync::mpsc::Sender;

use crate::model::TransferUpdate;

/// Worker-side byte counter for one attempt. Every change leaves the worker as
/// a `TransferUpdate`, so the UI thread only ever sees a copy of the count.
pub(crate) struct ProgressMonitor {
    tx: Sender<TransferUpdate>,
    transferred: u64,
    started: bool,
}

impl ProgressMonitor {
    pub(crate) fn new(tx: Sender<TransferUpdate>) -> Self {
        Self {
            tx,
            transferred: 0,
            started: false,
        }
    }

    pub(crate) fn init(&mut self, total: u64) {
        debug_assert!(!self.started, "progress monitor reused");
        self.started = true;
        self.transferred = 0;
        let _ = self.tx.send(TransferUpdate::Started { total });
    }

    /// Always returns `true`: a transfer cannot be stopped once it runs.
    pub(crate) fn count(&mut self, delta: u64) -> bool {
        if delta > 0 {
            self.transferred = self.transferred.saturating_add(delta);
            let _ = self.tx.send(TransferUpdate::Progress {
                transferred: self.transferred,
            });
        }
        true
    }

    #[cfg(test)]
    pub(crate) fn transferred(&self) -> u64 {
        self.transferred
    }

    pub(crate) fn end(self) {
        if self.started {
            let _ = self.tx.send(TransferUpdate::Finished);
        }
    }
}

/// UI-side view of the attempt's progress, rebuilt from worker events.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ProgressState {
    pub(crate) total: u64,
    pub(crate) transferred: u64,
}

impl ProgressState {
    pub(crate) fn new(total: u64) -> Self {
        Self {
            total,
            transferred: 0,
        }
    }

    /// Applies a cumulative count and returns the increase since the last one.
    pub(crate) fn advance_to(&mut self, transferred: u64) -> u64 {
        let delta = transferred.saturating_sub(self.transferred);
        self.transferred = self.transferred.max(transferred);
        delta
    }

    pub(crate) fn percent(&self) -> u16 {
        if self.total == 0 {
            return 100;
        }
        ((self.transferred.min(self.total) as f64 / self.total as f64) * 100.0).floor() as u16
    }
}
