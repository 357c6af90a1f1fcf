use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use super::levels::LevelSet;
use crate::storage::manifest::table_name;
use crate::storage::metrics::EngineMetrics;
use crate::storage::sstable::TableHandle;
use crate::types::Result;

/// Result of one flush pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    /// Frozen memtables drained.
    pub memtables: usize,
    /// Sorted tables written (empty memtables produce none).
    pub tables: usize,
    /// Records written across those tables.
    pub entries: usize,
}

/// Persists every frozen memtable as its own sorted table.
pub struct FlushingManager {
    levels: Arc<LevelSet>,
    metrics: Arc<dyn EngineMetrics>,
    active: AtomicBool,
}

impl FlushingManager {
    pub(crate) fn new(levels: Arc<LevelSet>, metrics: Arc<dyn EngineMetrics>) -> Self {
        Self {
            levels,
            metrics,
            active: AtomicBool::new(true),
        }
    }

    /// Drains the frozen memtables present when the pass starts, oldest
    /// first. A no-op once [`FlushingManager::shutdown`] ran.
    pub fn run(&self) -> Result<FlushOutcome> {
        if !self.is_active() {
            return Ok(FlushOutcome::default());
        }
        let _maintenance = self.levels.maintenance();
        let frozen = self.levels.frozen();
        if frozen.is_empty() {
            return Ok(FlushOutcome::default());
        }
        let store = self.levels.store();
        let mut outcome = FlushOutcome {
            memtables: frozen.len(),
            ..FlushOutcome::default()
        };
        let mut written = Vec::new();
        for memtable in &frozen {
            let table = memtable.table.dump();
            if table.is_empty() {
                continue;
            }
            let name = table_name(self.levels.allocate());
            table.write_to(store.as_ref(), &name)?;
            outcome.tables += 1;
            outcome.entries += table.len();
            written.push(Arc::new(TableHandle::new(
                Arc::clone(store),
                name,
                table.len(),
            )));
        }
        self.levels.install(written, false, &frozen)?;
        self.metrics.flush_completed(outcome.tables);
        info!(
            memtables = outcome.memtables,
            tables = outcome.tables,
            entries = outcome.entries,
            "flush.complete"
        );
        Ok(outcome)
    }

    /// Makes later [`FlushingManager::run`] calls no-ops.
    pub fn shutdown(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            debug!("flush.shutdown");
        }
    }

    /// False once [`FlushingManager::shutdown`] ran.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}
