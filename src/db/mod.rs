//! Engine orchestration: configuration, maintenance managers, recovery and
//! the public [`StorageEngine`].

mod compaction;
mod config;
mod engine;
mod flush;
mod levels;
mod recovery;


pub use compaction::{CompactionManager, CompactionOutcome};
pub use config::EngineConfig;
pub use engine::{sanitize_prefix, EngineBuilder, EngineStats, StorageEngine, MAX_PREFIX_LEN};
pub use flush::{FlushOutcome, FlushingManager};
