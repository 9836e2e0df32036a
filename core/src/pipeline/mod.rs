pub mod cell;
pub mod session;
pub mod shard;

pub use cell::{CellCommand, CellReport, CellWorker};
pub use session::{Session, SessionReport};
pub use shard::{BinEvent, MessageRecord, ShardCommand, ShardOutput, ShardWorker};
