//! The fault-tolerant executor and its building blocks.

mod executor;
pub mod id;
pub mod lock;
pub mod record;
pub mod status;
pub mod step;
pub mod store;

pub use executor::Fate;
pub use id::{
    FateId, FateIdGenerator, ParseFateIdError, RandomIdGenerator, ScriptedIdGenerator,
    SequentialIdGenerator,
};
pub use lock::{LockEntry, LockManager, LockOutcome, LockRequest, LockState, LockType, ResourceId};
pub use record::{Reservation, TxRecord, TxSummary, UndoFailure};
pub use status::TxStatus;
pub use step::{BoxStep, Step, StepContext, StepOutcome, StepRegistry, StoredStep};
pub use store::{CasResult, FateStore, FileRecordStore, ListCursor, MemoryRecordStore, RecordStore};
