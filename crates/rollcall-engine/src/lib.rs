//! rollcall-engine — Attendance verification over a blob store.
//!
//! Builds a roster index per request, matches and annotates every photo on
//! the blocking pool, and stores the annotated images through an upload saga
//! that deletes any blob whose outcome could not be recorded.

pub mod api;
pub mod config;
pub mod engine;
pub mod saga;

pub use api::{
    parse_roster, roster_students, EnrollResponse, ImageReport, RequestError, RosterEntry,
    StoragePath, VerifyRequest, VerifyResponse,
};
pub use config::{ConfigError, EngineConfig};
pub use engine::{AttendanceEngine, ImageError, ReportSlots};
pub use saga::{
    AssembleError, Assembler, OutcomeRecorder, PendingOutcome, RecordError, SagaState,
    StoreFailure, UploadSaga, VerificationOutcome,
};
