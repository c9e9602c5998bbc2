//! Phase orchestration: conservative phase, main phase, packaging.

pub mod packaging;
pub mod pipeline;
pub mod state;

pub use packaging::{CommandPackager, Packager};
pub use pipeline::{
    CONSERVATIVE_PHASE, MAIN_PHASE, PACKAGING_STEP, PhaseOrchestrator, PipelineSummary,
    phase_specs,
};
pub use state::{PhaseStatus, StateEntry, StateManager};
