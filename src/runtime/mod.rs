pub mod alignment;
pub mod context;
pub mod error;
pub mod result;
pub mod scheduler;
pub mod stream;

pub use alignment::{
    AlignmentError, AlignmentTable, InputShape, InputShaper, OutputShape, OutputShaper,
    ShaperPair, StreamShaper,
};
pub use context::{ExecutionContext, HandoffPolicy, Handoffs, Parameters, Payload};
pub use error::OrchestratorError;
pub use result::{NodeResult, ResultMap, Terminal};
pub use scheduler::Orchestrator;
pub use stream::{chunk_text, StreamHandle};
