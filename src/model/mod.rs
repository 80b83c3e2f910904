mod call_chain;
mod dataflow;
mod finding;
mod signals;

pub use call_chain::{CallChain, CallChainNode, CallChainNodeKind};
pub use dataflow::{DataFlowChain, DataFlowNode, DataFlowNodeKind, DataFlowPattern};
pub use finding::{Finding, ScanDiagnostic, ScanOutcome, Severity};
pub use signals::{MethodSignals, TypeSignals};
