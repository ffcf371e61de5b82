pub mod decision;
pub mod execution;
pub mod risk;

pub use decision::{run_decision_loop, Decision, DecisionConfig, DecisionEngine, ExitReason};
pub use execution::{
    DripExecutor, ExecutionConfig, ExecutionReport, PlanOutcome, PlanRequest,
};
pub use risk::{evaluate_pass, run_risk_loop, ExitDirective, RiskLoopConfig};
