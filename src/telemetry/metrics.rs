//! Authorization metric names and descriptions

use metrics::{describe_counter, describe_histogram};

pub const DECISIONS_TOTAL: &str = "authz_decisions_total";
pub const DECISION_DURATION_SECONDS: &str = "authz_decision_duration_seconds";
pub const ROLE_EVALUATIONS_TOTAL: &str = "authz_role_evaluations_total";
pub const POLICY_LOADS_TOTAL: &str = "authz_policy_loads_total";

/// Register metric descriptions with whatever recorder is installed
pub fn describe_metrics() {
    describe_counter!(
        DECISIONS_TOTAL,
        "Access checks by outcome (allow/deny/error/cancelled)"
    );
    describe_histogram!(
        DECISION_DURATION_SECONDS,
        "Access check duration in seconds, including every per-role evaluation"
    );
    describe_counter!(
        ROLE_EVALUATIONS_TOTAL,
        "Per-role policy evaluations by result (allow/deny/error/excluded)"
    );
    describe_counter!(
        POLICY_LOADS_TOTAL,
        "Policy snapshot loads by evaluator mode and result"
    );
}
