//! Saga data model: the saga header plus its ordered steps and
//! compensations, and the `CreateCompleteCampaign` topology.
//!
//! Grounded in the original implementation's `Saga`/`Paso` entities
//! (`dominio/entidades.py`): steps and compensations are append-only once
//! successful, and saga state is derived from the count of successful
//! steps rather than stored as free-standing truth.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Kinds of forward steps. New topologies add variants here and to
/// [`SagaTopology::new`] — the engine itself never special-cases a kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepKind {
    CreateCampaign,
    ProcessPayment,
    GenerateReport,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::CreateCampaign => "CREATE_CAMPAIGN",
            StepKind::ProcessPayment => "PROCESS_PAYMENT",
            StepKind::GenerateReport => "GENERATE_REPORT",
        }
    }

    pub fn compensation_kind(&self) -> CompensationKind {
        match self {
            StepKind::CreateCampaign => CompensationKind::CancelCampaign,
            StepKind::ProcessPayment => CompensationKind::RefundPayment,
            StepKind::GenerateReport => CompensationKind::CancelReport,
        }
    }
}

impl std::str::FromStr for StepKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATE_CAMPAIGN" => Ok(StepKind::CreateCampaign),
            "PROCESS_PAYMENT" => Ok(StepKind::ProcessPayment),
            "GENERATE_REPORT" => Ok(StepKind::GenerateReport),
            other => Err(format!("unknown step kind: {other}")),
        }
    }
}

/// Kinds of compensating actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompensationKind {
    CancelCampaign,
    RefundPayment,
    CancelReport,
}

impl CompensationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompensationKind::CancelCampaign => "CANCEL_CAMPAIGN",
            CompensationKind::RefundPayment => "REFUND_PAYMENT",
            CompensationKind::CancelReport => "CANCEL_REPORT",
        }
    }
}

impl std::str::FromStr for CompensationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CANCEL_CAMPAIGN" => Ok(CompensationKind::CancelCampaign),
            "REFUND_PAYMENT" => Ok(CompensationKind::RefundPayment),
            "CANCEL_REPORT" => Ok(CompensationKind::CancelReport),
            other => Err(format!("unknown compensation kind: {other}")),
        }
    }
}

/// Saga lifecycle state. `StepOk(n)` means the
/// step at index `n` (0-based) is the most recently completed forward step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SagaState {
    Started,
    StepOk(u32),
    Completed,
    Failed,
    Compensating,
    Compensated,
    TimedOut,
}

impl SagaState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaState::Completed | SagaState::Failed | SagaState::Compensated | SagaState::TimedOut
        )
    }

    /// States that `list-pending` excludes.
    pub fn is_pending(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_string(&self) -> String {
        match self {
            SagaState::Started => "STARTED".to_string(),
            SagaState::StepOk(n) => format!("STEP_OK_{n}"),
            SagaState::Completed => "COMPLETED".to_string(),
            SagaState::Failed => "FAILED".to_string(),
            SagaState::Compensating => "COMPENSATING".to_string(),
            SagaState::Compensated => "COMPENSATED".to_string(),
            SagaState::TimedOut => "TIMED_OUT".to_string(),
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        if let Some(rest) = s.strip_prefix("STEP_OK_") {
            let n: u32 = rest.parse().map_err(|_| format!("bad state: {s}"))?;
            return Ok(SagaState::StepOk(n));
        }
        match s {
            "STARTED" => Ok(SagaState::Started),
            "COMPLETED" => Ok(SagaState::Completed),
            "FAILED" => Ok(SagaState::Failed),
            "COMPENSATING" => Ok(SagaState::Compensating),
            "COMPENSATED" => Ok(SagaState::Compensated),
            "TIMED_OUT" => Ok(SagaState::TimedOut),
            other => Err(format!("unknown saga state: {other}")),
        }
    }
}

/// A single forward step. Invariant enforced by
/// [`Step::mark_success`]/[`Step::mark_failed`]: once `success` is true,
/// neither `success` nor `result` may change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: Uuid,
    pub kind: StepKind,
    pub input: Value,
    pub result: Option<Value>,
    pub success: bool,
    pub error: Option<String>,
    pub executed_at: Option<DateTime<Utc>>,
}

impl Step {
    pub fn pending(kind: StepKind, input: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            input,
            result: None,
            success: false,
            error: None,
            executed_at: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        !self.success && self.error.is_none()
    }

    pub fn mark_success(&mut self, result: Value) {
        if self.success {
            return; // append-only: a second success is a no-op (idempotent handler)
        }
        self.success = true;
        self.result = Some(result);
        self.error = None;
        self.executed_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        if self.success {
            return;
        }
        self.success = false;
        self.error = Some(error.into());
        self.executed_at = Some(Utc::now());
    }
}

/// A compensating action against a previously successful step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Compensation {
    pub id: Uuid,
    pub step_id: Uuid,
    pub kind: CompensationKind,
    pub input: Value,
    pub result: Option<Value>,
    pub success: bool,
    pub error: Option<String>,
    pub executed_at: Option<DateTime<Utc>>,
}

impl Compensation {
    pub fn pending(step_id: Uuid, kind: CompensationKind, input: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            step_id,
            kind,
            input,
            result: None,
            success: false,
            error: None,
            executed_at: None,
        }
    }

    pub fn mark_success(&mut self, result: Value) {
        self.success = true;
        self.result = Some(result);
        self.executed_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.success = false;
        self.error = Some(error.into());
        self.executed_at = Some(Utc::now());
    }
}

/// A saga instance: header plus ordered steps and compensations.
#[derive(Debug, Clone)]
pub struct Saga {
    pub id: Uuid,
    pub saga_type: String,
    pub state: SagaState,
    pub initial_payload: Value,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub timeout_minutes: i64,
    pub version: i64,
    pub steps: Vec<Step>,
    pub compensations: Vec<Compensation>,
}

impl Saga {
    /// Find the first step eligible for execution: `success = false ∧ error = ∅`.
    pub fn first_pending_step(&self) -> Option<&Step> {
        self.steps.iter().find(|s| s.is_pending())
    }

    pub fn first_pending_step_mut(&mut self, id: Uuid) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    pub fn step_mut(&mut self, id: Uuid) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    /// True once every step has succeeded.
    pub fn all_steps_succeeded(&self) -> bool {
        !self.steps.is_empty() && self.steps.iter().all(|s| s.success)
    }

    /// Index (0-based) of a step within the saga's ordered step list.
    pub fn step_index(&self, id: Uuid) -> Option<u32> {
        self.steps.iter().position(|s| s.id == id).map(|i| i as u32)
    }

    /// Steps that succeeded, in reverse execution order — the order the
    /// compensation chain walks them.
    pub fn successful_steps_reverse(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter().rev().filter(|s| s.success)
    }

    /// Whether any step succeeded (a precondition for entering compensation).
    pub fn has_successful_step(&self) -> bool {
        self.steps.iter().any(|s| s.success)
    }

    /// Recompute `state` from the step list. Mirrors the original's
    /// state-derivation from successful-step count, generalized: state only
    /// advances via explicit transition calls below, this just derives the
    /// `StepOk(n)` value for the currently-executing forward path.
    fn refresh_step_ok_state(&mut self) {
        let last_ok = self.steps.iter().rposition(|s| s.success);
        if let Some(idx) = last_ok {
            if !matches!(self.state, SagaState::Compensating | SagaState::Compensated) {
                self.state = SagaState::StepOk(idx as u32);
            }
        }
    }

    pub fn advance_after_step_success(&mut self) {
        self.refresh_step_ok_state();
        if self.all_steps_succeeded() {
            self.state = SagaState::Completed;
            self.ended_at = Some(Utc::now());
        }
    }

    pub fn fail_without_compensation(&mut self, error: impl Into<String>) {
        self.state = SagaState::Failed;
        self.error_message = Some(error.into());
        self.ended_at = Some(Utc::now());
    }

    pub fn enter_compensating(&mut self, error: impl Into<String>) {
        self.state = SagaState::Compensating;
        self.error_message = Some(error.into());
    }

    pub fn mark_compensated(&mut self) {
        self.state = SagaState::Compensated;
        self.ended_at = Some(Utc::now());
    }

    pub fn mark_timed_out(&mut self) {
        self.state = SagaState::TimedOut;
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.started_at);
        age.num_minutes() >= self.timeout_minutes
    }
}

/// The `CreateCompleteCampaign` saga topology: ordered step
/// kinds and their input payloads, built from the three request bodies.
pub struct SagaTopology;

impl SagaTopology {
    pub const NAME: &'static str = "CreateCompleteCampaign";

    /// Construct a new saga with all steps pre-enumerated (`success = false`).
    pub fn new_saga(
        campana: Value,
        pago: Value,
        reporte: Value,
        timeout_minutes: i64,
    ) -> Saga {
        let initial_payload = serde_json::json!({
            "campana": campana,
            "pago": pago,
            "reporte": reporte,
        });

        let steps = vec![
            Step::pending(StepKind::CreateCampaign, campana),
            Step::pending(StepKind::ProcessPayment, pago),
            Step::pending(StepKind::GenerateReport, reporte),
        ];

        Saga {
            id: Uuid::new_v4(),
            saga_type: Self::NAME.to_string(),
            state: SagaState::Started,
            initial_payload,
            started_at: Utc::now(),
            ended_at: None,
            error_message: None,
            timeout_minutes,
            version: 0,
            steps,
            compensations: vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_success_is_append_only() {
        let mut step = Step::pending(StepKind::CreateCampaign, serde_json::json!({}));
        step.mark_success(serde_json::json!({"id": "c-1"}));
        assert!(step.success);

        // A second (redelivered) success attempt must not overwrite the result.
        step.mark_success(serde_json::json!({"id": "c-2"}));
        assert_eq!(step.result, Some(serde_json::json!({"id": "c-1"})));
    }

    #[test]
    fn compensation_kind_mapping() {
        assert_eq!(
            StepKind::ProcessPayment.compensation_kind(),
            CompensationKind::RefundPayment
        );
    }

    #[test]
    fn saga_state_round_trips_through_string() {
        assert_eq!(SagaState::parse("STEP_OK_1").unwrap().as_string(), "STEP_OK_1");
        assert_eq!(SagaState::parse("COMPENSATED").unwrap().as_string(), "COMPENSATED");
    }

    #[test]
    fn new_saga_has_three_pending_steps() {
        let saga = SagaTopology::new_saga(
            serde_json::json!({}),
            serde_json::json!({}),
            serde_json::json!({}),
            30,
        );
        assert_eq!(saga.steps.len(), 3);
        assert!(saga.steps.iter().all(|s| !s.success));
        assert_eq!(saga.first_pending_step().unwrap().kind, StepKind::CreateCampaign);
    }

    #[test]
    fn all_steps_succeeded_requires_non_empty() {
        let saga = Saga {
            id: Uuid::new_v4(),
            saga_type: "x".to_string(),
            state: SagaState::Started,
            initial_payload: serde_json::json!({}),
            started_at: Utc::now(),
            ended_at: None,
            error_message: None,
            timeout_minutes: 1,
            version: 0,
            steps: vec![],
            compensations: vec![],
        };
        assert!(!saga.all_steps_succeeded());
    }
}
