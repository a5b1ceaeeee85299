//! Root-cause diagnosis.
//!
//! Turns a classified failure plus whatever execution context is available
//! into a structured [`Diagnosis`]: a root-cause statement, an impact estimate
//! and concrete, ordered recovery steps.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::taxonomy::{ClassifiedError, FailureCategory, FailureTaxonomy, RecoveryStrategy};

/// Failures of the same component at which impact is considered systemic.
const SYSTEMIC_FAILURE_THRESHOLD: u32 = 3;

/// Retries after which a failure is considered persistent.
const PERSISTENT_RETRY_COUNT: u32 = 3;

/// Execution context available when diagnosing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosisContext {
    /// The job or worker identity that failed.
    pub component: Option<String>,
    /// The external resource involved, if known.
    pub resource: Option<String>,
    /// Retries already spent on this failure.
    pub retry_count: u32,
    /// Recent failures of the same component.
    pub recent_failures: u32,
    /// Jobs that depend on the failed component.
    pub dependents: usize,
    /// Whether the component's circuit is open.
    pub circuit_open: bool,
}

impl DiagnosisContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn component(mut self, component: impl Into<String>) -> Self {
        self.component = Some(component.into());
        self
    }

    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn recent_failures(mut self, recent_failures: u32) -> Self {
        self.recent_failures = recent_failures;
        self
    }

    pub fn dependents(mut self, dependents: usize) -> Self {
        self.dependents = dependents;
        self
    }

    pub fn circuit_open(mut self, circuit_open: bool) -> Self {
        self.circuit_open = circuit_open;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImpactScope {
    /// Confined to the failing component.
    Local,
    /// Spreads beyond the failing component.
    Systemic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    fn raised(self) -> Self {
        match self {
            Severity::Low => Severity::Medium,
            Severity::Medium => Severity::High,
            Severity::High | Severity::Critical => Severity::Critical,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImpactAssessment {
    pub scope: ImpactScope,
    pub severity: Severity,
    pub summary: String,
}

/// One concrete recovery action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryStep {
    pub action: RecoveryStrategy,
    pub description: String,
    pub rationale: String,
}

/// Immutable diagnosis of a failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnosis {
    /// Source error message.
    pub error: String,
    pub category: FailureCategory,
    pub confidence: f64,
    pub root_cause: String,
    pub impact: ImpactAssessment,
    pub steps: Vec<RecoveryStep>,
    pub context: DiagnosisContext,
    pub diagnosed_at: DateTime<Utc>,
}

impl Diagnosis {
    /// The first recovery action to try.
    pub fn primary_action(&self) -> Option<RecoveryStrategy> {
        self.steps.first().map(|s| s.action)
    }
}

/// Produces diagnoses from failures.
#[derive(Debug, Clone, Default)]
pub struct Diagnoser {
    taxonomy: FailureTaxonomy,
}

impl Diagnoser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_taxonomy(taxonomy: FailureTaxonomy) -> Self {
        Self { taxonomy }
    }

    pub fn diagnose(
        &self,
        error: &(dyn std::error::Error + 'static),
        context: Option<&DiagnosisContext>,
    ) -> Diagnosis {
        self.diagnose_classified(self.taxonomy.classify(error), context)
    }

    pub fn diagnose_message(&self, message: &str, context: Option<&DiagnosisContext>) -> Diagnosis {
        self.diagnose_classified(self.taxonomy.classify_message(message), context)
    }

    /// Diagnose a failure that has already been classified.
    pub fn diagnose_classified(
        &self,
        classified: ClassifiedError,
        context: Option<&DiagnosisContext>,
    ) -> Diagnosis {
        let context = context.cloned().unwrap_or_default();
        let root_cause = root_cause(&classified, &context);
        let impact = assess_impact(classified.category, &context);
        let steps = recovery_steps(&classified, &context, impact.scope);

        info!(
            category = %classified.category,
            severity = %impact.severity,
            scope = ?impact.scope,
            component = context.component.as_deref().unwrap_or("-"),
            steps = steps.len(),
            "diagnosed failure"
        );

        Diagnosis {
            error: classified.message,
            category: classified.category,
            confidence: classified.confidence,
            root_cause,
            impact,
            steps,
            context,
            diagnosed_at: Utc::now(),
        }
    }
}

fn root_cause(classified: &ClassifiedError, ctx: &DiagnosisContext) -> String {
    let target = ctx
        .resource
        .as_deref()
        .or(ctx.component.as_deref())
        .unwrap_or("the job");

    let mut cause = match classified.category {
        FailureCategory::Config => format!("Invalid or missing configuration for {target}"),
        FailureCategory::Resource => format!("Resource exhaustion while running {target}"),
        FailureCategory::Dependency => {
            format!("A dependency of {target} is unreachable or failing")
        }
        FailureCategory::Logic => format!("Defect in the logic of {target}"),
        FailureCategory::Timeout => format!("{target} exceeded its time budget"),
        FailureCategory::Permission => format!("Insufficient permissions to access {target}"),
        FailureCategory::Unknown => format!("Unrecognized failure in {target}"),
    };

    if !classified.matched.is_empty() {
        cause.push_str(&format!(" (indicators: {})", classified.matched.join(", ")));
    }
    if ctx.retry_count > 0 {
        cause.push_str(&format!("; persisted across {} retries", ctx.retry_count));
    }
    cause
}

fn base_severity(category: FailureCategory) -> Severity {
    match category {
        FailureCategory::Logic | FailureCategory::Permission => Severity::High,
        FailureCategory::Config
        | FailureCategory::Resource
        | FailureCategory::Dependency
        | FailureCategory::Unknown => Severity::Medium,
        FailureCategory::Timeout => Severity::Low,
    }
}

fn assess_impact(category: FailureCategory, ctx: &DiagnosisContext) -> ImpactAssessment {
    let systemic = ctx.dependents > 0
        || ctx.recent_failures >= SYSTEMIC_FAILURE_THRESHOLD
        || ctx.circuit_open;
    let scope = if systemic {
        ImpactScope::Systemic
    } else {
        ImpactScope::Local
    };

    let mut severity = base_severity(category);
    if ctx.retry_count >= PERSISTENT_RETRY_COUNT && severity == Severity::Low {
        severity = Severity::Medium;
    }
    if systemic {
        severity = severity.raised();
    }

    let component = ctx.component.as_deref().unwrap_or("the job");
    let summary = match scope {
        ImpactScope::Local => format!("Failure is confined to {component}"),
        ImpactScope::Systemic => {
            let mut reasons = Vec::new();
            if ctx.dependents > 0 {
                reasons.push(format!("{} dependent job(s) are blocked", ctx.dependents));
            }
            if ctx.recent_failures >= SYSTEMIC_FAILURE_THRESHOLD {
                reasons.push(format!("{} recent failures", ctx.recent_failures));
            }
            if ctx.circuit_open {
                reasons.push("circuit is open".to_string());
            }
            format!(
                "Failure of {component} spreads beyond it: {}",
                reasons.join(", ")
            )
        }
    };

    ImpactAssessment {
        scope,
        severity,
        summary,
    }
}

fn recovery_steps(
    classified: &ClassifiedError,
    ctx: &DiagnosisContext,
    scope: ImpactScope,
) -> Vec<RecoveryStep> {
    let mut steps: Vec<RecoveryStep> = classified
        .strategies
        .iter()
        .map(|&action| describe_step(action, classified.category, ctx))
        .collect();

    if scope == ImpactScope::Systemic
        && !classified.strategies.contains(&RecoveryStrategy::Escalate)
    {
        steps.push(RecoveryStep {
            action: RecoveryStrategy::Escalate,
            description: "Notify an operator".to_string(),
            rationale: "Impact reaches beyond the failing component".to_string(),
        });
    }
    steps
}

fn describe_step(
    action: RecoveryStrategy,
    category: FailureCategory,
    ctx: &DiagnosisContext,
) -> RecoveryStep {
    let target = ctx
        .resource
        .as_deref()
        .or(ctx.component.as_deref())
        .unwrap_or("the job");

    let (description, rationale) = match action {
        RecoveryStrategy::Retry if ctx.retry_count >= PERSISTENT_RETRY_COUNT => (
            format!("Retry {target} with a longer backoff"),
            format!("{} retries already failed at the current pace", ctx.retry_count),
        ),
        RecoveryStrategy::Retry => (
            format!("Retry {target} with exponential backoff"),
            format!("{category} failures are often transient"),
        ),
        RecoveryStrategy::AdjustConfig => match category {
            FailureCategory::Resource => (
                format!("Lower concurrency or raise limits for {target}"),
                "The job exhausted a bounded resource".to_string(),
            ),
            _ => (
                format!("Correct the configuration of {target}"),
                "Rerunning with the same settings will fail the same way".to_string(),
            ),
        },
        RecoveryStrategy::Fallback => (
            format!("Switch {target} to a fallback provider or cached data"),
            "The primary dependency cannot be relied on right now".to_string(),
        ),
        RecoveryStrategy::Escalate => (
            "Notify an operator".to_string(),
            format!("{category} failures need human judgement"),
        ),
        RecoveryStrategy::Skip => (
            format!("Skip {target} and continue with the remaining work"),
            "Retrying deterministic logic errors cannot succeed".to_string(),
        ),
        RecoveryStrategy::Restart => (
            format!("Restart the worker running {target}"),
            "A restart releases leaked resources".to_string(),
        ),
    };

    RecoveryStep {
        action,
        description,
        rationale,
    }
}
