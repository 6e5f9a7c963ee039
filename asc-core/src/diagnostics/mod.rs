//! Self-healing diagnostics
//!
//! [`Diagnostics::run_diagnostics`] scans the configuration, the `.env`
//! file and the state tree for known problems and returns a
//! [`DiagnosticReport`]. [`Diagnostics::apply_fixes`] repairs every issue
//! whose kind has an automatic remediation. Fixes are idempotent: running
//! diagnostics again after fixing finds none of the fixed issues.

mod checks;
mod fixes;
pub mod probe;

use crate::state::{StateLayout, StateSubdir};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::Span;

pub use probe::{HttpProbe, NetworkProbe, PidProbe, SignalProbe};

/// Area of the system an issue belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Configuration,
    State,
    Permissions,
    Resources,
    Network,
    Agent,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Category::Configuration => "configuration",
            Category::State => "state",
            Category::Permissions => "permissions",
            Category::Resources => "resources",
            Category::Network => "network",
            Category::Agent => "agent",
        };
        f.write_str(s)
    }
}

/// Issue severity, most severe first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Info,
}

impl Severity {
    pub const ALL: [Severity; 5] = [
        Severity::Critical,
        Severity::High,
        Severity::Medium,
        Severity::Low,
        Severity::Info,
    ];

    fn icon(&self) -> &'static str {
        match self {
            Severity::Critical => "✗",
            Severity::High => "⚠",
            Severity::Medium => "!",
            Severity::Low => "·",
            Severity::Info => "ℹ",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
            Severity::Info => "info",
        };
        f.write_str(s)
    }
}

/// What went wrong, with the parameters its fix needs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IssueKind {
    ConfigMissing,
    ConfigInvalid,
    EnvMissing,
    EnvPermissions,
    StateRootNotDir,
    StateRootNotWritable,
    MissingSubdir { subdir: StateSubdir },
    /// Process record that does not parse; `file` is relative to the pid directory
    CorruptedRecord { file: String },
    /// Process record whose process is gone
    OrphanedRecord { agent: String, file: String },
    LogsOversized,
    DiskUsageHigh,
    BinaryMissing { binary: String },
    CoordinatorUnreachable { url: String },
    AgentNoCommand { agent: String },
    AgentInvalidModel { agent: String, model: String },
    AgentNoPhases { agent: String },
}

impl IssueKind {
    /// Stable identifier for display and JSON output
    pub fn id(&self) -> String {
        match self {
            IssueKind::ConfigMissing => "config-missing".into(),
            IssueKind::ConfigInvalid => "config-invalid".into(),
            IssueKind::EnvMissing => "env-missing".into(),
            IssueKind::EnvPermissions => "env-permissions".into(),
            IssueKind::StateRootNotDir => "state-root-not-dir".into(),
            IssueKind::StateRootNotWritable => "state-root-not-writable".into(),
            IssueKind::MissingSubdir { subdir } => format!("missing-dir-{subdir}"),
            IssueKind::CorruptedRecord { file } => format!("corrupted-record-{file}"),
            IssueKind::OrphanedRecord { agent, .. } => format!("orphaned-record-{agent}"),
            IssueKind::LogsOversized => "logs-oversized".into(),
            IssueKind::DiskUsageHigh => "disk-usage-high".into(),
            IssueKind::BinaryMissing { binary } => format!("binary-missing-{binary}"),
            IssueKind::CoordinatorUnreachable { .. } => "coordinator-unreachable".into(),
            IssueKind::AgentNoCommand { agent } => format!("agent-no-command-{agent}"),
            IssueKind::AgentInvalidModel { agent, .. } => format!("agent-invalid-model-{agent}"),
            IssueKind::AgentNoPhases { agent } => format!("agent-no-phases-{agent}"),
        }
    }

    pub fn category(&self) -> Category {
        match self {
            IssueKind::ConfigMissing
            | IssueKind::ConfigInvalid
            | IssueKind::EnvMissing
            | IssueKind::BinaryMissing { .. } => Category::Configuration,
            IssueKind::EnvPermissions
            | IssueKind::StateRootNotDir
            | IssueKind::StateRootNotWritable
            | IssueKind::MissingSubdir { .. } => Category::Permissions,
            IssueKind::CorruptedRecord { .. } | IssueKind::OrphanedRecord { .. } => {
                Category::State
            }
            IssueKind::LogsOversized | IssueKind::DiskUsageHigh => Category::Resources,
            IssueKind::CoordinatorUnreachable { .. } => Category::Network,
            IssueKind::AgentNoCommand { .. }
            | IssueKind::AgentInvalidModel { .. }
            | IssueKind::AgentNoPhases { .. } => Category::Agent,
        }
    }

    /// Whether [`Diagnostics::apply_fixes`] has a remediation for this kind
    pub fn is_fixable(&self) -> bool {
        matches!(
            self,
            IssueKind::ConfigMissing
                | IssueKind::EnvPermissions
                | IssueKind::StateRootNotDir
                | IssueKind::StateRootNotWritable
                | IssueKind::MissingSubdir { .. }
                | IssueKind::CorruptedRecord { .. }
                | IssueKind::OrphanedRecord { .. }
                | IssueKind::LogsOversized
        )
    }
}

/// A detected problem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    pub kind: IssueKind,
    pub category: Category,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    pub impact: String,
    pub remediation: String,
    pub auto_fixable: bool,
    pub detected_at: DateTime<Utc>,
}

impl Issue {
    /// Build an issue; id, category and fixability follow from `kind`.
    pub fn new(
        kind: IssueKind,
        severity: Severity,
        title: impl Into<String>,
        description: impl Into<String>,
        impact: impl Into<String>,
        remediation: impl Into<String>,
    ) -> Self {
        Self {
            id: kind.id(),
            category: kind.category(),
            auto_fixable: kind.is_fixable(),
            kind,
            severity,
            title: title.into(),
            description: description.into(),
            impact: impact.into(),
            remediation: remediation.into(),
            detected_at: Utc::now(),
        }
    }
}

/// Outcome of one attempted fix
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixResult {
    pub issue_id: String,
    pub success: bool,
    pub message: String,
    pub applied_at: DateTime<Utc>,
}

/// Result of one diagnostics run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticReport {
    pub run_at: DateTime<Utc>,
    pub issues: Vec<Issue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fixes_applied: Vec<FixResult>,
    pub health_summary: String,
}

impl DiagnosticReport {
    /// Build a report, deriving the health summary from `issues`.
    pub fn new(issues: Vec<Issue>) -> Self {
        Self {
            run_at: Utc::now(),
            health_summary: health_summary(&issues),
            issues,
            fixes_applied: Vec::new(),
        }
    }

    pub fn has_critical_issues(&self) -> bool {
        self.issues.iter().any(|i| i.severity == Severity::Critical)
    }

    /// Issues of a given kind family, for callers that match on kind
    pub fn find(&self, pred: impl Fn(&IssueKind) -> bool) -> Vec<&Issue> {
        self.issues.iter().filter(|i| pred(&i.kind)).collect()
    }

    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Human-readable report grouped by severity.
    pub fn format(&self, verbose: bool) -> String {
        use std::fmt::Write;

        let mut out = String::new();
        let _ = writeln!(out, "\nASC DOCTOR - DIAGNOSTIC REPORT\n");
        let _ = writeln!(out, "Run at: {}", self.run_at.format("%Y-%m-%d %H:%M:%S"));
        let _ = writeln!(out, "Status: {}\n", self.health_summary);

        if self.issues.is_empty() {
            out.push_str("✓ No issues detected\n");
            return out;
        }

        for severity in Severity::ALL {
            let issues: Vec<_> = self.issues.iter().filter(|i| i.severity == severity).collect();
            if issues.is_empty() {
                continue;
            }

            let label = severity.to_string().to_uppercase();
            let _ = writeln!(out, "─── {label} SEVERITY ({}) ───\n", issues.len());
            for (idx, issue) in issues.iter().enumerate() {
                let _ = writeln!(out, "{} {}", severity.icon(), issue.title);
                let _ = writeln!(out, "  Category: {}", issue.category);
                if verbose {
                    let _ = writeln!(out, "  Description: {}", issue.description);
                    let _ = writeln!(out, "  Impact: {}", issue.impact);
                }
                let _ = writeln!(out, "  Remediation: {}", issue.remediation);
                if issue.auto_fixable {
                    out.push_str("  ✓ Auto-fixable with --fix flag\n");
                }
                if idx + 1 < issues.len() {
                    out.push('\n');
                }
            }
            out.push('\n');
        }

        if !self.fixes_applied.is_empty() {
            out.push_str("─── FIXES APPLIED ───\n\n");
            for fix in &self.fixes_applied {
                let icon = if fix.success { "✓" } else { "✗" };
                let _ = writeln!(out, "{icon} {}: {}", fix.issue_id, fix.message);
            }
            out.push('\n');
        }

        out
    }
}

/// Summarize issue counts, most severe first.
pub fn health_summary(issues: &[Issue]) -> String {
    if issues.is_empty() {
        return "✓ All checks passed - system is healthy".to_string();
    }

    let parts: Vec<String> = [Severity::Critical, Severity::High, Severity::Medium, Severity::Low]
        .into_iter()
        .filter_map(|severity| {
            let count = issues.iter().filter(|i| i.severity == severity).count();
            (count > 0).then(|| format!("{count} {severity}"))
        })
        .collect();

    format!("Found {} issue(s): {}", issues.len(), parts.join(", "))
}

/// Inputs and thresholds for a diagnostics run
#[derive(Debug, Clone)]
pub struct DiagnosticsConfig {
    pub config_path: PathBuf,
    pub env_path: PathBuf,
    pub layout: StateLayout,
    /// Log directory size above which logs count as oversized
    pub log_size_limit: u64,
    /// Log files older than this are removed by the oversized-logs fix
    pub log_retention: Duration,
    /// State tree size above which disk usage is flagged
    pub disk_usage_limit: u64,
    /// Binaries that must be on `PATH`
    pub required_binaries: Vec<String>,
}

impl DiagnosticsConfig {
    pub fn new(
        config_path: impl Into<PathBuf>,
        env_path: impl Into<PathBuf>,
        layout: StateLayout,
    ) -> Self {
        Self {
            config_path: config_path.into(),
            env_path: env_path.into(),
            layout,
            log_size_limit: 100 * 1024 * 1024,
            log_retention: Duration::from_secs(7 * 24 * 60 * 60),
            disk_usage_limit: 500 * 1024 * 1024,
            required_binaries: ["git", "python3", "uv", "bd"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

/// Diagnostics engine
pub struct Diagnostics {
    config: DiagnosticsConfig,
    pid_probe: Arc<dyn PidProbe>,
    network_probe: Arc<dyn NetworkProbe>,
    span: Span,
}

impl Diagnostics {
    /// Create an engine with signal-based pid probing and an HTTP network probe.
    pub fn new(config: DiagnosticsConfig) -> crate::error::Result<Self> {
        Ok(Self {
            config,
            pid_probe: Arc::new(SignalProbe),
            network_probe: Arc::new(HttpProbe::new(Duration::from_secs(3))?),
            span: tracing::info_span!("diagnostics"),
        })
    }

    pub fn with_pid_probe(mut self, probe: Arc<dyn PidProbe>) -> Self {
        self.pid_probe = probe;
        self
    }

    pub fn with_network_probe(mut self, probe: Arc<dyn NetworkProbe>) -> Self {
        self.network_probe = probe;
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn config(&self) -> &DiagnosticsConfig {
        &self.config
    }

    /// Run every checker and collect their issues.
    ///
    /// A checker that fails is logged and skipped; the rest still run.
    pub async fn run_diagnostics(&self) -> DiagnosticReport {
        tracing::info!(parent: &self.span, "running diagnostics");
        let mut issues = Vec::new();

        let results = [
            ("configuration", self.check_configuration(&mut issues)),
            ("state", self.check_state(&mut issues)),
            ("permissions", self.check_permissions(&mut issues)),
            ("resources", self.check_resources(&mut issues)),
        ];
        for (checker, result) in results {
            if let Err(e) = result {
                tracing::warn!(parent: &self.span, checker, error = %e, "checker failed");
            }
        }
        if let Err(e) = self.check_network(&mut issues).await {
            tracing::warn!(parent: &self.span, checker = "network", error = %e, "checker failed");
        }
        if let Err(e) = self.check_agents(&mut issues) {
            tracing::warn!(parent: &self.span, checker = "agents", error = %e, "checker failed");
        }

        let report = DiagnosticReport::new(issues);
        tracing::info!(parent: &self.span, issues = report.issues.len(), "diagnostics complete");
        report
    }

    /// Apply the remediation of every auto-fixable issue in `report`.
    ///
    /// Every attempt yields a [`FixResult`]; a failed fix does not stop the rest.
    pub fn apply_fixes(&self, report: &DiagnosticReport) -> Vec<FixResult> {
        let mut results = Vec::new();

        for issue in report.issues.iter().filter(|i| i.auto_fixable) {
            tracing::info!(parent: &self.span, issue = %issue.id, "applying fix");
            let (success, message) = match self.apply_fix(&issue.kind) {
                Ok(message) => (true, message),
                Err(e) => {
                    tracing::warn!(parent: &self.span, issue = %issue.id, error = %e, "fix failed");
                    (false, e.to_string())
                }
            };
            results.push(FixResult {
                issue_id: issue.id.clone(),
                success,
                message,
                applied_at: Utc::now(),
            });
        }

        results
    }
}
