use crate::error::{LiveError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Kind of server-side events a [`Filter`] selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FilterType {
    Global,
    Project,
    Workflow,
    WorkflowRun,
    #[serde(rename = "workflow-node-run", alias = "node-run")]
    NodeRun,
    Pipeline,
    Application,
    Environment,
    Queue,
    Operation,
    Timeline,
}

impl FilterType {
    pub fn as_str(self) -> &'static str {
        match self {
            FilterType::Global => "global",
            FilterType::Project => "project",
            FilterType::Workflow => "workflow",
            FilterType::WorkflowRun => "workflow-run",
            FilterType::NodeRun => "workflow-node-run",
            FilterType::Pipeline => "pipeline",
            FilterType::Application => "application",
            FilterType::Environment => "environment",
            FilterType::Queue => "queue",
            FilterType::Operation => "operation",
            FilterType::Timeline => "timeline",
        }
    }

    fn required_keys(self) -> &'static [ScopeKey] {
        use ScopeKey::*;
        match self {
            FilterType::Global | FilterType::Queue | FilterType::Timeline => &[],
            FilterType::Project => &[ProjectKey],
            FilterType::Workflow => &[ProjectKey, WorkflowName],
            FilterType::WorkflowRun => &[ProjectKey, WorkflowName, WorkflowRunNum],
            FilterType::NodeRun => &[ProjectKey, WorkflowName, WorkflowNodeRunId],
            FilterType::Pipeline => &[ProjectKey, PipelineName],
            FilterType::Application => &[ProjectKey, ApplicationName],
            FilterType::Environment => &[ProjectKey, EnvironmentName],
            FilterType::Operation => &[ProjectKey, OperationUuid],
        }
    }
}

impl FromStr for FilterType {
    type Err = LiveError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "global" => FilterType::Global,
            "project" => FilterType::Project,
            "workflow" => FilterType::Workflow,
            "workflow-run" => FilterType::WorkflowRun,
            "node-run" | "workflow-node-run" => FilterType::NodeRun,
            "pipeline" => FilterType::Pipeline,
            "application" => FilterType::Application,
            "environment" => FilterType::Environment,
            "queue" => FilterType::Queue,
            "operation" => FilterType::Operation,
            "timeline" => FilterType::Timeline,
            other => {
                return Err(LiveError::InvalidFilter(format!(
                    "unknown filter type '{other}'"
                )))
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScopeKey {
    ProjectKey,
    ApplicationName,
    PipelineName,
    EnvironmentName,
    WorkflowName,
    WorkflowRunNum,
    WorkflowNodeRunId,
    OperationUuid,
}

impl ScopeKey {
    const ALL: [ScopeKey; 8] = [
        ScopeKey::ProjectKey,
        ScopeKey::ApplicationName,
        ScopeKey::PipelineName,
        ScopeKey::EnvironmentName,
        ScopeKey::WorkflowName,
        ScopeKey::WorkflowRunNum,
        ScopeKey::WorkflowNodeRunId,
        ScopeKey::OperationUuid,
    ];

    fn name(self) -> &'static str {
        match self {
            ScopeKey::ProjectKey => "project_key",
            ScopeKey::ApplicationName => "application_name",
            ScopeKey::PipelineName => "pipeline_name",
            ScopeKey::EnvironmentName => "environment_name",
            ScopeKey::WorkflowName => "workflow_name",
            ScopeKey::WorkflowRunNum => "workflow_run_num",
            ScopeKey::WorkflowNodeRunId => "workflow_node_run_id",
            ScopeKey::OperationUuid => "operation_uuid",
        }
    }

    /// Short names accepted by the textual filter form.
    fn parse(s: &str) -> Option<ScopeKey> {
        Some(match s {
            "project" | "project_key" => ScopeKey::ProjectKey,
            "application" | "application_name" => ScopeKey::ApplicationName,
            "pipeline" | "pipeline_name" => ScopeKey::PipelineName,
            "environment" | "environment_name" => ScopeKey::EnvironmentName,
            "workflow" | "workflow_name" => ScopeKey::WorkflowName,
            "run" | "workflow_run_num" => ScopeKey::WorkflowRunNum,
            "node-run" | "workflow_node_run_id" => ScopeKey::WorkflowNodeRunId,
            "operation" | "operation_uuid" => ScopeKey::OperationUuid,
            _ => return None,
        })
    }

    fn is_present(self, f: &Filter) -> bool {
        match self {
            ScopeKey::ProjectKey => f.project_key.is_some(),
            ScopeKey::ApplicationName => f.application_name.is_some(),
            ScopeKey::PipelineName => f.pipeline_name.is_some(),
            ScopeKey::EnvironmentName => f.environment_name.is_some(),
            ScopeKey::WorkflowName => f.workflow_name.is_some(),
            ScopeKey::WorkflowRunNum => f.workflow_run_num.is_some(),
            ScopeKey::WorkflowNodeRunId => f.workflow_node_run_id.is_some(),
            ScopeKey::OperationUuid => f.operation_uuid.is_some(),
        }
    }
}

/// Typed, scoped description of the events a consumer wants delivered.
///
/// Filters compare by full structural equality: two filters select the same
/// events exactly when every field is equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Filter {
    #[serde(rename = "type")]
    pub kind: FilterType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_run_num: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_node_run_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_uuid: Option<String>,
}

impl Filter {
    fn bare(kind: FilterType) -> Self {
        Self {
            kind,
            project_key: None,
            application_name: None,
            pipeline_name: None,
            environment_name: None,
            workflow_name: None,
            workflow_run_num: None,
            workflow_node_run_id: None,
            operation_uuid: None,
        }
    }

    pub fn global() -> Self {
        Self::bare(FilterType::Global)
    }

    pub fn queue() -> Self {
        Self::bare(FilterType::Queue)
    }

    pub fn timeline() -> Self {
        Self::bare(FilterType::Timeline)
    }

    pub fn project(project_key: impl Into<String>) -> Self {
        Self {
            project_key: Some(project_key.into()),
            ..Self::bare(FilterType::Project)
        }
    }

    pub fn workflow(project_key: impl Into<String>, workflow_name: impl Into<String>) -> Self {
        Self {
            project_key: Some(project_key.into()),
            workflow_name: Some(workflow_name.into()),
            ..Self::bare(FilterType::Workflow)
        }
    }

    pub fn workflow_run(
        project_key: impl Into<String>,
        workflow_name: impl Into<String>,
        run_number: i64,
    ) -> Self {
        Self {
            project_key: Some(project_key.into()),
            workflow_name: Some(workflow_name.into()),
            workflow_run_num: Some(run_number),
            ..Self::bare(FilterType::WorkflowRun)
        }
    }

    pub fn node_run(
        project_key: impl Into<String>,
        workflow_name: impl Into<String>,
        node_run_id: i64,
    ) -> Self {
        Self {
            project_key: Some(project_key.into()),
            workflow_name: Some(workflow_name.into()),
            workflow_node_run_id: Some(node_run_id),
            ..Self::bare(FilterType::NodeRun)
        }
    }

    pub fn pipeline(project_key: impl Into<String>, pipeline_name: impl Into<String>) -> Self {
        Self {
            project_key: Some(project_key.into()),
            pipeline_name: Some(pipeline_name.into()),
            ..Self::bare(FilterType::Pipeline)
        }
    }

    pub fn application(
        project_key: impl Into<String>,
        application_name: impl Into<String>,
    ) -> Self {
        Self {
            project_key: Some(project_key.into()),
            application_name: Some(application_name.into()),
            ..Self::bare(FilterType::Application)
        }
    }

    pub fn environment(
        project_key: impl Into<String>,
        environment_name: impl Into<String>,
    ) -> Self {
        Self {
            project_key: Some(project_key.into()),
            environment_name: Some(environment_name.into()),
            ..Self::bare(FilterType::Environment)
        }
    }

    pub fn operation(project_key: impl Into<String>, operation_uuid: impl Into<String>) -> Self {
        Self {
            project_key: Some(project_key.into()),
            operation_uuid: Some(operation_uuid.into()),
            ..Self::bare(FilterType::Operation)
        }
    }

    /// Check that exactly the scoping keys required by the filter type are set.
    pub fn validate(&self) -> Result<()> {
        let required = self.kind.required_keys();
        for key in ScopeKey::ALL {
            let needed = required.contains(&key);
            let present = key.is_present(self);
            if needed && !present {
                return Err(LiveError::InvalidFilter(format!(
                    "{} filter requires {}",
                    self.kind.as_str(),
                    key.name()
                )));
            }
            if present && !needed {
                return Err(LiveError::InvalidFilter(format!(
                    "{} filter does not take {}",
                    self.kind.as_str(),
                    key.name()
                )));
            }
        }
        Ok(())
    }

    pub fn matches(&self, event: &Event) -> bool {
        event.matching_filters().contains(self)
    }

    /// Whether the event's status is the status of the one run, node run or
    /// operation this filter names. Broad filters (queue, project, workflow...)
    /// name no single entity and never qualify.
    pub fn is_status_of(&self, event: &Event) -> bool {
        let kind_ok = match self.kind {
            FilterType::WorkflowRun => event.type_event == "sdk.EventRunWorkflow",
            FilterType::NodeRun => event.type_event == "sdk.EventRunWorkflowNode",
            FilterType::Operation => event.type_event == "sdk.EventOperation",
            _ => false,
        };
        kind_ok && self.matches(event)
    }

    fn set(&mut self, key: ScopeKey, value: &str) -> Result<()> {
        let int = |v: &str| {
            v.parse::<i64>().map_err(|_| {
                LiveError::InvalidFilter(format!("{} must be an integer, got '{v}'", key.name()))
            })
        };
        match key {
            ScopeKey::ProjectKey => self.project_key = Some(value.to_string()),
            ScopeKey::ApplicationName => self.application_name = Some(value.to_string()),
            ScopeKey::PipelineName => self.pipeline_name = Some(value.to_string()),
            ScopeKey::EnvironmentName => self.environment_name = Some(value.to_string()),
            ScopeKey::WorkflowName => self.workflow_name = Some(value.to_string()),
            ScopeKey::WorkflowRunNum => self.workflow_run_num = Some(int(value)?),
            ScopeKey::WorkflowNodeRunId => self.workflow_node_run_id = Some(int(value)?),
            ScopeKey::OperationUuid => self.operation_uuid = Some(value.to_string()),
        }
        Ok(())
    }
}

/// Textual form: `type[:key=value,...]`, e.g. `workflow-run:project=PRJ,workflow=build,run=12`.
impl FromStr for Filter {
    type Err = LiveError;

    fn from_str(s: &str) -> Result<Self> {
        let (kind, rest) = match s.split_once(':') {
            Some((k, r)) => (k, Some(r)),
            None => (s, None),
        };
        let mut filter = Filter::bare(kind.trim().parse()?);
        for pair in rest.into_iter().flat_map(|r| r.split(',')) {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let (k, v) = pair.split_once('=').ok_or_else(|| {
                LiveError::InvalidFilter(format!("expected key=value, got '{pair}'"))
            })?;
            let key = ScopeKey::parse(k.trim())
                .ok_or_else(|| LiveError::InvalidFilter(format!("unknown filter key '{k}'")))?;
            filter.set(key, v.trim())?;
        }
        filter.validate()?;
        Ok(filter)
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind.as_str())?;
        let mut sep = ':';
        let mut field = |f: &mut fmt::Formatter<'_>, name: &str, value: Option<String>| {
            if let Some(v) = value {
                write!(f, "{sep}{name}={v}")?;
                sep = ',';
            }
            Ok(())
        };
        field(f, "project", self.project_key.clone())?;
        field(f, "workflow", self.workflow_name.clone())?;
        field(f, "run", self.workflow_run_num.map(|n| n.to_string()))?;
        field(f, "node-run", self.workflow_node_run_id.map(|n| n.to_string()))?;
        field(f, "pipeline", self.pipeline_name.clone())?;
        field(f, "application", self.application_name.clone())?;
        field(f, "environment", self.environment_name.clone())?;
        field(f, "operation", self.operation_uuid.clone())
    }
}

fn str_field(v: &Value, key: &str) -> Option<String> {
    match v.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

fn int_field(v: &Value, key: &str) -> Option<i64> {
    match v.get(key)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// A decoded data frame.
///
/// The payload is kept as generic JSON; only the routing envelope is read.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub type_event: String,
    pub project_key: Option<String>,
    pub workflow_name: Option<String>,
    pub workflow_run_num: Option<i64>,
    pub workflow_node_run_id: Option<i64>,
    pub pipeline_name: Option<String>,
    pub application_name: Option<String>,
    pub environment_name: Option<String>,
    pub operation_uuid: Option<String>,
    pub payload: Value,
}

impl Event {
    pub fn from_value(payload: Value) -> Result<Self> {
        if !payload.is_object() {
            return Err(LiveError::Malformed(
                "event payload is not a JSON object".into(),
            ));
        }
        Ok(Self {
            type_event: str_field(&payload, "type_event").unwrap_or_default(),
            project_key: str_field(&payload, "project_key"),
            workflow_name: str_field(&payload, "workflow_name"),
            workflow_run_num: int_field(&payload, "workflow_run_num"),
            workflow_node_run_id: int_field(&payload, "workflow_node_run_id"),
            pipeline_name: str_field(&payload, "pipeline_name"),
            application_name: str_field(&payload, "application_name"),
            environment_name: str_field(&payload, "environment_name"),
            operation_uuid: str_field(&payload, "operation_uuid"),
            payload,
        })
    }

    /// Status carried by the event, either on the envelope or on the nested payload.
    pub fn status(&self) -> Option<String> {
        str_field(&self.payload, "status").or_else(|| {
            self.payload
                .get("payload")
                .and_then(|inner| str_field(inner, "status"))
        })
    }

    /// Every filter this event belongs to.
    ///
    /// Mirrors the server's routing keys so that a consumer filter matches
    /// exactly when it is structurally equal to one of them.
    pub fn matching_filters(&self) -> Vec<Filter> {
        let t = self.type_event.as_str();
        let pk = self.project_key.as_deref();
        let wn = self.workflow_name.as_deref();
        let mut out = Vec::new();

        if t == "sdk.EventMaintenance" || t.starts_with("sdk.EventBroadcast") {
            out.push(Filter::global());
        }
        if t.starts_with("sdk.EventProject") {
            if let Some(pk) = pk {
                out.push(Filter::project(pk));
            }
        }
        if t.starts_with("sdk.EventWorkflow") || t == "sdk.EventRunWorkflow" {
            if let (Some(pk), Some(wn)) = (pk, wn) {
                out.push(Filter::workflow(pk, wn));
            }
        }
        if t == "sdk.EventRunWorkflow" || t == "sdk.EventRunWorkflowNode" {
            if let (Some(pk), Some(wn), Some(num)) = (pk, wn, self.workflow_run_num) {
                out.push(Filter::workflow_run(pk, wn, num));
            }
        }
        if t == "sdk.EventRunWorkflowNode" {
            if let (Some(pk), Some(wn), Some(id)) = (pk, wn, self.workflow_node_run_id) {
                out.push(Filter::node_run(pk, wn, id));
            }
        }
        if t.starts_with("sdk.EventPipeline") {
            if let (Some(pk), Some(name)) = (pk, self.pipeline_name.as_deref()) {
                out.push(Filter::pipeline(pk, name));
            }
        }
        if t.starts_with("sdk.EventApplication") {
            if let (Some(pk), Some(name)) = (pk, self.application_name.as_deref()) {
                out.push(Filter::application(pk, name));
            }
        }
        if t.starts_with("sdk.EventEnvironment") {
            if let (Some(pk), Some(name)) = (pk, self.environment_name.as_deref()) {
                out.push(Filter::environment(pk, name));
            }
        }
        if t == "sdk.EventRunWorkflowJob" {
            out.push(Filter::queue());
        }
        if t == "sdk.EventOperation" {
            if let (Some(pk), Some(uuid)) = (pk, self.operation_uuid.as_deref()) {
                out.push(Filter::operation(pk, uuid));
            }
        }
        if t == "sdk.EventRunWorkflow" {
            out.push(Filter::timeline());
        }
        out
    }
}

/// Statuses that mean "work still in progress". Anything else is terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusSet(Vec<String>);

impl StatusSet {
    pub fn new<I, S>(statuses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(statuses.into_iter().map(Into::into).collect())
    }

    pub fn is_active(&self, status: &str) -> bool {
        self.0.iter().any(|s| s.eq_ignore_ascii_case(status))
    }

    /// A missing status is not terminal: the resource has not reported one yet.
    pub fn is_terminal(&self, status: Option<&str>) -> bool {
        status.map(|s| !self.is_active(s)).unwrap_or(false)
    }
}

impl Default for StatusSet {
    fn default() -> Self {
        Self::new(["Building", "Waiting"])
    }
}

/// Cheap comparable tuple used to detect an unchanged resource between polls.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ChangeFingerprint {
    pub last_modified: Option<String>,
    pub id: Option<String>,
}

/// A polled resource-status body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceSnapshot {
    pub id: Option<String>,
    pub status: Option<String>,
    pub last_modified: Option<String>,
    pub body: Value,
}

impl ResourceSnapshot {
    pub fn from_value(body: Value) -> Result<Self> {
        if !body.is_object() {
            return Err(LiveError::Malformed(
                "resource body is not a JSON object".into(),
            ));
        }
        let id = match body.get("id") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };
        Ok(Self {
            id,
            status: str_field(&body, "status"),
            last_modified: str_field(&body, "last_modified"),
            body,
        })
    }

    pub fn fingerprint(&self) -> ChangeFingerprint {
        ChangeFingerprint {
            last_modified: self.last_modified.clone(),
            id: self.id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn filter_serializes_only_its_scoping_keys() {
        let v = serde_json::to_value(Filter::workflow_run("PRJ", "build", 12)).unwrap();
        assert_eq!(
            v,
            json!({
                "type": "workflow-run",
                "project_key": "PRJ",
                "workflow_name": "build",
                "workflow_run_num": 12
            })
        );
        assert_eq!(serde_json::to_value(Filter::queue()).unwrap(), json!({"type": "queue"}));
    }

    #[test]
    fn node_run_uses_server_wire_name() {
        let v = serde_json::to_value(Filter::node_run("PRJ", "build", 7)).unwrap();
        assert_eq!(v["type"], "workflow-node-run");
        let back: Filter = serde_json::from_value(json!({
            "type": "node-run",
            "project_key": "PRJ",
            "workflow_name": "build",
            "workflow_node_run_id": 7
        }))
        .unwrap();
        assert_eq!(back, Filter::node_run("PRJ", "build", 7));
    }

    #[test]
    fn validate_rejects_missing_and_extra_keys() {
        let mut f = Filter::workflow("PRJ", "build");
        f.workflow_name = None;
        assert!(matches!(f.validate(), Err(LiveError::InvalidFilter(_))));

        let mut q = Filter::queue();
        q.project_key = Some("PRJ".into());
        assert!(matches!(q.validate(), Err(LiveError::InvalidFilter(_))));

        assert!(Filter::operation("PRJ", "abc").validate().is_ok());
    }

    #[test]
    fn parse_textual_filter() {
        let f: Filter = "workflow-run:project=PRJ,workflow=build,run=12".parse().unwrap();
        assert_eq!(f, Filter::workflow_run("PRJ", "build", 12));
        assert_eq!(f.to_string(), "workflow-run:project=PRJ,workflow=build,run=12");

        let q: Filter = "queue".parse().unwrap();
        assert_eq!(q, Filter::queue());

        assert!("workflow-run:project=PRJ,workflow=build,run=abc"
            .parse::<Filter>()
            .is_err());
        assert!("pipeline:project=PRJ".parse::<Filter>().is_err());
        assert!("bogus".parse::<Filter>().is_err());
    }

    #[test]
    fn job_event_routes_to_queue() {
        let ev = Event::from_value(json!({
            "type_event": "sdk.EventRunWorkflowJob",
            "project_key": "PRJ",
            "workflow_name": "build",
            "status": "Building"
        }))
        .unwrap();
        assert_eq!(ev.matching_filters(), vec![Filter::queue()]);
        assert!(Filter::queue().matches(&ev));
        assert!(!Filter::project("PRJ").matches(&ev));
        assert_eq!(ev.status().as_deref(), Some("Building"));
    }

    #[test]
    fn node_run_event_routes_to_run_and_node_run() {
        let ev = Event::from_value(json!({
            "type_event": "sdk.EventRunWorkflowNode",
            "project_key": "PRJ",
            "workflow_name": "build",
            "workflow_run_num": 3,
            "workflow_node_run_id": 99
        }))
        .unwrap();
        let keys = ev.matching_filters();
        assert!(keys.contains(&Filter::workflow_run("PRJ", "build", 3)));
        assert!(keys.contains(&Filter::node_run("PRJ", "build", 99)));
        assert!(!keys.contains(&Filter::workflow_run("PRJ", "build", 4)));
        assert!(!keys.contains(&Filter::timeline()));
    }

    #[test]
    fn run_event_also_feeds_workflow_and_timeline() {
        let ev = Event::from_value(json!({
            "type_event": "sdk.EventRunWorkflow",
            "project_key": "PRJ",
            "workflow_name": "build",
            "workflow_run_num": "3",
            "payload": {"status": "Success"}
        }))
        .unwrap();
        let keys = ev.matching_filters();
        assert!(keys.contains(&Filter::workflow("PRJ", "build")));
        assert!(keys.contains(&Filter::workflow_run("PRJ", "build", 3)));
        assert!(keys.contains(&Filter::timeline()));
        assert_eq!(ev.status().as_deref(), Some("Success"));
    }

    #[test]
    fn status_belongs_only_to_the_named_entity() {
        let run = Event::from_value(json!({
            "type_event": "sdk.EventRunWorkflow",
            "project_key": "PRJ",
            "workflow_name": "build",
            "workflow_run_num": 3,
            "status": "Success"
        }))
        .unwrap();
        let node = Event::from_value(json!({
            "type_event": "sdk.EventRunWorkflowNode",
            "project_key": "PRJ",
            "workflow_name": "build",
            "workflow_run_num": 3,
            "workflow_node_run_id": 99,
            "status": "Success"
        }))
        .unwrap();
        let job = Event::from_value(json!({
            "type_event": "sdk.EventRunWorkflowJob",
            "project_key": "OTHER",
            "status": "Success"
        }))
        .unwrap();

        let run_filter = Filter::workflow_run("PRJ", "build", 3);
        assert!(run_filter.is_status_of(&run));
        // a node finishing does not finish the run
        assert!(run_filter.matches(&node));
        assert!(!run_filter.is_status_of(&node));
        assert!(Filter::node_run("PRJ", "build", 99).is_status_of(&node));
        assert!(!Filter::node_run("PRJ", "build", 98).is_status_of(&node));
        assert!(!Filter::workflow_run("PRJ", "build", 4).is_status_of(&run));

        assert!(Filter::queue().matches(&job));
        assert!(!Filter::queue().is_status_of(&job));
        assert!(!Filter::workflow("PRJ", "build").is_status_of(&run));
    }

    #[test]
    fn non_object_event_is_malformed() {
        assert!(matches!(
            Event::from_value(json!([1, 2])),
            Err(LiveError::Malformed(_))
        ));
    }

    #[test]
    fn status_set_terminal_detection() {
        let set = StatusSet::default();
        assert!(!set.is_terminal(Some("Building")));
        assert!(!set.is_terminal(Some("Waiting")));
        assert!(set.is_terminal(Some("Success")));
        assert!(set.is_terminal(Some("Fail")));
        assert!(!set.is_terminal(None));
    }

    #[test]
    fn snapshot_fingerprint_normalizes_numeric_id() {
        let snap = ResourceSnapshot::from_value(json!({
            "id": 42,
            "status": "Building",
            "last_modified": "2024-01-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(
            snap.fingerprint(),
            ChangeFingerprint {
                last_modified: Some("2024-01-01T00:00:00Z".into()),
                id: Some("42".into()),
            }
        );
    }
}
