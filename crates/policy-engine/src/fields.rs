//! Per-field predicates.
//!
//! Every supported policy field is a variant of [`FieldName`]. The static
//! [`FIELDS`] table describes how values of that field are parsed and which
//! events carry it, so resolving a field name never involves reflection and
//! unknown names are rejected when a policy is compiled.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use regex::{Regex, RegexBuilder};

use crate::error::CompileError;
use crate::event::{Event, EventKind, FileOperation};
use crate::schema::EventSource;

// ---------------------------------------------------------------------------
// Field vocabulary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldName {
    ImageTag,
    ImageRegistry,
    ImageRemote,
    ContainerName,
    PrivilegedContainer,
    Replicas,
    ProcessName,
    ProcessArguments,
    ProcessUid,
    ActualPath,
    EffectivePath,
    FileOperation,
}

/// How the string-encoded policy values of a field are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Regex { case_insensitive: bool },
    /// Exact path or glob (`/etc/**`).
    Path,
    Boolean,
    /// Integer with an optional comparator prefix (`>`, `>=`, `<`, `<=`, `=`).
    Numeric,
    FileOperation,
}

/// Which part of an event supplies a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldSource {
    Deployment,
    Process,
    FileAccess,
}

#[derive(Debug)]
pub struct FieldMetadata {
    pub field: FieldName,
    pub name: &'static str,
    pub kind: ValueKind,
    pub source: FieldSource,
}

/// Field metadata, in declaration order of [`FieldName`].
pub static FIELDS: [FieldMetadata; 12] = [
    FieldMetadata {
        field: FieldName::ImageTag,
        name: "Image Tag",
        kind: ValueKind::Regex { case_insensitive: true },
        source: FieldSource::Deployment,
    },
    FieldMetadata {
        field: FieldName::ImageRegistry,
        name: "Image Registry",
        kind: ValueKind::Regex { case_insensitive: true },
        source: FieldSource::Deployment,
    },
    FieldMetadata {
        field: FieldName::ImageRemote,
        name: "Image Remote",
        kind: ValueKind::Regex { case_insensitive: true },
        source: FieldSource::Deployment,
    },
    FieldMetadata {
        field: FieldName::ContainerName,
        name: "Container Name",
        kind: ValueKind::Regex { case_insensitive: false },
        source: FieldSource::Deployment,
    },
    FieldMetadata {
        field: FieldName::PrivilegedContainer,
        name: "Privileged Container",
        kind: ValueKind::Boolean,
        source: FieldSource::Deployment,
    },
    FieldMetadata {
        field: FieldName::Replicas,
        name: "Replicas",
        kind: ValueKind::Numeric,
        source: FieldSource::Deployment,
    },
    FieldMetadata {
        field: FieldName::ProcessName,
        name: "Process Name",
        kind: ValueKind::Regex { case_insensitive: false },
        source: FieldSource::Process,
    },
    FieldMetadata {
        field: FieldName::ProcessArguments,
        name: "Process Arguments",
        kind: ValueKind::Regex { case_insensitive: false },
        source: FieldSource::Process,
    },
    FieldMetadata {
        field: FieldName::ProcessUid,
        name: "Process UID",
        kind: ValueKind::Numeric,
        source: FieldSource::Process,
    },
    FieldMetadata {
        field: FieldName::ActualPath,
        name: "Actual Path",
        kind: ValueKind::Path,
        source: FieldSource::FileAccess,
    },
    FieldMetadata {
        field: FieldName::EffectivePath,
        name: "Effective Path",
        kind: ValueKind::Path,
        source: FieldSource::FileAccess,
    },
    FieldMetadata {
        field: FieldName::FileOperation,
        name: "File Operation",
        kind: ValueKind::FileOperation,
        source: FieldSource::FileAccess,
    },
];

impl FieldName {
    pub fn metadata(self) -> &'static FieldMetadata {
        &FIELDS[self as usize]
    }

    pub fn as_str(self) -> &'static str {
        self.metadata().name
    }

    /// Whether `kind` events carry a value for this field.
    pub fn available_on(self, kind: EventKind) -> bool {
        match self.metadata().source {
            FieldSource::Deployment => kind != EventKind::NodeFileAccess,
            FieldSource::Process => kind == EventKind::Process,
            FieldSource::FileAccess => matches!(
                kind,
                EventKind::DeploymentFileAccess | EventKind::NodeFileAccess
            ),
        }
    }

    /// Whether a policy listening to `source` may reference this field.
    /// Node events carry no deployment, so only file fields apply.
    pub fn allowed_for(self, source: EventSource) -> bool {
        match source {
            EventSource::NodeEvent => self.metadata().source == FieldSource::FileAccess,
            EventSource::DeploymentEvent | EventSource::NotApplicable => true,
        }
    }

    pub fn is_path(self) -> bool {
        self.metadata().kind == ValueKind::Path
    }
}

impl fmt::Display for FieldName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldName {
    type Err = CompileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FIELDS
            .iter()
            .find(|m| m.name == s)
            .map(|m| m.field)
            .ok_or_else(|| CompileError::UnknownField(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Compiled predicates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Comparator {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct NumericComparison {
    comparator: Comparator,
    operand: i64,
}

impl NumericComparison {
    fn holds(&self, value: i64) -> bool {
        match self.comparator {
            Comparator::Eq => value == self.operand,
            Comparator::Lt => value < self.operand,
            Comparator::Le => value <= self.operand,
            Comparator::Gt => value > self.operand,
            Comparator::Ge => value >= self.operand,
        }
    }
}

#[derive(Debug)]
enum ValuePredicate {
    /// No values configured: the field only has to be present.
    Present,
    Regex(Vec<Regex>),
    Path(PathPatterns),
    Boolean(Vec<bool>),
    Numeric(Vec<NumericComparison>),
    Operations(Vec<FileOperation>),
}

/// A value pulled out of an event for one field.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Extracted<'e> {
    Str(&'e str),
    Int(i64),
    Bool(bool),
    Op(FileOperation),
}

impl fmt::Display for Extracted<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Extracted::Str(s) => f.write_str(s),
            Extracted::Int(i) => write!(f, "{i}"),
            Extracted::Bool(b) => write!(f, "{b}"),
            Extracted::Op(op) => write!(f, "{op}"),
        }
    }
}

/// Result of evaluating one field predicate.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldMatch {
    pub matched: bool,
    /// Event values that satisfied the predicate, rendered as strings.
    pub values: Vec<String>,
}

/// A compiled predicate over one field of an event.
#[derive(Debug)]
pub struct FieldMatcher {
    field: FieldName,
    predicate: ValuePredicate,
}

impl FieldMatcher {
    /// Compile `values` according to the value kind of `field`.
    pub fn compile(field: FieldName, values: &[String]) -> Result<Self, CompileError> {
        let name = field.as_str();
        let predicate = if values.is_empty() {
            ValuePredicate::Present
        } else {
            match field.metadata().kind {
                ValueKind::Regex { case_insensitive } => ValuePredicate::Regex(
                    values
                        .iter()
                        .map(|v| compile_regex(name, v, case_insensitive))
                        .collect::<Result<_, _>>()?,
                ),
                ValueKind::Path => ValuePredicate::Path(compile_paths(name, values)?),
                ValueKind::Boolean => ValuePredicate::Boolean(
                    values
                        .iter()
                        .map(|v| parse_bool(name, v))
                        .collect::<Result<_, _>>()?,
                ),
                ValueKind::Numeric => ValuePredicate::Numeric(
                    values
                        .iter()
                        .map(|v| parse_numeric(name, v))
                        .collect::<Result<_, _>>()?,
                ),
                ValueKind::FileOperation => {
                    ValuePredicate::Operations(parse_operations(name, values)?)
                }
            }
        };
        Ok(Self { field, predicate })
    }

    pub fn field(&self) -> FieldName {
        self.field
    }

    /// Evaluate against `event`. Fields the event does not carry never match.
    pub fn evaluate(&self, event: &Event) -> FieldMatch {
        let mut result = FieldMatch::default();
        for value in extract(self.field, event) {
            if self.accepts(value) {
                result.matched = true;
                result.values.push(value.to_string());
            }
        }
        result
    }

    fn accepts(&self, value: Extracted<'_>) -> bool {
        match (&self.predicate, value) {
            (ValuePredicate::Present, _) => true,
            (ValuePredicate::Regex(regexes), Extracted::Str(s)) => {
                regexes.iter().any(|re| re.is_match(s))
            }
            (ValuePredicate::Path(paths), Extracted::Str(s)) => paths.is_match(s),
            (ValuePredicate::Boolean(wanted), Extracted::Bool(b)) => wanted.contains(&b),
            (ValuePredicate::Numeric(comparisons), Extracted::Int(i)) => {
                comparisons.iter().any(|c| c.holds(i))
            }
            (ValuePredicate::Operations(ops), Extracted::Op(op)) => ops.contains(&op),
            _ => false,
        }
    }
}

/// Pull every value of `field` out of `event`. Deployment fields yield one
/// value per container; empty paths count as absent.
fn extract(field: FieldName, event: &Event) -> Vec<Extracted<'_>> {
    if !field.available_on(event.kind()) {
        return Vec::new();
    }
    let containers = move || event.deployment().into_iter().flat_map(|d| d.containers.iter());
    match field {
        FieldName::ImageTag => containers().map(|c| Extracted::Str(&c.image.tag)).collect(),
        FieldName::ImageRegistry => containers()
            .map(|c| Extracted::Str(&c.image.registry))
            .collect(),
        FieldName::ImageRemote => containers()
            .map(|c| Extracted::Str(&c.image.remote))
            .collect(),
        FieldName::ContainerName => containers().map(|c| Extracted::Str(&c.name)).collect(),
        FieldName::PrivilegedContainer => {
            containers().map(|c| Extracted::Bool(c.privileged)).collect()
        }
        FieldName::Replicas => event
            .deployment()
            .map(|d| Extracted::Int(d.replicas))
            .into_iter()
            .collect(),
        FieldName::ProcessName => event
            .process()
            .map(|p| Extracted::Str(&p.signal.name))
            .into_iter()
            .collect(),
        FieldName::ProcessArguments => event
            .process()
            .map(|p| Extracted::Str(&p.signal.args))
            .into_iter()
            .collect(),
        FieldName::ProcessUid => event
            .process()
            .map(|p| Extracted::Int(i64::from(p.signal.uid)))
            .into_iter()
            .collect(),
        FieldName::ActualPath => event
            .file_access()
            .map(|a| a.file.actual_path.as_str())
            .filter(|p| !p.is_empty())
            .map(Extracted::Str)
            .into_iter()
            .collect(),
        FieldName::EffectivePath => event
            .file_access()
            .map(|a| a.file.effective_path.as_str())
            .filter(|p| !p.is_empty())
            .map(Extracted::Str)
            .into_iter()
            .collect(),
        FieldName::FileOperation => event
            .file_access()
            .map(|a| Extracted::Op(a.operation))
            .into_iter()
            .collect(),
    }
}

// ---------------------------------------------------------------------------
// Value parsing
// ---------------------------------------------------------------------------

/// Values are matched against the whole extracted string.
fn compile_regex(field: &'static str, value: &str, case_insensitive: bool) -> Result<Regex, CompileError> {
    RegexBuilder::new(&format!("^(?:{value})$"))
        .case_insensitive(case_insensitive)
        .build()
        .map_err(|source| CompileError::InvalidRegex {
            field,
            value: value.to_string(),
            source,
        })
}

/// Configured path values. A path equal to a value always matches, so
/// literal paths containing glob metacharacters stay matchable. Otherwise
/// values are globs where `*` and `?` stop at `/` and `**` spans
/// directories.
#[derive(Debug)]
struct PathPatterns {
    exact: HashSet<String>,
    globs: GlobSet,
}

impl PathPatterns {
    fn is_match(&self, path: &str) -> bool {
        self.exact.contains(path) || self.globs.is_match(path)
    }
}

fn compile_paths(field: &'static str, values: &[String]) -> Result<PathPatterns, CompileError> {
    let mut builder = GlobSetBuilder::new();
    for value in values {
        if !value.starts_with('/') {
            return Err(CompileError::InvalidValue {
                field,
                value: value.clone(),
                reason: "path must be absolute".to_string(),
            });
        }
        let glob = GlobBuilder::new(value)
            .literal_separator(true)
            .build()
            .map_err(|source| CompileError::InvalidGlob {
                field,
                value: value.clone(),
                source,
            })?;
        builder.add(glob);
    }
    let globs = builder.build().map_err(|source| CompileError::InvalidGlob {
        field,
        value: values.join(","),
        source,
    })?;
    Ok(PathPatterns {
        exact: values.iter().cloned().collect(),
        globs,
    })
}

fn parse_bool(field: &'static str, value: &str) -> Result<bool, CompileError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(CompileError::InvalidValue {
            field,
            value: value.to_string(),
            reason: "expected 'true' or 'false'".to_string(),
        }),
    }
}

fn parse_numeric(field: &'static str, value: &str) -> Result<NumericComparison, CompileError> {
    let trimmed = value.trim();
    let (comparator, rest) = if let Some(rest) = trimmed.strip_prefix(">=") {
        (Comparator::Ge, rest)
    } else if let Some(rest) = trimmed.strip_prefix("<=") {
        (Comparator::Le, rest)
    } else if let Some(rest) = trimmed.strip_prefix('>') {
        (Comparator::Gt, rest)
    } else if let Some(rest) = trimmed.strip_prefix('<') {
        (Comparator::Lt, rest)
    } else if let Some(rest) = trimmed.strip_prefix('=') {
        (Comparator::Eq, rest)
    } else {
        (Comparator::Eq, trimmed)
    };
    let operand = rest
        .trim()
        .parse::<i64>()
        .map_err(|e| CompileError::InvalidValue {
            field,
            value: value.to_string(),
            reason: e.to_string(),
        })?;
    Ok(NumericComparison {
        comparator,
        operand,
    })
}

/// Parse a list of file operation names.
fn parse_operations(field: &'static str, values: &[String]) -> Result<Vec<FileOperation>, CompileError> {
    values
        .iter()
        .map(|v| {
            v.parse::<FileOperation>()
                .map_err(|reason| CompileError::InvalidValue {
                    field,
                    value: v.clone(),
                    reason,
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{
        Container, Deployment, FileAccess, FileInfo, ImageName, Node, ProcessIndicator,
        ProcessSignal,
    };

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn matcher(field: FieldName, values: &[&str]) -> FieldMatcher {
        FieldMatcher::compile(field, &strings(values)).expect("test matcher should compile")
    }

    fn deployment_event() -> Event {
        Event::Deployment(Deployment {
            id: "d1".into(),
            name: "web".into(),
            cluster_id: "c1".into(),
            replicas: 3,
            containers: vec![
                Container {
                    name: "nginx".into(),
                    image: ImageName {
                        registry: "docker.io".into(),
                        remote: "library/nginx".into(),
                        tag: "latest".into(),
                    },
                    privileged: false,
                },
                Container {
                    name: "sidecar".into(),
                    image: ImageName {
                        registry: "quay.io".into(),
                        remote: "proxy/envoy".into(),
                        tag: "1.29".into(),
                    },
                    privileged: true,
                },
            ],
            ..Default::default()
        })
    }

    fn process_event(name: &str, uid: u32) -> Event {
        Event::Process {
            deployment: Deployment::default(),
            indicator: ProcessIndicator {
                id: "pi1".into(),
                signal: ProcessSignal {
                    name: name.into(),
                    args: "-c id".into(),
                    uid,
                    ..Default::default()
                },
                ..Default::default()
            },
        }
    }

    fn node_access(path: &str, op: FileOperation) -> Event {
        Event::NodeFileAccess {
            node: Node::default(),
            access: FileAccess::new(FileInfo::actual(path), op),
        }
    }

    // ---- vocabulary ----

    #[test]
    fn field_table_is_in_enum_order() {
        for meta in FIELDS.iter() {
            assert_eq!(meta.field.metadata().name, meta.name);
        }
    }

    #[test]
    fn unknown_field_rejected() {
        let err = "Image Flavour".parse::<FieldName>().unwrap_err();
        assert!(matches!(err, CompileError::UnknownField(ref f) if f == "Image Flavour"));
    }

    #[test]
    fn field_names_round_trip_through_display() {
        assert_eq!("Actual Path".parse::<FieldName>().unwrap(), FieldName::ActualPath);
        assert_eq!(FieldName::ProcessUid.to_string(), "Process UID");
    }

    #[test]
    fn node_policies_only_allow_file_fields() {
        assert!(FieldName::ActualPath.allowed_for(EventSource::NodeEvent));
        assert!(FieldName::FileOperation.allowed_for(EventSource::NodeEvent));
        assert!(!FieldName::ImageTag.allowed_for(EventSource::NodeEvent));
        assert!(FieldName::ImageTag.allowed_for(EventSource::DeploymentEvent));
    }

    // ---- string fields ----

    #[test]
    fn regex_is_anchored() {
        let m = matcher(FieldName::ImageTag, &["lat"]);
        assert!(!m.evaluate(&deployment_event()).matched);

        let m = matcher(FieldName::ImageTag, &["lat.*"]);
        let result = m.evaluate(&deployment_event());
        assert!(result.matched);
        assert_eq!(result.values, vec!["latest"]);
    }

    #[test]
    fn image_fields_are_case_insensitive() {
        let m = matcher(FieldName::ImageTag, &["LATEST"]);
        assert!(m.evaluate(&deployment_event()).matched);
    }

    #[test]
    fn container_name_is_case_sensitive() {
        assert!(matcher(FieldName::ContainerName, &["nginx"])
            .evaluate(&deployment_event())
            .matched);
        assert!(!matcher(FieldName::ContainerName, &["NGINX"])
            .evaluate(&deployment_event())
            .matched);
    }

    #[test]
    fn any_container_can_satisfy_a_field() {
        let result = matcher(FieldName::ImageRegistry, &["quay.io", "gcr.io"])
            .evaluate(&deployment_event());
        assert!(result.matched);
        assert_eq!(result.values, vec!["quay.io"]);
    }

    #[test]
    fn invalid_regex_fails_compilation() {
        let err = FieldMatcher::compile(FieldName::ProcessName, &strings(&["[bad"])).unwrap_err();
        assert!(matches!(err, CompileError::InvalidRegex { field: "Process Name", .. }));
    }

    // ---- booleans and numbers ----

    #[test]
    fn boolean_field() {
        let result = matcher(FieldName::PrivilegedContainer, &["true"]).evaluate(&deployment_event());
        assert!(result.matched);
        assert_eq!(result.values, vec!["true"]);

        let err =
            FieldMatcher::compile(FieldName::PrivilegedContainer, &strings(&["yes"])).unwrap_err();
        assert!(matches!(err, CompileError::InvalidValue { .. }));
    }

    #[test]
    fn numeric_comparators() {
        let event = deployment_event();
        assert!(matcher(FieldName::Replicas, &["3"]).evaluate(&event).matched);
        assert!(matcher(FieldName::Replicas, &[">= 3"]).evaluate(&event).matched);
        assert!(matcher(FieldName::Replicas, &["<5"]).evaluate(&event).matched);
        assert!(!matcher(FieldName::Replicas, &[">3"]).evaluate(&event).matched);
        assert!(!matcher(FieldName::Replicas, &["<=2"]).evaluate(&event).matched);
    }

    #[test]
    fn process_uid_zero() {
        let m = matcher(FieldName::ProcessUid, &["0"]);
        assert!(m.evaluate(&process_event("bash", 0)).matched);
        assert!(!m.evaluate(&process_event("bash", 1000)).matched);
    }

    #[test]
    fn malformed_number_fails_compilation() {
        let err = FieldMatcher::compile(FieldName::Replicas, &strings(&[">three"])).unwrap_err();
        assert!(
            err.to_string().contains("invalid value '>three' for field 'Replicas'"),
            "unexpected error: {err}"
        );
    }

    // ---- file fields ----

    #[test]
    fn path_exact_and_glob() {
        let exact = matcher(FieldName::ActualPath, &["/etc/passwd"]);
        assert!(exact.evaluate(&node_access("/etc/passwd", FileOperation::Open)).matched);
        assert!(!exact.evaluate(&node_access("/etc/shadow", FileOperation::Open)).matched);

        let glob = matcher(FieldName::ActualPath, &["/etc/ssh/**"]);
        assert!(glob
            .evaluate(&node_access("/etc/ssh/sshd_config", FileOperation::Open))
            .matched);
    }

    #[test]
    fn single_star_stays_in_one_directory() {
        let m = matcher(FieldName::ActualPath, &["/etc/*.conf"]);
        assert!(m.evaluate(&node_access("/etc/resolv.conf", FileOperation::Open)).matched);
        assert!(!m
            .evaluate(&node_access("/etc/nginx/nginx.conf", FileOperation::Open))
            .matched);
    }

    #[test]
    fn literal_path_with_glob_characters_matches_itself() {
        let m = matcher(FieldName::ActualPath, &["/var/run/[secret]"]);
        assert!(m.evaluate(&node_access("/var/run/[secret]", FileOperation::Open)).matched);
        assert!(m.evaluate(&node_access("/var/run/s", FileOperation::Open)).matched);
        assert!(!m.evaluate(&node_access("/var/run/x", FileOperation::Open)).matched);
    }

    #[test]
    fn unknown_file_operation_fails_compilation() {
        let err = FieldMatcher::compile(FieldName::FileOperation, &strings(&["TRUNCATE"]))
            .unwrap_err();
        assert!(matches!(err, CompileError::InvalidValue { ref value, .. } if value == "TRUNCATE"));
    }

    #[test]
    fn relative_path_rejected() {
        let err = FieldMatcher::compile(FieldName::EffectivePath, &strings(&["etc/passwd"]))
            .unwrap_err();
        assert!(err.to_string().contains("path must be absolute"), "{err}");
    }

    #[test]
    fn empty_path_is_absent() {
        // The event only carries an actual path.
        let m = matcher(FieldName::EffectivePath, &[]);
        assert!(!m.evaluate(&node_access("/etc/passwd", FileOperation::Open)).matched);

        let m = matcher(FieldName::ActualPath, &[]);
        assert!(m.evaluate(&node_access("/etc/passwd", FileOperation::Open)).matched);
    }

    #[test]
    fn file_operation_membership() {
        let m = matcher(FieldName::FileOperation, &["OPEN", "create"]);
        assert!(m.evaluate(&node_access("/x", FileOperation::Open)).matched);
        assert!(m.evaluate(&node_access("/x", FileOperation::Create)).matched);
        assert!(!m.evaluate(&node_access("/x", FileOperation::Unlink)).matched);

        let err = FieldMatcher::compile(FieldName::FileOperation, &strings(&["CHMOD"])).unwrap_err();
        assert!(err.to_string().contains("unknown file operation"), "{err}");
    }

    #[test]
    fn fields_absent_from_event_never_match() {
        let m = matcher(FieldName::ProcessName, &[]);
        assert!(!m.evaluate(&deployment_event()).matched);

        let m = matcher(FieldName::ImageTag, &[]);
        assert!(!m.evaluate(&node_access("/etc/passwd", FileOperation::Open)).matched);
    }
}
