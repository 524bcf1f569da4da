//! Resolved flags and typed evaluation against them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{ConfidenceError, ErrorCode, Result};
use crate::types::{Context, Schema, Value};

pub(crate) const FLAG_PREFIX: &str = "flags/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ResolveReason {
    #[default]
    #[serde(rename = "RESOLVE_REASON_UNSPECIFIED")]
    Unspecified,
    #[serde(rename = "RESOLVE_REASON_MATCH")]
    Match,
    #[serde(rename = "RESOLVE_REASON_NO_SEGMENT_MATCH")]
    NoSegmentMatch,
    #[serde(rename = "RESOLVE_REASON_NO_TREATMENT_MATCH")]
    NoTreatmentMatch,
    #[serde(rename = "RESOLVE_REASON_FLAG_ARCHIVED")]
    Archived,
    #[serde(rename = "RESOLVE_REASON_TARGETING_KEY_ERROR")]
    TargetingKeyError,
    #[serde(rename = "RESOLVE_REASON_ERROR")]
    Error,
}

impl ResolveReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolveReason::Unspecified => "UNSPECIFIED",
            ResolveReason::Match => "MATCH",
            ResolveReason::NoSegmentMatch => "NO_SEGMENT_MATCH",
            ResolveReason::NoTreatmentMatch => "NO_TREATMENT_MATCH",
            ResolveReason::Archived => "FLAG_ARCHIVED",
            ResolveReason::TargetingKeyError => "TARGETING_KEY_ERROR",
            ResolveReason::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for ResolveReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One flag of a resolve response.
#[derive(Debug)]
pub struct ResolvedFlag {
    pub name: String,
    pub schema: Schema,
    pub value: Value,
    pub variant: Option<String>,
    pub reason: ResolveReason,
    should_apply: AtomicBool,
}

impl ResolvedFlag {
    pub fn new(
        name: impl Into<String>,
        schema: Schema,
        value: Value,
        variant: Option<String>,
        reason: ResolveReason,
    ) -> Self {
        Self {
            name: name.into(),
            schema,
            value,
            variant,
            reason,
            should_apply: AtomicBool::new(true),
        }
    }

    pub fn should_apply(&self) -> bool {
        self.should_apply.load(Ordering::Acquire)
    }

    /// True only for the first caller.
    fn take_apply(&self) -> bool {
        self.should_apply.swap(false, Ordering::AcqRel)
    }
}

/// Wire form of a resolved flag, shared by resolve responses and cache snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ResolvedFlagRecord {
    pub flag: String,
    #[serde(default)]
    pub variant: String,
    #[serde(default)]
    pub value: serde_json::Value,
    #[serde(default)]
    pub flag_schema: serde_json::Value,
    #[serde(default)]
    pub reason: ResolveReason,
    #[serde(default = "default_should_apply")]
    pub should_apply: bool,
}

fn default_should_apply() -> bool {
    true
}

impl ResolvedFlagRecord {
    pub(crate) fn into_flag(self) -> Result<ResolvedFlag> {
        let name = self
            .flag
            .strip_prefix(FLAG_PREFIX)
            .unwrap_or(&self.flag)
            .to_string();
        let schema = Schema::from_wire(&self.flag_schema).map_err(|e| {
            ConfidenceError::with_source(
                ErrorCode::InvalidResponse,
                format!("Invalid schema for flag '{}'", name),
                e,
            )
        })?;
        let flag = ResolvedFlag::new(
            name,
            schema,
            Value::from(self.value),
            Some(self.variant).filter(|v| !v.is_empty()),
            self.reason,
        );
        flag.should_apply.store(self.should_apply, Ordering::Release);
        Ok(flag)
    }

    fn from_flag(flag: &ResolvedFlag) -> Self {
        Self {
            flag: format!("{}{}", FLAG_PREFIX, flag.name),
            variant: flag.variant.clone().unwrap_or_default(),
            value: flag.value.to_json(),
            flag_schema: flag.schema.to_wire(),
            reason: flag.reason,
            should_apply: flag.should_apply(),
        }
    }
}

#[derive(Debug)]
enum Outcome {
    Ready {
        resolve_token: String,
        flags: HashMap<String, ResolvedFlag>,
    },
    Failed {
        code: ErrorCode,
        message: String,
    },
}

#[derive(Debug)]
struct ResolutionInner {
    context: Context,
    outcome: Outcome,
}

/// The flags resolved for one context, or the error that prevented it.
///
/// Cloning shares the same flags, including their apply state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(into = "ResolutionRecord", try_from = "ResolutionRecord")]
pub struct FlagResolution {
    inner: Arc<ResolutionInner>,
}

/// Reporting handle for a flag whose value was used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyTicket {
    pub resolve_token: String,
    pub flag: String,
}

/// Result of evaluating a flag path.
#[derive(Debug, Clone)]
pub struct FlagEvaluation<T> {
    pub value: T,
    pub variant: Option<String>,
    pub reason: ResolveReason,
    pub error_code: Option<ErrorCode>,
    pub error_message: Option<String>,
    pub(crate) apply_ticket: Option<ApplyTicket>,
}

impl<T> FlagEvaluation<T> {
    pub(crate) fn error(default: T, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            value: default,
            variant: None,
            reason: ResolveReason::Error,
            error_code: Some(code),
            error_message: Some(message.into()),
            apply_ticket: None,
        }
    }

    pub(crate) fn failed(default: T, error: ConfidenceError) -> Self {
        Self::error(default, error.code, error.message)
    }

    pub fn is_error(&self) -> bool {
        self.error_code.is_some()
    }

    pub fn apply_ticket(&self) -> Option<&ApplyTicket> {
        self.apply_ticket.as_ref()
    }
}

impl FlagResolution {
    pub fn ready(context: Context, resolve_token: impl Into<String>, flags: Vec<ResolvedFlag>) -> Self {
        Self {
            inner: Arc::new(ResolutionInner {
                context,
                outcome: Outcome::Ready {
                    resolve_token: resolve_token.into(),
                    flags: flags.into_iter().map(|f| (f.name.clone(), f)).collect(),
                },
            }),
        }
    }

    pub fn failed(context: Context, error: &ConfidenceError) -> Self {
        Self {
            inner: Arc::new(ResolutionInner {
                context,
                outcome: Outcome::Failed {
                    code: error.code,
                    message: error.message.clone(),
                },
            }),
        }
    }

    pub fn context(&self) -> &Context {
        &self.inner.context
    }

    pub fn resolve_token(&self) -> Option<&str> {
        match &self.inner.outcome {
            Outcome::Ready { resolve_token, .. } => Some(resolve_token),
            Outcome::Failed { .. } => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.inner.outcome, Outcome::Failed { .. })
    }

    pub fn error(&self) -> Option<(ErrorCode, &str)> {
        match &self.inner.outcome {
            Outcome::Failed { code, message } => Some((*code, message)),
            Outcome::Ready { .. } => None,
        }
    }

    pub fn flag(&self, name: &str) -> Option<&ResolvedFlag> {
        match &self.inner.outcome {
            Outcome::Ready { flags, .. } => flags.get(name),
            Outcome::Failed { .. } => None,
        }
    }

    pub fn flag_names(&self) -> Vec<&str> {
        match &self.inner.outcome {
            Outcome::Ready { flags, .. } => {
                let mut names: Vec<&str> = flags.keys().map(String::as_str).collect();
                names.sort_unstable();
                names
            }
            Outcome::Failed { .. } => Vec::new(),
        }
    }

    /// Evaluates `path` (`flag` or `flag.field.sub`), falling back to `default`.
    ///
    /// Never fails: problems are reported through the evaluation's reason and
    /// error code. A matched flag is marked as applied the first time one of
    /// its paths evaluates successfully.
    pub fn evaluate<T>(&self, path: &str, default: T) -> FlagEvaluation<T>
    where
        T: Clone + Into<Value> + TryFrom<Value>,
    {
        let (resolve_token, flags) = match &self.inner.outcome {
            Outcome::Failed { code, message } => {
                return FlagEvaluation::error(default, *code, message.clone())
            }
            Outcome::Ready {
                resolve_token,
                flags,
            } => (resolve_token, flags),
        };

        let mut segments = path.split('.');
        let flag_name = segments.next().unwrap_or_default();
        let sub_path: Vec<&str> = segments.collect();

        let Some(flag) = flags.get(flag_name) else {
            return FlagEvaluation::failed(default, ConfidenceError::flag_not_found(flag_name));
        };

        let ticket = |flag: &ResolvedFlag| {
            flag.take_apply().then(|| ApplyTicket {
                resolve_token: resolve_token.clone(),
                flag: flag.name.clone(),
            })
        };

        if flag.reason != ResolveReason::Match {
            let apply_ticket = if flag.reason == ResolveReason::NoSegmentMatch {
                ticket(flag)
            } else {
                None
            };
            return FlagEvaluation {
                value: default,
                variant: None,
                reason: flag.reason,
                error_code: None,
                error_message: None,
                apply_ticket,
            };
        }

        let schema = match flag.schema.get(&sub_path) {
            Ok(schema) => schema,
            Err(mismatch) => {
                return FlagEvaluation::failed(
                    default,
                    ConfidenceError::type_mismatch(mismatch.prefixed(&[flag_name])),
                )
            }
        };

        let default_value: Value = default.clone().into();
        if let Err(mismatch) = schema.assert_assignable(&default_value) {
            let mut prefix = vec!["defaultValue"];
            prefix.extend(sub_path.iter().copied());
            return FlagEvaluation::failed(
                default,
                ConfidenceError::type_mismatch(mismatch.prefixed(&prefix)),
            );
        }

        let resolved = flag
            .value
            .get_path(&sub_path)
            .cloned()
            .unwrap_or(Value::Undefined);

        let value = if resolved.is_undefined() {
            default
        } else {
            match T::try_from(resolved) {
                Ok(value) => value,
                Err(_) => {
                    return FlagEvaluation::error(
                        default,
                        ErrorCode::TypeMismatch,
                        format!("Value at {} does not convert to the requested type", path),
                    )
                }
            }
        };

        FlagEvaluation {
            value,
            variant: flag.variant.clone(),
            reason: ResolveReason::Match,
            error_code: None,
            error_message: None,
            apply_ticket: ticket(flag),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResolutionRecord {
    context: Context,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    resolve_token: Option<String>,
    #[serde(default)]
    resolved_flags: Vec<ResolvedFlagRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
}

impl From<FlagResolution> for ResolutionRecord {
    fn from(resolution: FlagResolution) -> Self {
        let context = resolution.inner.context.clone();
        match &resolution.inner.outcome {
            Outcome::Ready {
                resolve_token,
                flags,
            } => {
                let mut resolved_flags: Vec<_> = flags.values().map(ResolvedFlagRecord::from_flag).collect();
                resolved_flags.sort_by(|a, b| a.flag.cmp(&b.flag));
                ResolutionRecord {
                    context,
                    resolve_token: Some(resolve_token.clone()),
                    resolved_flags,
                    error_code: None,
                    error_message: None,
                }
            }
            Outcome::Failed { code, message } => ResolutionRecord {
                context,
                resolve_token: None,
                resolved_flags: Vec::new(),
                error_code: Some(*code),
                error_message: Some(message.clone()),
            },
        }
    }
}

impl TryFrom<ResolutionRecord> for FlagResolution {
    type Error = ConfidenceError;

    fn try_from(record: ResolutionRecord) -> Result<Self> {
        if let Some(code) = record.error_code {
            let error = ConfidenceError::new(code, record.error_message.unwrap_or_default());
            return Ok(FlagResolution::failed(record.context, &error));
        }
        let resolve_token = record.resolve_token.ok_or_else(|| {
            ConfidenceError::new(ErrorCode::CacheInvalidData, "Resolution without a resolve token")
        })?;
        let flags = record
            .resolved_flags
            .into_iter()
            .map(ResolvedFlagRecord::into_flag)
            .collect::<Result<Vec<_>>>()?;
        Ok(FlagResolution::ready(record.context, resolve_token, flags))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resolution() -> FlagResolution {
        let record: ResolvedFlagRecord = serde_json::from_value(json!({
            "flag": "flags/button",
            "variant": "flags/button/variants/red",
            "value": { "color": "red", "size": 4 },
            "flagSchema": { "schema": {
                "color": { "stringSchema": {} },
                "size": { "intSchema": {} }
            } },
            "reason": "RESOLVE_REASON_MATCH"
        }))
        .unwrap();
        FlagResolution::ready(Context::new(), "token-1", vec![record.into_flag().unwrap()])
    }

    #[test]
    fn test_reason_wire_names() {
        let reason: ResolveReason = serde_json::from_str("\"RESOLVE_REASON_FLAG_ARCHIVED\"").unwrap();
        assert_eq!(reason, ResolveReason::Archived);
        assert_eq!(
            serde_json::to_string(&ResolveReason::NoSegmentMatch).unwrap(),
            "\"RESOLVE_REASON_NO_SEGMENT_MATCH\""
        );
    }

    #[test]
    fn test_flag_prefix_stripped() {
        let resolution = resolution();
        assert_eq!(resolution.flag_names(), vec!["button"]);
        assert_eq!(
            resolution.flag("button").unwrap().variant.as_deref(),
            Some("flags/button/variants/red")
        );
    }

    #[test]
    fn test_evaluate_sub_path() {
        let evaluation = resolution().evaluate("button.size", 1i64);
        assert_eq!(evaluation.value, 4);
        assert_eq!(evaluation.reason, ResolveReason::Match);
        assert!(evaluation.apply_ticket().is_some());
    }

    #[test]
    fn test_failed_resolution_keeps_error_code() {
        let resolution = FlagResolution::failed(Context::new(), &ConfidenceError::timeout(std::time::Duration::from_secs(1)));
        let evaluation = resolution.evaluate("button.color", "blue".to_string());
        assert_eq!(evaluation.value, "blue");
        assert_eq!(evaluation.error_code, Some(ErrorCode::Timeout));
        assert_eq!(evaluation.reason, ResolveReason::Error);
    }

    #[test]
    fn test_serde_round_trip_keeps_apply_state() {
        let resolution = resolution();
        resolution.evaluate("button.color", String::new());

        let json = serde_json::to_value(&resolution).unwrap();
        assert_eq!(json["resolveToken"], "token-1");
        let restored: FlagResolution = serde_json::from_value(json).unwrap();
        assert!(!restored.flag("button").unwrap().should_apply());
        assert_eq!(restored.evaluate("button.color", String::new()).value, "red");
    }
}
