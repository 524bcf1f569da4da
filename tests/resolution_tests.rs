use confidence::{
    ConfidenceError, Context, ErrorCode, FlagResolution, ResolveReason, Value,
};
use serde_json::json;
use std::collections::BTreeMap;

/// Builds a resolution the way it would come back from the resolver.
fn resolution(flags: serde_json::Value) -> FlagResolution {
    serde_json::from_value(json!({
        "context": { "targeting_key": "user-1" },
        "resolveToken": "token-1",
        "resolvedFlags": flags,
    }))
    .unwrap()
}

fn button() -> FlagResolution {
    resolution(json!([{
        "flag": "flags/button",
        "variant": "flags/button/variants/big",
        "value": {
            "enabled": true,
            "size": 12,
            "label": null,
            "style": { "color": "red", "ratio": 0.5 }
        },
        "flagSchema": { "schema": {
            "enabled": { "boolSchema": {} },
            "size": { "intSchema": {} },
            "label": { "stringSchema": {} },
            "style": { "structSchema": { "schema": {
                "color": { "stringSchema": {} },
                "ratio": { "doubleSchema": {} }
            } } }
        } },
        "reason": "RESOLVE_REASON_MATCH"
    }]))
}

mod match_tests {
    use super::*;

    #[test]
    fn test_evaluates_typed_leaf_values() {
        let resolution = button();

        let enabled = resolution.evaluate("button.enabled", false);
        assert!(enabled.value);
        assert_eq!(enabled.reason, ResolveReason::Match);
        assert_eq!(enabled.variant.as_deref(), Some("flags/button/variants/big"));
        assert!(!enabled.is_error());

        assert_eq!(resolution.evaluate("button.size", 0i64).value, 12);
        assert_eq!(resolution.evaluate("button.style.ratio", 1.0).value, 0.5);
        assert_eq!(resolution.evaluate("button.style.color", String::new()).value, "red");
    }

    #[test]
    fn test_evaluates_whole_struct() {
        let resolution = button();
        let style = resolution.evaluate("button.style", BTreeMap::<String, Value>::new());

        assert_eq!(style.value.get("color"), Some(&Value::from("red")));
        assert_eq!(style.reason, ResolveReason::Match);
    }

    #[test]
    fn test_partial_struct_default_is_assignable() {
        let resolution = button();
        let default = Value::from(BTreeMap::from([("color".to_string(), Value::from("blue"))]));
        let style = resolution.evaluate("button.style", default);

        assert!(!style.is_error());
        assert_eq!(style.value.get_path(&["ratio"]), Some(&Value::Number(0.5)));
    }

    #[test]
    fn test_null_value_yields_default_with_match() {
        let resolution = button();
        let label = resolution.evaluate("button.label", "fallback".to_string());

        assert_eq!(label.value, "fallback");
        assert_eq!(label.reason, ResolveReason::Match);
        assert_eq!(label.variant.as_deref(), Some("flags/button/variants/big"));
        assert!(!label.is_error());
    }

    #[test]
    fn test_first_match_carries_apply_ticket() {
        let resolution = button();

        let first = resolution.evaluate("button.enabled", false);
        let ticket = first.apply_ticket().unwrap();
        assert_eq!(ticket.resolve_token, "token-1");
        assert_eq!(ticket.flag, "button");

        assert!(resolution.evaluate("button.size", 0i64).apply_ticket().is_none());
        assert!(!resolution.flag("button").unwrap().should_apply());
    }

    #[test]
    fn test_clones_share_apply_state() {
        let resolution = button();
        let clone = resolution.clone();

        assert!(clone.evaluate("button.enabled", false).apply_ticket().is_some());
        assert!(resolution.evaluate("button.enabled", false).apply_ticket().is_none());
    }
}

mod defaulting_tests {
    use super::*;

    fn with_reason(reason: &str) -> FlagResolution {
        resolution(json!([{
            "flag": "flags/f",
            "variant": "",
            "value": null,
            "flagSchema": null,
            "reason": reason
        }]))
    }

    #[test]
    fn test_no_segment_match_returns_default_without_error() {
        let resolution = with_reason("RESOLVE_REASON_NO_SEGMENT_MATCH");
        let evaluation = resolution.evaluate("f.sub", "X".to_string());

        assert_eq!(evaluation.value, "X");
        assert_eq!(evaluation.reason, ResolveReason::NoSegmentMatch);
        assert_eq!(evaluation.error_code, None);
        assert_eq!(evaluation.variant, None);
    }

    #[test]
    fn test_no_segment_match_is_applied_once() {
        let resolution = with_reason("RESOLVE_REASON_NO_SEGMENT_MATCH");

        assert!(resolution.evaluate("f", false).apply_ticket().is_some());
        assert!(resolution.evaluate("f", false).apply_ticket().is_none());
    }

    #[test]
    fn test_other_reasons_are_not_applied() {
        for reason in [
            "RESOLVE_REASON_NO_TREATMENT_MATCH",
            "RESOLVE_REASON_FLAG_ARCHIVED",
            "RESOLVE_REASON_TARGETING_KEY_ERROR",
        ] {
            let evaluation = with_reason(reason).evaluate("f", 3i64);
            assert_eq!(evaluation.value, 3);
            assert!(evaluation.apply_ticket().is_none());
            assert!(!evaluation.is_error());
        }
    }

    #[test]
    fn test_archived_reason() {
        let evaluation = with_reason("RESOLVE_REASON_FLAG_ARCHIVED").evaluate("f", true);
        assert_eq!(evaluation.reason, ResolveReason::Archived);
    }
}

mod error_tests {
    use super::*;

    #[test]
    fn test_missing_flag() {
        let evaluation = button().evaluate("missing.enabled", true);

        assert!(evaluation.value);
        assert_eq!(evaluation.reason, ResolveReason::Error);
        assert_eq!(evaluation.error_code, Some(ErrorCode::FlagNotFound));
    }

    #[test]
    fn test_default_type_mismatch_reports_default_path() {
        let resolution = resolution(json!([{
            "flag": "flags/f",
            "variant": "flags/f/variants/a",
            "value": { "bool": true },
            "flagSchema": { "schema": { "bool": { "boolSchema": {} } } },
            "reason": "RESOLVE_REASON_MATCH"
        }]));
        let evaluation = resolution.evaluate("f.bool", "str".to_string());

        assert_eq!(evaluation.value, "str");
        assert_eq!(evaluation.reason, ResolveReason::Error);
        assert_eq!(evaluation.error_code, Some(ErrorCode::TypeMismatch));
        assert!(evaluation.error_message.unwrap().contains("defaultValue.bool"));
        assert!(resolution.flag("f").unwrap().should_apply());
    }

    #[test]
    fn test_missing_schema_step_reports_path() {
        let evaluation = button().evaluate("button.style.shade", String::new());

        assert_eq!(evaluation.error_code, Some(ErrorCode::TypeMismatch));
        assert!(evaluation.error_message.unwrap().contains("button.style.shade"));
    }

    #[test]
    fn test_navigating_into_leaf_is_mismatch() {
        let evaluation = button().evaluate("button.size.value", 0i64);
        assert_eq!(evaluation.error_code, Some(ErrorCode::TypeMismatch));
    }

    #[test]
    fn test_fractional_default_for_integer_schema() {
        let evaluation = button().evaluate("button.size", 1.5);

        assert_eq!(evaluation.value, 1.5);
        assert_eq!(evaluation.error_code, Some(ErrorCode::TypeMismatch));
    }

    #[test]
    fn test_extra_struct_key_in_default() {
        let default = Value::from(BTreeMap::from([("shade".to_string(), Value::from("dark"))]));
        let evaluation = button().evaluate("button.style", default);

        assert_eq!(evaluation.error_code, Some(ErrorCode::TypeMismatch));
        assert!(evaluation.error_message.unwrap().contains("defaultValue.style.shade"));
    }

    #[test]
    fn test_failed_resolution_returns_defaults() {
        let resolution = FlagResolution::failed(
            Context::with_targeting_key("user-1"),
            &ConfidenceError::network_error("unreachable"),
        );
        let evaluation = resolution.evaluate("button.enabled", true);

        assert!(evaluation.value);
        assert_eq!(evaluation.reason, ResolveReason::Error);
        assert_eq!(evaluation.error_code, Some(ErrorCode::NetworkError));
        assert!(resolution.is_failed());
        assert_eq!(resolution.resolve_token(), None);
    }
}

mod serde_tests {
    use super::*;

    #[test]
    fn test_failed_resolution_round_trip() {
        let failed = FlagResolution::failed(Context::new(), &ConfidenceError::superseded());
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["errorCode"], "SUPERSEDED");

        let restored: FlagResolution = serde_json::from_value(json).unwrap();
        assert_eq!(restored.error().map(|(code, _)| code), Some(ErrorCode::Superseded));
    }

    #[test]
    fn test_missing_token_is_invalid() {
        let result: Result<FlagResolution, _> = serde_json::from_value(json!({
            "context": {},
            "resolvedFlags": []
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_context_survives_round_trip() {
        let resolution = button();
        let restored: FlagResolution =
            serde_json::from_value(serde_json::to_value(&resolution).unwrap()).unwrap();

        assert_eq!(restored.context(), &Context::with_targeting_key("user-1"));
        assert_eq!(restored.flag_names(), vec!["button"]);
    }
}
