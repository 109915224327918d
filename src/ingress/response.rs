use http::StatusCode;
use serde_json::{Value, json};

use crate::engine::PhaseState;
use crate::ruleset::{CompiledRuleSet, Disposition};

/// Payload of the per-request reply channel: what the ingress handler writes
/// back to the forwarding front-end.
#[derive(Debug)]
pub struct InBandVerdict {
    pub status: StatusCode,
    pub body: Value,
    pub interrupt: bool,
}

/// Composes the in-band verdict from the finished phase state.
pub fn render_in_band(state: &PhaseState, ruleset: &CompiledRuleSet) -> InBandVerdict {
    let mut status = match &state.disposition {
        Disposition::Allow => ruleset.passed_http_code,
        Disposition::Captcha | Disposition::Deny => ruleset.blocked_http_code,
        Disposition::Custom { status, .. } => *status,
    };
    if let Some(override_status) = state.status_override {
        status = override_status;
    }

    let mut body = json!({ "action": state.disposition.action() });
    let body_text = state.body_override.as_deref().or(match &state.disposition {
        Disposition::Custom { body, .. } if !body.is_empty() => Some(body.as_ref()),
        _ => None,
    });
    if let Some(text) = body_text {
        body["body"] = json!(text);
    }

    InBandVerdict {
        status,
        body,
        interrupt: state.interrupted,
    }
}

/// Verdict synthesized when a rule primitive panics during the in-band phase:
/// the request is let through with a 500 so the handler never blocks.
pub fn panic_verdict() -> InBandVerdict {
    InBandVerdict {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        body: json!({ "action": "allow" }),
        interrupt: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ruleset::compile::compile;
    use crate::ruleset::loader::RawRuleSet;
    use std::path::Path;
    use std::sync::Arc;

    fn ruleset(yaml: &str) -> CompiledRuleSet {
        let raw: RawRuleSet = serde_yaml::from_str(yaml).expect("parse raw rule set");
        compile(raw, "test", Path::new(".")).expect("compile")
    }

    #[test]
    fn allow_renders_passed_code() {
        let state = PhaseState::default();
        let verdict = render_in_band(&state, &ruleset("{}"));
        assert_eq!(verdict.status, StatusCode::OK);
        assert_eq!(verdict.body, serde_json::json!({"action": "allow"}));
        assert!(!verdict.interrupt);
    }

    #[test]
    fn deny_renders_blocked_code() {
        let mut state = PhaseState::default();
        state.override_disposition(Disposition::Deny);
        state.interrupted = true;
        let verdict = render_in_band(&state, &ruleset("{}"));
        assert_eq!(verdict.status, StatusCode::FORBIDDEN);
        assert_eq!(verdict.body, serde_json::json!({"action": "deny"}));
        assert!(verdict.interrupt);
    }

    #[test]
    fn captcha_keeps_blocked_code_with_its_own_action() {
        let mut state = PhaseState::default();
        state.override_disposition(Disposition::Captcha);
        state.interrupted = true;
        let verdict = render_in_band(&state, &ruleset("blocked_http_code: 401\n"));
        assert_eq!(verdict.status, StatusCode::UNAUTHORIZED);
        assert_eq!(verdict.body["action"], "captcha");
    }

    #[test]
    fn custom_carries_status_and_body() {
        let mut state = PhaseState::default();
        state.override_disposition(Disposition::Custom {
            status: StatusCode::IM_A_TEAPOT,
            body: Arc::from("short and stout"),
        });
        state.interrupted = true;
        let verdict = render_in_band(&state, &ruleset("{}"));
        assert_eq!(verdict.status, StatusCode::IM_A_TEAPOT);
        assert_eq!(verdict.body["action"], "deny");
        assert_eq!(verdict.body["body"], "short and stout");
    }

    #[test]
    fn overrides_win_over_disposition_defaults() {
        let mut state = PhaseState::default();
        state.override_disposition(Disposition::Deny);
        state.status_override = Some(StatusCode::FOUND);
        state.body_override = Some("redirected".to_string());
        let verdict = render_in_band(&state, &ruleset("{}"));
        assert_eq!(verdict.status, StatusCode::FOUND);
        assert_eq!(verdict.body["body"], "redirected");
    }

    #[test]
    fn panic_verdict_allows_with_500() {
        let verdict = panic_verdict();
        assert_eq!(verdict.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(verdict.body["action"], "allow");
        assert!(!verdict.interrupt);
    }
}
