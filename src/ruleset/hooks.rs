use std::sync::Arc;

use http::{Method, StatusCode};
use regex::Regex;

use super::{Disposition, Phase};

/// One compiled hook: a conjunctive filter plus the actions applied when the
/// filter matches. Hooks run in declaration order at their hook point.
#[derive(Debug, Clone)]
pub struct CompiledHook {
    pub filter: HookFilter,
    pub actions: Vec<HookAction>,
}

/// Filter fields are ANDed; an absent field matches anything. An empty filter
/// therefore fires on every evaluation at its hook point.
#[derive(Debug, Clone, Default)]
pub struct HookFilter {
    pub phase: Option<Phase>,
    pub method: Option<Method>,
    pub rule_name: Option<Arc<str>>,
    pub disposition: Option<String>,
    pub path: Option<Regex>,
}

/// Evaluation context a hook filter is tested against. `rule_name` is only
/// present at the OnMatch point.
#[derive(Debug)]
pub struct HookContext<'a> {
    pub phase: Phase,
    pub method: &'a Method,
    pub path: &'a str,
    pub rule_name: Option<&'a str>,
    pub disposition: &'a Disposition,
}

impl HookFilter {
    pub fn matches(&self, ctx: &HookContext<'_>) -> bool {
        if let Some(phase) = self.phase
            && phase != ctx.phase
        {
            return false;
        }
        if let Some(method) = &self.method
            && method != ctx.method
        {
            return false;
        }
        if let Some(rule_name) = &self.rule_name {
            match ctx.rule_name {
                Some(name) if name == rule_name.as_ref() => {}
                _ => return false,
            }
        }
        if let Some(disposition) = &self.disposition
            && disposition != ctx.disposition.kind()
        {
            return false;
        }
        if let Some(path) = &self.path
            && !path.is_match(ctx.path)
        {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone)]
pub enum HookAction {
    /// Replace the disposition. At PreEval and PostEval this is a direct
    /// override and may weaken it; at OnMatch it replaces the matched rule's
    /// contribution before the monotonic escalation.
    SetDisposition(Disposition),
    /// Override the HTTP status of the phase verdict.
    SetStatus(StatusCode),
    /// Override the user-visible response body.
    SetBody(String),
    /// Remove a rule from the set. Only honored at the OnLoad point.
    DisableRule(String),
}
