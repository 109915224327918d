use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail, ensure};
use http::{Method, StatusCode};
use regex::Regex;

use super::hooks::{CompiledHook, HookAction, HookFilter};
use super::loader::{RawHook, RawHookAction, RawRemediation, RawRule, RawRuleSet};
use super::model::{CompiledRule, CompiledRuleSet, HeaderMatcher, MethodMask};
use super::{Disposition, Phase};

const DEFAULT_MAX_BODY_SIZE: usize = 64 * 1024;

pub fn compile(raw: RawRuleSet, fallback_name: &str, data_dir: &Path) -> Result<CompiledRuleSet> {
    let name: Arc<str> = Arc::from(raw.name.as_deref().unwrap_or(fallback_name));

    let blocked_http_code = status_from_u16(raw.blocked_http_code.unwrap_or(403))
        .context("invalid blocked_http_code")?;
    let passed_http_code = status_from_u16(raw.passed_http_code.unwrap_or(200))
        .context("invalid passed_http_code")?;

    let default_disposition = match raw.default_remediation.unwrap_or(RawRemediation::Deny) {
        RawRemediation::Allow => Disposition::Allow,
        RawRemediation::Captcha => Disposition::Captcha,
        RawRemediation::Deny => Disposition::Deny,
        RawRemediation::Custom => bail!("default_remediation must not be 'custom'"),
    };

    let max_body_size = raw.max_body_size.unwrap_or(DEFAULT_MAX_BODY_SIZE);
    ensure!(max_body_size > 0, "max_body_size must be greater than 0");

    let mut seen_names = HashSet::new();
    let inband = compile_rules(
        &raw.inband_rules,
        &default_disposition,
        blocked_http_code,
        &mut seen_names,
    )
    .context("invalid inband_rules")?;
    let outofband = compile_rules(
        &raw.outofband_rules,
        &default_disposition,
        blocked_http_code,
        &mut seen_names,
    )
    .context("invalid outofband_rules")?;

    let on_load = compile_hooks(&raw.on_load).context("invalid on_load hooks")?;
    for hook in &on_load {
        ensure!(
            hook_filter_is_empty(&hook.filter),
            "on_load hooks do not support filters"
        );
    }
    let pre_eval = compile_hooks(&raw.pre_eval).context("invalid pre_eval hooks")?;
    let post_eval = compile_hooks(&raw.post_eval).context("invalid post_eval hooks")?;
    let on_match = compile_hooks(&raw.on_match).context("invalid on_match hooks")?;

    Ok(CompiledRuleSet {
        name,
        inband,
        outofband,
        on_load,
        pre_eval,
        post_eval,
        on_match,
        default_disposition,
        blocked_http_code,
        passed_http_code,
        max_body_size,
        data_dir: data_dir.to_path_buf(),
    })
}

impl CompiledRuleSet {
    /// Applies the OnLoad hook list. Called exactly once at startup, before
    /// the set is frozen behind an `Arc` and shared with the runners.
    pub fn process_on_load(mut self) -> Result<Self> {
        let hooks = std::mem::take(&mut self.on_load);
        for hook in &hooks {
            for action in &hook.actions {
                match action {
                    HookAction::DisableRule(rule_name) => {
                        let before = self.inband.len() + self.outofband.len();
                        self.inband.retain(|rule| rule.name.as_ref() != rule_name);
                        self.outofband.retain(|rule| rule.name.as_ref() != rule_name);
                        let after = self.inband.len() + self.outofband.len();
                        ensure!(
                            after < before,
                            "on_load disable_rule references unknown rule '{rule_name}'"
                        );
                    }
                    HookAction::SetStatus(status) => {
                        self.blocked_http_code = *status;
                    }
                    HookAction::SetDisposition(_) | HookAction::SetBody(_) => {
                        bail!("action not supported at on_load")
                    }
                }
            }
        }
        self.on_load = hooks;
        Ok(self)
    }
}

fn compile_rules(
    raw_rules: &[RawRule],
    default_disposition: &Disposition,
    blocked_http_code: StatusCode,
    seen_names: &mut HashSet<String>,
) -> Result<Vec<CompiledRule>> {
    let mut rules = Vec::with_capacity(raw_rules.len());
    for raw in raw_rules {
        ensure!(!raw.name.is_empty(), "rule name must not be empty");
        ensure!(
            seen_names.insert(raw.name.clone()),
            "duplicate rule name '{}'",
            raw.name
        );
        rules.push(
            compile_rule(raw, default_disposition, blocked_http_code)
                .with_context(|| format!("rule '{}'", raw.name))?,
        );
    }
    Ok(rules)
}

fn compile_rule(
    raw: &RawRule,
    default_disposition: &Disposition,
    blocked_http_code: StatusCode,
) -> Result<CompiledRule> {
    let mut methods = Vec::with_capacity(raw.methods.len());
    for method in &raw.methods {
        methods.push(parse_method(method)?);
    }

    let path = raw
        .path
        .as_deref()
        .map(|pattern| Regex::new(pattern).with_context(|| format!("invalid path regex '{pattern}'")))
        .transpose()?;

    let mut headers = Vec::with_capacity(raw.headers.len());
    for (header_name, pattern) in &raw.headers {
        let value = Regex::new(pattern)
            .with_context(|| format!("invalid regex for header '{header_name}'"))?;
        headers.push(HeaderMatcher::new(header_name, value));
    }

    let body = raw
        .body
        .as_deref()
        .map(|pattern| Regex::new(pattern).with_context(|| format!("invalid body regex '{pattern}'")))
        .transpose()?;

    let disposition = match raw.remediation {
        None => default_disposition.clone(),
        Some(RawRemediation::Allow) => Disposition::Allow,
        Some(RawRemediation::Captcha) => Disposition::Captcha,
        Some(RawRemediation::Deny) => Disposition::Deny,
        Some(RawRemediation::Custom) => {
            let status = raw
                .custom_status
                .map(status_from_u16)
                .transpose()
                .context("invalid custom_status")?
                .unwrap_or(blocked_http_code);
            Disposition::Custom {
                status,
                body: Arc::from(raw.custom_body.as_deref().unwrap_or_default()),
            }
        }
    };
    if raw.remediation != Some(RawRemediation::Custom) {
        ensure!(
            raw.custom_status.is_none() && raw.custom_body.is_none(),
            "custom_status/custom_body require remediation: custom"
        );
    }

    Ok(CompiledRule {
        name: Arc::from(raw.name.as_str()),
        methods: MethodMask::from_methods(&methods),
        path,
        headers,
        body,
        disposition,
    })
}

fn compile_hooks(raw_hooks: &[RawHook]) -> Result<Vec<CompiledHook>> {
    let mut hooks = Vec::with_capacity(raw_hooks.len());
    for raw in raw_hooks {
        ensure!(!raw.apply.is_empty(), "hook must have at least one action");
        let filter = match &raw.filter {
            None => HookFilter::default(),
            Some(raw_filter) => HookFilter {
                phase: raw_filter.phase.as_deref().map(parse_phase).transpose()?,
                method: raw_filter.method.as_deref().map(parse_method).transpose()?,
                rule_name: raw_filter.rule_name.as_deref().map(Arc::from),
                disposition: raw_filter
                    .disposition
                    .as_deref()
                    .map(parse_disposition_kind)
                    .transpose()?,
                path: raw_filter
                    .path
                    .as_deref()
                    .map(|pattern| {
                        Regex::new(pattern)
                            .with_context(|| format!("invalid filter path regex '{pattern}'"))
                    })
                    .transpose()?,
            },
        };
        let mut actions = Vec::with_capacity(raw.apply.len());
        for action in &raw.apply {
            actions.push(compile_action(action)?);
        }
        hooks.push(CompiledHook { filter, actions });
    }
    Ok(hooks)
}

fn compile_action(raw: &RawHookAction) -> Result<HookAction> {
    let set_fields = usize::from(raw.set_disposition.is_some())
        + usize::from(raw.set_status.is_some())
        + usize::from(raw.set_body.is_some())
        + usize::from(raw.disable_rule.is_some());
    ensure!(
        set_fields == 1,
        "hook action must set exactly one of set_disposition, set_status, set_body, disable_rule"
    );

    if let Some(disposition) = &raw.set_disposition {
        let disposition = match disposition.as_str() {
            "allow" => Disposition::Allow,
            "captcha" => Disposition::Captcha,
            "deny" => Disposition::Deny,
            "custom" => bail!("set_disposition: custom is not supported; use set_status/set_body"),
            other => bail!("unknown disposition '{other}'"),
        };
        return Ok(HookAction::SetDisposition(disposition));
    }
    if let Some(status) = raw.set_status {
        return Ok(HookAction::SetStatus(
            status_from_u16(status).context("invalid set_status")?,
        ));
    }
    if let Some(body) = &raw.set_body {
        return Ok(HookAction::SetBody(body.clone()));
    }
    if let Some(rule_name) = &raw.disable_rule {
        return Ok(HookAction::DisableRule(rule_name.clone()));
    }
    unreachable!("exactly one action field checked above")
}

fn hook_filter_is_empty(filter: &HookFilter) -> bool {
    filter.phase.is_none()
        && filter.method.is_none()
        && filter.rule_name.is_none()
        && filter.disposition.is_none()
        && filter.path.is_none()
}

fn parse_phase(value: &str) -> Result<Phase> {
    match value {
        "inband" => Ok(Phase::InBand),
        "outofband" => Ok(Phase::OutOfBand),
        other => bail!("unknown phase '{other}' (expected inband or outofband)"),
    }
}

fn parse_method(value: &str) -> Result<Method> {
    Method::from_bytes(value.to_ascii_uppercase().as_bytes())
        .with_context(|| format!("invalid method '{value}'"))
}

fn parse_disposition_kind(value: &str) -> Result<String> {
    match value {
        "allow" | "captcha" | "custom" | "deny" => Ok(value.to_string()),
        other => bail!("unknown disposition '{other}'"),
    }
}

fn status_from_u16(value: u16) -> Result<StatusCode> {
    StatusCode::from_u16(value).with_context(|| format!("invalid HTTP status {value}"))
}
