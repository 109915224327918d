use std::sync::Arc;

use http::StatusCode;

use crate::ingress::request::ParsedRequest;
use crate::ruleset::hooks::{HookAction, HookContext};
use crate::ruleset::{CompiledRuleSet, Disposition, Phase};

pub mod runner;

pub use runner::Runner;

/// Accumulated outcome of one evaluation phase.
#[derive(Debug, Clone)]
pub struct PhaseState {
    /// Matched rule names, ordered by match time.
    pub matched_rules: Vec<Arc<str>>,
    pub disposition: Disposition,
    pub interrupted: bool,
    pub status_override: Option<StatusCode>,
    pub body_override: Option<String>,
}

impl Default for PhaseState {
    fn default() -> Self {
        Self {
            matched_rules: Vec::new(),
            disposition: Disposition::Allow,
            interrupted: false,
            status_override: None,
            body_override: None,
        }
    }
}

impl PhaseState {
    /// Monotonic escalation: a later match never weakens an earlier one.
    pub fn escalate(&mut self, candidate: &Disposition) {
        if candidate.severity() > self.disposition.severity() {
            self.disposition = candidate.clone();
        }
    }

    /// Direct override, reserved for PreEval/PostEval hooks.
    pub fn override_disposition(&mut self, disposition: Disposition) {
        self.disposition = disposition;
    }
}

/// Per-request evaluation state, one sub-state per phase. Owned by the runner
/// processing the request; never shared.
#[derive(Debug, Clone, Default)]
pub struct EvaluationState {
    pub in_band: PhaseState,
    pub out_of_band: PhaseState,
}

impl EvaluationState {
    pub fn phase_mut(&mut self, phase: Phase) -> &mut PhaseState {
        match phase {
            Phase::InBand => &mut self.in_band,
            Phase::OutOfBand => &mut self.out_of_band,
        }
    }
}

/// Runner-affine view over the shared compiled rule set. The compiled rules
/// are immutable and shared; evaluation scratch lives here, one instance per
/// runner, so phases run without locks or deep copies.
#[derive(Debug)]
pub struct RuleEngineHandle {
    ruleset: Arc<CompiledRuleSet>,
    evaluations: u64,
    #[cfg(test)]
    pub(crate) panic_next: bool,
}

impl RuleEngineHandle {
    pub fn new(ruleset: Arc<CompiledRuleSet>) -> Self {
        Self {
            ruleset,
            evaluations: 0,
            #[cfg(test)]
            panic_next: false,
        }
    }

    pub fn ruleset(&self) -> &Arc<CompiledRuleSet> {
        &self.ruleset
    }

    /// Phase evaluations driven by this handle since startup.
    pub fn evaluations(&self) -> u64 {
        self.evaluations
    }

    /// Drives one phase: PreEval hooks, rules in declared order with OnMatch
    /// hooks, PostEval hooks. A PreEval hook that leaves the disposition
    /// non-`Allow` short-circuits the rule list.
    pub fn run_phase(&mut self, phase: Phase, request: &ParsedRequest, state: &mut EvaluationState) {
        self.evaluations += 1;
        #[cfg(test)]
        if self.panic_next {
            self.panic_next = false;
            panic!("injected rule primitive failure");
        }
        let ruleset = self.ruleset.clone();
        let phase_state = state.phase_mut(phase);

        for hook in &ruleset.pre_eval {
            let ctx = HookContext {
                phase,
                method: &request.method,
                path: &request.path,
                rule_name: None,
                disposition: &phase_state.disposition,
            };
            if hook.filter.matches(&ctx) {
                apply_state_actions(&hook.actions, phase_state);
            }
        }

        if phase_state.disposition == Disposition::Allow {
            for rule in ruleset.rules(phase) {
                if !rule.matches(request) {
                    continue;
                }
                let mut contribution = rule.disposition.clone();
                for hook in &ruleset.on_match {
                    let ctx = HookContext {
                        phase,
                        method: &request.method,
                        path: &request.path,
                        rule_name: Some(rule.name.as_ref()),
                        disposition: &contribution,
                    };
                    if hook.filter.matches(&ctx) {
                        for action in &hook.actions {
                            match action {
                                HookAction::SetDisposition(disposition) => {
                                    contribution = disposition.clone();
                                }
                                HookAction::SetStatus(status) => {
                                    phase_state.status_override = Some(*status);
                                }
                                HookAction::SetBody(body) => {
                                    phase_state.body_override = Some(body.clone());
                                }
                                HookAction::DisableRule(_) => {}
                            }
                        }
                    }
                }
                phase_state.matched_rules.push(rule.name.clone());
                phase_state.escalate(&contribution);
            }
        }

        for hook in &ruleset.post_eval {
            let ctx = HookContext {
                phase,
                method: &request.method,
                path: &request.path,
                rule_name: None,
                disposition: &phase_state.disposition,
            };
            if hook.filter.matches(&ctx) {
                apply_state_actions(&hook.actions, phase_state);
            }
        }

        phase_state.interrupted = phase_state.disposition.is_interrupt();
    }
}

/// PreEval/PostEval actions apply directly to the phase state; their
/// `set_disposition` is the explicit override allowed to weaken it.
fn apply_state_actions(actions: &[HookAction], state: &mut PhaseState) {
    for action in actions {
        match action {
            HookAction::SetDisposition(disposition) => {
                state.override_disposition(disposition.clone());
            }
            HookAction::SetStatus(status) => state.status_override = Some(*status),
            HookAction::SetBody(body) => state.body_override = Some(body.clone()),
            HookAction::DisableRule(_) => {}
        }
    }
}
