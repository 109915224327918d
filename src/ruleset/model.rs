use std::path::PathBuf;
use std::sync::Arc;

use http::{Method, StatusCode};
use regex::Regex;

use super::Disposition;
use super::hooks::CompiledHook;
use crate::ingress::request::ParsedRequest;

/// Immutable compiled rule set, built once at startup and shared read-only by
/// every runner.
#[derive(Debug, Clone)]
pub struct CompiledRuleSet {
    pub name: Arc<str>,
    pub inband: Vec<CompiledRule>,
    pub outofband: Vec<CompiledRule>,
    pub on_load: Vec<CompiledHook>,
    pub pre_eval: Vec<CompiledHook>,
    pub post_eval: Vec<CompiledHook>,
    pub on_match: Vec<CompiledHook>,
    pub default_disposition: Disposition,
    pub blocked_http_code: StatusCode,
    pub passed_http_code: StatusCode,
    pub max_body_size: usize,
    /// Directory rule primitives resolve external resources against.
    pub data_dir: PathBuf,
}

impl CompiledRuleSet {
    pub fn rules(&self, phase: super::Phase) -> &[CompiledRule] {
        match phase {
            super::Phase::InBand => &self.inband,
            super::Phase::OutOfBand => &self.outofband,
        }
    }
}

/// One compiled rule. A rule matches when every matcher it carries matches;
/// a rule with no matchers matches every request.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub name: Arc<str>,
    pub methods: MethodMask,
    pub path: Option<Regex>,
    pub headers: Vec<HeaderMatcher>,
    pub body: Option<Regex>,
    /// Disposition this rule contributes on match, already resolved against
    /// the rule set's default remediation.
    pub disposition: Disposition,
}

impl CompiledRule {
    pub fn matches(&self, request: &ParsedRequest) -> bool {
        if !self.methods.allows(&request.method) {
            return false;
        }
        if let Some(path) = &self.path
            && !path.is_match(&request.path)
        {
            return false;
        }
        for header in &self.headers {
            let matched = request
                .headers
                .get_all(&header.name)
                .any(|value| header.value.is_match(value));
            if !matched {
                return false;
            }
        }
        if let Some(body) = &self.body {
            let text = String::from_utf8_lossy(&request.body);
            if !body.is_match(&text) {
                return false;
            }
        }
        true
    }
}

/// Matches one request header: lookup is case-insensitive on the name, the
/// value is tested against a regex. Duplicate headers match if any value does.
#[derive(Debug, Clone)]
pub struct HeaderMatcher {
    pub name: String,
    pub value: Regex,
}

impl HeaderMatcher {
    pub fn new(name: &str, value: Regex) -> Self {
        Self {
            name: name.to_ascii_lowercase(),
            value,
        }
    }
}

/// Method restriction of one rule. An empty `methods:` list in the rule file
/// means the rule applies to every method, so that is the canonical
/// constructor input rather than a separate wildcard.
#[derive(Debug, Clone)]
pub enum MethodMask {
    Any,
    Listed { mask: u32, extras: Arc<[Method]> },
}

static REGISTERED_METHODS: [Method; 9] = [
    Method::GET,
    Method::POST,
    Method::PUT,
    Method::PATCH,
    Method::DELETE,
    Method::HEAD,
    Method::OPTIONS,
    Method::TRACE,
    Method::CONNECT,
];

impl MethodMask {
    pub fn from_methods(methods: &[Method]) -> Self {
        if methods.is_empty() {
            return MethodMask::Any;
        }
        let mut mask = 0u32;
        let mut extras: Vec<Method> = Vec::new();
        for method in methods {
            match registered_bit(method) {
                Some(bit) => mask |= bit,
                None if extras.contains(method) => {}
                None => extras.push(method.clone()),
            }
        }
        MethodMask::Listed {
            mask,
            extras: Arc::from(extras.into_boxed_slice()),
        }
    }

    pub fn allows(&self, method: &Method) -> bool {
        match self {
            MethodMask::Any => true,
            MethodMask::Listed { mask, extras } => match registered_bit(method) {
                Some(bit) => mask & bit != 0,
                None => extras.iter().any(|extra| extra == method),
            },
        }
    }
}

fn registered_bit(method: &Method) -> Option<u32> {
    REGISTERED_METHODS
        .iter()
        .position(|registered| registered == method)
        .map(|index| 1 << index)
}
