use std::sync::Arc;

use http::StatusCode;

pub mod compile;
pub mod hooks;
pub mod loader;
pub mod model;

pub use loader::{load_by_name, load_by_path};
pub use model::{CompiledRule, CompiledRuleSet, MethodMask};

/// Evaluation phase of a request. The in-band verdict is returned to the
/// caller synchronously; the out-of-band verdict only feeds the event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    InBand,
    OutOfBand,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::InBand => "inband",
            Phase::OutOfBand => "outofband",
        }
    }
}

/// Phase-level outcome of evaluation.
///
/// Ordered by severity: `Allow < Captcha < Custom < Deny`. Within a phase the
/// disposition only escalates along this order; only an explicit override
/// hook may set it directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Allow,
    Captcha,
    Custom { status: StatusCode, body: Arc<str> },
    Deny,
}

impl Disposition {
    pub fn severity(&self) -> u8 {
        match self {
            Disposition::Allow => 0,
            Disposition::Captcha => 1,
            Disposition::Custom { .. } => 2,
            Disposition::Deny => 3,
        }
    }

    /// Discriminant name used by hook filters.
    pub fn kind(&self) -> &'static str {
        match self {
            Disposition::Allow => "allow",
            Disposition::Captcha => "captcha",
            Disposition::Custom { .. } => "custom",
            Disposition::Deny => "deny",
        }
    }

    /// The `action` field of the JSON response body. A custom disposition is
    /// reported as a denial with its own status code and body.
    pub fn action(&self) -> &'static str {
        match self {
            Disposition::Allow => "allow",
            Disposition::Captcha => "captcha",
            Disposition::Custom { .. } => "deny",
            Disposition::Deny => "deny",
        }
    }

    pub fn is_interrupt(&self) -> bool {
        !matches!(self, Disposition::Allow)
    }
}
