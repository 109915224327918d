pub mod codec;
pub mod handler;
pub mod request;
pub mod response;
pub mod server;

use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::auth::{AuthCache, AuthProbe};
use crate::ruleset::CompiledRuleSet;
use crate::settings::Settings;
use request::ParsedRequest;

/// Authentication plumbing shared by every handler task.
pub struct AuthState {
    pub cache: AuthCache,
    pub probe: AuthProbe,
    pub ttl: time::Duration,
}

/// Everything one ingress connection needs. Cloned per connection.
#[derive(Clone)]
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub ruleset: Arc<CompiledRuleSet>,
    pub auth: Arc<AuthState>,
    pub engine_name: Arc<str>,
    pub queue: mpsc::Sender<ParsedRequest>,
    pub shutdown: watch::Receiver<bool>,
}
