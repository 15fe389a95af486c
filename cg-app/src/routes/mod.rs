pub mod agent_card;
pub mod bindings;
pub mod health;

use axum::Router;

pub fn router() -> Router {
    Router::new()
        .merge(health::router())
        .merge(agent_card::router())
        .merge(bindings::router())
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::audit::{AuditSink, MemoryAuditSink};
    use crate::binder::UserBinder;
    use crate::chain::SecurityChain;
    use crate::config::{FilterConfig, RolesConfig, SecurityConfig};
    use crate::filter::ResponseFilter;
    use crate::gateway::CommandGateway;
    use crate::ratelimit::RateLimiter;
    use crate::server::GatewayState;
    use crate::store::GatewayStore;
    use cg_channels::{ChannelAdapter, Classification, EnvironmentMode, InternalChatAdapter};
    use cg_exec::{CommandCatalog, CommandCategory, CommandRunner, CommandSpec};
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    pub fn state() -> Arc<GatewayState> {
        let adapter = Arc::new(InternalChatAdapter::new(
            "/internal-webhook",
            Classification::Restricted,
        ));
        let store = Arc::new(GatewayStore::open_in_memory().expect("store"));
        let binder = Arc::new(UserBinder::new(store.clone()));
        let audit = Arc::new(MemoryAuditSink::default()) as Arc<dyn AuditSink>;
        let chain = SecurityChain::new(
            binder.clone(),
            Arc::new(RateLimiter::new(10, 100, Duration::from_secs(60))),
            audit.clone(),
            &SecurityConfig::default(),
            RolesConfig::default(),
        );
        let mut adapters: HashMap<String, Arc<dyn ChannelAdapter>> = HashMap::new();
        adapters.insert("internal".to_string(), adapter);
        let catalog = CommandCatalog::new(vec![CommandSpec {
            name: "platform-status".to_string(),
            program: "/bin/echo".to_string(),
            category: CommandCategory::Read,
            max_classification: Classification::Internal,
            channels: Vec::new(),
            requires_confirmation: false,
            sensitive_domain: None,
            args: Vec::new(),
        }]);
        let gateway = Arc::new(CommandGateway::new(
            adapters,
            catalog,
            chain,
            CommandRunner::new(Duration::from_secs(10), vec!["PATH".to_string()]),
            ResponseFilter::new(&FilterConfig::default()),
            binder,
            store,
            audit,
            15,
        ));
        Arc::new(GatewayState {
            gateway,
            instance_name: "cmdgate-test".to_string(),
            environment_mode: EnvironmentMode::Connected,
            started_at: Instant::now(),
            challenge_ttl_minutes: 15,
        })
    }
}
