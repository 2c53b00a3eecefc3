//! Shared server state, wired once at startup and handed to every
//! connection task.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::ServerConfig;
use crate::connection_table::ConnectionTable;
use crate::coordinator::DeliveryCoordinator;
use crate::gateway::PersistenceGateway;
use crate::group_ledger::GroupKeyLedger;
use crate::push::{PushDispatcher, PushProvider};

pub struct ServerState {
    pub config: ServerConfig,
    pub gateway: Arc<dyn PersistenceGateway>,
    pub connections: Arc<ConnectionTable>,
    pub ledger: Arc<GroupKeyLedger>,
    pub coordinator: Arc<DeliveryCoordinator>,
    pub push: Arc<PushDispatcher>,
    pub started_at: Instant,
}

impl ServerState {
    pub fn new(
        config: ServerConfig,
        gateway: Arc<dyn PersistenceGateway>,
        providers: Vec<Arc<dyn PushProvider>>,
    ) -> Arc<Self> {
        let connections = Arc::new(ConnectionTable::new());
        let ledger = Arc::new(GroupKeyLedger::new(
            Arc::clone(&gateway),
            config.rotation.stale_after_ms,
        ));
        let push = Arc::new(PushDispatcher::new(
            Arc::clone(&gateway),
            providers,
            Duration::from_millis(config.push.rate_limit_ms),
            config.push.thread_pool_size,
        ));
        let coordinator = Arc::new(DeliveryCoordinator::new(
            Arc::clone(&gateway),
            Arc::clone(&connections),
            Arc::clone(&ledger),
            Arc::clone(&push),
        ));
        Arc::new(Self {
            config,
            gateway,
            connections,
            ledger,
            coordinator,
            push,
            started_at: Instant::now(),
        })
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
