//! API Surface Contracts: the typed boundary an external transport (GraphQL,
//! REST, whatever) would implement against. Plain traits only — no GraphQL
//! framework dependency, that transport is out of scope here.
//!
//! A typed boundary an external transport calls into, generalized from HTTP
//! handlers to trait methods so any transport can sit on top.

use async_trait::async_trait;

use crate::db::Db;
use crate::error::CoreResult;
use crate::model::{Device, Notification, Operation, Reading, Role, Rule, Sensor};

/// Read access to the Store's current and historical state, gated by role.
#[async_trait]
pub trait QueryApi {
    async fn sensors(&self, caller: Role) -> CoreResult<Vec<Sensor>>;
    async fn devices(&self, caller: Role) -> CoreResult<Vec<Device>>;
    async fn rules(&self, caller: Role) -> CoreResult<Vec<Rule>>;
    async fn readings(&self, caller: Role, sensor_id: &str, cursor: Option<&str>, limit: i64) -> CoreResult<(Vec<Reading>, Option<String>, i64)>;
    async fn notifications(&self, caller: Role, cursor: Option<&str>, limit: i64, unread_only: bool) -> CoreResult<(Vec<Notification>, Option<String>)>;
}

/// Mutations an external transport issues on behalf of an authenticated
/// caller. Every method is expected to check `caller.can(op)` before doing
/// anything — `require` below is the shared guard.
#[async_trait]
pub trait CommandApi {
    async fn create_rule(&self, caller: Role, rule: Rule) -> CoreResult<()>;
    async fn set_rule_enabled(&self, caller: Role, rule_id: &str, enabled: bool) -> CoreResult<()>;
    async fn trigger_rule(&self, caller: Role, rule_id: &str) -> CoreResult<()>;
    async fn mark_notification_read(&self, caller: Role, notification_id: &str) -> CoreResult<()>;
}

/// Guard a mutation against the caller's role before running `action`.
pub async fn require<T, F>(caller: Role, op: Operation, action: F) -> CoreResult<T>
where
    F: std::future::Future<Output = CoreResult<T>> + Send,
{
    if !caller.can(op) {
        return Err(crate::error::CoreError::AuthorizationDenied(format!("{caller:?} cannot perform {op:?}")));
    }
    action.await
}

/// The default implementation backing `QueryApi`/`CommandApi` against the
/// Store directly — a transport crate can wrap this instead of reaching
/// into `Db` itself.
pub struct CoreApi {
    db: Db,
}

impl CoreApi {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

#[async_trait]
impl QueryApi for CoreApi {
    async fn sensors(&self, caller: Role) -> CoreResult<Vec<Sensor>> {
        require(caller, Operation::ReadAll, self.db.list_sensors()).await
    }

    async fn devices(&self, caller: Role) -> CoreResult<Vec<Device>> {
        require(caller, Operation::ReadAll, self.db.list_devices()).await
    }

    async fn rules(&self, caller: Role) -> CoreResult<Vec<Rule>> {
        require(caller, Operation::ReadAll, self.db.list_enabled_rules()).await
    }

    async fn readings(&self, caller: Role, sensor_id: &str, cursor: Option<&str>, limit: i64) -> CoreResult<(Vec<Reading>, Option<String>, i64)> {
        require(caller, Operation::ReadAll, self.db.list_readings(sensor_id, cursor, limit)).await
    }

    async fn notifications(&self, caller: Role, cursor: Option<&str>, limit: i64, unread_only: bool) -> CoreResult<(Vec<Notification>, Option<String>)> {
        require(caller, Operation::ReadAll, self.db.list_notifications(cursor, limit, unread_only)).await
    }
}

#[async_trait]
impl CommandApi for CoreApi {
    async fn create_rule(&self, caller: Role, rule: Rule) -> CoreResult<()> {
        require(caller, Operation::ManageRules, async { self.db.create_rule(&rule).await }).await
    }

    async fn set_rule_enabled(&self, caller: Role, rule_id: &str, enabled: bool) -> CoreResult<()> {
        require(caller, Operation::ManageRules, self.db.set_rule_enabled(rule_id, enabled)).await
    }

    async fn trigger_rule(&self, caller: Role, _rule_id: &str) -> CoreResult<()> {
        // Dispatching an actual trigger needs the live RulesEngine, which
        // CoreApi doesn't hold — a transport wires this to
        // `RulesEngine::trigger_manually` directly instead of through here.
        require(caller, Operation::ManageRules, async { Ok(()) }).await
    }

    async fn mark_notification_read(&self, caller: Role, notification_id: &str) -> CoreResult<()> {
        require(caller, Operation::ReadAll, self.db.mark_notification_read(notification_id)).await
    }
}
