//! Bus topic names.

/// Agent announcement, published once after subscribing.
pub const DEA_HELLO: &str = "dea.start";
/// Stop instances matching a selector.
pub const DEA_STOP: &str = "dea.stop";
/// Agent-level status query.
pub const DEA_STATUS: &str = "dea.status";
/// Placement probe answered after the load-based delay.
pub const DEA_DISCOVER: &str = "dea.discover";
/// Per-instance lookup.
pub const DEA_FIND_DROPLET: &str = "dea.find.droplet";
/// URI remapping for a droplet.
pub const DEA_UPDATE: &str = "dea.update";
/// Periodic liveness report for every non-stopped instance.
pub const DEA_HEARTBEAT: &str = "dea.heartbeat";
/// Per-instance status query for running instances.
pub const DROPLET_STATUS: &str = "droplet.status";
/// Exactly one per instance that leaves Starting/Running.
pub const DROPLET_EXITED: &str = "droplet.exited";
/// Route registration.
pub const ROUTER_REGISTER: &str = "router.register";
/// Route removal.
pub const ROUTER_UNREGISTER: &str = "router.unregister";
/// Routers ask every agent to re-register its routes.
pub const ROUTER_START: &str = "router.start";
/// The health manager asks for an immediate heartbeat.
pub const HEALTHMANAGER_START: &str = "healthmanager.start";

/// Start commands are addressed to one agent.
pub fn dea_start(agent_id: &str) -> String {
    format!("dea.{agent_id}.start")
}
