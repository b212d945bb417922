//! Network domain: bridge membership, VLAN tags, MTU, link state and
//! addresses of host interfaces, plus the System singleton.
//!
//! Every step is an idempotent set/replace, so a row is re-applied in full
//! on each store change. Bridge and port creation are guarded by
//! `br-exists`/`port-to-br` queries so an already attached interface is never
//! touched again.

use std::sync::Arc;

use async_trait::async_trait;
use edge_reconcile::{Domain, Snapshot, SyncReport};
use edge_schema::{decode_row, InterfaceSpec, SystemSettings, TableRow};
use edge_store::StoreClient;
use tracing::{debug, info, warn};

use crate::command::{run_checked, CommandError, CommandRunner, CommandSpec};
use crate::system::SystemApplier;

/// Tables consumed by the network domain.
pub const NETWORK_TABLES: &[&str] = &["System", "Interface"];

/// `ovs-vsctl br-exists` exit status for a missing bridge.
const BR_MISSING: i32 = 2;

pub struct NetworkReconciler {
    runner: Arc<dyn CommandRunner>,
    bridge: String,
    system: SystemApplier,
}

impl NetworkReconciler {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        bridge: impl Into<String>,
        system: SystemApplier,
    ) -> Self {
        Self {
            runner,
            bridge: bridge.into(),
            system,
        }
    }

    pub fn bridge(&self) -> &str {
        &self.bridge
    }

    async fn run(&self, cmd: CommandSpec) -> Result<(), CommandError> {
        run_checked(self.runner.as_ref(), &cmd).await.map(|_| ())
    }

    /// Create the bridge unless it already exists.
    pub async fn ensure_bridge(&self) -> Result<(), CommandError> {
        let probe = self
            .runner
            .run(&ovs_vsctl().args(["br-exists", self.bridge.as_str()]))
            .await;
        if probe.success() {
            return Ok(());
        }
        if probe.code != Some(BR_MISSING) {
            debug!(bridge = %self.bridge, output = %probe.output.trim(), "br-exists probe failed");
        }

        info!(bridge = %self.bridge, "Creating bridge");
        self.run(ovs_vsctl().args(["--may-exist", "add-br", self.bridge.as_str()]))
            .await
    }

    async fn ensure_port(&self, name: &str) -> Result<(), CommandError> {
        let owner = self.runner.run(&ovs_vsctl().args(["port-to-br", name])).await;
        if owner.success() && owner.lines().any(|line| line == self.bridge) {
            return Ok(());
        }

        info!(interface = name, bridge = %self.bridge, "Attaching interface to bridge");
        self.run(ovs_vsctl().args(["--may-exist", "add-port", self.bridge.as_str(), name]))
            .await
    }

    /// Apply one interface row. Every step is attempted; failures are
    /// returned together.
    pub async fn apply_interface(&self, iface: &InterfaceSpec) -> Vec<CommandError> {
        let name = iface.name.as_str();
        let mut errors = Vec::new();
        let mut step = |result: Result<(), CommandError>| {
            if let Err(e) = result {
                warn!(interface = name, error = %e, "Interface step failed");
                errors.push(e);
            }
        };

        if name != self.bridge {
            step(self.ensure_port(name).await);
            if let Some(vlan) = iface.vlan {
                step(
                    self.run(ovs_vsctl().args(["set", "port", name]).arg(format!("tag={vlan}")))
                        .await,
                );
            }
        }

        if let Some(mtu) = iface.mtu.filter(|mtu| *mtu > 0) {
            step(
                self.run(ip().args(["link", "set", "dev", name, "mtu"]).arg(mtu.to_string()))
                    .await,
            );
        }

        if let Some(state) = iface.state {
            step(
                self.run(ip().args(["link", "set", "dev", name, state.as_str()]))
                    .await,
            );
        }

        if let Some(addr) = iface.ip.as_deref().map(str::trim).filter(|a| !a.is_empty()) {
            step(self.run(ip().args(["addr", "replace", addr, "dev", name])).await);
        }

        errors
    }
}

/// Decode the System row. An unusable `logging_level` only drops the level;
/// hostname and timezone still apply.
fn system_settings(snapshot: &Snapshot, report: &mut SyncReport) -> Option<SystemSettings> {
    let row = snapshot.table(SystemSettings::TABLE)?.first()?;
    let error = match decode_row::<SystemSettings>(&row.fields) {
        Ok(settings) => return Some(settings),
        Err(e) => e,
    };

    let mut fields = row.fields.clone();
    fields.remove("logging_level");
    match decode_row::<SystemSettings>(&fields) {
        Ok(settings) => {
            warn!(error = %error, "Ignoring invalid logging_level");
            report.record_skipped("System.logging_level", error);
            Some(settings)
        }
        Err(_) => {
            warn!(error = %error, "Skipping invalid System row");
            report.record_skipped(SystemSettings::TABLE, error);
            None
        }
    }
}

fn ovs_vsctl() -> CommandSpec {
    CommandSpec::new("ovs-vsctl")
}

fn ip() -> CommandSpec {
    CommandSpec::new("ip")
}

#[async_trait]
impl Domain for NetworkReconciler {
    fn name(&self) -> &'static str {
        "network"
    }

    fn tables(&self) -> &'static [&'static str] {
        NETWORK_TABLES
    }

    async fn sync(&mut self, snapshot: &Snapshot, _store: &mut dyn StoreClient) -> SyncReport {
        let mut report = SyncReport::new();

        if let Some(system) = system_settings(snapshot, &mut report) {
            self.system.apply(&system, &mut report).await;
        }

        let interfaces = snapshot.typed::<InterfaceSpec>();
        if interfaces.is_empty() {
            return report;
        }

        if let Err(e) = self.ensure_bridge().await {
            warn!(bridge = %self.bridge, error = %e, "Failed to ensure bridge");
            report.record_failure(self.bridge.clone(), e);
        }

        for row in interfaces {
            let errors = self.apply_interface(&row.value).await;
            if errors.is_empty() {
                report.record_applied();
            }
            for e in errors {
                report.record_failure(row.key.clone(), e);
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandOutput, RecordingRunner};
    use edge_schema::LinkState;

    fn reconciler(runner: Arc<RecordingRunner>) -> NetworkReconciler {
        let system = SystemApplier::new(runner.clone(), "/nonexistent/timezone");
        NetworkReconciler::new(runner, "br0", system)
    }

    fn eth0() -> InterfaceSpec {
        InterfaceSpec {
            name: "eth0".to_string(),
            ip: Some("10.0.0.5/24".to_string()),
            state: Some(LinkState::Up),
            mtu: Some(9000),
            vlan: Some(100),
        }
    }

    #[tokio::test]
    async fn test_full_interface_commands() {
        let runner = Arc::new(RecordingRunner::with_handler(|cmd| {
            (cmd.arguments().first().map(String::as_str) == Some("port-to-br"))
                .then(|| CommandOutput::failed(1, "no port named eth0"))
        }));
        let net = reconciler(runner.clone());

        assert!(net.apply_interface(&eth0()).await.is_empty());
        assert_eq!(
            runner.rendered(),
            vec![
                "ovs-vsctl port-to-br eth0",
                "ovs-vsctl --may-exist add-port br0 eth0",
                "ovs-vsctl set port eth0 tag=100",
                "ip link set dev eth0 mtu 9000",
                "ip link set dev eth0 up",
                "ip addr replace 10.0.0.5/24 dev eth0",
            ]
        );
    }

    #[tokio::test]
    async fn test_bridge_row_is_not_attached_to_itself() {
        let runner = Arc::new(RecordingRunner::new());
        let net = reconciler(runner.clone());

        let br = InterfaceSpec {
            name: "br0".to_string(),
            state: Some(LinkState::Up),
            ..Default::default()
        };
        net.apply_interface(&br).await;
        assert_eq!(runner.rendered(), vec!["ip link set dev br0 up"]);
    }

    #[tokio::test]
    async fn test_failed_step_does_not_stop_later_steps() {
        let runner = Arc::new(RecordingRunner::with_handler(|cmd| {
            cmd.arguments()
                .contains(&"mtu".to_string())
                .then(|| CommandOutput::failed(2, "RTNETLINK answers: Invalid argument"))
        }));
        let net = reconciler(runner.clone());

        let errors = net.apply_interface(&eth0()).await;
        assert_eq!(errors.len(), 1);
        assert!(errors[0].output.contains("Invalid argument"));
        assert_eq!(runner.count_prefix("ip addr replace"), 1);
    }

    #[tokio::test]
    async fn test_existing_bridge_not_recreated() {
        let runner = Arc::new(RecordingRunner::new());
        let net = reconciler(runner.clone());
        net.ensure_bridge().await.unwrap();
        assert_eq!(runner.rendered(), vec!["ovs-vsctl br-exists br0"]);
    }

    #[tokio::test]
    async fn test_missing_bridge_created() {
        let runner = Arc::new(RecordingRunner::with_handler(|cmd| {
            (cmd.arguments().first().map(String::as_str) == Some("br-exists"))
                .then(|| CommandOutput::failed(2, ""))
        }));
        let net = reconciler(runner.clone());
        net.ensure_bridge().await.unwrap();
        assert_eq!(runner.count_prefix("ovs-vsctl --may-exist add-br br0"), 1);
    }
}
