//! Ephemeral multi-node clusters started over a remote execution channel.
//!
//! Each node runs in its own task that owns the remote process for its whole life: start it,
//! wait until it exits or the cluster is stopped, then always clean up its pid and working
//! directory before reporting how the process ended.
mod remote;

pub use remote::{RemoteExec, SshExec};

use crate::error::ClusterError;
use crate::shutdown::{StopListener, StopSignal};
use pgslam_core::{parse_endpoint, ClusterSpec, RunConfig, HTTP_PORT_OFFSET, NODE_STAGGER};
use tokio::task::JoinHandle;
#[allow(unused)]
use tracing::{debug, error, info, instrument, trace, warn};

/// One managed database process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterNode {
    pub index: usize,
    /// Host the process runs on, as given to the remote channel.
    pub host: String,
    /// SQL listen address.
    pub addr: String,
    pub workdir: String,
    pub pid_file: String,
    pub command: Vec<String>,
}

impl ClusterNode {
    /// Plan node `index` listening on `addr`. Every node but the first joins `seed`.
    pub fn new(
        index: usize,
        spec: &ClusterSpec,
        addr: &str,
        seed: &str,
    ) -> Result<Self, ClusterError> {
        let (host, port) =
            parse_endpoint(addr).ok_or_else(|| ClusterError::InvalidAddress(addr.to_string()))?;
        let http_port = port
            .checked_sub(HTTP_PORT_OFFSET)
            .ok_or(ClusterError::PortTooLow(port))?;

        let binary = &spec.binary;
        let workdir = format!("{binary}-work-{}", rand::random::<u32>());
        let pid_file = format!("{workdir}/{binary}.pid");

        let mut command = vec![
            binary.clone(),
            "start".to_string(),
            "--insecure".to_string(),
            "--store".to_string(),
            workdir.clone(),
            "--listen-addr".to_string(),
            addr.to_string(),
            "--http-addr".to_string(),
            format!("{host}:{http_port}"),
            "--pid-file".to_string(),
            pid_file.clone(),
        ];
        if index > 0 {
            command.push("--join".to_string());
            command.push(seed.to_string());
        }
        command.extend(spec.extra_args.iter().cloned());

        Ok(Self {
            index,
            host: host.to_string(),
            addr: addr.to_string(),
            workdir,
            pid_file,
            command,
        })
    }

    fn kill_command(&self) -> Vec<String> {
        ["cat", self.pid_file.as_str(), "|", "xargs", "kill", "-9"]
            .map(String::from)
            .to_vec()
    }

    fn remove_command(&self) -> Vec<String> {
        ["rm", "-rf", self.workdir.as_str()].map(String::from).to_vec()
    }

    /// Best effort: failures are logged, never returned.
    async fn cleanup<R: RemoteExec>(&self, remote: &R) {
        for command in [self.kill_command(), self.remove_command()] {
            if let Err(err) = remote.exec(&self.host, &command, None).await {
                warn!("Cleanup of {} failed: {err}", self.addr);
            }
        }
    }
}

/// Handle to a running cluster.
pub struct Cluster {
    nodes: Vec<(ClusterNode, JoinHandle<Result<(), ClusterError>>)>,
    stop: StopSignal,
}

impl Cluster {
    /// Start `config.nodes` nodes on the first hosts of `config.hosts`, one every
    /// [`NODE_STAGGER`]. If `abort` fires while staggering, no further nodes are started.
    #[instrument(name = "cluster", skip_all, fields(nodes = config.nodes))]
    pub async fn start<R: RemoteExec>(
        spec: &ClusterSpec,
        config: &RunConfig,
        remote: R,
        mut abort: StopListener,
    ) -> Result<Self, ClusterError> {
        let plan = Self::plan(spec, config)?;
        let stop = StopSignal::new();
        let mut nodes = Vec::with_capacity(plan.len());

        let count = plan.len();
        for node in plan {
            if abort.is_stopped() {
                warn!("Stopped before starting node {}", node.addr);
                break;
            }
            info!("Starting node {} on {}", node.index, node.addr);
            let handle = tokio::spawn(run_node(remote.clone(), node.clone(), stop.listener()));
            let index = node.index;
            nodes.push((node, handle));

            if index + 1 < count {
                tokio::select! {
                    _ = tokio::time::sleep(NODE_STAGGER) => {}
                    _ = abort.stopped() => {}
                }
            }
        }

        Ok(Self { nodes, stop })
    }

    /// Lay out every node without starting anything.
    pub fn plan(spec: &ClusterSpec, config: &RunConfig) -> Result<Vec<ClusterNode>, ClusterError> {
        if config.nodes > config.hosts.len() {
            return Err(ClusterError::TooFewHosts {
                nodes: config.nodes,
                hosts: config.hosts.len(),
            });
        }
        let addrs = &config.hosts[..config.nodes];
        let Some(seed) = addrs.first() else {
            return Ok(vec![]);
        };
        addrs
            .iter()
            .enumerate()
            .map(|(index, addr)| ClusterNode::new(index, spec, addr, seed))
            .collect()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &ClusterNode> {
        self.nodes.iter().map(|(node, _)| node)
    }

    /// Ask every node to shut down. Idempotent.
    pub fn stop(&self) {
        self.stop.stop();
    }

    /// Wait for every node to finish, logging each outcome, and return the first error.
    pub async fn wait(self) -> Result<(), ClusterError> {
        let mut first = None;
        for (node, handle) in self.nodes {
            let outcome = handle.await.unwrap_or_else(|err| {
                error!("Node task for {} failed: {err}", node.addr);
                Err(ClusterError::Lost {
                    host: node.host.clone(),
                })
            });
            match outcome {
                Ok(()) => info!("Node {} on {} exited cleanly", node.index, node.addr),
                Err(err) => {
                    error!("Node {} on {} failed: {err}", node.index, node.addr);
                    first.get_or_insert(err);
                }
            }
        }
        first.map_or(Ok(()), Err)
    }
}

#[instrument(name = "node", skip_all, fields(addr = %node.addr))]
async fn run_node<R: RemoteExec>(
    remote: R,
    node: ClusterNode,
    stop: StopListener,
) -> Result<(), ClusterError> {
    let result = remote.exec(&node.host, &node.command, Some(stop)).await;
    node.cleanup(&remote).await;
    result
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::worker::tests::config;
    use pgslam_core::OpKind;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Start commands block until cancelled, except on hosts listed in `failing`.
    #[derive(Clone, Default)]
    pub(crate) struct ScriptedExec {
        pub failing: Vec<String>,
        pub log: Arc<Mutex<Vec<(String, Vec<String>)>>>,
    }

    impl ScriptedExec {
        pub fn commands(&self) -> Vec<(String, Vec<String>)> {
            self.log.lock().unwrap().clone()
        }
    }

    impl RemoteExec for ScriptedExec {
        async fn exec(
            &self,
            host: &str,
            command: &[String],
            cancel: Option<StopListener>,
        ) -> Result<(), ClusterError> {
            self.log
                .lock()
                .unwrap()
                .push((host.to_string(), command.to_vec()));
            if command.get(1).map(String::as_str) != Some("start") {
                return Ok(());
            }
            if self.failing.iter().any(|h| h == host) {
                return Err(ClusterError::Exit {
                    host: host.to_string(),
                    status: "exit status: 1".to_string(),
                });
            }
            if let Some(mut cancel) = cancel {
                cancel.stopped().await;
            }
            Ok(())
        }
    }

    fn cluster_config(nodes: usize) -> RunConfig {
        let mut config = config(OpKind::Insert);
        config.hosts = ["n1:26257", "n2:26257", "n3:26257"].map(String::from).to_vec();
        config.nodes = nodes;
        config
    }

    #[test]
    fn node_commands() {
        let spec = ClusterSpec {
            binary: "cockroach".to_string(),
            extra_args: vec!["--cache=25%".to_string()],
        };
        let nodes = Cluster::plan(&spec, &cluster_config(2)).unwrap();
        assert_eq!(nodes.len(), 2);

        let seed = &nodes[0];
        assert!(seed.workdir.starts_with("cockroach-work-"));
        assert_eq!(seed.pid_file, format!("{}/cockroach.pid", seed.workdir));
        assert_eq!(
            seed.command,
            vec![
                "cockroach",
                "start",
                "--insecure",
                "--store",
                seed.workdir.as_str(),
                "--listen-addr",
                "n1:26257",
                "--http-addr",
                "n1:16257",
                "--pid-file",
                seed.pid_file.as_str(),
                "--cache=25%",
            ]
        );
        assert!(!seed.command.contains(&"--join".to_string()));

        let joiner = &nodes[1];
        let join = joiner.command.iter().position(|a| a == "--join").unwrap();
        assert_eq!(joiner.command[join + 1], "n1:26257");
        assert_ne!(joiner.workdir, seed.workdir);
    }

    #[test]
    fn rejects_bad_layouts() {
        let spec = ClusterSpec::default();
        assert!(matches!(
            Cluster::plan(&spec, &cluster_config(4)),
            Err(ClusterError::TooFewHosts { nodes: 4, hosts: 3 })
        ));

        let mut config = cluster_config(1);
        config.hosts = vec!["n1:5432".to_string()];
        assert!(matches!(
            Cluster::plan(&spec, &config),
            Err(ClusterError::PortTooLow(5432))
        ));

        config.hosts = vec!["n1".to_string()];
        assert!(matches!(
            Cluster::plan(&spec, &config),
            Err(ClusterError::InvalidAddress(_))
        ));
    }

    #[tracing_test::traced_test]
    #[tokio::test(start_paused = true)]
    #[ntest::timeout(5_000)]
    async fn partial_failure_is_reported_after_every_node_is_cleaned_up() {
        let remote = ScriptedExec {
            failing: vec!["n2".to_string()],
            ..Default::default()
        };
        let abort = StopSignal::new();
        let cluster = Cluster::start(
            &ClusterSpec::default(),
            &cluster_config(3),
            remote.clone(),
            abort.listener(),
        )
        .await
        .unwrap();
        assert_eq!(cluster.nodes().count(), 3);

        tokio::time::sleep(Duration::from_secs(1)).await;
        cluster.stop();
        let err = cluster.wait().await.unwrap_err();
        assert!(matches!(err, ClusterError::Exit { ref host, .. } if host == "n2"));
        assert!(logs_contain("Node 0 on n1:26257 exited cleanly"));
        assert!(logs_contain("Node 2 on n3:26257 exited cleanly"));
        assert!(logs_contain("Node 1 on n2:26257 failed"));

        let log = remote.log.lock().unwrap();
        for host in ["n1", "n2", "n3"] {
            let commands: Vec<_> = log.iter().filter(|(h, _)| h == host).collect();
            let kills = commands.iter().filter(|(_, c)| c.contains(&"xargs".to_string()));
            let removes = commands.iter().filter(|(_, c)| c[0] == "rm");
            assert_eq!(kills.count(), 1, "{host}");
            assert_eq!(removes.count(), 1, "{host}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn abort_during_stagger_starts_no_more_nodes() {
        let remote = ScriptedExec::default();
        let abort = StopSignal::new();
        abort.stop();
        let cluster = Cluster::start(
            &ClusterSpec::default(),
            &cluster_config(3),
            remote.clone(),
            abort.listener(),
        )
        .await
        .unwrap();
        assert_eq!(cluster.nodes().count(), 0);
        cluster.stop();
        cluster.wait().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_running_nodes() {
        let remote = ScriptedExec::default();
        let abort = StopSignal::new();
        let cluster = Cluster::start(
            &ClusterSpec::default(),
            &cluster_config(2),
            remote.clone(),
            abort.listener(),
        )
        .await
        .unwrap();

        cluster.stop();
        cluster.wait().await.unwrap();
        let cleanups = remote
            .log
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, c)| c[0] == "rm")
            .count();
        assert_eq!(cleanups, 2);
    }
}
