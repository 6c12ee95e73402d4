//! Integration tests for cluster membership and messaging across nodes

use async_trait::async_trait;
use carbon_cluster::{
    AgentState, ClusterConfiguration, ClusterContext, ClusterError, ClusterMember,
    ClusterMessage, ClusteringAgent, DeliveryFailureKind, GroupManagementAgent,
    MembershipListener, MessageHandler, EXECUTED,
};
use serde_json::json;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing_subscriber::fmt::try_init;
use uuid::Uuid;

const DOMAIN: &str = "wso2.carbon.domain";

fn resource(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("resources")
        .join(name)
}

fn built(path: PathBuf) -> Arc<ClusterConfiguration> {
    let mut configuration = ClusterConfiguration::new();
    configuration.set_configuration_source_location(path);
    configuration.build().unwrap();
    Arc::new(configuration)
}

/// Topology of a WKA node on 127.0.0.1 with fast timeouts
fn wka_topology(port: u16, seeds: &[u16], init_ms: u64) -> Arc<ClusterConfiguration> {
    wka_topology_with(DOMAIN, port, seeds, init_ms, 3000)
}

fn wka_topology_with(
    domain: &str,
    port: u16,
    seeds: &[u16],
    init_ms: u64,
    send_ms: u64,
) -> Arc<ClusterConfiguration> {
    let members: Vec<String> = seeds
        .iter()
        .map(|p| format!("\"127.0.0.1:{}\"", p))
        .collect();
    let body = format!(
        r#"
enabled = true
membership_scheme = "wka"
domain = "{domain}"
max_retries = 2

[local_member]
host = "127.0.0.1"
port = {port}

[wka]
members = [{members}]
rejoin_interval_ms = 1000

[timeouts]
heartbeat_interval_ms = 200
heartbeat_timeout_ms = 1500
init_ms = {init_ms}
connect_ms = 500
send_ms = {send_ms}
"#,
        domain = domain,
        port = port,
        members = members.join(", "),
        init_ms = init_ms,
        send_ms = send_ms,
    );

    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .unwrap();
    file.write_all(body.as_bytes()).unwrap();
    built(file.path().to_path_buf())
}

/// Records every message it executes and answers with the execution count
#[derive(Default)]
struct RecordingHandler {
    executed: Mutex<Vec<Uuid>>,
}

impl RecordingHandler {
    fn executed(&self) -> Vec<Uuid> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn execute(
        &self,
        message: &mut ClusterMessage,
        _sender: &ClusterMember,
    ) -> carbon_cluster::Result<()> {
        let count = {
            let mut executed = self.executed.lock().unwrap();
            executed.push(message.id);
            executed.len()
        };
        message.set_response(json!({ "executed": count }));
        Ok(())
    }
}

#[derive(Default)]
struct RecordingListener {
    added: Mutex<Vec<ClusterMember>>,
    removed: Mutex<Vec<ClusterMember>>,
}

impl MembershipListener for RecordingListener {
    fn member_added(&self, member: &ClusterMember) {
        self.added.lock().unwrap().push(member.clone());
    }

    fn member_disappeared(&self, member: &ClusterMember) {
        self.removed.lock().unwrap().push(member.clone());
    }
}

struct Node {
    agent: ClusteringAgent,
    context: Arc<ClusterContext>,
    handler: Arc<RecordingHandler>,
}

impl Node {
    async fn start(configuration: Arc<ClusterConfiguration>) -> Self {
        let handler = Arc::new(RecordingHandler::default());
        let agent = ClusteringAgent::with_message_handler(handler.clone());
        let context = ClusterContext::new(configuration).unwrap();
        agent.init(context.clone()).await.unwrap();
        Self {
            agent,
            context,
            handler,
        }
    }

    fn member(&self) -> ClusterMember {
        self.agent.local_member().unwrap()
    }
}

/// Poll until the agent reports `expected` members
async fn wait_for_count(agent: &ClusteringAgent, expected: usize, within: Duration) -> bool {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if agent.get_alive_member_count().await == expected {
            return true;
        }
        sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Test the scenario of a malformed (missing) topology file
#[test]
fn test_missing_configuration_fails_to_build() {
    let mut configuration = ClusterConfiguration::new();
    configuration.set_configuration_source_location(resource("does-not-exist.toml"));

    let err = configuration.build().unwrap_err();
    assert!(matches!(err, ClusterError::Configuration(_)));
    assert!(err.to_string().contains("Could not build cluster configuration"));
}

/// Test the fixture topologies parse as expected
#[test]
fn test_fixture_configuration() {
    let configuration = built(resource("cluster-03.toml"));

    assert!(configuration.should_initialize("wka").unwrap());
    assert!(!configuration.should_initialize("multicast").unwrap());
    assert_eq!(
        configuration.get_properties("wka.members").unwrap(),
        vec!["127.0.0.1:45300".to_string(), "127.0.0.1:45301".to_string()]
    );
    assert_eq!(
        configuration.get_first_property("local_member.host").unwrap(),
        Some("127.0.0.1".to_string())
    );
}

/// Test a two-node WKA cluster forms and delivers messages
#[tokio::test]
async fn test_two_node_wka_cluster() {
    let _ = try_init();

    let node1 = Node::start(built(resource("cluster-03.toml"))).await;
    let node2 = Node::start(built(resource("cluster-04.toml"))).await;

    assert!(wait_for_count(&node1.agent, 2, Duration::from_secs(10)).await);
    assert!(wait_for_count(&node2.agent, 2, Duration::from_secs(10)).await);
    assert_eq!(node1.agent.state(), AgentState::Active);

    // Membership symmetry
    assert!(node1.context.contains(&node2.member().id).await);
    assert!(node2.context.contains(&node1.member().id).await);

    // Placeholders in member properties are resolved
    assert_eq!(
        node2.member().property("backendServerURL"),
        Some("https://127.0.0.1:9443/services/")
    );

    // The first node is the oldest member
    assert!(node1.agent.is_coordinator().await);
    assert!(!node2.agent.is_coordinator().await);

    let message = ClusterMessage::new("cache.invalidate", json!({"cache": "registry"}));
    let report = timeout(Duration::from_secs(5), node1.agent.send_message(&message))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.delivered, vec![node2.member()]);
    assert_eq!(
        report.response_from(&node2.member().id),
        Some(&json!({ "executed": 1 }))
    );

    let received = node2.agent.received_message(&message.id).unwrap();
    assert_eq!(received.execution_marker(), Some(EXECUTED));
    assert_eq!(node2.handler.executed(), vec![message.id]);
    assert!(node1.agent.received_message(&message.id).is_none());

    node2.agent.shutdown().await;
    node1.agent.shutdown().await;
}

/// Test broadcast reaches every member once and targeted sends reach only the subset
#[tokio::test]
async fn test_broadcast_and_targeted_send() {
    let _ = try_init();

    let seeds = [45310, 45311, 45312];
    let node1 = Node::start(wka_topology(45310, &seeds, 10_000)).await;
    let node2 = Node::start(wka_topology(45311, &seeds, 10_000)).await;
    let node3 = Node::start(wka_topology(45312, &seeds, 10_000)).await;

    for node in [&node1, &node2, &node3] {
        assert!(wait_for_count(&node.agent, 3, Duration::from_secs(10)).await);
    }

    let broadcast = ClusterMessage::new("config.reload", json!(null));
    let report = node1.agent.send_message(&broadcast).await.unwrap();
    assert_eq!(report.delivered.len(), 2);
    assert_eq!(node2.handler.executed(), vec![broadcast.id]);
    assert_eq!(node3.handler.executed(), vec![broadcast.id]);
    assert!(node1.handler.executed().is_empty());

    let targeted = ClusterMessage::new("config.reload", json!({"tenant": 3}));
    let report = node1
        .agent
        .send_message_to(&targeted, &[node3.member()])
        .await
        .unwrap();
    assert_eq!(report.delivered, vec![node3.member()]);
    assert!(node3.agent.received_message(&targeted.id).is_some());
    assert!(node2.agent.received_message(&targeted.id).is_none());
    assert_eq!(node2.handler.executed().len(), 1);

    for node in [&node3, &node2, &node1] {
        node.agent.shutdown().await;
    }
}

/// Test a departed member disappears and can no longer be targeted
#[tokio::test]
async fn test_leave_detection_and_send_to_departed_member() {
    let _ = try_init();

    let seeds = [45320, 45321];
    let node1 = Node::start(wka_topology(45320, &seeds, 10_000)).await;
    let listener = Arc::new(RecordingListener::default());
    node1
        .context
        .add_membership_listener(listener.clone())
        .await;
    let mut events = node1.context.subscribe();

    let node2 = Node::start(wka_topology(45321, &seeds, 10_000)).await;
    assert!(wait_for_count(&node1.agent, 2, Duration::from_secs(10)).await);

    let departed = node2.member();
    assert_eq!(listener.added.lock().unwrap().clone(), vec![departed.clone()]);
    assert_eq!(events.recv().await.unwrap().member(), &departed);

    node2.agent.shutdown().await;
    assert_eq!(node2.agent.state(), AgentState::Stopped);

    // Bounded by the heartbeat timeout even if the leave frame is lost
    assert!(wait_for_count(&node1.agent, 1, Duration::from_millis(1500 + 1000)).await);
    assert!(listener.removed.lock().unwrap().contains(&departed));

    let message = ClusterMessage::new("cache.invalidate", json!(null));
    let err = node1
        .agent
        .send_message_to(&message, &[departed.clone()])
        .await
        .unwrap_err();

    let failure = err.message_failure().unwrap();
    assert_eq!(failure.failed_members(), vec![&departed]);
    assert_eq!(failure.failures[0].kind, DeliveryFailureKind::UnknownMember);
    assert!(!failure.is_partial());

    node1.agent.shutdown().await;
}

/// Test a node that is not a seed gives up when no seed answers
#[tokio::test]
async fn test_wka_init_times_out_without_reachable_seed() {
    let _ = try_init();

    let agent = ClusteringAgent::new();
    let context = ClusterContext::new(wka_topology(45330, &[45331], 2500)).unwrap();

    let started = Instant::now();
    let err = agent.init(context).await.unwrap_err();

    assert!(err.is_initialization());
    assert!(started.elapsed() < Duration::from_secs(8));
    assert_eq!(agent.state(), AgentState::Stopped);
    agent.shutdown().await;

    // The receiver port was released
    let rebound = tokio::net::TcpListener::bind("127.0.0.1:45330").await;
    assert!(rebound.is_ok());
}

/// Test a seed that accepts connections but never answers cannot hold init past its deadline
#[tokio::test]
async fn test_wka_init_deadline_bounds_silent_seed() {
    let _ = try_init();

    let silent = tokio::net::TcpListener::bind("127.0.0.1:45381").await.unwrap();
    let hold = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = silent.accept().await {
            held.push(stream);
        }
    });

    let agent = ClusteringAgent::new();
    let configuration = wka_topology_with(DOMAIN, 45380, &[45381], 1000, 8000);
    let context = ClusterContext::new(configuration).unwrap();

    let started = Instant::now();
    let err = agent.init(context).await.unwrap_err();

    assert!(err.is_initialization());
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(agent.state(), AgentState::Stopped);
    hold.abort();
}

/// Test a node tracks the members of another domain through a group management agent
#[tokio::test]
async fn test_group_management_of_application_domain() {
    let _ = try_init();

    let balancer =
        Node::start(wka_topology_with("lb.domain", 45370, &[45370], 10_000, 3000)).await;
    balancer
        .agent
        .add_group_management_agent(Arc::new(GroupManagementAgent::new(DOMAIN, None)));
    let group = balancer
        .agent
        .get_group_management_agent(DOMAIN, None)
        .unwrap();

    // The application node keeps re-joining the balancer, which refuses it
    let application = Node::start(wka_topology(45371, &[45370, 45371], 10_000)).await;
    let application_id = application.member().id;

    let deadline = Instant::now() + Duration::from_secs(5);
    while !group.contains(&application_id) && Instant::now() < deadline {
        sleep(Duration::from_millis(50)).await;
    }
    assert!(group.contains(&application_id));
    assert_eq!(balancer.agent.get_alive_member_count().await, 1);
    assert_eq!(application.agent.get_alive_member_count().await, 1);
    assert_eq!(balancer.agent.get_domains(), vec![DOMAIN.to_string()]);

    application.agent.shutdown().await;
    let deadline = Instant::now() + Duration::from_secs(5);
    while group.contains(&application_id) && Instant::now() < deadline {
        sleep(Duration::from_millis(50)).await;
    }
    assert!(group.members().is_empty());

    balancer.agent.shutdown().await;
}

/// Test init may only be called once
#[tokio::test]
async fn test_init_twice_rejected() {
    let _ = try_init();

    let configuration = wka_topology(45340, &[45340], 5000);
    let node = Node::start(configuration.clone()).await;

    let again = ClusterContext::new(configuration).unwrap();
    let err = node.agent.init(again).await.unwrap_err();
    assert!(matches!(err, ClusterError::InvalidState(_)));
    assert_eq!(node.agent.state(), AgentState::Active);

    node.agent.shutdown().await;
    node.agent.shutdown().await;
    assert_eq!(node.agent.state(), AgentState::Stopped);
}

/// Test two members discover each other over multicast.
///
/// Skipped at runtime where the host cannot join or loop back the group.
#[tokio::test]
async fn test_multicast_discovery() {
    let _ = try_init();

    let topology = |port: u16| {
        let body = format!(
            r#"
enabled = true
membership_scheme = "multicast"
domain = "{}"

[local_member]
host = "127.0.0.1"
port = {}

[multicast]
address = "228.0.0.4"
port = 45588

[timeouts]
heartbeat_interval_ms = 200
heartbeat_timeout_ms = 1500
"#,
            DOMAIN, port
        );
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        built(file.path().to_path_buf())
    };

    let start = |configuration: Arc<ClusterConfiguration>| async move {
        let handler = Arc::new(RecordingHandler::default());
        let agent = ClusteringAgent::with_message_handler(handler.clone());
        let context = ClusterContext::new(configuration).unwrap();
        agent.init(context.clone()).await.map(|_| Node {
            agent,
            context,
            handler,
        })
    };

    let node1 = match start(topology(45350)).await {
        Ok(node) => node,
        Err(e) => {
            eprintln!("skipping multicast discovery: {}", e);
            return;
        }
    };
    let node2 = match start(topology(45351)).await {
        Ok(node) => node,
        Err(e) => {
            eprintln!("skipping multicast discovery: {}", e);
            node1.agent.shutdown().await;
            return;
        }
    };

    if !wait_for_count(&node1.agent, 2, Duration::from_secs(5)).await {
        eprintln!("skipping multicast discovery: heartbeats are not looped back on this host");
        node2.agent.shutdown().await;
        node1.agent.shutdown().await;
        return;
    }
    assert!(wait_for_count(&node2.agent, 2, Duration::from_secs(5)).await);
    assert!(node1.context.contains(&node2.member().id).await);

    let message = ClusterMessage::new("cache.invalidate", json!(null));
    node2.agent.send_message(&message).await.unwrap();
    assert_eq!(node1.handler.executed(), vec![message.id]);

    node2.agent.shutdown().await;
    assert!(wait_for_count(&node1.agent, 1, Duration::from_secs(3)).await);
    node1.agent.shutdown().await;
}
