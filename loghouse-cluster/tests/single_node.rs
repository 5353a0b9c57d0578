//! Single-node tests: the record API against one bootstrapped agent.

mod common;

use std::io::Write;
use std::time::Duration;

use common::{connect_client, consume, produce, TestCluster};
use loghouse_cluster::{Agent, NodeConfig};
use loghouse_proto::v1::{ConsumeRequest, GetServersRequest, ProduceRequest, Record};
use tempfile::TempDir;
use tonic::Code;

#[tokio::test]
async fn test_produce_consume_roundtrip() {
    let mut cluster = TestCluster::new(1).await;
    let mut client = cluster.client(0).await;

    for (i, value) in [b"a", b"b", b"c"].iter().enumerate() {
        let offset = produce(&mut client, *value).await;
        assert_eq!(offset, i as u64);
    }

    for (i, value) in [b"a", b"b", b"c"].iter().enumerate() {
        let record = consume(&mut client, i as u64).await.expect("consume");
        assert_eq!(record.value, *value);
        assert_eq!(record.offset, i as u64);
    }

    let err = consume(&mut client, 3).await.expect_err("past the head");
    assert_eq!(err.code(), Code::OutOfRange);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_consume_stream_tails_the_log() {
    let mut cluster = TestCluster::new(1).await;
    let mut client = cluster.client(0).await;

    produce(&mut client, b"one").await;

    let mut stream = client
        .consume_stream(ConsumeRequest { offset: 0 })
        .await
        .expect("open stream")
        .into_inner();

    let first = stream.message().await.expect("recv").expect("record");
    assert_eq!(first.record.expect("record").value, b"one");

    // The stream is now past the head of the log; it must wait rather than
    // error, and deliver the next record once it exists.
    produce(&mut client, b"two").await;
    let second = tokio::time::timeout(Duration::from_secs(5), stream.message())
        .await
        .expect("stream should deliver the new record")
        .expect("recv")
        .expect("record");
    assert_eq!(second.record.expect("record").value, b"two");

    drop(stream);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_produce_stream_answers_in_order() {
    let mut cluster = TestCluster::new(1).await;
    let mut client = cluster.client(0).await;

    let requests = tokio_stream::iter(
        [b"first".to_vec(), b"second".to_vec(), b"third".to_vec()].map(|value| ProduceRequest {
            record: Some(Record {
                value,
                ..Default::default()
            }),
        }),
    );

    let mut responses = client
        .produce_stream(requests)
        .await
        .expect("open stream")
        .into_inner();

    for expected in 0..3u64 {
        let response = responses.message().await.expect("recv").expect("response");
        assert_eq!(response.offset, expected);
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_get_servers_reports_leader() {
    let mut cluster = TestCluster::new(1).await;
    let mut client = cluster.client(0).await;

    let servers = client
        .get_servers(GetServersRequest {})
        .await
        .expect("get servers")
        .into_inner()
        .servers;

    assert_eq!(servers.len(), 1);
    assert_eq!(servers[0].id, 1);
    assert_eq!(servers[0].rpc_addr, cluster.agents[0].rpc_addr());
    assert!(servers[0].is_leader);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_restart_recovers_offsets_and_records() {
    let (gossip_port, rpc_port) = common::get_test_ports();
    let temp_dir = TempDir::new().expect("create temp dir");

    let config = NodeConfig::builder()
        .node_id(1)
        .bind_addr(format!("127.0.0.1:{gossip_port}"))
        .rpc_port(rpc_port)
        .data_dir(temp_dir.path())
        .bootstrap(true)
        .build()
        .expect("valid config");

    {
        let mut agent = Agent::start(config.clone()).await.expect("start agent");
        agent
            .distributed_log()
            .wait_for_leader(Duration::from_secs(10))
            .await
            .expect("leader");

        let mut client = connect_client(&agent.rpc_addr()).await;
        for value in [b"alpha".as_slice(), b"beta", b"gamma"] {
            produce(&mut client, value).await;
        }
        agent.shutdown().await.expect("shutdown");
    }

    // Let detached stream tasks release their handles before reopening.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut agent = Agent::start(config).await.expect("restart agent");
    agent
        .distributed_log()
        .wait_for_leader(Duration::from_secs(10))
        .await
        .expect("leader after restart");

    let mut client = connect_client(&agent.rpc_addr()).await;
    for (i, value) in [b"alpha".as_slice(), b"beta", b"gamma"].iter().enumerate() {
        let record = consume(&mut client, i as u64).await.expect("consume");
        assert_eq!(&record.value, value);
    }
    let err = consume(&mut client, 3).await.expect_err("past the head");
    assert_eq!(err.code(), Code::OutOfRange);

    agent.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn test_unlisted_subject_is_denied() {
    let (gossip_port, rpc_port) = common::get_test_ports();
    let temp_dir = TempDir::new().expect("create temp dir");

    // Policy grants everything to "root". A plaintext client authenticates
    // as the empty subject and matches nothing.
    let policy_path = temp_dir.path().join("policy.json");
    let mut policy = std::fs::File::create(&policy_path).expect("create policy");
    policy
        .write_all(br#"[{"subject": "root", "actions": ["produce", "consume"]}]"#)
        .expect("write policy");

    let config = NodeConfig::builder()
        .node_id(1)
        .bind_addr(format!("127.0.0.1:{gossip_port}"))
        .rpc_port(rpc_port)
        .data_dir(temp_dir.path().join("data"))
        .bootstrap(true)
        .acl_policy_file(&policy_path)
        .build()
        .expect("valid config");

    let mut agent = Agent::start(config).await.expect("start agent");
    agent
        .distributed_log()
        .wait_for_leader(Duration::from_secs(10))
        .await
        .expect("leader");

    let mut client = connect_client(&agent.rpc_addr()).await;

    let err = client
        .produce(ProduceRequest {
            record: Some(Record {
                value: b"nope".to_vec(),
                ..Default::default()
            }),
        })
        .await
        .expect_err("produce must be denied");
    assert_eq!(err.code(), Code::PermissionDenied);

    let err = client
        .consume(ConsumeRequest { offset: 0 })
        .await
        .expect_err("consume must be denied");
    assert_eq!(err.code(), Code::PermissionDenied);

    agent.shutdown().await.expect("shutdown");
}
