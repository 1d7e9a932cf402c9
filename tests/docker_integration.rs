//! Integration tests against a local Docker daemon.
//!
//! Run with: cargo test --test docker_integration -- --ignored

use std::collections::HashMap;

use itextmine::execution::{
    run_labels, Container, ContainerRuntime, ContainerSpec, DockerClient, NetworkAttachment,
    WaitOutcome,
};

const IMAGE: &str = "alpine:3.19";

fn client() -> DockerClient {
    DockerClient::new().expect("Docker daemon must be reachable for integration tests")
}

#[tokio::test]
#[ignore] // Run with: cargo test --test docker_integration -- --ignored
async fn test_network_lifecycle() {
    let client = client();
    let name = format!("itextmine-it-{}", uuid::Uuid::new_v4().simple());

    let id = client
        .create_network(&name, "172.29.0.0/16", &run_labels("it", "run-it"))
        .await
        .expect("create network");
    let listed = client.list_networks(&name).await.expect("list");
    assert!(listed.iter().any(|n| n.id == id && n.name == name));

    let duplicate = client
        .create_network(&name, "172.29.0.0/16", &HashMap::new())
        .await;
    assert!(duplicate.is_err());

    client.remove_network(&id).await.expect("remove network");
    let err = client.remove_network(&id).await.expect_err("already removed");
    assert!(err.is_not_found());
}

#[tokio::test]
#[ignore]
async fn test_stage_container_writes_bound_output() {
    let client = client();
    let dir = tempfile::tempdir().expect("tempdir");
    let output = dir.path().join("out.json");
    std::fs::write(&output, "").expect("touch");
    let host = std::fs::canonicalize(&output).expect("canonicalize");

    let name = format!("itextmine-it-{}", uuid::Uuid::new_v4().simple());
    let spec = ContainerSpec::new(&name, IMAGE)
        .with_binds(vec![format!("{}:/work/out.json", host.display())])
        .with_env(vec!["PAYLOAD=hello".to_string()]);

    let mut container = Container::create(&client, &spec).await.expect("create");
    container.start(&client).await.expect("start");
    let outcome = container.wait(&client, None).await.expect("wait");
    container.cleanup(&client).await.expect("cleanup");

    assert_eq!(outcome, WaitOutcome::Exited(0));
    assert!(container.is_removed());
    assert!(client.list_containers(&name).await.expect("list").is_empty());
}

#[tokio::test]
#[ignore]
async fn test_fixed_address_on_provisioned_network() {
    let client = client();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let network = format!("itextmine-it-net-{suffix}");
    let network_id = client
        .create_network(&network, "172.30.0.0/16", &HashMap::new())
        .await
        .expect("create network");

    let spec = ContainerSpec::new(format!("itextmine-it-svc-{suffix}"), IMAGE)
        .with_network(NetworkAttachment::fixed(&network, "172.30.0.2"));
    let mut container = Container::create(&client, &spec).await.expect("create");
    container.start(&client).await.expect("start");
    let outcome = container.wait(&client, None).await.expect("wait");
    container.cleanup(&client).await.expect("cleanup");
    client.remove_network(&network_id).await.expect("remove network");

    assert_eq!(outcome, WaitOutcome::Exited(0));
}
