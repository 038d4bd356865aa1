//! End-to-end tests for the mapping operations of the state proxy.

use serde_json::{json, Map};
use zproc_core::{Server, ServerHandle, ServerOptions, StateClient, ZprocError};

async fn start() -> (ServerHandle, StateClient) {
    let handle = Server::start(ServerOptions::new()).await.unwrap();
    let client = StateClient::connect_to(handle.endpoints()).await.unwrap();
    (handle, client)
}

#[tokio::test]
async fn test_set_then_get() {
    let (_handle, client) = start().await;

    client.set("apples", json!(5)).await.unwrap();
    assert_eq!(client.get("apples").await.unwrap(), Some(json!(5)));
}

#[tokio::test]
async fn test_get_missing_key_is_none() {
    let (_handle, client) = start().await;
    assert_eq!(client.get("nothing").await.unwrap(), None);
}

#[tokio::test]
async fn test_roundtrip_preserves_value_shapes() {
    let (_handle, client) = start().await;

    let values = vec![
        json!(null),
        json!(true),
        json!(-42),
        json!(3.25),
        json!("text"),
        json!([1, [2, 3], {"k": null}]),
        json!({"nested": {"deep": [true, "x"]}}),
    ];
    for (i, value) in values.into_iter().enumerate() {
        let key = format!("k{}", i);
        client.set(&key, value.clone()).await.unwrap();
        assert_eq!(client.get(&key).await.unwrap(), Some(value));
    }
}

#[tokio::test]
async fn test_revisions_increase_monotonically() {
    let (_handle, client) = start().await;

    let mut last = client.ping().await.unwrap().revision;
    assert_eq!(last, 0);

    for i in 0..5 {
        let revision = client.set("k", json!(i)).await.unwrap();
        assert!(revision > last, "revision {} after {}", revision, last);
        last = revision;
    }
}

#[tokio::test]
async fn test_set_equal_value_commits_no_revision() {
    let (_handle, client) = start().await;

    let r1 = client.set("k", json!([1, 2])).await.unwrap();
    let r2 = client.set("k", json!([1, 2])).await.unwrap();
    assert_eq!(r1, r2);
    assert_eq!(client.ping().await.unwrap().revision, r1);
}

#[tokio::test]
async fn test_update_commits_one_revision() {
    let (_handle, client) = start().await;

    let mut delta = Map::new();
    delta.insert("a".to_string(), json!(1));
    delta.insert("b".to_string(), json!(2));
    delta.insert("c".to_string(), json!(3));
    let revision = client.update(delta).await.unwrap();

    assert_eq!(revision, 1);
    assert_eq!(client.len().await.unwrap(), 3);
}

#[tokio::test]
async fn test_snapshot_reflects_revision() {
    let (_handle, client) = start().await;

    client.set("a", json!(1)).await.unwrap();
    client.set("b", json!(2)).await.unwrap();

    let snapshot = client.snapshot().await.unwrap();
    assert_eq!(snapshot.revision, 2);
    assert_eq!(snapshot.get("a"), Some(&json!(1)));
    assert_eq!(snapshot.get("b"), Some(&json!(2)));
    assert_eq!(snapshot.len(), 2);
}

#[tokio::test]
async fn test_delete_is_strict() {
    let (_handle, client) = start().await;

    client.set("k", json!(1)).await.unwrap();
    client.delete("k").await.unwrap();
    assert_eq!(client.get("k").await.unwrap(), None);

    match client.delete("k").await {
        Err(ZprocError::KeyMissing { key }) => assert_eq!(key, "k"),
        other => panic!("expected KeyMissing, got {:?}", other),
    }
}

#[tokio::test]
async fn test_dict_style_operations() {
    let (_handle, client) = start().await;

    assert!(client.is_empty().await.unwrap());
    client.set("foo", json!("foo")).await.unwrap();
    client.set("bar", json!("bar")).await.unwrap();

    assert!(client.contains("foo").await.unwrap());
    assert!(!client.contains("zoo").await.unwrap());
    assert_eq!(client.len().await.unwrap(), 2);
    assert_eq!(
        client.keys().await.unwrap(),
        vec!["bar".to_string(), "foo".to_string()]
    );

    // set_default only inserts when absent.
    assert_eq!(
        client.set_default("foo", json!("other")).await.unwrap(),
        json!("foo")
    );
    assert_eq!(
        client.set_default("zzz", json!(null)).await.unwrap(),
        json!(null)
    );
    assert!(client.contains("zzz").await.unwrap());

    // pop is non-strict and returns the removed value.
    assert_eq!(client.pop("foo").await.unwrap(), Some(json!("foo")));
    assert_eq!(client.pop("foo").await.unwrap(), None);

    client.clear().await.unwrap();
    assert!(client.is_empty().await.unwrap());
}

#[tokio::test]
async fn test_two_clients_observe_the_same_state() {
    let (handle, writer) = start().await;
    let reader = StateClient::connect_to(handle.endpoints()).await.unwrap();

    let revision = writer.set("shared", json!("value")).await.unwrap();

    // The write committed before the writer's reply; any later read from
    // another client sees it.
    assert_eq!(reader.get("shared").await.unwrap(), Some(json!("value")));
    assert!(reader.ping().await.unwrap().revision >= revision);
}

#[tokio::test]
async fn test_ping_identity_is_stable() {
    let (_handle, client) = start().await;

    let a = client.ping().await.unwrap();
    let b = client.ping().await.unwrap();
    assert_eq!(a.server_id, b.server_id);
    assert!(!a.server_id.is_empty());
}

#[tokio::test]
async fn test_server_shutdown_fails_requests() {
    let (mut handle, client) = start().await;
    client.set("k", json!(1)).await.unwrap();

    handle.shutdown();

    // Retry until the shutdown is visible (the close may race the call).
    let mut saw_failure = false;
    for _ in 0..20 {
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
        if client.get("k").await.is_err() {
            saw_failure = true;
            break;
        }
    }
    assert!(saw_failure, "client should observe server shutdown");

    // A connection may still be accepted before the listener task is fully
    // gone; the first call must then fail.
    match StateClient::connect_to(handle.endpoints()).await {
        Err(_) => {}
        Ok(client) => assert!(client.ping().await.is_err()),
    }
}

#[tokio::test]
async fn test_values_are_copied_not_shared() {
    let (_handle, client) = start().await;

    client.set("list", json!([1, 2, 3])).await.unwrap();

    // Mutating a returned snapshot value never reaches the server.
    let mut local = client.get("list").await.unwrap().unwrap();
    local.as_array_mut().unwrap().push(json!(4));

    assert_eq!(client.get("list").await.unwrap(), Some(json!([1, 2, 3])));
}
