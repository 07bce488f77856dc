//! Remote proxy transport: correlated request/response over the mesh and
//! the per-node allowed-module set.

use std::collections::BTreeMap;
use std::sync::Arc;

use chaski::{ChaskiRemote, NodeConfig, NodeError, ProxyHandler, ProxyRegistry};

fn remote_config(name: &str) -> NodeConfig {
    NodeConfig::default()
        .with_name(name)
        .with_reconnections(None)
}

fn math_registry() -> ProxyRegistry {
    let handler: ProxyHandler = Arc::new(|call| {
        if call.attr_path == "double" {
            let value: i64 = String::from_utf8_lossy(&call.args[0]).parse().map_err(|_| {
                "argument is not an integer".to_string()
            })?;
            Ok((value * 2).to_string().into_bytes())
        } else {
            Err(format!("unknown attribute {}", call.attr_path))
        }
    });
    ProxyRegistry::new(["math"], handler)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn proxy_call_round_trips() {
    let server = ChaskiRemote::start(remote_config("Server"), math_registry())
        .await
        .unwrap();

    let dummy: ProxyHandler = Arc::new(|_| Err("client side".into()));
    let client = ChaskiRemote::start(
        remote_config("Client"),
        ProxyRegistry::new(Vec::<String>::new(), dummy),
    )
    .await
    .unwrap();

    let server_address = server.address().to_string();
    client.connect(&server_address).await.unwrap();

    let result = client
        .call(
            &server_address,
            "math",
            "double",
            vec![b"21".to_vec()],
            BTreeMap::new(),
        )
        .await
        .unwrap();
    assert_eq!(result, b"42");

    client.stop().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unlisted_module_errors_do_not_disconnect() {
    let server = ChaskiRemote::start(remote_config("Server"), math_registry())
        .await
        .unwrap();
    let dummy: ProxyHandler = Arc::new(|_| Err("client side".into()));
    let client = ChaskiRemote::start(
        remote_config("Client"),
        ProxyRegistry::new(Vec::<String>::new(), dummy),
    )
    .await
    .unwrap();

    let server_address = server.address().to_string();
    client.connect(&server_address).await.unwrap();

    let refused = client
        .call(&server_address, "os", "remove", vec![], BTreeMap::new())
        .await;
    assert!(matches!(refused, Err(NodeError::Other(_))));

    // The error is a structured reply, not a disconnect: the same edge
    // still serves allowed calls.
    let result = client
        .call(
            &server_address,
            "math",
            "double",
            vec![b"4".to_vec()],
            BTreeMap::new(),
        )
        .await
        .unwrap();
    assert_eq!(result, b"8");

    client.stop().await;
    server.stop().await;
}
