use backbone_server::config::{load_config, Args};
use backbone_server::BackboneNode;
use event_backbone::{BrokerMessage, EventEnvelope};
use serde_json::json;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;

#[tokio::test]
async fn test_node_from_config_file_publishes_to_broker() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(
        br#"
[node]
name = "realm-test"
heartbeat_interval_ms = 0

[dispatcher]
worker_count = 2
batch_timeout_ms = 5

[broker]
subject_prefix = "realm"
"#,
    )
    .unwrap();
    let args = Args {
        config: file.path().to_path_buf(),
        ..Default::default()
    };
    let config = load_config(&args).await.unwrap();
    let node = BackboneNode::new(config).unwrap();

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    node.subscriber()
        .subscribe("realm.events.player.>", move |_message: BrokerMessage| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap();

    node.start().await.unwrap();
    for id in 0..3 {
        let login = EventEnvelope::new("player.login", "player", format!("p-{id}"), json!({})).with_actor(format!("p-{id}"));
        node.dispatcher().dispatch_async(node.token(), login).await.unwrap();
    }

    let mut delivered = false;
    for _ in 0..200 {
        if seen.load(Ordering::SeqCst) == 3 {
            delivered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(delivered);

    node.stop().await;
    let stats = node.stats().await;
    assert_eq!(stats.by_event_type["player.login"].processed_count, 3);
    assert!(node.subscriber().is_stopped());
}
