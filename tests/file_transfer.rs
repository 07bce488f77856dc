//! End-to-end chunked file transfer between streamers, including resume
//! from a partial file and refusal when intake is disabled.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chaski::files::sha256;
use chaski::{ChaskiStreamer, FileCallback, FileEvent, NodeConfig};

mod util;
use util::wait_until;

fn producer_config(topic: &str, chunk_size: u64) -> NodeConfig {
    NodeConfig::default()
        .with_name("Producer")
        .with_subscriptions([topic])
        .with_reconnections(None)
        .with_chunk_size(chunk_size)
}

fn consumer_config(topic: &str, destination: &std::path::Path) -> NodeConfig {
    NodeConfig::default()
        .with_name("Consumer")
        .with_subscriptions([topic])
        .with_reconnections(None)
        .with_incoming_files(destination)
}

fn test_payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 233) as u8).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn file_round_trips_with_matching_hash() {
    let input_dir = tempfile::tempdir().unwrap();
    let output_dir = tempfile::tempdir().unwrap();

    let data = test_payload(300 * 1024);
    let input_path = input_dir.path().join("dummy_300KB.data");
    std::fs::write(&input_path, &data).unwrap();

    let received = Arc::new(AtomicUsize::new(0));
    let callback: FileCallback = {
        let received = received.clone();
        Arc::new(move |event: FileEvent| {
            assert_eq!(event.filename, "dummy_300KB.data");
            assert_eq!(event.size, 300 * 1024);
            assert_eq!(event.topic, "topicF");
            received.fetch_add(1, Ordering::SeqCst);
        })
    };

    let producer = ChaskiStreamer::start(producer_config("topicF", 4096))
        .await
        .unwrap();
    let consumer = ChaskiStreamer::start(
        consumer_config("topicF", output_dir.path()).with_file_handling_callback(callback),
    )
    .await
    .unwrap();

    consumer
        .connect(&format!("*{}", producer.address()))
        .await
        .unwrap();
    wait_until(Duration::from_secs(2), || async {
        producer
            .edges()
            .await
            .unwrap()
            .iter()
            .any(|e| e.paired_topics.contains(&"topicF".to_string()))
    })
    .await;

    let pushed = producer.push_file("topicF", &input_path).await.unwrap();
    assert_eq!(pushed.targets, 1);

    let done = wait_until(Duration::from_secs(10), || async {
        received.load(Ordering::SeqCst) == 1
    })
    .await;
    assert!(done, "file callback must fire on completion");

    let written = std::fs::read(output_dir.path().join("dummy_300KB.data")).unwrap();
    assert_eq!(sha256(&written), sha256(&data));
    assert!(!output_dir.path().join("dummy_300KB.data.part").exists());

    producer.stop().await;
    consumer.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transfer_resumes_from_partial_file() {
    let input_dir = tempfile::tempdir().unwrap();
    let output_dir = tempfile::tempdir().unwrap();

    let chunk_size = 1024u64;
    let data = test_payload(64 * 1024);
    let input_path = input_dir.path().join("resumed.data");
    std::fs::write(&input_path, &data).unwrap();

    // A previous run got 17 whole chunks onto disk before dying.
    std::fs::write(
        output_dir.path().join("resumed.data.part"),
        &data[..17 * chunk_size as usize],
    )
    .unwrap();

    let received = Arc::new(AtomicUsize::new(0));
    let callback: FileCallback = {
        let received = received.clone();
        Arc::new(move |_event: FileEvent| {
            received.fetch_add(1, Ordering::SeqCst);
        })
    };

    let producer = ChaskiStreamer::start(producer_config("topicR", chunk_size))
        .await
        .unwrap();
    let consumer = ChaskiStreamer::start(
        consumer_config("topicR", output_dir.path()).with_file_handling_callback(callback),
    )
    .await
    .unwrap();

    consumer
        .connect(&format!("*{}", producer.address()))
        .await
        .unwrap();
    wait_until(Duration::from_secs(2), || async {
        producer
            .edges()
            .await
            .unwrap()
            .iter()
            .any(|e| e.paired_topics.contains(&"topicR".to_string()))
    })
    .await;

    producer.push_file("topicR", &input_path).await.unwrap();

    let done = wait_until(Duration::from_secs(10), || async {
        received.load(Ordering::SeqCst) == 1
    })
    .await;
    assert!(done, "resumed transfer must complete");

    let written = std::fs::read(output_dir.path().join("resumed.data")).unwrap();
    assert_eq!(
        sha256(&written),
        sha256(&data),
        "resumed file must hash identically to the original"
    );

    producer.stop().await;
    consumer.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disabled_intake_never_writes_files() {
    let input_dir = tempfile::tempdir().unwrap();
    let output_dir = tempfile::tempdir().unwrap();

    let data = test_payload(8 * 1024);
    let input_path = input_dir.path().join("unwanted.data");
    std::fs::write(&input_path, &data).unwrap();

    let producer = ChaskiStreamer::start(producer_config("topicD", 1024))
        .await
        .unwrap();
    // Subscribed to the topic, but file intake stays disabled.
    let consumer = ChaskiStreamer::start(
        NodeConfig::default()
            .with_name("Consumer")
            .with_subscriptions(["topicD"])
            .with_reconnections(None),
    )
    .await
    .unwrap();

    consumer
        .connect(&format!("*{}", producer.address()))
        .await
        .unwrap();
    wait_until(Duration::from_secs(2), || async {
        producer
            .edges()
            .await
            .unwrap()
            .iter()
            .any(|e| e.paired_topics.contains(&"topicD".to_string()))
    })
    .await;

    producer.push_file("topicD", &input_path).await.unwrap();
    tokio::time::sleep(Duration::from_millis(700)).await;

    assert!(!output_dir.path().join("unwanted.data").exists());
    assert!(!output_dir.path().join("unwanted.data.part").exists());

    producer.stop().await;
    consumer.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn attachment_reaches_the_receive_callback() {
    let input_dir = tempfile::tempdir().unwrap();
    let output_dir = tempfile::tempdir().unwrap();

    let data = test_payload(4 * 1024);
    let input_path = input_dir.path().join("tagged.data");
    std::fs::write(&input_path, &data).unwrap();

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let callback: FileCallback = {
        let seen = seen.clone();
        Arc::new(move |event: FileEvent| {
            seen.lock().unwrap().push(event.attachment.clone());
        })
    };

    let producer = ChaskiStreamer::start(producer_config("topicT", 1024))
        .await
        .unwrap();
    let consumer = ChaskiStreamer::start(
        consumer_config("topicT", output_dir.path()).with_file_handling_callback(callback),
    )
    .await
    .unwrap();

    consumer
        .connect(&format!("*{}", producer.address()))
        .await
        .unwrap();
    wait_until(Duration::from_secs(2), || async {
        producer
            .edges()
            .await
            .unwrap()
            .iter()
            .any(|e| e.paired_topics.contains(&"topicT".to_string()))
    })
    .await;

    producer
        .push_file_with("topicT", &input_path, b"{\"size\":4096}".to_vec())
        .await
        .unwrap();

    let done = wait_until(Duration::from_secs(5), || async {
        !seen.lock().unwrap().is_empty()
    })
    .await;
    assert!(done);
    assert_eq!(seen.lock().unwrap()[0], b"{\"size\":4096}");

    producer.stop().await;
    consumer.stop().await;
}
