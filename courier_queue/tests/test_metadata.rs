mod common;

use courier_model::{FamilyMetadata, MetadataRecord, MetricType, SeriesRef};
use courier_wire::WireVersion;

use common::*;

fn family(name: &str) -> FamilyMetadata {
    FamilyMetadata {
        metric_family_name: name.to_owned(),
        metric_type: MetricType::Counter,
        unit: "seconds".to_owned(),
        help: format!("help for {name}"),
    }
}

#[tokio::test]
async fn ships_family_metadata_in_chunks() {
    let client = MockWriteClient::new();
    let mut options = test_options();
    options.metadata.max_samples_per_send = 2;
    let manager = new_manager(options, client.clone());

    manager
        .append_metadata(&[family("a"), family("b"), family("c")])
        .await;

    let requests = client.requests();
    assert_eq!(requests.len(), 2);
    let sizes: Vec<usize> = requests
        .iter()
        .map(|request| request.v1.as_ref().unwrap().metadata.len())
        .collect();
    assert_eq!(sizes, vec![2, 1]);
    assert!(
        requests[0].v1.as_ref().unwrap().timeseries.is_empty(),
        "metadata requests carry no series"
    );

    let snapshot = manager.metrics().snapshot();
    assert_eq!(snapshot.metadata_sent, 3);
    assert!(snapshot.metadata_bytes > 0);
}

#[tokio::test]
async fn family_metadata_failures_are_counted() {
    let client = MockWriteClient::new();
    client.push_responses([Err(courier_queue::StoreError::Rejected {
        message: "no metadata accepted".to_owned(),
    })]);
    let manager = new_manager(test_options(), client.clone());

    manager.append_metadata(&[family("a"), family("b")]).await;

    assert_eq!(client.request_count(), 1);
    let snapshot = manager.metrics().snapshot();
    assert_eq!(snapshot.metadata_failed, 2);
    assert_eq!(snapshot.metadata_sent, 0);
}

#[tokio::test(start_paused = true)]
async fn v2_ships_metadata_inline_and_skips_the_legacy_path() {
    let client = MockWriteClient::with_header("2.0;snappy");
    let mut options = test_options();
    options.wire_format = WireVersion::V2;
    let manager = new_manager(options, client.clone());
    seed_series(&manager, 1);
    manager.store_metadata(&[MetadataRecord {
        series: SeriesRef(0),
        metric_type: MetricType::Gauge,
        unit: "bytes".to_owned(),
        help: "resident set size".to_owned(),
    }]);
    manager.start().await;

    // The legacy path is a no-op on v2.
    manager.append_metadata(&[family("ignored")]).await;
    assert_eq!(client.request_count(), 0);

    let records: Vec<_> = (0..5).map(|t| sample(0, t, 1.0)).collect();
    assert!(manager.append_samples(&records).await);
    wait_until("v2 batch sent", || client.request_count() == 1).await;

    let requests = client.requests();
    let request = requests[0].v2.as_ref().unwrap();
    let entry = &request.timeseries[0];
    let metadata = entry.metadata.as_ref().expect("inline metadata");
    assert_ne!(metadata.help_ref, metadata.unit_ref);
    assert_eq!(
        request.symbols[metadata.unit_ref as usize],
        "bytes".to_owned()
    );
    assert_eq!(
        request.symbols[metadata.help_ref as usize],
        "resident set size".to_owned()
    );
    assert_eq!(manager.metrics().snapshot().metadata_sent, 5);

    manager.stop().await;
}
