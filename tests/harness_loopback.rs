//! The two harness roles run against each other over loopback TCP.
mod common;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use mdoc_proximity::definitions::device_engagement::{
    BleOptions, CentralClientMode, DeviceRetrievalMethod, DeviceRetrievalMethods,
};
use mdoc_proximity::definitions::x5chain::X5Chain;
use mdoc_proximity::harness::runner::{
    run_client, run_server, DeviceAuthVariant, HolderConfig, ReaderConfig, ReaderIdentity,
};
use mdoc_proximity::harness::{PlanEntry, TestPlan};
use mdoc_proximity::secure_area::{KeySettings, SecureArea, SoftwareSecureArea};
use mdoc_proximity::transport::{ConnectionSelector, TerminationStyle, TransportOptions};

fn reader_config() -> ReaderConfig {
    let secure_area = Arc::new(SoftwareSecureArea::default());
    let reader_key = p256::SecretKey::from_sec1_pem(common::READER_KEY).unwrap();
    secure_area.import_key("reader", reader_key).unwrap();
    ReaderConfig {
        requests: vec![common::demo_request()],
        authority: Some(ReaderIdentity {
            secure_area,
            key_alias: "reader".to_string(),
            x5chain: X5Chain::from_pem_chain(common::READER_CERT).unwrap(),
        }),
        selector: ConnectionSelector::default(),
        transport: TransportOptions::default(),
    }
}

fn holder_config(device_auth: DeviceAuthVariant) -> HolderConfig {
    let secure_area = Arc::new(SoftwareSecureArea::default());
    let key_info = secure_area.create_key("device", KeySettings::default()).unwrap();
    HolderConfig {
        mdoc: common::issue_mdoc(key_info.public_key),
        secure_area,
        key_alias: "device".to_string(),
        retrieval_methods: DeviceRetrievalMethods::new(DeviceRetrievalMethod::BLE(BleOptions {
            peripheral_server_mode: None,
            central_client_mode: Some(CentralClientMode {
                uuid: uuid::Uuid::new_v4(),
            }),
        })),
        device_auth,
        transport: TransportOptions::default(),
    }
}

async fn run_plan(plan: TestPlan, device_auth: DeviceAuthVariant) -> mdoc_proximity::harness::TestResult {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let cancel = CancellationToken::new();

    let server = tokio::spawn(run_server(
        listener,
        plan,
        reader_config(),
        cancel.clone(),
    ));
    let client = tokio::spawn(run_client(
        "127.0.0.1",
        port,
        holder_config(device_auth),
        cancel,
    ));

    let (result, client_result) = tokio::join!(server, client);
    client_result.unwrap().unwrap();
    result.unwrap().unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn every_termination_style_round_trips() {
    let result = run_plan(TestPlan::all_styles(), DeviceAuthVariant::Signature).await;
    assert_eq!(result.entries.len(), 3);
    assert!(result.all_succeeded());
    for (style, entry) in &result.entries {
        assert_eq!(entry.successes, 1, "style {style:?}");
        assert_eq!(entry.scanning.count, 1);
        assert_eq!(entry.transaction.count, 1);
        assert!(entry.transaction.min >= 0.0);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn repeated_iterations_aggregate_timings() {
    let plan = TestPlan::from(vec![PlanEntry {
        termination: TerminationStyle::InBandStatus,
        iterations: 5,
    }]);
    let result = run_plan(plan, DeviceAuthVariant::Mac).await;
    assert!(result.all_succeeded());
    let (_, entry) = &result.entries[0];
    assert_eq!(entry.successes, 5);
    assert_eq!(entry.transaction.count, 5);
    assert!(entry.transaction.max >= entry.transaction.min);
    assert!(entry.transaction.mean >= entry.transaction.min);
    assert!(entry.holder_transaction.count <= 5);
}
