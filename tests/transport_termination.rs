//! The transport state machine: connection setup over paired channels,
//! message exchange, the three termination styles, and cancellation.
use tokio_util::sync::CancellationToken;

use mdoc_proximity::definitions::device_engagement::nfc_options::{
    CommandDataLength, ResponseDataLength,
};
use mdoc_proximity::definitions::device_engagement::{
    BleOptions, CentralClientMode, DeviceRetrievalMethod, NfcOptions,
};
use mdoc_proximity::definitions::session::Role;
use mdoc_proximity::transport::channel::memory_pair;
use mdoc_proximity::transport::{
    Received, TerminationStyle, Transport, TransportOptions, TransportState,
};

fn ble_method() -> DeviceRetrievalMethod {
    DeviceRetrievalMethod::BLE(BleOptions {
        peripheral_server_mode: None,
        central_client_mode: Some(CentralClientMode {
            uuid: uuid::Uuid::new_v4(),
        }),
    })
}

fn nfc_method() -> DeviceRetrievalMethod {
    DeviceRetrievalMethod::NFC(NfcOptions::new(
        CommandDataLength::new(255).unwrap(),
        ResponseDataLength::new(256).unwrap(),
    ))
}

async fn connected_pair(
    options: TransportOptions,
    cancel: CancellationToken,
) -> (Transport, Transport) {
    connected_pair_over(ble_method(), options, cancel).await
}

async fn connected_pair_over(
    method: DeviceRetrievalMethod,
    options: TransportOptions,
    cancel: CancellationToken,
) -> (Transport, Transport) {
    let (holder_end, reader_end) = memory_pair();
    let holder = Transport::connect(
        &method,
        Role::Device,
        Box::new(holder_end),
        &options,
        cancel.clone(),
    );
    let reader = Transport::connect(
        &method,
        Role::Reader,
        Box::new(reader_end),
        &options,
        cancel,
    );
    let (holder, reader) = tokio::join!(holder, reader);
    (holder.unwrap(), reader.unwrap())
}

#[tokio::test]
async fn messages_flow_both_ways_once_connected() {
    let options = TransportOptions {
        ident: Some([7u8; 16]),
        ..Default::default()
    };
    let (mut holder, mut reader) = connected_pair(options, CancellationToken::new()).await;
    assert_eq!(holder.state(), TransportState::Connected);
    assert_eq!(reader.state(), TransportState::Connected);

    let request = vec![0xa1, 0x01, 0x02];
    reader.send_message(&request).await.unwrap();
    assert_eq!(
        holder.wait_for_message().await.unwrap(),
        Received::Message(request)
    );

    let response = vec![0u8; 4096];
    holder.send_message(&response).await.unwrap();
    assert_eq!(
        reader.wait_for_message().await.unwrap(),
        Received::Message(response)
    );
}

#[tokio::test]
async fn mismatched_ident_refuses_the_connection() {
    let method = ble_method();
    let (holder_end, reader_end) = memory_pair();
    let holder_options = TransportOptions {
        ident: Some([1u8; 16]),
        ..Default::default()
    };
    let reader_options = TransportOptions {
        ident: Some([2u8; 16]),
        ..Default::default()
    };
    let cancel = CancellationToken::new();
    let holder = Transport::connect(
        &method,
        Role::Device,
        Box::new(holder_end),
        &holder_options,
        cancel.clone(),
    );
    let reader = Transport::connect(
        &method,
        Role::Reader,
        Box::new(reader_end),
        &reader_options,
        cancel,
    );
    let (holder, reader) = tokio::join!(holder, reader);
    assert!(holder.is_err());
    assert!(reader.is_err());
}

async fn close_in_style(style: TerminationStyle) {
    let (mut holder, mut reader) =
        connected_pair(TransportOptions::default(), CancellationToken::new()).await;
    let (closed, received) = tokio::join!(reader.close(style), holder.wait_for_message());
    closed.unwrap();
    assert_eq!(received.unwrap(), Received::Terminated(style));
    assert_eq!(reader.state(), TransportState::Closed);
    assert_eq!(holder.state(), TransportState::Closed);

    // Nothing more flows after closure, in either direction.
    assert!(holder.send_message(&[1]).await.is_err());
    assert!(reader.send_message(&[1]).await.is_err());
}

#[tokio::test]
async fn termination_by_in_band_status() {
    close_in_style(TerminationStyle::InBandStatus).await;
}

#[tokio::test]
async fn termination_by_close_message() {
    close_in_style(TerminationStyle::CloseMessage).await;
}

#[tokio::test]
async fn termination_by_transport_signal() {
    close_in_style(TerminationStyle::TransportSpecific).await;
}

#[tokio::test]
async fn nfc_reader_terminates_in_every_style() {
    for style in [
        TerminationStyle::InBandStatus,
        TerminationStyle::CloseMessage,
        TerminationStyle::TransportSpecific,
    ] {
        let (mut holder, mut reader) = connected_pair_over(
            nfc_method(),
            TransportOptions::default(),
            CancellationToken::new(),
        )
        .await;
        let (closed, received) = tokio::join!(reader.close(style), holder.wait_for_message());
        closed.unwrap();
        assert_eq!(received.unwrap(), Received::Terminated(style));
        assert_eq!(reader.state(), TransportState::Closed);
        assert_eq!(holder.state(), TransportState::Closed);
    }
}

#[tokio::test]
async fn nfc_holder_close_does_not_wait_for_a_poll() {
    let (mut holder, mut reader) = connected_pair_over(
        nfc_method(),
        TransportOptions::default(),
        CancellationToken::new(),
    )
    .await;

    // The reader is idle, not polling; the holder must still come down.
    tokio::time::timeout(
        std::time::Duration::from_secs(1),
        holder.close(TerminationStyle::TransportSpecific),
    )
    .await
    .expect("close must not block on the peer")
    .unwrap();
    assert_eq!(holder.state(), TransportState::Closed);

    assert_eq!(
        reader.wait_for_message().await.unwrap(),
        Received::Terminated(TerminationStyle::TransportSpecific)
    );
    assert_eq!(reader.state(), TransportState::Closed);
}

#[tokio::test]
async fn cancellation_interrupts_a_waiting_transport() {
    let cancel = CancellationToken::new();
    let (mut holder, _reader) =
        connected_pair(TransportOptions::default(), cancel.clone()).await;

    let waiter = tokio::spawn(async move {
        let result = holder.wait_for_message().await;
        (result, holder.state())
    });
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    cancel.cancel();

    let (result, state) = waiter.await.unwrap();
    assert!(result.is_err());
    assert_eq!(state, TransportState::Closed);
}

#[tokio::test]
async fn hangup_during_setup_is_a_connection_error() {
    let method = ble_method();
    let (holder_end, reader_end) = memory_pair();
    drop(reader_end);
    let result = Transport::connect(
        &method,
        Role::Device,
        Box::new(holder_end),
        &TransportOptions::default(),
        CancellationToken::new(),
    )
    .await;
    assert!(result.is_err());
}
