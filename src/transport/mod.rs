//! The connection lifecycle around a presentment session.
//!
//! A [Transport] moves through `Initializing` → `Connecting` → `Connected` →
//! `Closing` → `Closed`, with `Failed` reachable from any active state. The
//! same state machine drives every link flavour; the radio itself is
//! abstracted behind [channel::Channel].
pub mod ble;
pub mod channel;
pub mod nfc;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::cbor;
use crate::definitions::device_engagement::{BleOptions, DeviceRetrievalMethod};
use crate::definitions::session::{Role, SessionData};

use ble::{GattLink, L2capLink};
use channel::Channel;
use nfc::NfcLink;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("i/o failure on the underlying channel: {0}")]
    Io(#[from] std::io::Error),
    #[error("the peer disconnected")]
    ConnectionLost,
    #[error("connection setup timed out")]
    ConnectionTimeout,
    #[error("the transport is closed")]
    TransportClosed,
    #[error("the peripheral's ident does not match the engagement")]
    IdentMismatch,
    #[error("protocol violation: {0}")]
    InvalidFrame(&'static str),
    #[error("the connection method offers no mode for this role")]
    UnusableMethod,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportState {
    Initializing,
    Connecting,
    Connected,
    Closing,
    Closed,
    Failed,
}

/// The three ways a finished session can be torn down.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminationStyle {
    /// A status-only session envelope carrying the termination status.
    InBandStatus,
    /// A data-less, status-less session envelope.
    CloseMessage,
    /// The link's own termination signal, outside the session layer.
    TransportSpecific,
}

/// What [Transport::wait_for_message] yielded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Received {
    /// An envelope carrying data for the session layer.
    Message(Vec<u8>),
    /// The peer ended the session; the transport is now closed.
    Terminated(TerminationStyle),
}

/// Synchronous choice among disambiguated connection methods. The default
/// takes the first candidate; an interactive holder can inject a prompt.
pub struct ConnectionSelector {
    select: Box<dyn Fn(&[DeviceRetrievalMethod]) -> Option<usize> + Send + Sync>,
}

impl ConnectionSelector {
    pub fn new(
        select: impl Fn(&[DeviceRetrievalMethod]) -> Option<usize> + Send + Sync + 'static,
    ) -> Self {
        Self {
            select: Box::new(select),
        }
    }

    pub fn select(&self, methods: &[DeviceRetrievalMethod]) -> Option<usize> {
        (self.select)(methods)
    }
}

impl Default for ConnectionSelector {
    fn default() -> Self {
        Self::new(|methods| (!methods.is_empty()).then_some(0))
    }
}

#[derive(Clone, Debug)]
pub struct TransportOptions {
    pub connect_timeout: Duration,
    pub preferred_mtu: u16,
    /// The expected (reader) or owned (holder) BLE ident.
    pub ident: Option<[u8; 16]>,
    /// Prefer an L2CAP channel over the GATT message stream.
    pub use_l2cap: bool,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            preferred_mtu: ble::DEFAULT_MTU,
            ident: None,
            use_l2cap: false,
        }
    }
}

enum Link {
    Gatt(GattLink),
    L2cap(L2capLink),
    Nfc(NfcLink),
}

impl Link {
    async fn send_message(&mut self, message: &[u8]) -> Result<(), Error> {
        match self {
            Link::Gatt(link) => link.send_message(message).await,
            Link::L2cap(link) => link.send_message(message).await,
            Link::Nfc(link) => link.send_message(message).await,
        }
    }

    async fn wait_for_message(&mut self) -> Result<Vec<u8>, Error> {
        match self {
            Link::Gatt(link) => link.wait_for_message().await,
            Link::L2cap(link) => link.wait_for_message().await,
            Link::Nfc(link) => link.wait_for_message().await,
        }
    }

    async fn close(&mut self) -> Result<(), Error> {
        match self {
            Link::Gatt(link) => link.close().await,
            Link::L2cap(link) => link.close().await,
            Link::Nfc(link) => link.close().await,
        }
    }

    async fn abort(&mut self) -> Result<(), Error> {
        match self {
            Link::Gatt(link) => link.abort().await,
            Link::L2cap(link) => link.abort().await,
            Link::Nfc(link) => link.abort().await,
        }
    }
}

pub struct Transport {
    role: Role,
    state: TransportState,
    link: Link,
    cancel: CancellationToken,
}

impl Transport {
    /// Bring a connection up over the given channel for the selected method.
    /// Link setup (GATT handshake or NFC selection) is bounded by the
    /// connect timeout and the cancellation token.
    pub async fn connect(
        method: &DeviceRetrievalMethod,
        role: Role,
        channel: Box<dyn Channel>,
        options: &TransportOptions,
        cancel: CancellationToken,
    ) -> Result<Self, Error> {
        tracing::debug!(?role, state = ?TransportState::Connecting, "transport setup");
        let setup = Self::setup_link(method, role, channel, options);
        let link = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::TransportClosed),
            result = tokio::time::timeout(options.connect_timeout, setup) => {
                result.map_err(|_| Error::ConnectionTimeout)??
            }
        };
        tracing::debug!(?role, state = ?TransportState::Connected, "transport connected");
        Ok(Self {
            role,
            state: TransportState::Connected,
            link,
            cancel,
        })
    }

    async fn setup_link(
        method: &DeviceRetrievalMethod,
        role: Role,
        channel: Box<dyn Channel>,
        options: &TransportOptions,
    ) -> Result<Link, Error> {
        match method {
            DeviceRetrievalMethod::NFC(nfc_options) => {
                let link = match role {
                    Role::Reader => NfcLink::connect_poller(channel, nfc_options).await?,
                    Role::Device => NfcLink::accept_listener(channel, nfc_options).await?,
                };
                Ok(Link::Nfc(link))
            }
            DeviceRetrievalMethod::BLE(ble_options) => {
                if options.use_l2cap {
                    return Ok(Link::L2cap(L2capLink::new(channel)));
                }
                let central = Self::is_central(ble_options, role)?;
                let link = if central {
                    GattLink::connect_central(channel, options.preferred_mtu, options.ident)
                        .await?
                } else {
                    GattLink::accept_peripheral(channel, options.preferred_mtu, options.ident)
                        .await?
                };
                Ok(Link::Gatt(link))
            }
        }
    }

    /// Whether this role acts as the GATT central for the advertised modes.
    /// In peripheral server mode the holder serves and the reader connects;
    /// in central client mode the holder connects.
    fn is_central(options: &BleOptions, role: Role) -> Result<bool, Error> {
        match (
            options.peripheral_server_mode.is_some(),
            options.central_client_mode.is_some(),
            role,
        ) {
            (true, _, Role::Reader) => Ok(true),
            (true, false, Role::Device) => Ok(false),
            (false, true, Role::Device) => Ok(true),
            (false, true, Role::Reader) => Ok(false),
            (true, true, Role::Device) => Ok(false),
            (false, false, _) => Err(Error::UnusableMethod),
        }
    }

    pub fn state(&self) -> TransportState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub async fn send_message(&mut self, message: &[u8]) -> Result<(), Error> {
        if self.state != TransportState::Connected {
            return Err(Error::TransportClosed);
        }
        let result = tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::TransportClosed),
            result = self.link.send_message(message) => result,
        };
        match result {
            Ok(()) => Ok(()),
            Err(Error::TransportClosed) => {
                self.shutdown_on_cancel().await;
                Err(Error::TransportClosed)
            }
            Err(e) => {
                self.state = TransportState::Failed;
                Err(e)
            }
        }
    }

    /// Await the next envelope, watching for all three termination styles
    /// and for cancellation. Termination and cancellation both leave the
    /// transport in `Closed`.
    pub async fn wait_for_message(&mut self) -> Result<Received, Error> {
        if self.state != TransportState::Connected {
            return Err(Error::TransportClosed);
        }
        let result = tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::TransportClosed),
            result = self.link.wait_for_message() => result,
        };
        let message = match result {
            Ok(message) => message,
            Err(Error::TransportClosed) => {
                self.shutdown_on_cancel().await;
                return Err(Error::TransportClosed);
            }
            Err(e) => {
                self.state = TransportState::Failed;
                return Err(e);
            }
        };
        if message.is_empty() {
            self.enter_closed().await;
            return Ok(Received::Terminated(TerminationStyle::TransportSpecific));
        }
        if let Ok(session_data) = cbor::from_slice::<SessionData>(&message) {
            if session_data.is_terminal() {
                let style = match session_data.status {
                    Some(_) => TerminationStyle::InBandStatus,
                    None => TerminationStyle::CloseMessage,
                };
                self.enter_closed().await;
                return Ok(Received::Terminated(style));
            }
        }
        Ok(Received::Message(message))
    }

    /// Tear the session down in the requested style. Safe to call once; the
    /// transport is `Closed` afterwards.
    pub async fn close(&mut self, style: TerminationStyle) -> Result<(), Error> {
        if matches!(self.state, TransportState::Closed | TransportState::Failed) {
            return Ok(());
        }
        self.state = TransportState::Closing;
        let result = match style {
            TerminationStyle::InBandStatus => {
                let envelope =
                    cbor::to_vec(&SessionData::termination())
                        .map_err(|_| Error::InvalidFrame("unencodable termination envelope"))?;
                self.link.send_message(&envelope).await
            }
            TerminationStyle::CloseMessage => {
                let envelope =
                    cbor::to_vec(&SessionData::close())
                        .map_err(|_| Error::InvalidFrame("unencodable close envelope"))?;
                self.link.send_message(&envelope).await
            }
            TerminationStyle::TransportSpecific => self.link.close().await,
        };
        let _ = self.link.abort().await;
        self.state = TransportState::Closed;
        tracing::debug!(role = ?self.role, "transport closed");
        result
    }

    async fn enter_closed(&mut self) {
        self.state = TransportState::Closing;
        let _ = self.link.abort().await;
        self.state = TransportState::Closed;
    }

    async fn shutdown_on_cancel(&mut self) {
        tracing::debug!(role = ?self.role, "transport cancelled");
        self.enter_closed().await;
    }
}
