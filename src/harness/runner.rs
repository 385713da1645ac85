//! The two harness roles. [run_server] plays the reader and drives the
//! plan; [run_client] plays the holder and answers each iteration with a
//! fresh engagement and a full presentment.
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, bail, Context};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::cbor;
use crate::definitions::device_engagement::{DeviceEngagement, DeviceRetrievalMethods};
use crate::definitions::device_request::ItemsRequest;
use crate::definitions::device_response::Status as ResponseStatus;
use crate::definitions::helpers::Tag24;
use crate::definitions::retrieval_methods;
use crate::definitions::session::{Role, SessionEstablishment};
use crate::definitions::x5chain::X5Chain;
use crate::issuance::Mdoc;
use crate::presentation::device::{self, Documents, SessionManagerInit};
use crate::presentation::reader::{self, Outcome, ReaderAuthority};
use crate::secure_area::SecureArea;
use crate::transport::channel::TcpChannel;
use crate::transport::{
    ConnectionSelector, Received, TerminationStyle, Transport, TransportOptions,
};

use super::control::{ControlChannel, ControlMessage};
use super::{EntryResult, IterationReport, TestPlan, TestResult, TimingStats};

/// The reader process's identity and per-iteration request.
pub struct ReaderConfig {
    pub requests: Vec<ItemsRequest>,
    pub authority: Option<ReaderIdentity>,
    pub selector: ConnectionSelector,
    pub transport: TransportOptions,
}

pub struct ReaderIdentity {
    pub secure_area: Arc<dyn SecureArea>,
    pub key_alias: String,
    pub x5chain: X5Chain,
}

impl ReaderIdentity {
    fn as_authority(&self) -> ReaderAuthority<'_> {
        ReaderAuthority {
            secure_area: self.secure_area.as_ref(),
            key_alias: &self.key_alias,
            x5chain: self.x5chain.clone(),
        }
    }
}

/// How the holder authenticates its response documents.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceAuthVariant {
    Signature,
    Mac,
}

/// The holder process's credential and keys.
pub struct HolderConfig {
    pub mdoc: Mdoc,
    pub secure_area: Arc<dyn SecureArea>,
    pub key_alias: String,
    pub retrieval_methods: DeviceRetrievalMethods,
    pub device_auth: DeviceAuthVariant,
    pub transport: TransportOptions,
}

/// Serve the control socket, run the reader side of every planned
/// iteration, and aggregate both sides' timings.
pub async fn run_server(
    listener: TcpListener,
    plan: TestPlan,
    config: ReaderConfig,
    cancel: CancellationToken,
) -> anyhow::Result<TestResult> {
    let (stream, peer) = tokio::select! {
        _ = cancel.cancelled() => bail!("cancelled before a client connected"),
        accepted = listener.accept() => accepted.context("accepting control connection")?,
    };
    tracing::info!(%peer, "harness client connected");
    let mut control = ControlChannel::new(stream);
    control.handshake().await?;
    control.send(&ControlMessage::Plan(plan.clone())).await?;

    let mut result = TestResult::default();
    let mut index = 0u32;
    for entry in &plan.entries {
        let mut scanning = Vec::new();
        let mut transaction = Vec::new();
        let mut holder_transaction = Vec::new();
        let mut entry_result = EntryResult::default();
        for _ in 0..entry.iterations {
            if cancel.is_cancelled() {
                control
                    .send(&ControlMessage::Abort("server cancelled".to_string()))
                    .await?;
                bail!("cancelled mid-plan");
            }
            let outcome =
                run_reader_iteration(&mut control, index, entry.termination, &config, &cancel)
                    .await;
            // The holder reports its own view after every iteration, unless
            // it failed before engaging, in which case its failure report
            // already stood in for the engagement.
            let (report, holder) = match outcome {
                Ok(ReaderOutcome::Completed(report)) => {
                    let holder = control
                        .expect("Report", |m| matches!(m, ControlMessage::Report(_)))
                        .await?;
                    (report, Some(holder))
                }
                Ok(ReaderOutcome::HolderFailedEarly) => (IterationReport::failed(index), None),
                Err(e) => {
                    tracing::warn!(index, error = %e, "iteration failed");
                    let holder = control
                        .expect("Report", |m| matches!(m, ControlMessage::Report(_)))
                        .await?;
                    (IterationReport::failed(index), Some(holder))
                }
            };
            if report.success {
                entry_result.successes += 1;
                scanning.push(report.scanning_ms);
                transaction.push(report.transaction_ms);
            } else {
                entry_result.failures += 1;
            }
            if let Some(ControlMessage::Report(holder)) = holder {
                if holder.success {
                    holder_transaction.push(holder.transaction_ms);
                }
            }
            index += 1;
        }
        entry_result.scanning = TimingStats::from_samples(&scanning);
        entry_result.transaction = TimingStats::from_samples(&transaction);
        entry_result.holder_transaction = TimingStats::from_samples(&holder_transaction);
        result.entries.push((entry.termination, entry_result));
    }
    control.send(&ControlMessage::Done).await?;
    Ok(result)
}

enum ReaderOutcome {
    Completed(IterationReport),
    /// The holder failed before engaging; its failure report arrived in
    /// place of the engagement and has been consumed.
    HolderFailedEarly,
}

async fn run_reader_iteration(
    control: &mut ControlChannel,
    index: u32,
    termination: TerminationStyle,
    config: &ReaderConfig,
    cancel: &CancellationToken,
) -> anyhow::Result<ReaderOutcome> {
    let data_listener = TcpListener::bind("0.0.0.0:0")
        .await
        .context("binding data listener")?;
    let data_port = data_listener.local_addr()?.port();
    control
        .send(&ControlMessage::Iteration {
            index,
            data_port,
            termination,
        })
        .await?;

    let qr_uri = match control.recv().await? {
        ControlMessage::Engagement { qr_uri } => qr_uri,
        ControlMessage::Report(_) => return Ok(ReaderOutcome::HolderFailedEarly),
        ControlMessage::Abort(reason) => bail!("client aborted: {reason}"),
        other => bail!("unexpected control message while awaiting engagement: {other:?}"),
    };
    let scan_started = Instant::now();

    let device_engagement = Tag24::<DeviceEngagement>::from_qr_code_uri(&qr_uri)
        .map_err(|e| anyhow!("invalid engagement: {e}"))?;
    let methods = retrieval_methods::disambiguate(
        &device_engagement.inner.device_retrieval_methods,
        Role::Reader,
    )?;
    let selected = config
        .selector
        .select(&methods)
        .ok_or_else(|| anyhow!("no acceptable connection method"))?;
    let method = methods[selected].clone();

    let (mut session, establishment, ble_ident) = reader::SessionManager::establish_session(
        &qr_uri,
        config.requests.clone(),
        config.authority.as_ref().map(ReaderIdentity::as_authority),
    )?;

    let (stream, _) = tokio::select! {
        _ = cancel.cancelled() => bail!("cancelled while waiting for the data connection"),
        accepted = tokio::time::timeout(config.transport.connect_timeout, data_listener.accept()) => {
            accepted
                .context("holder never dialed the data port")?
                .context("accepting data connection")?
        }
    };
    let mut options = config.transport.clone();
    options.ident = Some(ble_ident);
    let mut transport = Transport::connect(
        &method,
        Role::Reader,
        Box::new(TcpChannel::new(stream)),
        &options,
        cancel.clone(),
    )
    .await?;
    let scanning_ms = scan_started.elapsed().as_secs_f64() * 1e3;

    let transaction_started = Instant::now();
    transport.send_message(&establishment).await?;
    let envelope = match transport.wait_for_message().await? {
        Received::Message(envelope) => envelope,
        Received::Terminated(style) => bail!("holder terminated ({style:?}) before responding"),
    };
    let validated = session.handle_response(&envelope, None)?;
    let transaction_ms = transaction_started.elapsed().as_secs_f64() * 1e3;

    let success = validated.status == Some(ResponseStatus::OK)
        && !validated.documents.is_empty()
        && validated.documents.iter().all(|doc| {
            doc.issuer_signed_authenticated == Outcome::Valid
                && doc.device_signed_authenticated == Outcome::Valid
                && doc.digest_mismatches == 0
        });
    transport.close(termination).await?;

    Ok(ReaderOutcome::Completed(IterationReport {
        index,
        success,
        scanning_ms,
        transaction_ms,
    }))
}

/// Dial the control socket and play the holder for every iteration the
/// server announces.
pub async fn run_client(
    server: &str,
    control_port: u16,
    config: HolderConfig,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let stream = TcpStream::connect((server, control_port))
        .await
        .context("connecting to control socket")?;
    let mut control = ControlChannel::new(stream);
    control.handshake().await?;
    let plan = control
        .expect("Plan", |m| matches!(m, ControlMessage::Plan(_)))
        .await?;
    let ControlMessage::Plan(plan) = plan else {
        unreachable!("expect only returns the matched message");
    };
    tracing::info!(iterations = plan.total_iterations(), "plan received");

    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => {
                control.send(&ControlMessage::Abort("client cancelled".to_string())).await?;
                bail!("cancelled mid-plan");
            }
            message = control.recv() => message?,
        };
        let (index, data_port, termination) = match message {
            ControlMessage::Iteration {
                index,
                data_port,
                termination,
            } => (index, data_port, termination),
            ControlMessage::Done => return Ok(()),
            ControlMessage::Abort(reason) => bail!("server aborted: {reason}"),
            other => bail!("unexpected control message during the plan: {other:?}"),
        };

        let report = run_holder_iteration(
            &mut control,
            server,
            data_port,
            index,
            termination,
            &config,
            &cancel,
        )
        .await;
        let report = match report {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!(index, error = %e, "iteration failed");
                IterationReport {
                    index,
                    success: false,
                    scanning_ms: 0.0,
                    transaction_ms: 0.0,
                }
            }
        };
        control.send(&ControlMessage::Report(report)).await?;
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_holder_iteration(
    control: &mut ControlChannel,
    server: &str,
    data_port: u16,
    index: u32,
    termination: TerminationStyle,
    config: &HolderConfig,
    cancel: &CancellationToken,
) -> anyhow::Result<IterationReport> {
    // A fresh engagement, document instance and ephemeral key per run.
    let document: device::Document = config.mdoc.clone().into();
    let documents = Documents::new(config.mdoc.doc_type.clone(), document);
    let init = SessionManagerInit::initialise(documents, config.retrieval_methods.clone())?;
    let ble_ident = init
        .ble_ident()
        .map_err(|e| anyhow!("ident derivation: {e}"))?;
    let (engaged, qr_uri) = init.qr_engagement();
    control.send(&ControlMessage::Engagement { qr_uri }).await?;
    let method =
        retrieval_methods::disambiguate(&config.retrieval_methods, Role::Device)?[0].clone();

    let stream = TcpStream::connect((server, data_port))
        .await
        .context("connecting data channel")?;
    let mut options = config.transport.clone();
    options.ident = Some(ble_ident);
    let mut transport = Transport::connect(
        &method,
        Role::Device,
        Box::new(TcpChannel::new(stream)),
        &options,
        cancel.clone(),
    )
    .await?;

    let establishment_bytes = match transport.wait_for_message().await? {
        Received::Message(bytes) => bytes,
        Received::Terminated(style) => bail!("reader terminated ({style:?}) before requesting"),
    };
    let transaction_started = Instant::now();
    let establishment: SessionEstablishment = cbor::from_slice(&establishment_bytes)?;
    let (mut session, requested) = engaged.process_session_establishment(establishment)?;

    let permitted = device::permit_all(&requested);
    match config.device_auth {
        DeviceAuthVariant::Mac => {
            session.prepare_response_mac(
                &requested,
                permitted,
                config.secure_area.as_ref(),
                &config.key_alias,
            )?;
        }
        DeviceAuthVariant::Signature => {
            session.prepare_response(&requested, permitted);
            while let Some((_, payload)) = session.get_next_signature_payload() {
                let signature = config.secure_area.sign(&config.key_alias, payload)?;
                session.submit_next_signature(signature)?;
            }
        }
    }
    let response = session
        .retrieve_response()
        .ok_or_else(|| anyhow!("no response was prepared"))?;
    transport.send_message(&response).await?;
    let transaction_ms = transaction_started.elapsed().as_secs_f64() * 1e3;

    // The reader tears the session down in the planned style.
    let success = match transport.wait_for_message().await {
        Ok(Received::Terminated(style)) => style == termination,
        Ok(Received::Message(_)) => false,
        Err(_) => false,
    };

    Ok(IterationReport {
        index,
        success,
        scanning_ms: 0.0,
        transaction_ms,
    })
}
