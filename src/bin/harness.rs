//! Two-process interoperability harness. Run `mdoc-harness serve` in one
//! terminal and `mdoc-harness connect` in another; the server plays the
//! reader, the client plays the holder, and each planned iteration runs a
//! full presentment over loopback TCP.
use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use mdoc_proximity::definitions::device_engagement::{
    BleOptions, CentralClientMode, DeviceRetrievalMethod, DeviceRetrievalMethods,
};
use mdoc_proximity::definitions::device_request::ItemsRequest;
use mdoc_proximity::definitions::helpers::NonEmptyMap;
use mdoc_proximity::definitions::x5chain::X5Chain;
use mdoc_proximity::harness::runner::{
    self, DeviceAuthVariant, HolderConfig, ReaderConfig, ReaderIdentity,
};
use mdoc_proximity::harness::{PlanEntry, TestPlan};
use mdoc_proximity::issuance::Mdoc;
use mdoc_proximity::secure_area::{KeySettings, SecureArea, SoftwareSecureArea};
use mdoc_proximity::transport::{ConnectionSelector, TerminationStyle, TransportOptions};

const DOC_TYPE: &str = "org.iso.18013.5.1.mDL";
const NAMESPACE: &str = "org.iso.18013.5.1";

const ISSUER_KEY: &str = include_str!("../../test/issuer_key.pem");
const ISSUER_CERT: &str = include_str!("../../test/issuer_cert.pem");
const READER_KEY: &str = include_str!("../../test/reader_key.pem");
const READER_CERT: &str = include_str!("../../test/reader_cert.pem");

#[derive(Parser)]
#[command(name = "mdoc-harness", about = "mdoc presentment interoperability harness")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Play the reader: serve the control socket and drive the plan.
    Serve {
        #[arg(long, default_value = "0.0.0.0")]
        bind: String,
        #[arg(long, default_value_t = 7230)]
        port: u16,
        /// Iterations per termination style.
        #[arg(long, default_value_t = 5)]
        iterations: u32,
        #[arg(long, value_enum, default_value_t = Termination::All)]
        termination: Termination,
    },
    /// Play the holder: dial the control socket and answer each iteration.
    Connect {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value_t = 7230)]
        port: u16,
        #[arg(long, value_enum, default_value_t = DeviceAuth::Signature)]
        device_auth: DeviceAuth,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Termination {
    All,
    Status,
    Close,
    Transport,
}

#[derive(Clone, Copy, ValueEnum)]
enum DeviceAuth {
    Signature,
    Mac,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted; shutting down");
            signal_cancel.cancel();
        }
    });

    match cli.command {
        Command::Serve {
            bind,
            port,
            iterations,
            termination,
        } => serve(&bind, port, iterations, termination, cancel).await,
        Command::Connect {
            host,
            port,
            device_auth,
        } => connect(&host, port, device_auth, cancel).await,
    }
}

async fn serve(
    bind: &str,
    port: u16,
    iterations: u32,
    termination: Termination,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind((bind, port))
        .await
        .with_context(|| format!("binding control socket on {bind}:{port}"))?;
    tracing::info!(%bind, port, "serving; waiting for a holder");

    let styles: Vec<TerminationStyle> = match termination {
        Termination::All => vec![
            TerminationStyle::InBandStatus,
            TerminationStyle::CloseMessage,
            TerminationStyle::TransportSpecific,
        ],
        Termination::Status => vec![TerminationStyle::InBandStatus],
        Termination::Close => vec![TerminationStyle::CloseMessage],
        Termination::Transport => vec![TerminationStyle::TransportSpecific],
    };
    let plan: TestPlan = styles
        .into_iter()
        .map(|termination| PlanEntry {
            termination,
            iterations,
        })
        .collect::<Vec<_>>()
        .into();

    let secure_area = Arc::new(SoftwareSecureArea::default());
    let reader_key =
        p256::SecretKey::from_sec1_pem(READER_KEY).context("parsing reader key")?;
    secure_area.import_key("reader", reader_key)?;
    let config = ReaderConfig {
        requests: vec![demo_request()],
        authority: Some(ReaderIdentity {
            secure_area,
            key_alias: "reader".to_string(),
            x5chain: X5Chain::from_pem_chain(READER_CERT)?,
        }),
        selector: ConnectionSelector::default(),
        transport: TransportOptions::default(),
    };

    let result = runner::run_server(listener, plan, config, cancel).await?;
    for (style, entry) in &result.entries {
        tracing::info!(
            ?style,
            successes = entry.successes,
            failures = entry.failures,
            scanning_mean_ms = entry.scanning.mean,
            transaction_mean_ms = entry.transaction.mean,
            transaction_std_dev_ms = entry.transaction.std_dev,
            "entry finished"
        );
    }
    anyhow::ensure!(result.all_succeeded(), "some iterations failed");
    Ok(())
}

async fn connect(
    host: &str,
    port: u16,
    device_auth: DeviceAuth,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let secure_area: Arc<SoftwareSecureArea> = Arc::default();
    let device_key_info = secure_area.create_key("device", KeySettings::default())?;
    let mdoc = demo_mdoc(device_key_info.public_key)?;
    let config = HolderConfig {
        mdoc,
        secure_area,
        key_alias: "device".to_string(),
        retrieval_methods: DeviceRetrievalMethods::new(DeviceRetrievalMethod::BLE(BleOptions {
            peripheral_server_mode: None,
            central_client_mode: Some(CentralClientMode {
                uuid: uuid::Uuid::new_v4(),
            }),
        })),
        device_auth: match device_auth {
            DeviceAuth::Signature => DeviceAuthVariant::Signature,
            DeviceAuth::Mac => DeviceAuthVariant::Mac,
        },
        transport: TransportOptions::default(),
    };
    tracing::info!(%host, port, "connecting to the reader");
    runner::run_client(host, port, config, cancel).await
}

fn demo_mdoc(
    device_key: mdoc_proximity::definitions::device_key::CoseKey,
) -> anyhow::Result<Mdoc> {
    let issuer_key = p256::SecretKey::from_sec1_pem(ISSUER_KEY).context("parsing issuer key")?;
    let signer = p256::ecdsa::SigningKey::from(issuer_key);
    let elements: BTreeMap<String, ciborium::Value> = [
        ("family_name", ciborium::Value::Text("Mustermann".into())),
        ("given_name", ciborium::Value::Text("Erika".into())),
        ("document_number", ciborium::Value::Text("0123456789".into())),
        ("age_over_21", ciborium::Value::Bool(true)),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();
    let namespaces = [(NAMESPACE.to_string(), elements)].into_iter().collect();
    Ok(Mdoc::builder()
        .doc_type(DOC_TYPE)
        .namespaces(namespaces)
        .device_key(device_key)
        .issue(X5Chain::from_pem_chain(ISSUER_CERT)?, &signer)?)
}

fn demo_request() -> ItemsRequest {
    let mut elements = NonEmptyMap::new("family_name".to_string(), false);
    elements.insert("given_name".to_string(), false);
    elements.insert("age_over_21".to_string(), false);
    ItemsRequest {
        doc_type: DOC_TYPE.to_string(),
        namespaces: NonEmptyMap::new(NAMESPACE.to_string(), elements),
        request_info: None,
    }
}
