use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use secrecy::SecretString;
use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ntrip_client::relay::Relay;
use ntrip_client::retry::{retry_until, RetryPolicy};
use ntrip_client::{
    ClientConfig, ErrorKind, NtripClient, NtripDefaults, NtripError, NtripVersion, StreamReader,
};

/// Stream RTCM corrections from an NTRIP caster (v1/v2, plain or TLS).
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Caster host name
    #[arg(long)]
    host: Option<String>,

    /// Caster port [default: 2101]
    #[arg(long)]
    port: Option<u32>,

    /// Mountpoint to stream (e.g. RTCM3)
    #[arg(long)]
    mountpoint: Option<String>,

    /// User name for Basic authentication
    #[arg(long, env = "NTRIP_USER")]
    user: Option<String>,

    /// Password for Basic authentication
    #[arg(long, env = "NTRIP_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Connect over TLS
    #[arg(long, alias = "https")]
    tls: bool,

    /// NTRIP protocol version [default: 2]
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=2))]
    ntrip_version: Option<u8>,

    /// Extra greeting accepted as success from version 1 casters (repeatable)
    #[arg(long = "accept-greeting")]
    accept_greetings: Vec<String>,

    /// Connect and handshake timeout in seconds [default: 10]
    #[arg(long)]
    timeout: Option<u64>,

    /// File to write corrections to; stdout when omitted
    #[arg(long)]
    output: Option<PathBuf>,

    /// Serve the stream to local TCP clients on this port instead of writing it
    #[arg(long)]
    serve_port: Option<u16>,

    /// Address the relay listens on
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Reconnect attempts after a dropped or failed session
    #[arg(long, default_value_t = 0)]
    reconnect: usize,

    /// JSON caster profile; command line flags override its values
    #[arg(long)]
    config: Option<PathBuf>,
}

/// Caster profile loaded with `--config`.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct Profile {
    host: Option<String>,
    port: Option<u32>,
    mountpoint: Option<String>,
    username: Option<String>,
    password: Option<SecretString>,
    tls: Option<bool>,
    version: Option<u8>,
    accept_greetings: Vec<String>,
    timeout_secs: Option<u64>,
}

impl Profile {
    async fn load(path: &Path) -> Result<Self, CliError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|err| CliError::Profile(format!("{}: {err}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|err| CliError::Profile(format!("{}: {err}", path.display())))
    }
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Ntrip(#[from] NtripError),

    #[error("could not load profile {0}")]
    Profile(String),

    #[error("missing required setting --{0}")]
    Missing(&'static str),

    #[error("output error: {0}")]
    Output(#[source] io::Error),

    #[error("relay bind failed: {0}")]
    Relay(#[source] io::Error),

    #[error("caster closed the stream")]
    CasterClosed,
}

impl CliError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Ntrip(err) => err.is_retryable(),
            Self::CasterClosed => true,
            Self::Profile(_) | Self::Missing(_) | Self::Output(_) | Self::Relay(_) => false,
        }
    }

    fn exit_code(&self) -> u8 {
        match self {
            Self::Ntrip(err) => ntrip_exit_code(err.kind()),
            Self::Profile(_) | Self::Missing(_) => 2,
            Self::Output(_) | Self::Relay(_) => 3,
            Self::CasterClosed => 0,
        }
    }
}

fn ntrip_exit_code(kind: ErrorKind) -> u8 {
    match kind {
        ErrorKind::InvalidConfig => 2,
        ErrorKind::DnsFailure => 10,
        ErrorKind::ConnectionRefused => 11,
        ErrorKind::ConnectTimeout | ErrorKind::Tls | ErrorKind::Transport => 12,
        ErrorKind::HandshakeTimeout => 20,
        ErrorKind::AuthenticationFailed => 21,
        ErrorKind::MountpointNotFound => 22,
        ErrorKind::MalformedResponse => 23,
        ErrorKind::CasterRejected => 24,
        ErrorKind::StreamInterrupted => 30,
    }
}

enum Sink {
    Output(Box<dyn AsyncWrite + Unpin + Send>),
    Relay { bind: IpAddr, port: u16 },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(CliError::CasterClosed) => {
            info!(event = "ntrip_stream_ended");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(event = "ntrip_client_failed", error = %err);
            eprintln!("error: {err}");
            ExitCode::from(err.exit_code())
        }
    }
}

async fn run(args: Args) -> Result<(), CliError> {
    let profile = match args.config.as_deref() {
        Some(path) => Profile::load(path).await?,
        None => Profile::default(),
    };
    let config = build_config(&args, profile)?;
    let client = NtripClient::new(config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!(event = "shutdown_requested");
            shutdown_tx.send_replace(true);
        }
    });

    let sink = match args.serve_port {
        Some(port) => Sink::Relay {
            bind: args.bind,
            port,
        },
        None => Sink::Output(open_output(args.output.as_deref()).await?),
    };
    let sink = Mutex::new(sink);

    let policy = RetryPolicy::reconnect(args.reconnect);
    let result = supervise(&client, &sink, &policy, shutdown_rx).await;

    if let Sink::Output(writer) = &mut *sink.lock().await {
        writer.flush().await.map_err(CliError::Output)?;
    }
    result
}

/// How a session that got as far as streaming ended.
enum SessionEnd {
    Shutdown,
    /// The stream delivered data and then dropped; the reconnect budget
    /// starts over.
    Dropped(CliError),
}

/// Runs sessions until shutdown, a permanent failure, or an exhausted
/// reconnect budget. The budget applies per outage: a session that streamed
/// data resets it.
async fn supervise(
    client: &NtripClient,
    sink: &Mutex<Sink>,
    policy: &RetryPolicy,
    shutdown: watch::Receiver<bool>,
) -> Result<(), CliError> {
    loop {
        let outcome = retry_until(
            policy,
            |attempt| {
                let shutdown = shutdown.clone();
                async move {
                    info!(event = "ntrip_session_attempt", attempt);
                    let mut sink = sink.lock().await;
                    run_session(client, &mut sink, shutdown).await
                }
            },
            CliError::is_retryable,
            shutdown_requested(shutdown.clone()),
        )
        .await;

        let err = match outcome {
            None | Some(Ok(SessionEnd::Shutdown)) => return Ok(()),
            Some(Err(err)) => return Err(err),
            Some(Ok(SessionEnd::Dropped(err))) => err,
        };
        if policy.max_attempts <= 1 || !err.is_retryable() {
            return Err(err);
        }

        let delay = policy.delay_for_attempt(1);
        warn!(
            event = "reconnect_scheduled",
            attempt = 1,
            max_attempts = policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_requested(shutdown.clone()) => return Ok(()),
        }
    }
}

/// Resolves once shutdown is requested. A closed channel never resolves.
async fn shutdown_requested(mut shutdown: watch::Receiver<bool>) {
    let requested = shutdown.wait_for(|requested| *requested).await.is_ok();
    if !requested {
        std::future::pending::<()>().await;
    }
}

fn build_config(args: &Args, profile: Profile) -> Result<ClientConfig, CliError> {
    let host = args
        .host
        .clone()
        .or(profile.host)
        .ok_or(CliError::Missing("host"))?;
    let mountpoint = args
        .mountpoint
        .clone()
        .or(profile.mountpoint)
        .ok_or(CliError::Missing("mountpoint"))?;
    let version = args.ntrip_version.or(profile.version).unwrap_or(2);
    let version = NtripVersion::from_number(version).map_err(NtripError::from)?;
    let timeout = args
        .timeout
        .or(profile.timeout_secs)
        .map(Duration::from_secs)
        .unwrap_or(NtripDefaults::HANDSHAKE_TIMEOUT);

    let mut builder = ClientConfig::builder(host, mountpoint)
        .port(args.port.or(profile.port).unwrap_or(u32::from(NtripDefaults::PORT)))
        .use_tls(args.tls || profile.tls.unwrap_or(false))
        .version(version)
        .connect_timeout(timeout)
        .handshake_timeout(timeout);

    let username = args.user.clone().or(profile.username);
    let password = args
        .password
        .clone()
        .map(SecretString::new)
        .or(profile.password);
    if let Some(username) = username {
        builder = builder.credentials(username, password);
    }

    let greetings = profile
        .accept_greetings
        .into_iter()
        .chain(args.accept_greetings.iter().cloned());
    for greeting in greetings {
        builder = builder.accept_v1_greeting(greeting);
    }

    builder
        .build()
        .map_err(|err| CliError::Ntrip(NtripError::from(err)))
}

async fn open_output(path: Option<&Path>) -> Result<Box<dyn AsyncWrite + Unpin + Send>, CliError> {
    match path {
        Some(path) => {
            let file = tokio::fs::File::create(path)
                .await
                .map_err(CliError::Output)?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(tokio::io::stdout())),
    }
}

async fn run_session(
    client: &NtripClient,
    sink: &mut Sink,
    shutdown: watch::Receiver<bool>,
) -> Result<SessionEnd, CliError> {
    if *shutdown.borrow() {
        return Ok(SessionEnd::Shutdown);
    }

    let mut reader = tokio::select! {
        reader = client.connect() => reader?,
        _ = shutdown_requested(shutdown.clone()) => return Ok(SessionEnd::Shutdown),
    };
    let close_handle = reader.close_handle();
    let watcher = tokio::spawn(async move {
        shutdown_requested(shutdown).await;
        close_handle.close();
    });

    let result = match sink {
        Sink::Output(writer) => pump(&mut reader, writer.as_mut()).await,
        Sink::Relay { bind, port } => match Relay::bind((*bind, *port)).await {
            Ok(relay) => relay.run(&mut reader).await.map(|_| ()).map_err(CliError::from),
            Err(err) => Err(CliError::Relay(err)),
        },
    };
    watcher.abort();

    if reader.close_handle().is_closed() {
        return Ok(SessionEnd::Shutdown);
    }
    let err = result.err().unwrap_or(CliError::CasterClosed);
    if reader.bytes_read() > 0 {
        Ok(SessionEnd::Dropped(err))
    } else {
        Err(err)
    }
}

async fn pump<T>(
    reader: &mut StreamReader<T>,
    writer: &mut (dyn AsyncWrite + Unpin + Send),
) -> Result<(), CliError>
where
    T: ntrip_client::transport::Transport,
{
    while let Some(chunk) = reader.next().await? {
        writer.write_all(&chunk).await.map_err(CliError::Output)?;
        writer.flush().await.map_err(CliError::Output)?;
    }
    Ok(())
}
