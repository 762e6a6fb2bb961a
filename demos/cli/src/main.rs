//! Command-line runner client.
//!
//! Run with: cargo run -p code-runner-cli -- --language python hello.py
//!
//! Streams stdout to stdout and backend errors to stderr. The first Ctrl-C
//! asks the backend to stop; a second one exits immediately.

use std::{
    io::{self, Read, Write},
    path::{Path, PathBuf},
    process::ExitCode,
    time::Duration,
};

use anyhow::Context;
use clap::Parser;
use code_runner_core::{
    FragmentKind, Language, RunRequest, SessionError, SessionEvent, SessionStatus,
};
use code_runner_session::{Channel, ClientConfig, ClientError, DEFAULT_ENDPOINT, RunnerClient};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(version, about = "Run code on a remote execution backend")]
struct Args {
    /// Source file to run, or `-` to read it from stdin.
    #[arg(required_unless_present = "list_languages")]
    file: Option<PathBuf>,

    /// Language of the source file.
    #[arg(short, long, default_value_t = Language::default())]
    language: Language,

    /// Text passed to the program's stdin.
    #[arg(short, long, conflicts_with = "input_file")]
    input: Option<String>,

    /// File whose contents are passed to the program's stdin.
    #[arg(long)]
    input_file: Option<PathBuf>,

    /// WebSocket endpoint of the backend.
    #[arg(long, env = "CODE_RUNNER_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
    endpoint: String,

    /// Seconds to wait for the connection.
    #[arg(long, default_value_t = 10)]
    connect_timeout: u64,

    /// Stop the run after this many seconds without output.
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Print the supported languages and exit.
    #[arg(long)]
    list_languages: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let args = Args::parse();

    if args.list_languages {
        for lang in Language::ALL {
            println!("{:<12}{}", lang.code(), lang.display_name());
        }
        return Ok(ExitCode::SUCCESS);
    }

    let Some(file) = args.file.as_deref() else {
        anyhow::bail!("no source file given");
    };
    let code = read_source(file)?;
    let input = match (&args.input, &args.input_file) {
        (Some(text), _) => text.clone(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        (None, None) => String::new(),
    };
    let request = RunRequest::new(args.language, code).with_input(input);

    // wss:// endpoints need a process-wide crypto provider.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let config = ClientConfig::new(args.endpoint)
        .with_connect_timeout(Duration::from_secs(args.connect_timeout))
        .with_idle_timeout(args.idle_timeout.map(Duration::from_secs));
    tracing::info!(endpoint = %config.endpoint, "Connecting");

    let mut client = RunnerClient::connect(config);
    client
        .wait_open()
        .await
        .with_context(|| format!("could not connect to {}", client.config().endpoint))?;

    client.run(request)?;
    let status = stream_run(&mut client).await?;

    if let Some(err @ SessionError::Connectivity(_)) = client.session().error() {
        eprintln!("error: {err}");
    }
    client.close();

    Ok(match status {
        SessionStatus::Completed => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    })
}

fn read_source(path: &Path) -> anyhow::Result<String> {
    if path == Path::new("-") {
        let mut code = String::new();
        io::stdin()
            .read_to_string(&mut code)
            .context("failed to read code from stdin")?;
        Ok(code)
    } else {
        std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
    }
}

/// Print output as it arrives until the run ends.
async fn stream_run<C: Channel>(client: &mut RunnerClient<C>) -> anyhow::Result<SessionStatus> {
    let mut interrupted = false;

    loop {
        tokio::select! {
            event = client.next_event_watched() => match event {
                Ok(Some(SessionEvent::Output(fragment))) => {
                    let written = match fragment.kind {
                        FragmentKind::Stdout => write_flush(&mut io::stdout(), &fragment.text),
                        FragmentKind::Error => write_flush(&mut io::stderr(), &fragment.text),
                    };
                    if let Err(e) = written {
                        tracing::debug!("Output write failed: {e}");
                    }
                }
                Ok(Some(SessionEvent::Notice(notice))) => eprintln!("warning: {notice}"),
                Ok(Some(SessionEvent::StatusChanged(t))) if t.to.is_finished() => return Ok(t.to),
                Ok(Some(_)) => {}
                Ok(None) => return Ok(client.status()),
                Err(ClientError::IdleTimeout(limit)) => {
                    if client.status() == SessionStatus::Running {
                        eprintln!("no output for {}s, stopping", limit.as_secs());
                        client.stop()?;
                    } else {
                        anyhow::bail!("backend did not finish within {}s of stopping", limit.as_secs());
                    }
                }
                Err(e) => return Err(e.into()),
            },
            _ = tokio::signal::ctrl_c() => {
                if interrupted {
                    return Ok(client.status());
                }
                interrupted = true;
                match client.stop() {
                    Ok(()) => eprintln!("stopping, press Ctrl-C again to quit"),
                    Err(e) => tracing::warn!("Stop failed: {e}"),
                }
            }
        }
    }
}

fn write_flush(out: &mut impl Write, text: &str) -> io::Result<()> {
    out.write_all(text.as_bytes())?;
    out.flush()
}
