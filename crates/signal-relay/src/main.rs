//! Signal Relay Daemon - SSE relay for upstream reply generation

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use signal_relay::client::ReplyClient;
use signal_relay::config::Config;
use signal_relay::error::Result;
use signal_relay::relay::RelayServer;
use signal_relay::types::{GenerationRequest, Post, PostSource};
use signal_relay::upstream::OpenAiClient;

/// Signal Relay - streams model replies to clients as Server-Sent Events
#[derive(Parser)]
#[command(name = "signal-relay")]
#[command(about = "Streams upstream model replies to clients as Server-Sent Events")]
#[command(version)]
pub struct Cli {
    /// Path to config file
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the relay server (default command)
    #[command(name = "serve")]
    Serve {
        /// Override the configured listen address
        #[arg(long)]
        listen: Option<String>,
    },

    /// Ask a running relay for a reply and print it
    #[command(name = "reply")]
    Reply(ReplyArgs),
}

#[derive(clap::Args)]
pub struct ReplyArgs {
    /// Base URL of the relay
    #[arg(long, default_value = "http://127.0.0.1:8000")]
    pub url: String,

    #[arg(long)]
    pub topic: String,

    #[arg(long)]
    pub title: String,

    /// URL of the post being replied to
    #[arg(long)]
    pub post_url: String,

    #[arg(long, default_value = "")]
    pub snippet: String,

    #[arg(long, value_enum, default_value = "reddit")]
    pub source: SourceArg,

    /// Use the buffered endpoint instead of streaming
    #[arg(long)]
    pub no_stream: bool,
}

#[derive(Clone, Copy, clap::ValueEnum)]
pub enum SourceArg {
    Linkedin,
    Reddit,
    X,
}

impl From<SourceArg> for PostSource {
    fn from(source: SourceArg) -> Self {
        match source {
            SourceArg::Linkedin => PostSource::Linkedin,
            SourceArg::Reddit => PostSource::Reddit,
            SourceArg::X => PostSource::X,
        }
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        None => serve(cli.config, None).await,
        Some(Command::Serve { listen }) => serve(cli.config, listen).await,
        Some(Command::Reply(args)) => reply(cli.config, args).await,
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,signal_relay=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn serve(config_path: Option<PathBuf>, listen: Option<String>) -> Result<()> {
    tracing::info!("Starting signal-relay");

    let mut config = Config::load(config_path.as_deref())?;
    if let Some(listen) = listen {
        config.server.listen_addr = listen;
        config.validate()?;
    }
    tracing::debug!("Config loaded: {:?}", config);

    let upstream = Arc::new(OpenAiClient::from_env(&config.upstream)?);
    RelayServer::new(config, upstream).serve().await
}

async fn reply(config_path: Option<PathBuf>, args: ReplyArgs) -> Result<()> {
    let config = Config::load(config_path.as_deref())?;
    let timeout = config.relay.request_timeout() + Duration::from_secs(5);
    let client = ReplyClient::new(&args.url, timeout)?;

    let request = GenerationRequest {
        topic: args.topic,
        post: Post {
            source: args.source.into(),
            title: args.title,
            url: args.post_url,
            snippet: args.snippet,
            ts: None,
        },
    };

    let mut stdout = std::io::stdout();
    if args.no_stream {
        let text = client.reply(&request).await?;
        writeln!(stdout, "{text}")?;
        return Ok(());
    }

    let streamed = client
        .reply_stream(&request, |text| {
            stdout.write_all(text.as_bytes())?;
            stdout.flush()?;
            Ok(())
        })
        .await?;
    writeln!(stdout)?;

    tracing::debug!(
        fragments = streamed.fragments,
        buffered = streamed.buffered,
        "Reply complete"
    );
    Ok(())
}
