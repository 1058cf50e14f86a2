#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::module_name_repetitions,
    clippy::needless_pass_by_value,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use replyqueue::config::Config;
use replyqueue::observability::create_observer;
use replyqueue::publisher::create_publisher;
use replyqueue::transport::InMemoryTransport;
use replyqueue::{
    Message, MessageHandler, MessagePoller, Observer, ReplyQueue, RequestMessage, Subscriber,
    Transport,
};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CompletionShell {
    #[value(name = "bash")]
    Bash,
    #[value(name = "fish")]
    Fish,
    #[value(name = "zsh")]
    Zsh,
    #[value(name = "powershell")]
    PowerShell,
    #[value(name = "elvish")]
    Elvish,
}

/// Request/reply over message queues.
#[derive(Parser, Debug)]
#[command(name = "replyqueue")]
#[command(version)]
#[command(about = "Request/reply over at-least-once message queues.", long_about = None)]
struct Cli {
    /// Config file (defaults to $REPLYQUEUE_CONFIG, then the platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run an in-process ping/pong over the in-memory transport
    Demo {
        /// Number of requests to send
        #[arg(long, default_value_t = 3)]
        requests: usize,
    },

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Generate shell completion script to stdout
    #[command(long_about = "\
Generate shell completion scripts for `replyqueue`.

Examples:
  source <(replyqueue completions bash)
  replyqueue completions zsh > ~/.zfunc/_replyqueue")]
    Completions {
        #[arg(value_enum)]
        shell: CompletionShell,
    },

    /// Send requests to a queue and wait for each reply
    #[cfg(feature = "sqs")]
    Request {
        #[arg(long)]
        queue_url: String,
        #[arg(long)]
        body: String,
        #[arg(long, default_value_t = 1)]
        count: usize,
        /// Seconds to wait for each reply (defaults to reply_queue.default_response_timeout_secs)
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Answer requests on a queue with the request body plus a suffix
    #[cfg(feature = "sqs")]
    Respond {
        #[arg(long)]
        queue_url: String,
        #[arg(long, default_value = "-pong")]
        suffix: String,
    },
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigCommands {
    /// Print the JSON schema of the config file
    Schema,
    /// Print the effective configuration as TOML
    Show,
}

/// Replies with the request body plus a fixed suffix.
struct SuffixHandler {
    suffix: String,
}

#[async_trait]
impl MessageHandler for SuffixHandler {
    async fn process(&self, message: &Message) -> anyhow::Result<Option<String>> {
        Ok(Some(format!("{}{}", message.body, self.suffix)))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Completions must stay stdout-only: no config loading, no logging.
    if let Commands::Completions { shell } = &cli.command {
        let mut stdout = std::io::stdout().lock();
        write_shell_completion(*shell, &mut stdout)?;
        return Ok(());
    }

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default tracing subscriber failed")?;

    let config = Config::load(cli.config.as_deref()).await?;

    match cli.command {
        Commands::Demo { requests } => run_demo(config, requests).await,
        Commands::Config { command } => match command {
            ConfigCommands::Schema => {
                println!("{}", Config::json_schema()?);
                Ok(())
            }
            ConfigCommands::Show => {
                print!("{}", config.to_toml()?);
                Ok(())
            }
        },
        Commands::Completions { .. } => unreachable!(),
        #[cfg(feature = "sqs")]
        Commands::Request {
            queue_url,
            body,
            count,
            timeout,
        } => run_request(config, queue_url, body, count, timeout).await,
        #[cfg(feature = "sqs")]
        Commands::Respond { queue_url, suffix } => run_respond(config, queue_url, suffix).await,
    }
}

fn observer_for(config: &Config) -> Arc<dyn Observer> {
    Arc::from(create_observer(&config.observability))
}

fn responder(
    transport: &Arc<dyn Transport>,
    config: &Config,
    queue_url: &str,
    suffix: String,
    observer: &Arc<dyn Observer>,
) -> Arc<MessagePoller> {
    let subscriber = Arc::new(
        Subscriber::new(
            Arc::clone(transport),
            config.subscriber.clone(),
            Arc::clone(observer),
        )
        .with_queue(queue_url),
    );
    let publisher = create_publisher(
        Arc::clone(transport),
        &config.reliability,
        None,
        Arc::clone(observer),
    );
    Arc::new(MessagePoller::new(
        subscriber,
        Arc::new(SuffixHandler { suffix }),
        publisher,
        Arc::clone(observer),
    ))
}

async fn run_demo(config: Config, requests: usize) -> Result<()> {
    if requests == 0 {
        bail!("--requests must be at least 1");
    }

    let transport: Arc<dyn Transport> = Arc::new(InMemoryTransport::new());
    let observer = observer_for(&config);
    let inbox = transport
        .create_queue("demo_requests", &HashMap::new(), &HashMap::new())
        .await?;

    let shutdown = CancellationToken::new();
    let poller = responder(&transport, &config, &inbox, "-pong".into(), &observer);
    let responder_task = poller.spawn(shutdown.clone());

    let publisher = create_publisher(
        Arc::clone(&transport),
        &config.reliability,
        None,
        Arc::clone(&observer),
    );
    let reply_queue = Arc::new(ReplyQueue::from_config(
        Arc::clone(&transport),
        &config,
        Arc::clone(&observer),
    ));

    let result = async {
        for i in 0..requests {
            let request = RequestMessage::new(format!("ping-{i}"), &inbox)
                .with_reply_to(Arc::clone(&reply_queue));
            publisher.send(&request).await?;
            let reply = request
                .get_response(reply_queue.default_response_timeout())
                .await?;
            println!("{} -> {}", request.body(), reply.body);
        }
        anyhow::Ok(())
    }
    .await;

    shutdown.cancel();
    responder_task.await??;
    reply_queue.teardown().await?;
    result
}

#[cfg(feature = "sqs")]
async fn run_request(
    mut config: Config,
    queue_url: String,
    body: String,
    count: usize,
    timeout: Option<u64>,
) -> Result<()> {
    use replyqueue::config::TransportBackend;
    use replyqueue::transport::create_transport;
    use std::time::Duration;

    config.transport.backend = TransportBackend::Sqs;
    let transport = create_transport(&config.transport).await?;
    let observer = observer_for(&config);
    let publisher = create_publisher(
        Arc::clone(&transport),
        &config.reliability,
        None,
        Arc::clone(&observer),
    );
    let reply_queue = Arc::new(ReplyQueue::from_config(
        Arc::clone(&transport),
        &config,
        Arc::clone(&observer),
    ));
    let timeout = timeout.map_or_else(|| reply_queue.default_response_timeout(), Duration::from_secs);

    let result = async {
        for _ in 0..count {
            let request =
                RequestMessage::new(body.clone(), &queue_url).with_reply_to(Arc::clone(&reply_queue));
            publisher.send(&request).await?;
            tokio::select! {
                reply = request.get_response(timeout) => println!("{}", reply?.body),
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Interrupted");
                    break;
                }
            }
        }
        anyhow::Ok(())
    }
    .await;

    reply_queue.teardown().await?;
    result
}

#[cfg(feature = "sqs")]
async fn run_respond(mut config: Config, queue_url: String, suffix: String) -> Result<()> {
    use replyqueue::config::TransportBackend;
    use replyqueue::transport::create_transport;

    config.transport.backend = TransportBackend::Sqs;
    let transport = create_transport(&config.transport).await?;
    let observer = observer_for(&config);
    let shutdown = CancellationToken::new();
    let poller = responder(&transport, &config, &queue_url, suffix, &observer);
    let task = poller.spawn(shutdown.clone());

    tracing::info!(queue = %queue_url, "Responding; Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    shutdown.cancel();
    task.await??;
    Ok(())
}

fn write_shell_completion<W: Write>(shell: CompletionShell, writer: &mut W) -> Result<()> {
    use clap_complete::generate;
    use clap_complete::shells;

    let mut cmd = Cli::command();
    let bin_name = cmd.get_name().to_string();

    match shell {
        CompletionShell::Bash => generate(shells::Bash, &mut cmd, bin_name.clone(), writer),
        CompletionShell::Fish => generate(shells::Fish, &mut cmd, bin_name.clone(), writer),
        CompletionShell::Zsh => generate(shells::Zsh, &mut cmd, bin_name.clone(), writer),
        CompletionShell::PowerShell => {
            generate(shells::PowerShell, &mut cmd, bin_name.clone(), writer);
        }
        CompletionShell::Elvish => generate(shells::Elvish, &mut cmd, bin_name, writer),
    }

    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn demo_defaults_to_three_requests() {
        let cli = Cli::try_parse_from(["replyqueue", "demo"]).expect("demo should parse");
        match cli.command {
            Commands::Demo { requests } => assert_eq!(requests, 3),
            other => panic!("expected demo command, got {other:?}"),
        }
    }

    #[test]
    fn config_flag_is_global() {
        let cli = Cli::try_parse_from(["replyqueue", "config", "show", "--config", "/tmp/x.toml"])
            .expect("config show should parse");
        assert_eq!(cli.config.as_deref(), Some(std::path::Path::new("/tmp/x.toml")));
        assert!(matches!(
            cli.command,
            Commands::Config {
                command: ConfigCommands::Show
            }
        ));
    }

    #[test]
    fn completions_cli_parses_supported_shells() {
        for shell in ["bash", "fish", "zsh", "powershell", "elvish"] {
            let cli = Cli::try_parse_from(["replyqueue", "completions", shell])
                .expect("completions invocation should parse");
            match cli.command {
                Commands::Completions { .. } => {}
                other => panic!("expected completions command, got {other:?}"),
            }
        }
    }

    #[test]
    fn completion_generation_mentions_binary_name() {
        let mut output = Vec::new();
        write_shell_completion(CompletionShell::Bash, &mut output)
            .expect("completion generation should succeed");
        let script = String::from_utf8(output).expect("completion output should be valid utf-8");
        assert!(script.contains("replyqueue"));
    }

    #[tokio::test]
    async fn suffix_handler_appends_suffix() {
        let handler = SuffixHandler {
            suffix: "-pong".into(),
        };
        let message = Message {
            id: "m1".into(),
            receipt_handle: String::new(),
            body: "ping".into(),
            attributes: HashMap::new(),
            received_at: chrono::Utc::now(),
        };
        assert_eq!(
            handler.process(&message).await.unwrap().as_deref(),
            Some("ping-pong")
        );
    }
}
