use anyhow::Result;
use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "outlook", version, about = "Outlook mail from the command line")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output structured JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sign in with a device code
    Login,
    /// Forget the stored credentials
    Logout,
    /// Show the signed-in user
    User,
    /// List mail folders
    Folders,
    /// List messages in a folder
    List(ListArgs),
    /// Show one message with its body
    Read { message_id: String },
    /// Move messages to another folder
    Move {
        /// Message ids followed by the destination folder id
        #[arg(required = true, num_args = 2.., value_name = "MESSAGE_ID... FOLDER_ID")]
        targets: Vec<String>,
    },
    /// Delete messages
    Delete {
        #[arg(required = true, num_args = 1..)]
        message_ids: Vec<String>,
    },
    /// Forward a message
    Forward(ForwardArgs),
    /// Delete old messages from a folder in batches
    Purge(PurgeArgs),
}

#[derive(Debug, Args)]
struct ListArgs {
    #[arg(default_value = "inbox")]
    folder_id: String,
    #[arg(short = 't', long, default_value_t = 100)]
    top: usize,
    /// Oldest messages first
    #[arg(long, default_value_t = false)]
    oldest_first: bool,
    /// Only messages received today
    #[arg(long, default_value_t = false, conflicts_with = "yesterday")]
    today: bool,
    /// Only messages received yesterday
    #[arg(long, default_value_t = false)]
    yesterday: bool,
}

#[derive(Debug, Args)]
struct ForwardArgs {
    message_id: String,
    /// Recipient address (repeatable)
    #[arg(long = "to", required = true)]
    to: Vec<String>,
    #[arg(long)]
    comment: Option<String>,
}

#[derive(Debug, Args)]
struct PurgeArgs {
    #[arg(default_value = "inbox")]
    folder_id: String,
    /// Show what would be deleted without deleting
    #[arg(long, default_value_t = false)]
    dry_run: bool,
    /// Messages per batch
    #[arg(long, default_value_t = 50, value_parser = clap::value_parser!(u32).range(1..))]
    batch_size: u32,
    /// Delete messages received before this date (YYYY-MM-DD)
    #[arg(long, default_value = "2024-01-01")]
    before_date: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    commands::dispatch(cli).await
}

mod commands {
    use std::sync::Arc;

    use anyhow::{anyhow, bail, Context, Result};
    use chrono::Utc;

    use outlook::auth::{FileCredentialStore, TokenProvider};
    use outlook::config::AppConfig;
    use outlook::dates;
    use outlook::graph::GraphClient;
    use outlook::mail::{self, MailClient, MessageQuery, OperationOutcome, SortOrder};
    use outlook::output::{self, lines, OutputFormat};
    use outlook::purge::{PurgeCoordinator, PurgeRequest, StdConsole};

    use super::{Cli, Commands, ForwardArgs, ListArgs, PurgeArgs};

    pub async fn dispatch(cli: Cli) -> Result<()> {
        let config = AppConfig::load().context("load outlook configuration")?;
        let format = OutputFormat::from_json_flag(cli.json);
        let tokens = token_provider(&config)?;

        match cli.command {
            Commands::Login => handle_login(&config, tokens).await,
            Commands::Logout => handle_logout(&tokens).await,
            Commands::User => {
                let client = GraphClient::open(&config, tokens)?;
                handle_user(&client, format).await
            }
            Commands::Folders => {
                let client = GraphClient::open(&config, tokens)?;
                handle_folders(&client, format).await
            }
            Commands::List(args) => {
                let client = GraphClient::open(&config, tokens)?;
                handle_list(&client, &config, args, format).await
            }
            Commands::Read { message_id } => {
                let client = GraphClient::open(&config, tokens)?;
                handle_read(&client, &message_id, format).await
            }
            Commands::Move { targets } => {
                let client = GraphClient::open(&config, tokens)?;
                handle_move(&client, &targets).await
            }
            Commands::Delete { message_ids } => {
                let client = GraphClient::open(&config, tokens)?;
                handle_delete(&client, &message_ids).await
            }
            Commands::Forward(args) => {
                let client = GraphClient::open(&config, tokens)?;
                handle_forward(&client, args).await
            }
            Commands::Purge(args) => handle_purge(&config, tokens, args).await,
        }
    }

    fn token_provider(config: &AppConfig) -> Result<Arc<TokenProvider>> {
        let store = FileCredentialStore::from_env(config.auth_record_path())
            .context("open credential store")?;
        Ok(Arc::new(TokenProvider::new(config, Arc::new(store))))
    }

    async fn handle_login(config: &AppConfig, tokens: Arc<TokenProvider>) -> Result<()> {
        let prompt = tokens.begin_login().await.context("start device-code sign-in")?;
        match prompt.message.as_deref() {
            Some(message) => eprintln!("{message}"),
            None => eprintln!(
                "To sign in, open {} and enter the code {}",
                prompt.verification_uri, prompt.user_code
            ),
        }
        tokens
            .complete_login(&prompt)
            .await
            .context("complete device-code sign-in")?;

        let client = GraphClient::open(config, Arc::clone(&tokens))?;
        if let Some(address) = client.me().await?.address {
            tokens.remember_username(&address).await?;
        }
        println!("{}", lines::ok_line(&["authenticated"]));
        Ok(())
    }

    async fn handle_logout(tokens: &TokenProvider) -> Result<()> {
        tokens.logout().await.context("clear stored credentials")?;
        println!("{}", lines::ok_line(&["logged-out"]));
        Ok(())
    }

    async fn handle_user(client: &GraphClient, format: OutputFormat) -> Result<()> {
        let user = client.me().await?;
        println!("{}", output::format_user(format, &user)?);
        Ok(())
    }

    async fn handle_folders(client: &GraphClient, format: OutputFormat) -> Result<()> {
        let folders = client.mail_folders().await?;
        println!("{}", output::format_folders(format, &folders)?);
        Ok(())
    }

    async fn handle_list(
        client: &GraphClient,
        config: &AppConfig,
        args: ListArgs,
        format: OutputFormat,
    ) -> Result<()> {
        let mut query = MessageQuery {
            order: if args.oldest_first {
                SortOrder::Ascending
            } else {
                SortOrder::Descending
            },
            top: args.top,
            ..MessageQuery::default()
        };

        let days_back = match (args.today, args.yesterday) {
            (true, _) => Some(0),
            (_, true) => Some(1),
            _ => None,
        };
        if let Some(days_back) = days_back {
            let (start, end) = dates::day_window(Utc::now(), config.timezone, days_back)
                .ok_or_else(|| anyhow!("could not compute day window in {}", config.timezone))?;
            query.received_on_or_after = Some(start);
            query.received_before = Some(end);
        }

        let page = client.list_messages(&args.folder_id, &query).await?;
        println!("{}", output::format_message_page(format, &page)?);
        Ok(())
    }

    async fn handle_read(client: &GraphClient, message_id: &str, format: OutputFormat) -> Result<()> {
        let message = client.get_message(message_id).await?;
        println!("{}", output::format_message(format, &message)?);
        Ok(())
    }

    async fn handle_move(client: &GraphClient, targets: &[String]) -> Result<()> {
        let Some((destination, message_ids)) = targets
            .split_last()
            .filter(|(_, ids)| !ids.is_empty())
        else {
            bail!("move needs at least one message id and a destination folder");
        };

        let outcomes = mail::fan_out(message_ids.to_vec(), mail::MAX_CONCURRENT_OPERATIONS, |id| async move {
            client.move_message(&id, destination).await
        })
        .await;
        report_outcomes("move", message_ids, outcomes, |id| {
            lines::ok_line(&["moved", id, "to", destination])
        })
    }

    async fn handle_delete(client: &GraphClient, message_ids: &[String]) -> Result<()> {
        let outcomes = mail::fan_out(message_ids.to_vec(), mail::MAX_CONCURRENT_OPERATIONS, |id| async move {
            client.delete_message(&id).await
        })
        .await;
        report_outcomes("delete", message_ids, outcomes, |id| {
            lines::ok_line(&["deleted", id])
        })
    }

    async fn handle_forward(client: &GraphClient, args: ForwardArgs) -> Result<()> {
        let result = client
            .forward_message(&args.message_id, &args.to, args.comment.as_deref())
            .await;
        let outcome = OperationOutcome {
            message_id: args.message_id.clone(),
            result,
        };
        let recipients = args.to.join(",");
        report_outcomes("forward", &[args.message_id], vec![outcome], |id| {
            lines::ok_line(&["forwarded", id, "to", &recipients])
        })
    }

    /// Prints one line per id in the order given and fails the command if
    /// any operation failed.
    fn report_outcomes(
        operation: &str,
        message_ids: &[String],
        mut outcomes: Vec<OperationOutcome>,
        ok: impl Fn(&str) -> String,
    ) -> Result<()> {
        outcomes.sort_by_key(|outcome| {
            message_ids
                .iter()
                .position(|id| *id == outcome.message_id)
                .unwrap_or(usize::MAX)
        });

        let mut failed = 0usize;
        for outcome in &outcomes {
            match &outcome.result {
                Ok(()) => println!("{}", ok(&outcome.message_id)),
                Err(err) => {
                    failed += 1;
                    println!("{}", lines::error_line(operation, &outcome.message_id, err));
                }
            }
        }

        if failed > 0 {
            bail!("{failed} of {} {operation} operations failed", outcomes.len());
        }
        Ok(())
    }

    async fn handle_purge(config: &AppConfig, tokens: Arc<TokenProvider>, args: PurgeArgs) -> Result<()> {
        let cutoff = match dates::parse_cutoff(&args.before_date, config.timezone) {
            Ok(cutoff) => cutoff,
            Err(err) => {
                println!("ERROR: {err}");
                return Ok(());
            }
        };

        let request = PurgeRequest {
            folder_id: args.folder_id,
            batch_size: args.batch_size as usize,
            cutoff,
            dry_run: args.dry_run,
        };
        for line in request.banner(&args.before_date) {
            println!("{line}");
        }

        let client: Arc<dyn MailClient> = Arc::new(GraphClient::open(config, tokens)?);
        let coordinator = PurgeCoordinator::new(client, Arc::new(StdConsole));
        coordinator
            .run(request)
            .await
            .context("purge stopped before completion")?;
        Ok(())
    }
}
