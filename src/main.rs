use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use secrecy::SecretString;
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;

use feedstream::api::UnreadCount;
use feedstream::cache::PageFetch;
use feedstream::config::{Config, PASSWORD_ENV};
use feedstream::storage::{Database, DatabaseError, ThemeMode, ViewType};
use feedstream::util::{display_width, truncate_to_width};
use feedstream::{Article, ArticleId, QueryKey, Session, SessionError, StreamId};

/// Terminal width used when laying out article rows.
const ROW_WIDTH: usize = 100;

/// Get the config directory path (~/.config/feedstream/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("feedstream"))
}

#[derive(Parser, Debug)]
#[command(
    name = "feedstream",
    about = "Read Google Reader compatible feed services from the terminal"
)]
struct Args {
    /// Config file (defaults to ~/.config/feedstream/config.toml)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sign in and store the session token
    Login {
        /// Account name (defaults to `username` from the config file)
        #[arg(long)]
        username: Option<String>,
    },
    /// Forget the stored session
    Logout,
    /// List articles in a stream
    Stream {
        /// Stream id (defaults to the last stream viewed, then the reading list)
        stream: Option<String>,
        /// Only unread articles (defaults to the stored setting)
        #[arg(long)]
        unread_only: Option<bool>,
        /// Number of pages to load
        #[arg(long, default_value_t = 1)]
        pages: usize,
        /// Reload from the first page
        #[arg(long)]
        sync: bool,
    },
    /// Mark an article read (or unread)
    Read {
        id: String,
        #[arg(long)]
        unread: bool,
        /// Stream the article is in
        #[arg(long)]
        stream: Option<String>,
    },
    /// Star an article (or remove the star)
    Star {
        id: String,
        #[arg(long)]
        remove: bool,
        /// Stream the article is in
        #[arg(long)]
        stream: Option<String>,
    },
    /// Mark every article in a stream read
    MarkAllRead { stream: String },
    /// List subscriptions with unread counts
    Subscriptions,
    /// List folders with unread counts
    Folders,
    /// Show or change settings
    Settings {
        #[arg(long, value_enum)]
        theme: Option<ThemeMode>,
        #[arg(long, value_enum)]
        view: Option<ViewType>,
        #[arg(long)]
        unread_only: Option<bool>,
        #[arg(long)]
        mark_read_on_open: Option<bool>,
        #[arg(long)]
        page_size: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
    }

    // The directory holds the session token: user-only access
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) =
            std::fs::set_permissions(&config_dir, std::fs::Permissions::from_mode(0o700))
        {
            tracing::warn!(
                path = %config_dir.display(),
                error = %e,
                "Failed to set config directory permissions to 0700"
            );
        }
    }

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;

    let db_path = config_dir.join("feedstream.db");
    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    let db = match Database::open(db_path_str).await {
        Ok(db) => db,
        Err(DatabaseError::InstanceLocked) => {
            eprintln!("Error: {}", DatabaseError::InstanceLocked);
            std::process::exit(1);
        }
        Err(e) => return Err(anyhow::anyhow!("Failed to open database: {}", e)),
    };

    match run(args.command, db, &config).await {
        Err(e) if e.downcast_ref::<SessionError>().is_some_and(SessionError::is_unauthorized) => {
            eprintln!("Session expired or rejected. Run `feedstream login` to sign in again.");
            std::process::exit(1);
        }
        result => result,
    }
}

async fn run(command: Command, db: Database, config: &Config) -> Result<()> {
    match command {
        Command::Login { username } => login(db, config, username).await,
        Command::Logout => {
            match Session::restore(db.clone(), config).await? {
                Some(session) => session.logout().await?,
                None => {
                    db.clear_credentials().await?;
                }
            }
            println!("Signed out.");
            Ok(())
        }
        Command::Settings {
            theme,
            view,
            unread_only,
            mark_read_on_open,
            page_size,
        } => {
            let mut settings = db.load_settings().await?;
            let changed = theme.is_some()
                || view.is_some()
                || unread_only.is_some()
                || mark_read_on_open.is_some()
                || page_size.is_some();

            if let Some(theme) = theme {
                settings.theme = theme;
            }
            if let Some(view) = view {
                settings.view_type = view;
            }
            if let Some(unread_only) = unread_only {
                settings.unread_only = unread_only;
            }
            if let Some(mark_read_on_open) = mark_read_on_open {
                settings.mark_read_on_open = mark_read_on_open;
            }
            if let Some(page_size) = page_size {
                settings.page_size = page_size.max(1);
            }
            if changed {
                db.save_settings(&settings).await?;
            }

            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(())
        }
        command => {
            let session = Session::restore(db, config)
                .await?
                .ok_or_else(|| anyhow::anyhow!("Not signed in. Run `feedstream login` first."))?;
            run_signed_in(command, &session).await
        }
    }
}

async fn login(db: Database, config: &Config, username: Option<String>) -> Result<()> {
    let username = match username.or_else(|| config.username.clone()) {
        Some(username) => username,
        None => prompt("Username: ")?,
    };
    let password = match config.password() {
        Some(password) => password,
        None => SecretString::from(prompt(&format!("Password (or set {PASSWORD_ENV}): "))?),
    };

    let session = Session::login(db, config, &username, &password).await?;
    println!("Signed in as {} ({}).", username, config.server);
    drop(session);
    Ok(())
}

fn prompt(label: &str) -> Result<String> {
    let mut stdout = std::io::stdout();
    write!(stdout, "{label}")?;
    stdout.flush()?;

    let mut line = String::new();
    std::io::stdin()
        .read_line(&mut line)
        .context("Failed to read from stdin")?;
    let line = line.trim().to_string();
    if line.is_empty() {
        anyhow::bail!("No input given");
    }
    Ok(line)
}

async fn run_signed_in(command: Command, session: &Session) -> Result<()> {
    match command {
        Command::Stream {
            stream,
            unread_only,
            pages,
            sync,
        } => {
            let key = session.stream_key(stream, unread_only);
            let snapshot = session.load(&key, pages, sync).await?;

            for article in snapshot.articles() {
                println!("{}", format_row(&article));
            }
            println!(
                "-- {} articles in {} pages{}",
                snapshot.len(),
                snapshot.page_count(),
                if snapshot.has_next_page() {
                    ", more available"
                } else {
                    ""
                }
            );

            session
                .update_settings(|s| s.last_stream = Some(key.stream.to_string()))
                .await?;
            Ok(())
        }
        Command::Read { id, unread, stream } => {
            let id = locate(session, &id, stream).await?;
            let outcome = session.set_read(&id, !unread).await?;
            println!(
                "{} marked {}.",
                outcome.article_id,
                if outcome.value { "read" } else { "unread" }
            );
            Ok(())
        }
        Command::Star { id, remove, stream } => {
            let id = locate(session, &id, stream).await?;
            let outcome = session.set_starred(&id, !remove).await?;
            println!(
                "{} {}.",
                outcome.article_id,
                if outcome.value { "starred" } else { "unstarred" }
            );
            Ok(())
        }
        Command::MarkAllRead { stream } => {
            let key = QueryKey::new(stream.as_str(), false);
            session.articles(&key).await?;
            let changed = session.mark_all_read(&key).await?;
            println!("Marked {stream} read ({changed} loaded articles updated).");
            Ok(())
        }
        Command::Subscriptions => {
            let counts = unread_by_stream(session.unread_counts().await?);
            for sub in session.subscriptions().await? {
                let unread = counts.get(&sub.id).copied().unwrap_or(0);
                println!(
                    "{:>5}  {}  {}",
                    unread,
                    pad(&sub.title, 40),
                    sub.url
                );
            }
            Ok(())
        }
        Command::Folders => {
            let counts = unread_by_stream(session.unread_counts().await?);
            for folder in session.folders().await? {
                let unread = counts.get(&folder.id).copied().unwrap_or(0);
                println!("{:>5}  {}  {}", unread, pad(&folder.title, 30), folder.id);
            }
            Ok(())
        }
        Command::Login { .. } | Command::Logout | Command::Settings { .. } => Ok(()),
    }
}

/// Load `stream` (default: reading list) so the article is in the cache.
async fn locate(session: &Session, id: &str, stream: Option<String>) -> Result<ArticleId> {
    let stream = stream
        .map(StreamId::new)
        .unwrap_or_else(StreamId::reading_list);
    let key = QueryKey::new(stream, false);
    session.articles(&key).await?;

    let mut fetched = 1;
    while session.article(&key, id).is_none() {
        if fetched >= 10 {
            anyhow::bail!("Article {id} not found in the {fetched} most recent pages of {key}");
        }
        match session.fetch_more(&key).await? {
            PageFetch::Exhausted => anyhow::bail!("Article {id} not found in {key}"),
            _ => fetched += 1,
        }
    }
    Ok(ArticleId::from(id))
}

fn unread_by_stream(counts: Vec<UnreadCount>) -> HashMap<String, u64> {
    counts
        .into_iter()
        .map(|c| (c.stream_id, c.count))
        .collect()
}

fn pad(s: &str, width: usize) -> String {
    let truncated = truncate_to_width(s, width);
    let fill = width.saturating_sub(display_width(&truncated));
    format!("{}{}", truncated, " ".repeat(fill))
}

fn format_row(article: &Article) -> String {
    let flags = format!(
        "{}{}",
        if article.is_read { ' ' } else { '*' },
        if article.is_starred { '+' } else { ' ' }
    );
    let date = article.published.format("%Y-%m-%d");
    let source = truncate_to_width(&article.source_name, 20);
    let title_width = ROW_WIDTH.saturating_sub(display_width(&source) + 16);
    format!(
        "{flags} {date} {} [{source}]  {}",
        pad(&article.title, title_width),
        article.id
    )
}
