//! Terminal client: one session driven from stdin.
//!
//! Plain lines are sent as chat. `/move <lat> <lng>`, `/read <id>`,
//! `/name <display name>`, `/log` and `/quit` do what they say.

use fugumap::auth::{AnonymousIdentity, JwtSecret};
use fugumap::config::{Config, LogBackend};
use fugumap::models::position::{share_query, Position, DEFAULT_POSITION};
use fugumap::prefs::{JsonFilePreferences, MemoryPreferences, Preferences};
use fugumap::repositories::{MemoryLog, MessageLog, SharedLog};
use fugumap::SessionService;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env().map_err(|e| anyhow::anyhow!("config: {}", e))?;

    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("warn"))?;
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let log: Arc<dyn MessageLog> = match config.log_backend {
        LogBackend::Memory => Arc::new(MemoryLog::new()),
        LogBackend::Postgres => {
            Arc::new(SharedLog::connect(&config.database_url, &config.redis_url).await?)
        }
    };
    let prefs: Arc<dyn Preferences> = match &config.prefs_path {
        Some(path) => Arc::new(JsonFilePreferences::open(path)),
        None => Arc::new(MemoryPreferences::new()),
    };
    let identity = Arc::new(AnonymousIdentity::new(JwtSecret::new(
        config.jwt_secret.clone(),
    )?));
    let session = SessionService::new(log, identity, prefs, config.sync);

    let mut args = std::env::args().skip(1);
    let position = match (args.next(), args.next()) {
        (Some(lat), Some(lng)) => Position::new(lat.parse()?, lng.parse()?)?,
        _ => DEFAULT_POSITION,
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let name = match session.saved_display_name() {
        Some(name) => name,
        None => {
            println!("display name:");
            lines.next_line().await?.unwrap_or_default()
        }
    };
    if !session.tutorial_shown() {
        println!("type to chat; /move <lat> <lng>, /read <id>, /name <name>, /log, /quit");
        session.mark_tutorial_shown()?;
    }

    let signed_in = session.sign_in(&name, position).await?;
    println!(
        "signed in as {} ({}) at ?{}",
        signed_in.display_name,
        signed_in.user_id,
        share_query(signed_in.position)
    );

    let printer = {
        let session = session.clone();
        tokio::spawn(async move {
            let mut changes = session.changes();
            while changes.changed().await.is_ok() {
                for m in session.visible_messages().await {
                    println!("[{}] {}: {}", m.id, m.author_name, m.text);
                }
                let nearby = session.presence().await.len();
                println!("-- {} unread, {} nearby --", session.unread_count().await, nearby);
            }
        })
    };

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        let mut words = line.split_whitespace();
        let result = match words.next() {
            None => continue,
            Some("/quit") => break,
            Some("/move") => {
                let lat = words.next().and_then(|w| w.parse().ok()).unwrap_or(f64::NAN);
                let lng = words.next().and_then(|w| w.parse().ok()).unwrap_or(f64::NAN);
                session.move_to(Position { lat, lng }).await.map(|_| ())
            }
            Some("/read") => session.mark_read(words.next().unwrap_or_default()).await,
            Some("/name") => {
                let rest: Vec<&str> = words.collect();
                session.set_display_name(&rest.join(" ")).await
            }
            Some("/log") => {
                for m in session.message_log().await {
                    println!("{} {}: {}", m.created_at.format("%H:%M:%S"), m.author_name, m.text);
                }
                Ok(())
            }
            Some(_) => session.send(line).await.map(|_| ()),
        };
        if let Err(e) = result {
            eprintln!("error: {}", e);
        }
    }

    printer.abort();
    session.reset().await;
    Ok(())
}
