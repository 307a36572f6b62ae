use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand};
use matchday_adapters::{LIVE_FOOTBALL_ON_TV_SOURCE_ID, SKYSPORTS_SOURCE_ID};
use matchday_core::StoredFixture;
use matchday_storage::FixtureStore;
use matchday_sync::{SourceRunSummary, SyncConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "matchday")]
#[command(about = "Football fixture listing ingest")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Crawl the Sky Sports listing and its dated follow-up pages
    Skysports,
    /// Crawl the live-footballontv.com listing
    LiveFootballOnTv,
    /// Crawl every enabled source in the registry
    Sync,
    /// Print every stored fixture
    List,
    /// Create or upgrade the fixture table
    Migrate,
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow!("failed to initialize tracing: {e}"))
}

fn print_run(summary: &SourceRunSummary) {
    println!(
        "{}: inserted {} matches into the database ({} extracted, {}/{} pages fetched)",
        summary.source_id,
        summary.inserted,
        summary.extracted,
        summary.pages_fetched,
        summary.pages_attempted
    );
}

fn render_table(rows: &[StoredFixture]) -> String {
    let header = ["id", "date", "home_team", "away_team", "time", "competition", "channel"];
    let cells: Vec<[String; 7]> = rows
        .iter()
        .map(|r| {
            [
                r.id.to_string(),
                r.fixture.date.clone(),
                r.fixture.home_team.clone(),
                r.fixture.away_team.clone(),
                r.fixture.time.clone(),
                r.fixture.competition.clone(),
                r.fixture.channel.clone(),
            ]
        })
        .collect();

    let mut widths = header.map(|h| h.chars().count());
    for row in &cells {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let line = |values: &[&str]| -> String {
        values
            .iter()
            .zip(widths)
            .map(|(v, w)| format!("{v:<w$}"))
            .collect::<Vec<_>>()
            .join("  ")
            .trim_end()
            .to_string()
    };

    let mut out = vec![
        line(&header),
        widths.iter().map(|w| "-".repeat(*w)).collect::<Vec<_>>().join("  "),
    ];
    for row in &cells {
        let values: Vec<&str> = row.iter().map(String::as_str).collect();
        out.push(line(&values));
    }
    out.join("\n")
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Skysports => {
            let summary = matchday_sync::run_source_from_env(SKYSPORTS_SOURCE_ID).await?;
            println!("Inserted {} matches into the database.", summary.inserted);
        }
        Commands::LiveFootballOnTv => {
            let summary = matchday_sync::run_source_from_env(LIVE_FOOTBALL_ON_TV_SOURCE_ID).await?;
            println!("Inserted {} matches into the database.", summary.inserted);
        }
        Commands::Sync => {
            let mut failed = Vec::new();
            for (source_id, result) in matchday_sync::run_sync_once_from_env().await? {
                match result {
                    Ok(summary) => print_run(&summary),
                    Err(err) => {
                        eprintln!("{source_id}: failed: {err:#}");
                        failed.push(source_id);
                    }
                }
            }
            if !failed.is_empty() {
                bail!("sync failed for: {}", failed.join(", "));
            }
        }
        Commands::List => {
            let config = SyncConfig::from_env();
            let store = FixtureStore::open(&config.store_config()).await?;
            store.migrate().await?;
            let rows = store.list_all().await?;
            println!("{}", render_table(&rows));
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let store = FixtureStore::open(&config.store_config()).await?;
            store.migrate().await?;
            println!(
                "migrations applied to {} ({} matches stored)",
                config.database_url,
                store.count().await?
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use matchday_core::FixtureRecord;

    #[test]
    fn table_aligns_columns_to_widest_cell() {
        let rows = vec![StoredFixture {
            id: 7,
            fixture: FixtureRecord {
                date: "2025-12-04".into(),
                home_team: "Arsenal".into(),
                away_team: "Chelsea".into(),
                time: "20:00".into(),
                competition: "Premier League".into(),
                channel: String::new(),
            },
        }];
        let table = render_table(&rows);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(
            lines[0],
            "id  date        home_team  away_team  time   competition     channel"
        );
        assert!(lines[2].starts_with("7   2025-12-04  Arsenal    Chelsea    20:00  Premier League"));
    }

    #[test]
    fn cli_parses_source_commands() {
        let cli = Cli::try_parse_from(["matchday", "live-football-on-tv"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::LiveFootballOnTv)));
        let cli = Cli::try_parse_from(["matchday"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn source_subcommands_are_named_after_source_ids() {
        use clap::CommandFactory;
        let cmd = Cli::command();
        for source_id in [SKYSPORTS_SOURCE_ID, LIVE_FOOTBALL_ON_TV_SOURCE_ID] {
            assert!(cmd.find_subcommand(source_id).is_some(), "{source_id}");
        }
    }
}
