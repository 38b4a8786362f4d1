use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use docframe::datasource::{
    DataQuery, DataSource, HealthStatus, InstanceSettings, QueryDataRequest,
};
use docframe::db::{
    find_profile, load_profiles, profiles_path, store_profile, ConnectOptions, DataSourceProfile,
    SERVICE_ACCOUNT_ENV,
};
use docframe::export;
use docframe::store::{MemoryBackend, MemoryStore};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Format {
    Frame,
    Json,
    Csv,
    Tsv,
}

/// Run SQL against a document database and print the shaped table
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// JSON fixture to load into the in-memory store
    #[arg(long)]
    fixture: Option<PathBuf>,

    /// Use a saved data source by name
    #[arg(long, conflicts_with = "project")]
    profile: Option<String>,

    /// Project id
    #[arg(long)]
    project: Option<String>,

    /// Database id
    #[arg(long)]
    database: Option<String>,

    /// Service-account JSON file
    #[arg(long = "service-account")]
    service_account: Option<PathBuf>,

    /// Output format
    #[arg(long, value_enum, default_value = "frame")]
    format: Format,

    /// Check connectivity instead of running a query
    #[arg(long)]
    health: bool,

    /// Save --project/--database/--service-account as a named data source and exit
    #[arg(long = "save-profile", requires = "project", conflicts_with = "profile")]
    save_profile: Option<String>,

    /// Query text
    query: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Some(ref name) = cli.save_profile {
        let mut profile = DataSourceProfile::new(name, cli.project.clone().unwrap_or_default());
        profile.database = cli.database.clone();
        profile.service_account_path = cli.service_account.clone();
        let path = profiles_path();
        store_profile(&path, profile)?;
        println!("Saved data source {:?} to {}", name, path.display());
        return Ok(());
    }

    let options = resolve_options(&cli)?;
    let settings = InstanceSettings::from_options(&options);

    let store = match &cli.fixture {
        Some(path) => MemoryStore::load(path)?,
        None => MemoryStore::new(),
    };
    tracing::debug!(documents = store.document_count(), "store loaded");
    let datasource = DataSource::new(Arc::new(MemoryBackend::new(store)));

    if cli.health {
        let result = datasource.check_health(&settings);
        println!("{}", result.message);
        if result.status != HealthStatus::Ok {
            std::process::exit(1);
        }
        return Ok(());
    }

    let Some(query) = cli.query.as_deref() else {
        bail!("no query given (pass QUERY or --health)");
    };

    let request = QueryDataRequest {
        settings,
        queries: vec![DataQuery::text("A", query)],
    };
    let mut response = datasource.query_data(request).await;
    let Some(result) = response.responses.remove("A") else {
        bail!("no response for query");
    };

    if let Some(message) = &result.error {
        eprintln!("Error ({}): {}", result.status.code(), message);
        std::process::exit(1);
    }

    for table in &result.frames {
        let rendered = match cli.format {
            Format::Frame => export::to_frame_json(table),
            Format::Json => export::to_json(table),
            Format::Csv => export::to_csv(table),
            Format::Tsv => export::to_tsv(table),
        };
        println!("{}", rendered.trim_end());
    }

    Ok(())
}

fn resolve_options(cli: &Cli) -> Result<ConnectOptions> {
    let mut options = if let Some(ref name) = cli.profile {
        let profiles = load_profiles()?;
        match find_profile(&profiles, name) {
            Some(profile) => profile.connect_options()?,
            None => {
                eprintln!("Error: no saved data source named {:?}", name);
                eprintln!("Saved data sources:");
                for p in &profiles {
                    eprintln!("  - {}", p.name);
                }
                std::process::exit(1);
            }
        }
    } else {
        let mut options = ConnectOptions::new(cli.project.clone().unwrap_or_default());
        if let Ok(blob) = std::env::var(SERVICE_ACCOUNT_ENV) {
            if !blob.trim().is_empty() {
                options = options.with_service_account(blob);
            }
        }
        options
    };

    if let Some(ref database) = cli.database {
        options = options.with_database(database.clone());
    }
    if let Some(ref path) = cli.service_account {
        let blob = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read service account file: {}", path.display()))?;
        options = options.with_service_account(blob);
    }

    Ok(options)
}
