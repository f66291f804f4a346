use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use weather_core::{
    BatchItemResult, BatchResult, Config, DEFAULT_CHECK_CITY, HealthReport, ProviderId,
    WeatherService, WeatherSnapshot,
};

/// Top-level CLI struct.
#[derive(Debug, Parser)]
#[command(name = "weather", version, about = "Weather CLI")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Configure credentials for a specific provider.
    Configure {
        /// Provider short name, e.g. "openweather" or "weatherapi".
        provider: String,
    },

    /// Show current weather for a city.
    Show {
        /// City name.
        city: String,

        #[command(flatten)]
        output: OutputArgs,
    },

    /// Show current weather for several cities at once.
    Batch {
        /// City names, in the order results should be listed.
        #[arg(required = true)]
        cities: Vec<String>,

        #[command(flatten)]
        output: OutputArgs,
    },

    /// Report circuit-breaker and cache state.
    Health {
        /// Also fetch this city directly from the provider.
        #[arg(long, value_name = "CITY", num_args = 0..=1, default_missing_value = DEFAULT_CHECK_CITY)]
        check: Option<String>,
    },
}

#[derive(Debug, clap::Args)]
pub struct OutputArgs {
    /// Print JSON instead of a human-readable summary.
    #[arg(long)]
    json: bool,

    /// Give up after this many seconds.
    #[arg(long, value_name = "SECS")]
    timeout_secs: Option<u64>,
}

impl OutputArgs {
    fn deadline(&self) -> Option<tokio::time::Instant> {
        self.timeout_secs.map(|secs| tokio::time::Instant::now() + Duration::from_secs(secs))
    }
}

impl Cli {
    pub async fn run(self) -> anyhow::Result<()> {
        match self.command {
            Command::Configure { provider } => configure(&provider),
            Command::Show { city, output } => {
                let service = service()?;
                let snapshot = service.lookup(&city, output.deadline()).await?;
                if output.json {
                    println!("{}", serde_json::to_string_pretty(&snapshot)?);
                } else {
                    print_snapshot(&snapshot);
                }
                Ok(())
            }
            Command::Batch { cities, output } => {
                let service = service()?;
                let result = service.lookup_batch(&cities, output.deadline()).await?;
                if output.json {
                    println!("{}", serde_json::to_string_pretty(&result)?);
                } else {
                    print_batch(&result);
                }
                Ok(())
            }
            Command::Health { check } => {
                let service = service()?;
                let report = match check {
                    Some(city) => service.check_upstream(&city, None).await,
                    None => service.health().await,
                };
                print_health(&report);
                Ok(())
            }
        }
    }
}

fn service() -> anyhow::Result<WeatherService> {
    let config = Config::load()?;
    tracing::debug!(
        provider = config.default_provider.as_deref().unwrap_or("<none>"),
        "configuration loaded"
    );
    WeatherService::from_config(&config)
}

fn configure(provider: &str) -> anyhow::Result<()> {
    let id = ProviderId::try_from(provider)?;
    let mut config = Config::load()?;

    let api_key = inquire::Password::new(&format!("API key for {id}:"))
        .without_confirmation()
        .prompt()
        .context("Failed to read API key")?;

    config.upsert_provider_api_key(id, api_key.trim().to_string());

    let make_default = config.default_provider_id().ok() != Some(id)
        && inquire::Confirm::new(&format!("Use {id} as the default provider?"))
            .with_default(true)
            .prompt()
            .context("Failed to read answer")?;
    if make_default {
        config.set_default_provider(id);
    }

    config.save()?;
    println!("Saved configuration to {}", Config::config_file_path()?.display());
    Ok(())
}

fn source_label(snapshot: &WeatherSnapshot) -> &'static str {
    match (snapshot.served_from_cache, snapshot.stale) {
        (_, true) => " [stale]",
        (true, false) => " [cached]",
        (false, false) => "",
    }
}

fn print_snapshot(s: &WeatherSnapshot) {
    let observed = s.observed_at.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M");
    println!("{}, {}{}", s.city, s.country, source_label(s));
    println!("  {:.1}°C, {}", s.temperature_c, s.description);
    println!("  humidity {}%, wind {:.1} m/s", s.humidity_pct, s.wind_speed_mps);
    println!("  observed {observed}");
}

fn print_batch(result: &BatchResult) {
    for item in &result.items {
        match item {
            BatchItemResult::Success(s) => println!(
                "{:<20} {:>6.1}°C  {}{}",
                s.city,
                s.temperature_c,
                s.description,
                source_label(s)
            ),
            BatchItemResult::Failure { city, kind, message } => {
                println!("{city:<20} error ({kind}): {message}")
            }
        }
    }
    let summary = &result.summary;
    println!("{} cities: {} ok, {} failed", summary.total, summary.success, summary.failed);
}

fn print_health(report: &HealthReport) {
    println!("provider: {}", report.provider);
    println!("status:   {}", if report.healthy { "healthy" } else { "unhealthy" });
    println!(
        "circuit:  {:?} ({} consecutive failures)",
        report.circuit.status, report.circuit.consecutive_failures
    );
    match report.cached_entries {
        Some(n) => println!("cache:    {n} entries"),
        None => println!("cache:    unavailable"),
    }
    match report.upstream_reachable {
        Some(true) => println!("upstream: reachable"),
        Some(false) => println!("upstream: unreachable"),
        None => {}
    }
}
