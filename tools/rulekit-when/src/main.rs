//! Command-line front end for rulekit's time handling.
//!
//! Handy when writing rules: check how a `when` expression resolves, what a
//! hysteresis band decides, or watch a countdown tick.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use time::OffsetDateTime;
use tracing::debug;

use rulekit::config::Config;
use rulekit::countdown::CountdownTimer;
use rulekit::hysteresis::hysteresis;
use rulekit::when::{format_remaining, parse_duration};
use rulekit::{Clock, TokioScheduler, When};

#[derive(Parser)]
#[command(version, about = "Resolve rule timing expressions")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve a when expression (`5m`, `PT30S`, `7:30 pm`, an ISO date-time,
    /// or milliseconds) against the current time.
    Resolve {
        when: String,

        /// Move the result onto today's date.
        #[arg(long)]
        today: bool,
    },

    /// Classify a value against a target with a dead band.
    Hysteresis {
        #[arg(allow_negative_numbers = true)]
        target: f64,

        #[arg(allow_negative_numbers = true)]
        value: f64,

        /// Band below the target.
        #[arg(long, default_value_t = 0.0)]
        low: f64,

        /// Band above the target.
        #[arg(long, default_value_t = 0.0)]
        high: f64,
    },

    /// Format a duration the way countdowns display it.
    Remaining { duration: String },

    /// Count down to a when expression, printing the time left.
    Countdown { when: String },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let config = Config::from_env().context("reading configuration")?;
    rulekit::tracing::init(&config.log);

    let cli = Cli::parse();
    match cli.command {
        Commands::Resolve { when, today } => cmd_resolve(&when, today),
        Commands::Hysteresis {
            target,
            value,
            low,
            high,
        } => {
            println!("{}", hysteresis(target, value, low, high));
            Ok(())
        }
        Commands::Remaining { duration } => {
            let duration = parse_duration(&duration)?;
            println!("{}", format_remaining(duration));
            Ok(())
        }
        Commands::Countdown { when } => cmd_countdown(&when, config.countdown_tick).await,
    }
}

fn now() -> OffsetDateTime {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
}

fn cmd_resolve(input: &str, today: bool) -> Result<()> {
    let when: When = input.parse()?;
    debug!(%when, "Parsed");

    let now = now();
    let at = if today {
        when.to_today(now)?
    } else {
        when.resolve(now)?
    };

    println!("{at}");
    match Duration::try_from(at - now) {
        Ok(ahead) => println!("in {}", format_remaining(ahead)),
        Err(_) => println!("{} ago", format_remaining((now - at).unsigned_abs())),
    }
    Ok(())
}

async fn cmd_countdown(input: &str, tick: Duration) -> Result<()> {
    let when: When = input.parse()?;
    let scheduler = TokioScheduler::new()?;
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();

    let countdown = CountdownTimer::with_tick(
        scheduler.clone(),
        when,
        tick,
        move || {
            let _ = done_tx.send(());
        },
        |left| println!("{}", format_remaining(left)),
    )?;
    debug!(now = %scheduler.now(), ?countdown, "Counting down");

    done_rx.await.context("countdown dropped before finishing")?;
    Ok(())
}
