//! ledger_inspect - CLI for the sync ledger
//!
//! Lists segment upload states, shows individual records, and resets
//! Failed segments to Pending for manual retry. This is the surface the
//! user-facing layer builds on when it reports "some evidence has not
//! reached the cloud yet."

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use evidence_pipeline::buffer::ledger_path;
use evidence_pipeline::{SegmentId, SyncLedger, SyncRecord, SyncState};

#[derive(Parser, Debug)]
#[command(name = "ledger_inspect", about = "Inspect and repair the segment sync ledger")]
struct Args {
    /// Pipeline data directory (holds ledger.db and the spool).
    #[arg(long, default_value = "evidence_data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List records, oldest capture first
    List {
        /// Filter by state: pending, uploading, confirmed, failed
        #[arg(long)]
        state: Option<String>,
    },

    /// Show one record with its full metadata
    Show {
        /// Segment key, e.g. "device:rear_cam/00000000000000000042"
        segment: String,
    },

    /// Reset one Failed segment to Pending for another upload attempt
    Retry {
        segment: String,
    },

    /// Reset every retryable Failed segment to Pending
    RetryAll,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let db_path = ledger_path(&args.data_dir);
    if !db_path.exists() {
        return Err(anyhow!("no ledger at {}", db_path.display()));
    }
    let mut ledger = SyncLedger::open(&db_path)?;

    match args.command {
        Command::List { state } => {
            let records = ledger.list(state.as_deref())?;
            if records.is_empty() {
                println!("no records");
                return Ok(());
            }
            for record in records {
                println!("{}", summary_line(&record));
            }
        }
        Command::Show { segment } => {
            let id = SegmentId::parse(&segment)?;
            let record = ledger
                .get(&id)?
                .ok_or_else(|| anyhow!("no record for {}", id))?;
            println!("{}", summary_line(&record));
            println!("checksum: {}", hex::encode(record.checksum));
            match record.meta() {
                Ok(meta) => println!("{}", serde_json::to_string_pretty(&meta)?),
                Err(_) => println!("(no media metadata; segment was dropped before spooling)"),
            }
        }
        Command::Retry { segment } => {
            let id = SegmentId::parse(&segment)?;
            retry_one(&mut ledger, &id)?;
            println!("{} reset to pending", id);
        }
        Command::RetryAll => {
            let failed = ledger.list(Some("failed"))?;
            let mut reset = 0u32;
            for record in failed {
                match retry_one(&mut ledger, &record.segment_id) {
                    Ok(()) => reset += 1,
                    Err(err) => eprintln!("skipping {}: {}", record.segment_id, err),
                }
            }
            println!("{} segment(s) reset to pending", reset);
        }
    }

    Ok(())
}

fn retry_one(ledger: &mut SyncLedger, id: &SegmentId) -> Result<()> {
    let record = ledger
        .get(id)?
        .ok_or_else(|| anyhow!("no record for {}", id))?;
    if !matches!(record.state, SyncState::Failed(_)) {
        return Err(anyhow!(
            "{} is {}, only failed segments can be retried",
            id,
            record.state.name()
        ));
    }
    if record.purged {
        return Err(anyhow!("local media for {} is no longer present", id));
    }
    ledger.mark_pending(id)
}

fn summary_line(record: &SyncRecord) -> String {
    let reason = match &record.state {
        SyncState::Failed(reason) => format!("  ({})", reason),
        _ => String::new(),
    };
    format!(
        "{}  {:9}  attempts={}  acked={}/{}{}{}",
        record.segment_id,
        record.state.name(),
        record.attempts,
        record.bytes_acked,
        record.blob_len,
        if record.purged { "  purged" } else { "" },
        reason
    )
}
