//! # Seed Data Generator
//!
//! Populates a local and a remote calendar with events for development.
//! Events placed in the remote calendar are queued as pending creates, so
//! the queue has something to show before any server is configured.
//!
//! ## Usage
//! ```bash
//! # Generate 200 events (default)
//! cargo run -p caldera-db --bin seed
//!
//! # Generate custom amount
//! cargo run -p caldera-db --bin seed -- --count 1000
//!
//! # Specify database path
//! cargo run -p caldera-db --bin seed -- --db ./data/caldera.db
//! ```
//!
//! ## Generated Events
//! Cycles through a fixed set of shapes so the month view has a mix of:
//! - Single timed events
//! - All-day events
//! - Daily and weekly series (some with COUNT, some open-ended)
//! - Series in a DST-observing zone

use std::env;
use std::sync::Arc;

use caldera_core::{NewEvent, OperationStatus, SystemClock};
use caldera_db::{Database, DbConfig, WriterConfig};
use chrono::{Datelike, Duration, NaiveDate, TimeZone, Utc};

/// Collection URL of the demo remote calendar.
const DEMO_COLLECTION: &str = "https://caldav.example.com/calendars/demo/work/";

/// (summary, rrule, timezone, all_day)
const SHAPES: &[(&str, Option<&str>, Option<&str>, bool)] = &[
    ("Dentist", None, None, false),
    ("Standup", Some("FREQ=DAILY;BYDAY=MO,TU,WE,TH,FR"), Some("Europe/Berlin"), false),
    ("Team sync", Some("FREQ=WEEKLY;COUNT=12"), None, false),
    ("Holiday", None, None, true),
    ("Gym", Some("FREQ=WEEKLY;BYDAY=TU,TH;COUNT=20"), Some("America/New_York"), false),
    ("Lunch with Sam", None, None, false),
    ("Rent due", Some("FREQ=MONTHLY;BYMONTHDAY=1"), None, true),
    ("1:1", Some("FREQ=WEEKLY;INTERVAL=2"), Some("Europe/London"), false),
];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args: Vec<String> = env::args().collect();

    let mut count: usize = 200;
    let mut db_path = String::from("./caldera_dev.db");

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--count" | "-c" => {
                if i + 1 < args.len() {
                    count = args[i + 1].parse().unwrap_or(200);
                    i += 1;
                }
            }
            "--db" | "-d" => {
                if i + 1 < args.len() {
                    db_path = args[i + 1].clone();
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("Caldera Seed Data Generator");
                println!();
                println!("Usage: seed [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -c, --count <N>    Number of events to generate (default: 200)");
                println!("  -d, --db <PATH>    Database file path (default: ./caldera_dev.db)");
                println!("  -h, --help         Show this help message");
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    println!("🌱 Caldera Seed Data Generator");
    println!("==============================");
    println!("Database: {}", db_path);
    println!("Events:   {}", count);
    println!();

    let db = Database::new(DbConfig::new(&db_path)).await?;
    println!("✓ Connected to database");
    println!("✓ Migrations applied");

    if !db.calendars().list().await?.is_empty() {
        println!("⚠ Database already has calendars");
        println!("  Skipping seed to avoid duplicates.");
        println!("  Delete the database file to regenerate.");
        return Ok(());
    }

    let local = db.calendars().create_local("Personal").await?;
    let remote = db
        .calendars()
        .create_remote("demo", "Work (demo)", DEMO_COLLECTION)
        .await?;
    println!("✓ Created calendars: {}, {}", local.display_name, remote.display_name);
    let writer = db.writer(WriterConfig::default(), Arc::new(SystemClock));

    println!();
    println!("Generating events...");

    let today = Utc::now().date_naive();
    let started = std::time::Instant::now();
    let mut generated = 0;

    for seed in 0..count {
        // Every fourth event lives in the remote calendar.
        let calendar_id = if seed % 4 == 3 { &remote.id } else { &local.id };
        let draft = generate_event(calendar_id, today, seed);
        if let Err(e) = writer.create(draft).await {
            eprintln!("Failed to insert event {}: {}", seed, e);
            continue;
        }
        generated += 1;

        if generated % 50 == 0 {
            println!("  Generated {} events...", generated);
        }
    }

    let elapsed = started.elapsed();
    println!();
    println!("✓ Generated {} events in {:?}", generated, elapsed);

    let window_start = Utc.from_utc_datetime(&today.and_hms_opt(0, 0, 0).unwrap_or_default());
    let visible = db
        .occurrences()
        .in_range(window_start, window_start + Duration::days(31), None)
        .await?;
    println!("  Occurrences in the next 31 days: {}", visible.len());
    let queued = db
        .pending_operations()
        .count_by_status(OperationStatus::Pending)
        .await?;
    println!("  Pending operations for {}: {}", remote.display_name, queued);

    println!();
    println!("✓ Seed complete!");

    Ok(())
}

/// Builds one draft; `seed` picks the shape and spreads start days.
fn generate_event(calendar_id: &str, today: NaiveDate, seed: usize) -> NewEvent {
    let (summary, rrule, timezone, all_day) = SHAPES[seed % SHAPES.len()];

    let day = today + Duration::days((seed * 7 % 60) as i64 - 14);
    let hour = 8 + (seed % 10) as u32;
    let day_start = Utc.with_ymd_and_hms(day.year(), day.month(), day.day(), 0, 0, 0);
    let midnight = day_start.single().unwrap_or_else(Utc::now);

    let (start, end) = if all_day {
        (midnight, midnight + Duration::days(1))
    } else {
        let start = midnight + Duration::hours(hour as i64);
        (start, start + Duration::minutes(30 + (seed % 4) as i64 * 15))
    };

    let mut draft = NewEvent::new(calendar_id, format!("{} #{}", summary, seed), start, end)
        .all_day(all_day);
    if let Some(rule) = rrule {
        draft = draft.rrule(rule);
    }
    if let Some(tz) = timezone {
        draft = draft.timezone(tz);
    }
    draft
}
