// tools/wsns_cli/main.rs
//
// Command-line front end: capture records from a serial port or a capture file,
// list recorded days, export a day as CSV and encode test frames.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};

use wsns_lib::csv_export::{export_file_name, export_sensor_data_day};
use wsns_lib::io::serial::encode_ascii_frame;
use wsns_lib::io::{ByteSource, ReaderByteSource};
use wsns_lib::settings::{default_settings_path, load_settings, WsnsSettings};
use wsns_lib::{init_file_logging, Session, WsnsStore};

#[derive(Parser)]
#[command(name = "wsns_cli", version, about = "TWELITE sensor network capture and export")]
struct Cli {
    /// Settings file (created with defaults if missing).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database path, overriding the settings file.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Decode frames and print one JSON record per line.
    Ingest {
        /// Serial port name; defaults to the configured port.
        #[arg(long, conflicts_with = "file")]
        port: Option<String>,
        /// Read frames from a capture file instead of a port.
        #[arg(long)]
        file: Option<PathBuf>,
        /// Do not write records to the database.
        #[arg(long)]
        no_store: bool,
    },
    /// List available serial ports.
    Ports,
    /// List known devices, or the recorded days of one device.
    Days {
        /// Device id in hex, e.g. 810EE29A.
        #[arg(long, value_parser = parse_sid)]
        sid: Option<u32>,
    },
    /// Export one recorded day of a device as CSV.
    Export {
        #[arg(long, value_parser = parse_sid)]
        sid: u32,
        /// Local date, YYYY-MM-DD.
        #[arg(long)]
        date: NaiveDate,
        /// Output directory; defaults to the configured export directory.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Encode a hex payload as an ASCII frame.
    Replay {
        payload: String,
    },
}

fn parse_sid(s: &str) -> Result<u32, String> {
    let s = s.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(s, 16).map_err(|e| format!("invalid device id '{}': {}", s, e))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("wsns_cli: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), String> {
    let path = cli.config.unwrap_or_else(default_settings_path);
    let mut settings = load_settings(&path).map_err(|e| e.to_string())?;
    if let Some(db) = cli.db {
        settings.db_path = db;
    }
    if settings.file_logging {
        if let Err(e) = init_file_logging(&settings.log_dir) {
            eprintln!("wsns_cli: file logging disabled: {}", e);
        }
    }

    match cli.command {
        Command::Ingest { port, file, no_store } => ingest(settings, port, file, no_store),
        Command::Ports => ports(),
        Command::Days { sid } => days(&settings, sid),
        Command::Export { sid, date, out } => export(&settings, sid, date, out),
        Command::Replay { payload } => replay(&payload),
    }
}

// ============================================================================
// Ingest
// ============================================================================

fn ingest(
    mut settings: WsnsSettings,
    port: Option<String>,
    file: Option<PathBuf>,
    no_store: bool,
) -> Result<(), String> {
    let mut session = if no_store {
        Session::new(
            None,
            settings.live_capacity,
            Duration::from_secs(settings.commit_period_secs),
        )
    } else {
        Session::open(&settings)
    };

    match file {
        Some(path) => {
            let f = File::open(&path).map_err(|e| format!("{}: {}", path.display(), e))?;
            let mut source = ReaderByteSource::new(f);
            while !source.is_exhausted() {
                pump(&mut session, &mut source)?;
            }
        }
        None => {
            let mut source = open_port(&mut settings, port)?;
            loop {
                if pump(&mut session, source.as_mut())? == 0 {
                    std::thread::sleep(Duration::from_millis(10));
                }
            }
        }
    }
    session.close().map_err(|e| e.to_string())
}

/// One read from `source`, printing every record produced as a JSON line.
fn pump(session: &mut Session, source: &mut dyn ByteSource) -> Result<usize, String> {
    let now = Local::now();
    let records = session
        .ingest_from(source, &now)
        .map_err(|e| format!("read failed: {}", e))?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for r in &records {
        let line = serde_json::to_string(r).map_err(|e| e.to_string())?;
        writeln!(out, "{}", line).map_err(|e| e.to_string())?;
    }
    out.flush().map_err(|e| e.to_string())?;
    session.tick(&now);
    Ok(records.len())
}

#[cfg(any(target_os = "windows", target_os = "macos", target_os = "linux"))]
fn open_port(settings: &mut WsnsSettings, port: Option<String>) -> Result<Box<dyn ByteSource>, String> {
    if let Some(p) = port {
        settings.serial.port = p;
    }
    if settings.serial.port.is_empty() {
        return Err("no serial port configured; pass --port or --file".to_string());
    }
    let src = wsns_lib::io::serial::SerialByteSource::open(&settings.serial)
        .map_err(|e| format!("{}: {}", settings.serial.port, e))?;
    Ok(Box::new(src))
}

#[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
fn open_port(_settings: &mut WsnsSettings, _port: Option<String>) -> Result<Box<dyn ByteSource>, String> {
    Err("serial ports are not supported on this platform".to_string())
}

#[cfg(any(target_os = "windows", target_os = "macos", target_os = "linux"))]
fn ports() -> Result<(), String> {
    let ports = wsns_lib::io::serial::list_serial_ports().map_err(|e| e.to_string())?;
    for p in ports {
        println!(
            "{}\t{}\t{}",
            p.port_name,
            p.port_type,
            p.product.or(p.manufacturer).unwrap_or_default()
        );
    }
    Ok(())
}

#[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
fn ports() -> Result<(), String> {
    Err("serial ports are not supported on this platform".to_string())
}

// ============================================================================
// Days / export / replay
// ============================================================================

fn open_store(settings: &WsnsSettings) -> Result<WsnsStore, String> {
    WsnsStore::open(&settings.db_path).map_err(|e| format!("{}: {}", settings.db_path.display(), e))
}

fn days(settings: &WsnsSettings, sid: Option<u32>) -> Result<(), String> {
    let store = open_store(settings)?;

    let Some(sid) = sid else {
        for (sid, last) in store.query_sorted_sensor_list_newer_first().map_err(|e| e.to_string())? {
            let desc = store.query_sid_string(sid).map_err(|e| e.to_string())?.unwrap_or_default();
            let seen = chrono::DateTime::from_timestamp(last, 0)
                .map(|t| t.with_timezone(&Local).format("%Y/%m/%d %H:%M:%S").to_string())
                .unwrap_or_default();
            println!("{:08X}\t{}\t{}", sid, seen, desc);
        }
        return Ok(());
    };

    for year in store.query_recorded_years_of_sensor_data(sid).map_err(|e| e.to_string())? {
        for month in store
            .query_recorded_months_of_sensor_data(sid, year)
            .map_err(|e| e.to_string())?
        {
            let days = store
                .query_recorded_days_of_sensor_data(sid, year, month)
                .map_err(|e| e.to_string())?;
            let days: Vec<String> = days.iter().map(|d| d.to_string()).collect();
            println!("{:04}-{:02}: {}", year, month, days.join(" "));
        }
    }
    Ok(())
}

fn export(settings: &WsnsSettings, sid: u32, date: NaiveDate, out: Option<PathBuf>) -> Result<(), String> {
    use chrono::Datelike;

    let store = open_store(settings)?;
    let dir = out.unwrap_or_else(|| settings.export_dir.clone());
    std::fs::create_dir_all(&dir).map_err(|e| format!("{}: {}", dir.display(), e))?;

    let path = dir.join(export_file_name(sid, date.year(), date.month(), date.day()));
    let file = File::create(&path).map_err(|e| format!("{}: {}", path.display(), e))?;
    let rows = export_sensor_data_day(&store, sid, date.year(), date.month(), date.day(), BufWriter::new(file))
        .map_err(|e| e.to_string())?;
    println!("{} ({} rows)", path.display(), rows);
    Ok(())
}

fn replay(payload: &str) -> Result<(), String> {
    let bytes = hex::decode(payload.trim()).map_err(|e| format!("invalid hex payload: {}", e))?;
    let frame = encode_ascii_frame(&bytes);
    std::io::stdout().write_all(&frame).map_err(|e| e.to_string())
}
