// =============================================================================
// Persisted trade logs — append-only paper/live CSV event records
// =============================================================================
//
// Each writer appends to its file, writing the header only when the file is
// created (or empty). Rows are flushed as they are written so a crash never
// loses a completed trade. Writers are mutex-guarded; one writer at a time
// per file.
// =============================================================================

use std::fs::OpenOptions;
use std::path::Path;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::Serialize;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Paper log event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PaperEvent {
    #[serde(rename = "OPEN")]
    Open,
    #[serde(rename = "CLOSE")]
    Close,
}

/// One row of the paper trade log.
#[derive(Debug, Clone, Serialize)]
pub struct PaperRecord {
    pub ts: i64,
    pub symbol: String,
    pub side: String,
    pub event: PaperEvent,
    pub entry: f64,
    pub exit: Option<f64>,
    pub tp: f64,
    pub sl: f64,
    pub pnl_pct: Option<f64>,
    pub net_pnl_usd: Option<f64>,
    pub reason: Option<String>,
}

/// One row of the live trade log.
#[derive(Debug, Clone, Serialize)]
pub struct LiveRecord {
    pub ts: i64,
    pub symbol: String,
    pub side: String,
    pub entry: f64,
    pub exit: f64,
    pub qty: String,
    pub leverage: u32,
    pub pnl_pct: f64,
    pub net_pnl_usd: f64,
    pub outcome: String,
    pub reason: String,
    pub order_id_entry: i64,
    pub order_id_exit: Option<i64>,
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Append-only CSV writer with header-on-creation.
pub struct CsvLog {
    writer: Mutex<csv::Writer<std::fs::File>>,
}

impl CsvLog {
    /// Open (or create) the log at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create log dir {}", parent.display()))?;
            }
        }

        let fresh = std::fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;

        let writer = csv::WriterBuilder::new().has_headers(fresh).from_writer(file);
        Ok(Self {
            writer: Mutex::new(writer),
        })
    }

    /// Serialize one record and flush it to disk.
    pub fn append<T: Serialize>(&self, record: &T) -> Result<()> {
        let mut w = self.writer.lock();
        w.serialize(record).context("failed to serialize log record")?;
        w.flush().context("failed to flush log record")?;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    static SEQ: AtomicU32 = AtomicU32::new(0);

    fn temp_path(tag: &str) -> std::path::PathBuf {
        let n = SEQ.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!(
            "stride-log-test-{}-{tag}-{n}.csv",
            std::process::id()
        ))
    }

    fn paper_row(event: PaperEvent) -> PaperRecord {
        PaperRecord {
            ts: 1_700_000_000,
            symbol: "BTCUSDT".into(),
            side: "LONG".into(),
            event,
            entry: 100.2,
            exit: match event {
                PaperEvent::Open => None,
                PaperEvent::Close => Some(101.21),
            },
            tp: 101.202,
            sl: 99.198,
            pnl_pct: matches!(event, PaperEvent::Close).then_some(1.0),
            net_pnl_usd: matches!(event, PaperEvent::Close).then_some(0.5),
            reason: matches!(event, PaperEvent::Close).then(|| "TP".to_string()),
        }
    }

    #[test]
    fn header_written_once_across_reopens() {
        let path = temp_path("header");

        {
            let log = CsvLog::open(&path).unwrap();
            log.append(&paper_row(PaperEvent::Open)).unwrap();
        }
        {
            let log = CsvLog::open(&path).unwrap();
            log.append(&paper_row(PaperEvent::Close)).unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        let header_lines = content
            .lines()
            .filter(|l| l.starts_with("ts,symbol,side,event"))
            .count();
        assert_eq!(header_lines, 1, "header must appear exactly once");
        assert_eq!(content.lines().count(), 3, "header + two rows");

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn open_row_leaves_close_fields_empty() {
        let path = temp_path("open-row");
        let log = CsvLog::open(&path).unwrap();
        log.append(&paper_row(PaperEvent::Open)).unwrap();
        drop(log);

        let content = std::fs::read_to_string(&path).unwrap();
        let row = content.lines().nth(1).unwrap();
        assert!(row.contains("OPEN"));
        assert!(row.contains("BTCUSDT"));
        // exit / pnl / reason are empty fields on an OPEN event.
        assert!(row.ends_with(",,"), "row: {row}");

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn live_row_shape() {
        let path = temp_path("live-row");
        let log = CsvLog::open(&path).unwrap();
        log.append(&LiveRecord {
            ts: 1_700_000_000,
            symbol: "ETHUSDT".into(),
            side: "SHORT".into(),
            entry: 2000.0,
            exit: 1990.0,
            qty: "0.01".into(),
            leverage: 2,
            pnl_pct: 0.5,
            net_pnl_usd: 0.2,
            outcome: "WIN".into(),
            reason: "TP_EXCHANGE".into(),
            order_id_entry: 11,
            order_id_exit: Some(12),
        })
        .unwrap();
        drop(log);

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("ts,symbol,side,entry,exit,qty,leverage,pnl_pct,net_pnl_usd,outcome,reason,order_id_entry,order_id_exit"));
        assert!(content.contains("TP_EXCHANGE"));

        let _ = std::fs::remove_file(&path);
    }
}
