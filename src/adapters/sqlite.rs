//! SQLite loader for validated converters.
//!
//! Converters are upserted by part number. Their child rows (pins,
//! isolation tests, derating points, certification and protection links)
//! are replaced on every load so the database mirrors the latest run.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use tracing::{debug, info};

use super::RecordSink;
use crate::domain::{Lane, PowerConverter};
use crate::steps::ValidatedEntry;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS series (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    company TEXT NOT NULL,
    product_type TEXT NOT NULL,
    name TEXT NOT NULL,
    UNIQUE (company, name)
);

CREATE TABLE IF NOT EXISTS converter (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    company TEXT NOT NULL,
    series_id INTEGER REFERENCES series(id),
    part_number TEXT NOT NULL UNIQUE,
    converter_type TEXT NOT NULL,
    ac_voltage_input_min REAL,
    ac_voltage_input_max REAL,
    dc_voltage_input_min REAL,
    dc_voltage_input_max REAL,
    input_voltage_tolerance REAL,
    power REAL,
    is_regulated BOOLEAN,
    regulation_voltage_range TEXT,
    efficiency REAL,
    voltage_output_1 REAL,
    voltage_output_2 REAL,
    voltage_output_3 REAL,
    i_out1 REAL,
    i_out2 REAL,
    i_out3 REAL,
    output_type TEXT,
    pin_count INTEGER,
    mounting_type TEXT,
    connection_type TEXT,
    dimensions_unit TEXT,
    dimensions_length REAL,
    dimensions_width REAL,
    dimensions_height REAL,
    operating_temp_min REAL,
    operating_temp_max REAL,
    source_hash TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS certification (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS protection (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS converter_certification (
    converter_id INTEGER NOT NULL REFERENCES converter(id) ON DELETE CASCADE,
    certification_id INTEGER NOT NULL REFERENCES certification(id),
    PRIMARY KEY (converter_id, certification_id)
);

CREATE TABLE IF NOT EXISTS converter_protection (
    converter_id INTEGER NOT NULL REFERENCES converter(id) ON DELETE CASCADE,
    protection_id INTEGER NOT NULL REFERENCES protection(id),
    PRIMARY KEY (converter_id, protection_id)
);

CREATE TABLE IF NOT EXISTS pin (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    converter_id INTEGER NOT NULL REFERENCES converter(id) ON DELETE CASCADE,
    pin_id TEXT,
    pin_type TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS isolation_test (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    converter_id INTEGER NOT NULL REFERENCES converter(id) ON DELETE CASCADE,
    duration_sec INTEGER,
    unit TEXT NOT NULL,
    voltage REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS power_derating (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    converter_id INTEGER NOT NULL REFERENCES converter(id) ON DELETE CASCADE,
    threshold_temperature INTEGER,
    threshold_unit TEXT,
    unit TEXT NOT NULL,
    rate REAL NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_converter_company ON converter(company);
CREATE INDEX IF NOT EXISTS idx_converter_series ON converter(series_id);
CREATE INDEX IF NOT EXISTS idx_converter_type ON converter(converter_type);
CREATE INDEX IF NOT EXISTS idx_converter_power ON converter(power);
CREATE INDEX IF NOT EXISTS idx_converter_efficiency ON converter(efficiency);
"#;

/// Loads validated entries into a SQLite database
pub struct SqliteSink {
    conn: Mutex<Connection>,
}

impl SqliteSink {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory().context("Failed to open database")?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        conn.execute_batch(SCHEMA)
            .context("Failed to create schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Number of converters stored for a company
    pub fn converter_count(&self, company: &str) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM converter WHERE company = ?1",
            params![company],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("Database connection lock poisoned"))
    }
}

fn named_id(tx: &Transaction<'_>, table: &str, name: &str) -> Result<i64> {
    tx.execute(
        &format!("INSERT OR IGNORE INTO {} (name) VALUES (?1)", table),
        params![name],
    )?;
    let id = tx.query_row(
        &format!("SELECT id FROM {} WHERE name = ?1", table),
        params![name],
        |row| row.get(0),
    )?;
    Ok(id)
}

fn series_id(tx: &Transaction<'_>, lane: &Lane, name: &str) -> Result<i64> {
    tx.execute(
        "INSERT OR IGNORE INTO series (company, product_type, name) VALUES (?1, ?2, ?3)",
        params![lane.manufacturer.as_str(), lane.product_type.as_str(), name],
    )?;
    let id = tx.query_row(
        "SELECT id FROM series WHERE company = ?1 AND name = ?2",
        params![lane.manufacturer.as_str(), name],
        |row| row.get(0),
    )?;
    Ok(id)
}

fn upsert_converter(
    tx: &Transaction<'_>,
    lane: &Lane,
    source_hash: &str,
    c: &PowerConverter,
) -> Result<i64> {
    let now = chrono::Utc::now().to_rfc3339();
    let series = match c.product_series.as_deref().map(str::trim) {
        Some(name) if !name.is_empty() => Some(series_id(tx, lane, name)?),
        _ => None,
    };
    let package = c.package.clone().unwrap_or_default();
    let (dim_unit, dim_length, dim_width, dim_height) = match &c.dimensions {
        Some(d) => (
            serde_json::to_value(d.unit)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string)),
            d.length,
            d.width,
            d.height,
        ),
        None => (None, None, None, None),
    };
    let output_type = c
        .output_type
        .and_then(|t| serde_json::to_value(t).ok())
        .and_then(|v| v.as_str().map(str::to_string));
    let temp = c.operating_temperature.clone().unwrap_or_default();

    tx.execute(
        "INSERT INTO converter (
            company, series_id, part_number, converter_type,
            ac_voltage_input_min, ac_voltage_input_max, dc_voltage_input_min, dc_voltage_input_max,
            input_voltage_tolerance, power, is_regulated, regulation_voltage_range, efficiency,
            voltage_output_1, voltage_output_2, voltage_output_3, i_out1, i_out2, i_out3,
            output_type, pin_count, mounting_type, connection_type,
            dimensions_unit, dimensions_length, dimensions_width, dimensions_height,
            operating_temp_min, operating_temp_max, source_hash, created_at, updated_at
        ) VALUES (
            ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
            ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30, ?31, ?31
        )
        ON CONFLICT(part_number) DO UPDATE SET
            company = excluded.company,
            series_id = excluded.series_id,
            converter_type = excluded.converter_type,
            ac_voltage_input_min = excluded.ac_voltage_input_min,
            ac_voltage_input_max = excluded.ac_voltage_input_max,
            dc_voltage_input_min = excluded.dc_voltage_input_min,
            dc_voltage_input_max = excluded.dc_voltage_input_max,
            input_voltage_tolerance = excluded.input_voltage_tolerance,
            power = excluded.power,
            is_regulated = excluded.is_regulated,
            regulation_voltage_range = excluded.regulation_voltage_range,
            efficiency = excluded.efficiency,
            voltage_output_1 = excluded.voltage_output_1,
            voltage_output_2 = excluded.voltage_output_2,
            voltage_output_3 = excluded.voltage_output_3,
            i_out1 = excluded.i_out1,
            i_out2 = excluded.i_out2,
            i_out3 = excluded.i_out3,
            output_type = excluded.output_type,
            pin_count = excluded.pin_count,
            mounting_type = excluded.mounting_type,
            connection_type = excluded.connection_type,
            dimensions_unit = excluded.dimensions_unit,
            dimensions_length = excluded.dimensions_length,
            dimensions_width = excluded.dimensions_width,
            dimensions_height = excluded.dimensions_height,
            operating_temp_min = excluded.operating_temp_min,
            operating_temp_max = excluded.operating_temp_max,
            source_hash = excluded.source_hash,
            updated_at = excluded.updated_at",
        params![
            lane.manufacturer.as_str(),
            series,
            c.part_number,
            c.converter_type.as_str(),
            c.ac_voltage_input_min,
            c.ac_voltage_input_max,
            c.dc_voltage_input_min,
            c.dc_voltage_input_max,
            c.input_voltage_tolerance,
            c.power,
            c.is_regulated,
            c.regulation_voltage_range,
            c.efficiency,
            c.voltage_output_1,
            c.voltage_output_2,
            c.voltage_output_3,
            c.i_out1,
            c.i_out2,
            c.i_out3,
            output_type,
            c.pins.len() as i64,
            package.mounting_type,
            package.connection_type,
            dim_unit,
            dim_length,
            dim_width,
            dim_height,
            temp.min,
            temp.max,
            source_hash,
            now,
        ],
    )?;

    let id: i64 = tx.query_row(
        "SELECT id FROM converter WHERE part_number = ?1",
        params![c.part_number],
        |row| row.get(0),
    )?;

    for table in [
        "pin",
        "isolation_test",
        "power_derating",
        "converter_certification",
        "converter_protection",
    ] {
        tx.execute(
            &format!("DELETE FROM {} WHERE converter_id = ?1", table),
            params![id],
        )?;
    }

    for pin in &c.pins {
        tx.execute(
            "INSERT INTO pin (converter_id, pin_id, pin_type) VALUES (?1, ?2, ?3)",
            params![id, pin.pin_id.as_ref().map(|p| p.to_string()), pin.pin_type],
        )?;
    }

    for test in &c.isolation_test_voltage {
        tx.execute(
            "INSERT INTO isolation_test (converter_id, duration_sec, unit, voltage) VALUES (?1, ?2, ?3, ?4)",
            params![id, test.duration_sec, test.unit.as_str(), test.voltage],
        )?;
    }

    for point in &c.power_derating {
        let unit = serde_json::to_value(point.unit)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string));
        let threshold_unit = point
            .threshold
            .as_ref()
            .and_then(|t| serde_json::to_value(t.unit).ok())
            .and_then(|v| v.as_str().map(str::to_string));
        tx.execute(
            "INSERT INTO power_derating (converter_id, threshold_temperature, threshold_unit, unit, rate)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id,
                point.threshold.as_ref().map(|t| t.temperature),
                threshold_unit,
                unit,
                point.rate
            ],
        )?;
    }

    for name in c.certifications.iter().flatten() {
        let cert = named_id(tx, "certification", name.trim())?;
        tx.execute(
            "INSERT OR IGNORE INTO converter_certification (converter_id, certification_id) VALUES (?1, ?2)",
            params![id, cert],
        )?;
    }

    for name in c.protections.iter().flatten() {
        let protection = named_id(tx, "protection", name.trim())?;
        tx.execute(
            "INSERT OR IGNORE INTO converter_protection (converter_id, protection_id) VALUES (?1, ?2)",
            params![id, protection],
        )?;
    }

    Ok(id)
}

impl RecordSink for SqliteSink {
    fn load(&self, lane: &Lane, entry: &ValidatedEntry) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().context("Failed to start transaction")?;

        for converter in &entry.pdf {
            let id = upsert_converter(&tx, lane, &entry.hash, converter)
                .with_context(|| format!("Failed to load converter {}", converter.part_number))?;
            debug!(part_number = %converter.part_number, id, "Converter loaded");
        }

        tx.commit().context("Failed to commit")?;
        info!(lane = %lane, hash = %entry.hash, converters = entry.pdf.len(), "Entry loaded");
        Ok(entry.pdf.len())
    }
}

impl SqliteSink {
    /// Part numbers of a series, for inspection
    pub fn series_parts(&self, company: &str, series: &str) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let series_id: Option<i64> = conn
            .query_row(
                "SELECT id FROM series WHERE company = ?1 AND name = ?2",
                params![company, series],
                |row| row.get(0),
            )
            .optional()?;

        let Some(series_id) = series_id else {
            return Ok(Vec::new());
        };

        let mut stmt =
            conn.prepare("SELECT part_number FROM converter WHERE series_id = ?1 ORDER BY part_number")?;
        let parts = stmt
            .query_map(params![series_id], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(parts)
    }
}
