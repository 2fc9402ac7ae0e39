use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::NaiveDate;
use geo::{BoundingRect, Point};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use crate::app::ports::{AreaCount, CountsSummary, DatabasePort};
use crate::domain::coords::{self, Ring};
use crate::domain::{Attributes, HazardArea, Individual, LayerRecordSet, Severity};
use crate::error::{PipelineError, Result};
use crate::pipeline::processing::classify::{CandidateSearch, PreparedAreas};

const SCHEMA: &str = r#"
    PRAGMA journal_mode=WAL;
    CREATE TABLE IF NOT EXISTS hazard_areas (
        id                   INTEGER PRIMARY KEY,
        name                 TEXT NOT NULL,
        occurrence_date      TEXT,
        severity             TEXT,
        affected_population  INTEGER,
        geometry             TEXT NOT NULL,
        min_lon              REAL NOT NULL,
        min_lat              REAL NOT NULL,
        max_lon              REAL NOT NULL,
        max_lat              REAL NOT NULL,
        quality_score        REAL NOT NULL,
        attributes           TEXT NOT NULL,
        run_id               TEXT NOT NULL,
        processed_at         TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_hazard_areas_bbox
        ON hazard_areas (min_lon, max_lon, min_lat, max_lat);
    CREATE TABLE IF NOT EXISTS individuals (
        id                 INTEGER PRIMARY KEY,
        name               TEXT NOT NULL,
        address            TEXT NOT NULL,
        contact            TEXT NOT NULL,
        registration_date  TEXT,
        lon                REAL NOT NULL,
        lat                REAL NOT NULL,
        affected           INTEGER,
        hazard_area_id     INTEGER,
        quality_score      REAL NOT NULL,
        attributes         TEXT NOT NULL,
        run_id             TEXT NOT NULL,
        processed_at       TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_individuals_location ON individuals (lon, lat);
    CREATE INDEX IF NOT EXISTS idx_individuals_affected ON individuals (affected);
"#;

/// SQLite sink for classified records plus the dashboard queries.
pub struct SqliteDatabase {
    conn: Mutex<Connection>,
}

impl SqliteDatabase {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| PipelineError::Database {
            message: "connection lock poisoned".to_string(),
        })
    }
}

fn format_date(date: Option<NaiveDate>) -> Option<String> {
    date.map(|d| d.format("%Y-%m-%d").to_string())
}

fn parse_date(text: Option<String>) -> Option<NaiveDate> {
    text.and_then(|t| NaiveDate::parse_from_str(&t, "%Y-%m-%d").ok())
}

/// Columns of one `hazard_areas` row, before decoding.
struct HazardRow {
    id: i64,
    name: String,
    occurrence_date: Option<String>,
    severity: Option<String>,
    affected_population: Option<i64>,
    geometry: String,
    quality_score: f64,
    attributes: String,
}

impl HazardRow {
    fn decode(self) -> Result<HazardArea> {
        let rings: Vec<Ring> = serde_json::from_str(&self.geometry)?;
        let geometry = coords::polygon_from_rings(&rings).ok_or_else(|| PipelineError::Database {
            message: format!("hazard area {} has an empty geometry", self.id),
        })?;
        Ok(HazardArea {
            id: self.id,
            name: self.name,
            occurrence_date: parse_date(self.occurrence_date),
            severity: self.severity.and_then(|s| s.parse::<Severity>().ok()),
            affected_population: self.affected_population,
            geometry,
            quality_score: self.quality_score,
            attributes: serde_json::from_str::<Attributes>(&self.attributes)?,
        })
    }
}

#[async_trait]
impl DatabasePort for SqliteDatabase {
    async fn upsert_hazard_areas(&self, set: &LayerRecordSet<HazardArea>) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let run_id = set.run_id().to_string();
        let processed_at = set.processed_at().to_rfc3339();
        {
            let mut stmt = tx.prepare(
                "INSERT INTO hazard_areas (id, name, occurrence_date, severity, affected_population, geometry,
                     min_lon, min_lat, max_lon, max_lat, quality_score, attributes, run_id, processed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                 ON CONFLICT(id) DO UPDATE SET
                     name=excluded.name, occurrence_date=excluded.occurrence_date, severity=excluded.severity,
                     affected_population=excluded.affected_population, geometry=excluded.geometry,
                     min_lon=excluded.min_lon, min_lat=excluded.min_lat, max_lon=excluded.max_lon,
                     max_lat=excluded.max_lat, quality_score=excluded.quality_score,
                     attributes=excluded.attributes, run_id=excluded.run_id, processed_at=excluded.processed_at",
            )?;
            for area in set.records() {
                let bbox = area.geometry.bounding_rect().ok_or_else(|| PipelineError::Database {
                    message: format!("hazard area {} has no coordinates", area.id),
                })?;
                stmt.execute(params![
                    area.id,
                    area.name,
                    format_date(area.occurrence_date),
                    area.severity.map(|s| s.as_str()),
                    area.affected_population,
                    serde_json::to_string(&coords::polygon_to_rings(&area.geometry))?,
                    bbox.min().x,
                    bbox.min().y,
                    bbox.max().x,
                    bbox.max().y,
                    area.quality_score,
                    serde_json::to_string(&area.attributes)?,
                    run_id,
                    processed_at,
                ])?;
            }
        }
        let removed = tx.execute("DELETE FROM hazard_areas WHERE run_id <> ?1", params![run_id])?;
        tx.commit()?;
        info!("💾 Upserted {} hazard areas ({} stale removed)", set.len(), removed);
        Ok(set.len())
    }

    async fn upsert_individuals(&self, set: &LayerRecordSet<Individual>) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let run_id = set.run_id().to_string();
        let processed_at = set.processed_at().to_rfc3339();
        {
            let mut stmt = tx.prepare(
                "INSERT INTO individuals (id, name, address, contact, registration_date, lon, lat,
                     affected, hazard_area_id, quality_score, attributes, run_id, processed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                 ON CONFLICT(id) DO UPDATE SET
                     name=excluded.name, address=excluded.address, contact=excluded.contact,
                     registration_date=excluded.registration_date, lon=excluded.lon, lat=excluded.lat,
                     affected=excluded.affected, hazard_area_id=excluded.hazard_area_id,
                     quality_score=excluded.quality_score, attributes=excluded.attributes,
                     run_id=excluded.run_id, processed_at=excluded.processed_at",
            )?;
            for individual in set.records() {
                stmt.execute(params![
                    individual.id,
                    individual.name,
                    individual.address,
                    individual.contact,
                    format_date(individual.registration_date),
                    individual.location.x(),
                    individual.location.y(),
                    individual.affected,
                    individual.hazard_area_id,
                    individual.quality_score,
                    serde_json::to_string(&individual.attributes)?,
                    run_id,
                    processed_at,
                ])?;
            }
        }
        let removed = tx.execute("DELETE FROM individuals WHERE run_id <> ?1", params![run_id])?;
        tx.commit()?;
        info!("💾 Upserted {} individuals ({} stale removed)", set.len(), removed);
        Ok(set.len())
    }

    async fn query_counts(&self) -> Result<CountsSummary> {
        let conn = self.conn()?;
        let (total, affected, unaffected): (i64, i64, i64) = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN affected = 1 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN affected = 0 THEN 1 ELSE 0 END), 0)
             FROM individuals",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        Ok(CountsSummary {
            total: total as u64,
            affected: affected as u64,
            unaffected: unaffected as u64,
        })
    }

    async fn hazard_areas_containing(&self, lon: f64, lat: f64) -> Result<Vec<HazardArea>> {
        let rows: Vec<HazardRow> = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(
                "SELECT id, name, occurrence_date, severity, affected_population, geometry, quality_score, attributes
                 FROM hazard_areas
                 WHERE min_lon <= ?1 AND max_lon >= ?1 AND min_lat <= ?2 AND max_lat >= ?2
                 ORDER BY id",
            )?;
            let mapped = stmt.query_map(params![lon, lat], |row| {
                Ok(HazardRow {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    occurrence_date: row.get(2)?,
                    severity: row.get(3)?,
                    affected_population: row.get(4)?,
                    geometry: row.get(5)?,
                    quality_score: row.get(6)?,
                    attributes: row.get(7)?,
                })
            })?;
            let rows = mapped.collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        let areas = rows.into_iter().map(HazardRow::decode).collect::<Result<Vec<_>>>()?;
        let prepared = PreparedAreas::new(&areas, CandidateSearch::Exhaustive);
        Ok(prepared
            .containing(&Point::new(lon, lat))
            .into_iter()
            .cloned()
            .collect())
    }

    async fn counts_by_area(&self) -> Result<Vec<AreaCount>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT h.id, h.name, h.severity, COUNT(i.id)
             FROM hazard_areas h
             LEFT JOIN individuals i ON i.hazard_area_id = h.id AND i.affected = 1
             GROUP BY h.id, h.name, h.severity
             ORDER BY COUNT(i.id) DESC, h.id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(AreaCount {
                hazard_area_id: row.get(0)?,
                name: row.get(1)?,
                severity: row.get(2)?,
                affected: row.get::<_, i64>(3)? as u64,
            })
        })?;
        let counts = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(counts)
    }
}

impl SqliteDatabase {
    /// Stored membership for one individual: `None` if unknown, `Some(None)` if not yet classified.
    pub fn membership_of(&self, individual_id: i64) -> Result<Option<Option<bool>>> {
        let conn = self.conn()?;
        let membership = conn
            .query_row(
                "SELECT affected FROM individuals WHERE id = ?1",
                params![individual_id],
                |row| row.get::<_, Option<bool>>(0),
            )
            .optional()?;
        Ok(membership)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{point, polygon};
    use uuid::Uuid;

    fn area(id: i64, x0: f64, side: f64) -> HazardArea {
        HazardArea {
            id,
            name: format!("Area {}", id),
            occurrence_date: NaiveDate::from_ymd_opt(2024, 6, 10),
            severity: Some(Severity::High),
            affected_population: Some(2500),
            geometry: polygon![(x: x0, y: 0.0), (x: x0 + side, y: 0.0), (x: x0 + side, y: side), (x: x0, y: side)],
            quality_score: 1.0,
            attributes: Attributes::new(),
        }
    }

    fn person(id: i64, hazard_area_id: Option<i64>) -> Individual {
        Individual {
            id,
            name: format!("Citizen_{:03}", id),
            address: "Rua 1".to_string(),
            contact: "N/A".to_string(),
            registration_date: NaiveDate::from_ymd_opt(2024, 1, 1),
            location: point!(x: 0.5, y: 0.5),
            affected: None,
            hazard_area_id: None,
            quality_score: 0.9,
            attributes: Attributes::new(),
        }
        .classified(hazard_area_id)
    }

    #[tokio::test]
    async fn test_upsert_and_counts() {
        let db = SqliteDatabase::open_in_memory().unwrap();
        let run = Uuid::new_v4();
        db.upsert_hazard_areas(&LayerRecordSet::new(
            crate::domain::Layer::Classified,
            run,
            vec![area(1, 0.0, 1.0), area(2, 5.0, 1.0)],
        ))
        .await
        .unwrap();
        db.upsert_individuals(&LayerRecordSet::new(
            crate::domain::Layer::Classified,
            run,
            vec![person(1, Some(1)), person(2, None), person(3, Some(1))],
        ))
        .await
        .unwrap();

        let counts = db.query_counts().await.unwrap();
        assert_eq!(counts, CountsSummary { total: 3, affected: 2, unaffected: 1 });
        assert!((counts.affected_percent() - 66.666).abs() < 0.01);

        let by_area = db.counts_by_area().await.unwrap();
        assert_eq!(by_area[0].hazard_area_id, 1);
        assert_eq!(by_area[0].affected, 2);
        assert_eq!(by_area[0].severity.as_deref(), Some("high"));
        assert_eq!(by_area[1].affected, 0);
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent_and_updates() {
        let db = SqliteDatabase::open_in_memory().unwrap();
        let run = Uuid::new_v4();
        let set = LayerRecordSet::new(crate::domain::Layer::Classified, run, vec![person(1, None)]);
        db.upsert_individuals(&set).await.unwrap();
        db.upsert_individuals(&set).await.unwrap();
        assert_eq!(db.query_counts().await.unwrap().total, 1);
        assert_eq!(db.membership_of(1).unwrap(), Some(Some(false)));

        let updated = LayerRecordSet::new(crate::domain::Layer::Classified, run, vec![person(1, Some(4))]);
        db.upsert_individuals(&updated).await.unwrap();
        assert_eq!(db.membership_of(1).unwrap(), Some(Some(true)));
        assert_eq!(db.membership_of(99).unwrap(), None);
    }

    #[tokio::test]
    async fn test_new_run_replaces_rows_from_previous_runs() {
        let db = SqliteDatabase::open_in_memory().unwrap();
        let first = Uuid::new_v4();
        db.upsert_hazard_areas(&LayerRecordSet::new(
            crate::domain::Layer::Classified,
            first,
            vec![area(1, 0.0, 1.0), area(2, 5.0, 1.0)],
        ))
        .await
        .unwrap();
        db.upsert_individuals(&LayerRecordSet::new(
            crate::domain::Layer::Classified,
            first,
            (1..=5).map(|id| person(id, Some(1))).collect(),
        ))
        .await
        .unwrap();
        assert_eq!(db.query_counts().await.unwrap().total, 5);

        let second = Uuid::new_v4();
        db.upsert_hazard_areas(&LayerRecordSet::new(
            crate::domain::Layer::Classified,
            second,
            vec![area(2, 5.0, 1.0)],
        ))
        .await
        .unwrap();
        db.upsert_individuals(&LayerRecordSet::new(
            crate::domain::Layer::Classified,
            second,
            vec![person(2, None), person(4, Some(2))],
        ))
        .await
        .unwrap();

        let counts = db.query_counts().await.unwrap();
        assert_eq!(counts, CountsSummary { total: 2, affected: 1, unaffected: 1 });
        assert_eq!(db.membership_of(1).unwrap(), None);
        assert_eq!(db.membership_of(4).unwrap(), Some(Some(true)));
        let area_ids: Vec<i64> = db.counts_by_area().await.unwrap().iter().map(|a| a.hazard_area_id).collect();
        assert_eq!(area_ids, vec![2]);
    }

    #[tokio::test]
    async fn test_hazard_areas_containing_decodes_and_orders() {
        let db = SqliteDatabase::open_in_memory().unwrap();
        db.upsert_hazard_areas(&LayerRecordSet::new(
            crate::domain::Layer::Classified,
            Uuid::new_v4(),
            vec![area(1, 0.0, 10.0), area(2, 0.0, 2.0), area(3, 50.0, 1.0)],
        ))
        .await
        .unwrap();

        let found = db.hazard_areas_containing(1.0, 1.0).await.unwrap();
        let ids: Vec<i64> = found.iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![2, 1]);
        assert_eq!(found[0].occurrence_date, NaiveDate::from_ymd_opt(2024, 6, 10));
        assert_eq!(found[0].severity, Some(Severity::High));

        // boundary inclusive
        assert_eq!(db.hazard_areas_containing(2.0, 0.0).await.unwrap().len(), 2);
        assert!(db.hazard_areas_containing(30.0, 30.0).await.unwrap().is_empty());
    }

    #[test]
    fn test_open_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("esteira.db");
        SqliteDatabase::open(&path).unwrap();
        assert!(path.exists());
    }
}
