//! Deterministic sample dataset for Porto Alegre, written into the raw namespace.

use chrono::{Duration, NaiveDate};
use geo::{polygon, Point, Polygon};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Map, Value};
use tracing::info;

use crate::app::ports::StoragePort;
use crate::config::PipelineConfig;
use crate::domain::{FeatureCollection, Namespace, RawFeature};
use crate::error::Result;

pub const SEED: u64 = 42;
pub const AT_RISK_INDIVIDUALS: usize = 60;
pub const SAFE_INDIVIDUALS: usize = 40;

/// (lat, lon) centres inside the sample hazard areas.
const RISK_CENTRES: [(f64, f64); 3] = [(-30.01, -51.24), (-30.01, -51.22), (-29.90, -51.20)];
/// (lat, lon) centres well outside every sample hazard area.
const SAFE_CENTRES: [(f64, f64); 2] = [(-29.80, -51.10), (-30.15, -51.40)];
const JITTER: f64 = 0.02;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeedSummary {
    pub hazard_areas: usize,
    pub individuals: usize,
}

fn rectangle(min_lon: f64, max_lon: f64, min_lat: f64, max_lat: f64) -> Polygon<f64> {
    polygon![
        (x: min_lon, y: min_lat),
        (x: max_lon, y: min_lat),
        (x: max_lon, y: max_lat),
        (x: min_lon, y: max_lat),
    ]
}

fn properties(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn area(id: i64, name: &str, severity: &str, population: i64, geometry: &Polygon<f64>) -> RawFeature {
    RawFeature::with_polygon(
        properties(json!({
            "area_id": id,
            "area_name": name,
            "flood_date": "2024-06-10",
            "severity": severity,
            "affected_population": population,
        })),
        geometry,
    )
}

/// The three flood zones of the June 2024 sample.
pub fn sample_hazard_areas(with_anomalies: bool) -> FeatureCollection {
    let mut features = vec![
        area(1, "Partenon", "high", 2500, &rectangle(-51.30, -51.20, -30.05, -29.95)),
        area(2, "Centro/Menino Deus", "very_high", 5000, &rectangle(-51.22, -51.18, -30.03, -29.98)),
        area(3, "Zona Norte", "medium", 1500, &rectangle(-51.25, -51.15, -29.92, -29.88)),
    ];

    if with_anomalies {
        // Same id as Partenon, rejected as a duplicate.
        features.push(area(1, "Partenon (copy)", "low", 0, &rectangle(-51.60, -51.55, -30.40, -30.35)));
        // Self-intersecting ring, repaired during validation.
        features.push(RawFeature::new(
            properties(json!({
                "area_id": 4,
                "area_name": "  Arquipélago ",
                "flood_date": "10/06/2024",
                "severity": "HIGH",
            })),
            Some(json!({
                "type": "Polygon",
                "coordinates": [[[-51.50, -30.30], [-51.45, -30.25], [-51.45, -30.30], [-51.50, -30.25], [-51.50, -30.30]]]
            })),
        ));
    }
    FeatureCollection::new(features)
}

fn jittered(rng: &mut StdRng, (lat, lon): (f64, f64)) -> Point<f64> {
    Point::new(
        lon + rng.gen_range(-JITTER..=JITTER),
        lat + rng.gen_range(-JITTER..=JITTER),
    )
}

/// 60 individuals near risk centres followed by 40 near safe ones, reproducible from [`SEED`].
pub fn sample_individuals(with_anomalies: bool) -> FeatureCollection {
    let mut rng = StdRng::seed_from_u64(SEED);
    let base_date = NaiveDate::from_ymd_opt(2024, 1, 1);
    let total = AT_RISK_INDIVIDUALS + SAFE_INDIVIDUALS;

    let mut features = Vec::with_capacity(total + 1);
    for i in 0..total {
        let centre = if i < AT_RISK_INDIVIDUALS {
            RISK_CENTRES[i % RISK_CENTRES.len()]
        } else {
            SAFE_CENTRES[i % SAFE_CENTRES.len()]
        };
        let location = jittered(&mut rng, centre);
        let registered = base_date.map(|d| (d + Duration::days(i as i64)).format("%Y-%m-%d").to_string());
        let house_number: u32 = rng.gen_range(1..1000);

        let mut props = properties(json!({
            "citizen_id": i,
            "name": format!("Citizen_{:03}", i),
            "address": format!("Rua {}, nº {}, Porto Alegre", i, house_number),
            "phone": format!("51 99999-{:04}", i),
            "registration_date": registered,
        }));

        if with_anomalies {
            match i {
                1 => {
                    props.insert("name".to_string(), json!(format!("   Citizen_{:03}  ", i)));
                }
                2 => {
                    props.remove("phone");
                }
                3 => {
                    props.insert("registration_date".to_string(), json!("sometime in january"));
                }
                _ => {}
            }
        }
        features.push(RawFeature::with_point(props, &location));
    }

    if with_anomalies {
        if let Some(first) = features.first().cloned() {
            features.push(first);
        }
    }
    FeatureCollection::new(features)
}

/// Write both sample collections to the raw namespace under the configured names.
pub async fn seed_raw(storage: &dyn StoragePort, config: &PipelineConfig, with_anomalies: bool) -> Result<SeedSummary> {
    let areas = sample_hazard_areas(with_anomalies);
    let individuals = sample_individuals(with_anomalies);

    storage
        .put(Namespace::Raw, &config.hazard_areas_file, serde_json::to_vec_pretty(&areas)?)
        .await?;
    storage
        .put(Namespace::Raw, &config.individuals_file, serde_json::to_vec_pretty(&individuals)?)
        .await?;

    let summary = SeedSummary {
        hazard_areas: areas.features.len(),
        individuals: individuals.features.len(),
    };
    info!(
        "🌱 Seeded {} hazard areas and {} individuals into {} ({})",
        summary.hazard_areas,
        summary.individuals,
        Namespace::Raw,
        storage.describe()
    );
    Ok(summary)
}
