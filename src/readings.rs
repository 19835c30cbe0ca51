use std::collections::HashMap;

use serde_derive::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// One normalized snapshot: canonical field name to instantaneous watts.
pub type Reading = HashMap<String, f64>;

pub const PRODUCTION: &str = "production";
pub const NET_CONSUMPTION: &str = "net-consumption";
pub const TOTAL_CONSUMPTION: &str = "total_consumption";

const STREAM_PHASES: [&str; 3] = ["ph-a", "ph-b", "ph-c"];
const STREAM_TOTAL_PHASE: &str = "ph-t";
const STREAM_POWER_KEY: &str = "p";

/// What a meter element measures, as reported by the device metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MeasurementKind {
    Production,
    NetConsumption,
    TotalConsumption,
    /// Anything this bridge does not report on (storage CTs etc).
    #[serde(other)]
    Other,
}

impl MeasurementKind {
    fn field_name(self) -> Option<&'static str> {
        match self {
            MeasurementKind::Production => Some(PRODUCTION),
            MeasurementKind::NetConsumption => Some(NET_CONSUMPTION),
            MeasurementKind::TotalConsumption => Some("total-consumption"),
            MeasurementKind::Other => None,
        }
    }
}

/// One row of the device's meter metadata document.
#[derive(Debug, Deserialize)]
pub struct RawMeter {
    pub eid: u64,
    #[serde(rename = "measurementType")]
    pub measurement_type: MeasurementKind,
    #[serde(rename = "phaseCount", default = "single_phase")]
    pub phase_count: u8,
}

fn single_phase() -> u8 {
    1
}

/// One row of the live readings document.
#[derive(Debug, Deserialize)]
pub struct RawMeterReading {
    pub eid: u64,
    #[serde(rename = "instantaneousDemand")]
    pub instantaneous_demand: f64,
    /// Per-phase values in fixed phase order (A, B, C).
    #[serde(default)]
    pub channels: Vec<RawChannel>,
}

#[derive(Debug, Deserialize)]
pub struct RawChannel {
    #[serde(rename = "instantaneousDemand")]
    pub instantaneous_demand: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct MeterInfo {
    pub kind: MeasurementKind,
    pub phase_count: u8,
}

/// Session-immutable map from meter element id to what that element
/// measures. Built once from the metadata document and reused for every
/// readings fetch afterwards.
#[derive(Debug, Clone, Default)]
pub struct MeterDirectory {
    meters: HashMap<u64, MeterInfo>,
    phase_count: u8,
}

impl MeterDirectory {
    pub fn from_meters(rows: Vec<RawMeter>) -> Self {
        let phase_count = rows.iter().map(|m| m.phase_count).max().unwrap_or(1);
        let meters = rows
            .into_iter()
            .map(|m| {
                (
                    m.eid,
                    MeterInfo {
                        kind: m.measurement_type,
                        phase_count: m.phase_count,
                    },
                )
            })
            .collect();
        Self { meters, phase_count }
    }

    pub fn get(&self, eid: u64) -> Option<&MeterInfo> {
        self.meters.get(&eid)
    }

    pub fn phase_count(&self) -> u8 {
        self.phase_count
    }

    pub fn len(&self) -> usize {
        self.meters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.meters.is_empty()
    }
}

/// Flattens the raw readings rows into the canonical field set and appends
/// the derived consumption totals. Rows pointing at unknown meter elements
/// are dropped; the snapshot only fails when nothing at all could be
/// resolved.
pub fn normalize_snapshot(directory: &MeterDirectory, rows: &[RawMeterReading]) -> Result<Reading> {
    let mut reading = Reading::new();
    let mut resolved = 0usize;

    for row in rows {
        let Some(meter) = directory.get(row.eid) else {
            warn!(eid = row.eid, "readings row references unknown meter element");
            continue;
        };
        let Some(kind) = meter.kind.field_name() else {
            debug!(eid = row.eid, "skipping unsupported measurement type");
            continue;
        };

        resolved += 1;
        reading.insert(kind.to_string(), row.instantaneous_demand);
        for (index, channel) in row.channels.iter().enumerate() {
            reading.insert(
                format!("{kind}_phase_{}", index + 1),
                channel.instantaneous_demand,
            );
        }
    }

    if resolved == 0 && !rows.is_empty() {
        return Err(Error::Decode(
            "no readings row matched the meter directory".to_string(),
        ));
    }

    append_consumption_totals(&mut reading, directory.phase_count());
    Ok(reading)
}

/// Derived totals: net-consumption minus production, whole-system and per
/// phase. Skipped (with a warning) when either source kind is absent; the
/// partial snapshot is still valid.
fn append_consumption_totals(reading: &mut Reading, phase_count: u8) {
    let (Some(&production), Some(&net)) = (reading.get(PRODUCTION), reading.get(NET_CONSUMPTION))
    else {
        warn!("production or net-consumption meter missing, returning snapshot without totals");
        return;
    };

    reading.insert(TOTAL_CONSUMPTION.to_string(), net - production);
    for phase in 1..=phase_count {
        let production_phase = reading.get(&format!("{PRODUCTION}_phase_{phase}"));
        let net_phase = reading.get(&format!("{NET_CONSUMPTION}_phase_{phase}"));
        if let (Some(&p), Some(&n)) = (production_phase, net_phase) {
            reading.insert(format!("{TOTAL_CONSUMPTION}_phase_{phase}"), n - p);
        }
    }
}

/// Stream frames arrive as `<type> -> <phase> -> <datatype>`. A `ph-t`
/// power entry is synthesized per type as the sum of the three phases, then
/// the whole frame is flattened to `<type>-<phase>-<datatype>` keys.
pub fn flatten_stream_frame(frame: Value) -> Reading {
    let mut reading = Reading::new();
    let Value::Object(types) = frame else {
        return reading;
    };

    for (meter_type, phases) in types {
        let Value::Object(mut phases) = phases else {
            continue;
        };

        // Synthesize before flattening; a missing phase contributes 0.
        let total_power: f64 = STREAM_PHASES
            .iter()
            .filter_map(|phase| phases.get(*phase)?.get(STREAM_POWER_KEY)?.as_f64())
            .sum();
        let totals = phases
            .entry(STREAM_TOTAL_PHASE)
            .or_insert_with(|| json!({}));
        if let Value::Object(totals) = totals {
            totals.insert(STREAM_POWER_KEY.to_string(), json!(total_power));
        }

        for (phase, datatypes) in &phases {
            let Value::Object(datatypes) = datatypes else {
                continue;
            };
            for (datatype, value) in datatypes {
                if let Some(value) = value.as_f64() {
                    reading.insert(format!("{meter_type}-{phase}-{datatype}"), value);
                }
            }
        }
    }

    reading
}
