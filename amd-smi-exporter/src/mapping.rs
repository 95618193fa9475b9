//! Mapping from amd-smi device records to labeled gauge families.
//!
//! The set of families and the JSON path each reading is taken from is fixed.
//! amd-smi is inconsistent about how a reading is shaped: most leaves are
//! wrapped as `{"value": X, "unit": "..."}`, but `fan.speed`, `fan.rpm` and
//! the ECC counters are bare scalars or strings, and VCN activity is an array.
//! [`Lookup`] encodes which shape each entry expects.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value};
use tracing::{debug, trace, warn};

use crate::error::CycleError;
use crate::extract::{VALUE_KEY, extract_nested, extract_number, json_type_name, object_at};

/// Label value used when a device record carries no usable `gpu` id.
pub const FALLBACK_DEVICE_ID: &str = "0";

/// amd-smi reports memory in MiB.
const MIB: f64 = 1024.0 * 1024.0;

/// A gauge family exposed by the exporter.
///
/// Variant order is exposition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Family {
    Usage,
    Power,
    Temperature,
    Clock,
    MemoryBytes,
    Fan,
    Voltage,
    EccErrors,
}

impl Family {
    /// All families, in exposition order.
    pub const ALL: [Family; 8] = [
        Family::Usage,
        Family::Power,
        Family::Temperature,
        Family::Clock,
        Family::MemoryBytes,
        Family::Fan,
        Family::Voltage,
        Family::EccErrors,
    ];

    /// Short key used in configuration filters.
    pub fn key(&self) -> &'static str {
        match self {
            Family::Usage => "usage",
            Family::Power => "power",
            Family::Temperature => "temperature",
            Family::Clock => "clock",
            Family::MemoryBytes => "memory_bytes",
            Family::Fan => "fan",
            Family::Voltage => "voltage",
            Family::EccErrors => "ecc_errors",
        }
    }

    /// Metric name without the exporter prefix.
    pub fn suffix(&self) -> &'static str {
        match self {
            Family::Usage => "usage_percent",
            Family::Power => "power_watts",
            Family::Temperature => "temperature_celsius",
            Family::Clock => "clock_mhz",
            Family::MemoryBytes => "memory_bytes",
            Family::Fan => "fan",
            Family::Voltage => "voltage_mv",
            Family::EccErrors => "ecc_errors_total",
        }
    }

    pub fn help(&self) -> &'static str {
        match self {
            Family::Usage => "GPU usage metrics in percent",
            Family::Power => "GPU power consumption in watts",
            Family::Temperature => "GPU temperature in celsius",
            Family::Clock => "GPU clock metrics in MHz",
            Family::MemoryBytes => "GPU memory usage in bytes",
            Family::Fan => "GPU fan metrics",
            Family::Voltage => "GPU voltage in millivolts",
            Family::EccErrors => "GPU ECC error counts",
        }
    }
}

/// How a reading is located inside its section object.
#[derive(Debug, Clone, Copy)]
pub enum Lookup {
    /// Value-wrapped reading, resolved with [`extract_nested`].
    Nested(&'static [&'static str]),
    /// Bare scalar or string field.
    Direct(&'static str),
    /// Value-wrapped reading in the first element of an array field.
    FirstElement(&'static str),
}

impl Lookup {
    fn resolve(&self, section: &Map<String, Value>) -> Option<f64> {
        match self {
            Lookup::Nested(path) => extract_nested(section, path),
            Lookup::Direct(key) => section.get(*key).and_then(extract_number),
            Lookup::FirstElement(key) => section
                .get(*key)?
                .as_array()?
                .first()?
                .as_object()?
                .get(VALUE_KEY)
                .and_then(extract_number),
        }
    }
}

/// One entry of the device field table.
#[derive(Debug, Clone, Copy)]
pub struct FieldMapping {
    pub family: Family,
    pub sub_type: &'static str,
    /// Object path from the device record to the section holding the reading.
    pub section: &'static [&'static str],
    pub lookup: Lookup,
    /// Multiplier applied to the extracted reading.
    pub scale: f64,
}

const fn field(
    family: Family,
    sub_type: &'static str,
    section: &'static [&'static str],
    lookup: Lookup,
) -> FieldMapping {
    FieldMapping {
        family,
        sub_type,
        section,
        lookup,
        scale: 1.0,
    }
}

const fn mem_field(sub_type: &'static str, path: &'static [&'static str]) -> FieldMapping {
    FieldMapping {
        family: Family::MemoryBytes,
        sub_type,
        section: &["mem_usage"],
        lookup: Lookup::Nested(path),
        scale: MIB,
    }
}

/// Every reading the exporter knows how to take from a device record.
pub const FIELDS: &[FieldMapping] = &[
    field(Family::Usage, "gfx", &["usage"], Lookup::Nested(&["gfx_activity", "value"])),
    field(Family::Usage, "umc", &["usage"], Lookup::Nested(&["umc_activity", "value"])),
    field(Family::Usage, "mm", &["usage"], Lookup::Nested(&["mm_activity", "value"])),
    field(Family::Usage, "vcn", &["usage"], Lookup::FirstElement("vcn_activity")),
    field(Family::Power, "socket", &["power"], Lookup::Nested(&["socket_power", "value"])),
    field(Family::Voltage, "gfx", &["power"], Lookup::Nested(&["gfx_voltage", "value"])),
    field(Family::Voltage, "soc", &["power"], Lookup::Nested(&["soc_voltage", "value"])),
    field(Family::Voltage, "memory", &["power"], Lookup::Nested(&["mem_voltage", "value"])),
    field(Family::Clock, "gfx", &["clock", "gfx_0"], Lookup::Nested(&["clk", "value"])),
    field(Family::Temperature, "edge", &["temperature"], Lookup::Nested(&["edge", "value"])),
    field(Family::Temperature, "hotspot", &["temperature"], Lookup::Nested(&["hotspot", "value"])),
    field(Family::Temperature, "memory", &["temperature"], Lookup::Nested(&["mem", "value"])),
    mem_field("total_vram", &["total_vram", "value"]),
    mem_field("used_vram", &["used_vram", "value"]),
    mem_field("free_vram", &["free_vram", "value"]),
    mem_field("total_visible_vram", &["total_visible_vram", "value"]),
    mem_field("used_visible_vram", &["used_visible_vram", "value"]),
    mem_field("free_visible_vram", &["free_visible_vram", "value"]),
    mem_field("total_gtt", &["total_gtt", "value"]),
    mem_field("used_gtt", &["used_gtt", "value"]),
    mem_field("free_gtt", &["free_gtt", "value"]),
    field(Family::Fan, "speed", &["fan"], Lookup::Direct("speed")),
    field(Family::Fan, "rpm", &["fan"], Lookup::Direct("rpm")),
    field(Family::Fan, "usage", &["fan"], Lookup::Nested(&["usage", "value"])),
    field(Family::EccErrors, "correctable", &["ecc"], Lookup::Direct("total_correctable_count")),
    field(Family::EccErrors, "uncorrectable", &["ecc"], Lookup::Direct("total_uncorrectable_count")),
];

/// Label pair identifying one sample within a family.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SeriesKey {
    pub gpu: String,
    pub sub_type: &'static str,
}

/// The gauge families of one collection cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricFamilies {
    samples: BTreeMap<Family, BTreeMap<SeriesKey, f64>>,
}

impl MetricFamilies {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a sample, overwriting any earlier value for the same labels.
    pub fn set(&mut self, family: Family, gpu: &str, sub_type: &'static str, value: f64) {
        let key = SeriesKey {
            gpu: gpu.to_string(),
            sub_type,
        };
        self.samples.entry(family).or_default().insert(key, value);
    }

    pub fn get(&self, family: Family, gpu: &str, sub_type: &str) -> Option<f64> {
        self.samples
            .get(&family)?
            .iter()
            .find(|(key, _)| key.gpu == gpu && key.sub_type == sub_type)
            .map(|(_, value)| *value)
    }

    /// Drop every sample of every family.
    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Keep only the families accepted by `keep`.
    pub fn retain_families(&mut self, mut keep: impl FnMut(Family) -> bool) {
        self.samples.retain(|family, _| keep(*family));
    }

    /// Samples of one family, ordered by labels.
    pub fn family(&self, family: Family) -> impl Iterator<Item = (&SeriesKey, f64)> {
        self.samples
            .get(&family)
            .into_iter()
            .flat_map(|series| series.iter().map(|(key, value)| (key, *value)))
    }

    /// Number of samples in one family.
    pub fn family_len(&self, family: Family) -> usize {
        self.samples.get(&family).map_or(0, BTreeMap::len)
    }

    /// Total number of samples across all families.
    pub fn len(&self) -> usize {
        self.samples.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of distinct device ids with at least one sample.
    pub fn device_count(&self) -> usize {
        self.samples
            .values()
            .flat_map(|series| series.keys().map(|key| key.gpu.as_str()))
            .collect::<BTreeSet<_>>()
            .len()
    }
}

/// Read the device id from the `gpu` field of a device record.
///
/// Returns `None` if the field is absent or not a non-negative number.
pub fn device_id(device: &Map<String, Value>) -> Option<String> {
    let id = device.get("gpu")?;
    if let Some(n) = id.as_u64() {
        return Some(n.to_string());
    }
    match id.as_f64() {
        // Adding zero turns -0.0 into 0.0
        Some(f) if f.is_finite() && f >= 0.0 => Some(format!("{:.0}", f + 0.0)),
        _ => None,
    }
}

/// Record every reading the table finds in one device record.
///
/// Each field is resolved independently; one that is missing or malformed is
/// skipped without affecting the others. Returns the number of samples set.
pub fn map_device(
    device_id: &str,
    device: &Map<String, Value>,
    families: &mut MetricFamilies,
) -> usize {
    let mut recorded = 0;

    for field in FIELDS {
        let value =
            object_at(device, field.section).and_then(|section| field.lookup.resolve(section));

        match value {
            Some(v) => {
                families.set(field.family, device_id, field.sub_type, v * field.scale);
                recorded += 1;
            }
            None => {
                trace!(
                    gpu = %device_id,
                    family = field.family.key(),
                    sub_type = field.sub_type,
                    "Reading not available"
                );
            }
        }
    }

    recorded
}

/// Map a decoded amd-smi document into a fresh set of families.
///
/// The document must be an array; elements that are not objects are skipped.
pub fn map_document(document: &Value) -> Result<MetricFamilies, CycleError> {
    let devices = document.as_array().ok_or(CycleError::Shape {
        found: json_type_name(document),
    })?;

    let mut families = MetricFamilies::new();

    for (index, entry) in devices.iter().enumerate() {
        let Some(device) = entry.as_object() else {
            warn!(
                index,
                found = json_type_name(entry),
                "Expected GPU object to be a map, skipping"
            );
            continue;
        };

        let id = match device_id(device) {
            Some(id) => id,
            None => {
                let reason = if device.contains_key("gpu") {
                    "malformed"
                } else {
                    "missing"
                };
                warn!(
                    index,
                    reason,
                    gpu = ?device.get("gpu"),
                    fallback = FALLBACK_DEVICE_ID,
                    "GPU record has no usable id, using fallback"
                );
                FALLBACK_DEVICE_ID.to_string()
            }
        };

        let recorded = map_device(&id, device, &mut families);
        debug!(gpu = %id, samples = recorded, "Mapped GPU record");
    }

    Ok(families)
}

/// Sanitize a metric name to be Prometheus-compatible.
///
/// Prometheus metric names must match `[a-zA-Z_:][a-zA-Z0-9_:]*`.
/// Invalid characters become underscores, runs of underscores collapse, and
/// a leading digit is prefixed with an underscore.
pub fn sanitize_metric_name(name: &str) -> String {
    let mut result = String::with_capacity(name.len() + 1);
    let mut last_was_underscore = false;

    if name.starts_with(|c: char| c.is_ascii_digit()) {
        result.push('_');
        last_was_underscore = true;
    }

    for c in name.chars() {
        if c.is_ascii_alphanumeric() || c == ':' {
            result.push(c);
            last_was_underscore = false;
        } else if !last_was_underscore {
            result.push('_');
            last_was_underscore = true;
        }
    }

    while result.ends_with('_') {
        result.pop();
    }

    result
}

/// Build the exposed metric name of a family.
///
/// Format: `{prefix}_{suffix}`, or just the suffix when the prefix is empty.
pub fn build_metric_name(prefix: &str, family: Family) -> String {
    let prefix = sanitize_metric_name(prefix);

    if prefix.is_empty() {
        family.suffix().to_string()
    } else {
        format!("{}_{}", prefix, family.suffix())
    }
}
