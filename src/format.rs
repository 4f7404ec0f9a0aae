// format.rs
//
// Turns a decoded value (or a raw register, or accumulated response-time
// stats) into the JSON body a `pub` or a `get` reply carries, per the
// plain/`individual_bits`/`bit_field`/`enum` shapes and the `/_raw` and
// `/_timings` diagnostic suffixes. Every body carries a `Timestamp` field
// stamped with the same `MM-DD-YYYY HH:MM:SS.ffffff` format the original
// client's `fmt_timestamp` produces, rendered here with `chrono`.

use chrono::{DateTime, Local};
use serde_json::{json, Map, Value};

use crate::decode::{BitStrings, DecodeSpec, TypedValue};

pub fn timestamp(now: DateTime<Local>) -> String {
    now.format("%m-%d-%Y %H:%M:%S%.6f").to_string()
}

/// Format a fully decoded, non-bit-string value: `{"<id>": <value>,
/// "Timestamp": "..."}`.
pub fn format_plain(spec: &DecodeSpec, value: TypedValue, now: DateTime<Local>) -> Value {
    let mut body = Map::new();
    body.insert(spec.id.clone(), value.to_json());
    body.insert("Timestamp".to_string(), json!(timestamp(now)));
    Value::Object(body)
}

/// Format a single labeled bit of an `individual_bits` decode:
/// `{"<label>": true|false, "Timestamp": "..."}`.
pub fn format_individual_bit(label: &str, set: bool, now: DateTime<Local>) -> Value {
    let mut body = Map::new();
    body.insert(label.to_string(), json!(set));
    body.insert("Timestamp".to_string(), json!(timestamp(now)));
    Value::Object(body)
}

/// Format a `bit_field` decode as `[{"value": begin_bit, "string": label},
/// …]`, one entry per high bit/range, unlabeled ranges rendering as
/// `"string":"Unknown"`; zero ranges are omitted, same as the original
/// client only surfacing active flags.
pub fn format_bit_field(spec: &DecodeSpec, raw: u64, now: DateTime<Local>) -> Value {
    let mut flags = Vec::new();
    if let Some(BitStrings::BitField(ranges)) = &spec.bit_strings {
        for range in ranges {
            if raw & range.mask() != 0 {
                flags.push(json!({
                    "value": range.begin_bit,
                    "string": range.label.clone().unwrap_or_else(|| "Unknown".to_string()),
                }));
            }
        }
    }
    let mut body = Map::new();
    body.insert(spec.id.clone(), json!(flags));
    body.insert("Timestamp".to_string(), json!(timestamp(now)));
    Value::Object(body)
}

/// Format an `enum` decode: `[{"value": raw, "string": label}]`, the
/// label falling back to `"Unknown"` if no enum entry matches `raw`.
pub fn format_enum(spec: &DecodeSpec, raw: u64, now: DateTime<Local>) -> Value {
    let label = match &spec.bit_strings {
        Some(BitStrings::Enum(labels)) => labels
            .iter()
            .find(|l| l.value == raw)
            .map(|l| l.label.clone())
            .unwrap_or_else(|| "Unknown".to_string()),
        _ => "Unknown".to_string(),
    };
    let mut body = Map::new();
    body.insert(spec.id.clone(), json!([{ "value": raw, "string": label }]));
    body.insert("Timestamp".to_string(), json!(timestamp(now)));
    Value::Object(body)
}

/// Dispatch to the right formatter for a plain (non-individual-bit)
/// decode based on its `bit_strings` kind.
pub fn format_decode(spec: &DecodeSpec, value: TypedValue, raw: u64, now: DateTime<Local>) -> Value {
    match &spec.bit_strings {
        Some(BitStrings::BitField(_)) => format_bit_field(spec, raw, now),
        Some(BitStrings::Enum(_)) => format_enum(spec, raw, now),
        Some(BitStrings::IndividualBits(_)) | None => format_plain(spec, value, now),
    }
}

/// `/_raw`: the composed raw integer plus a zero-padded binary rendering
/// and a big-endian hex rendering (via the `hex` crate) of the
/// underlying words.
pub fn format_raw(raw: u64, size: u8, now: DateTime<Local>) -> Value {
    let bit_len = size as usize * 16;
    let byte_len = size as usize * 2;
    let bytes: Vec<u8> = (0..byte_len)
        .rev()
        .map(|i| ((raw >> (i * 8)) & 0xFF) as u8)
        .collect();
    json!({
        "value": raw,
        "binary": format!("{:0width$b}", raw, width = bit_len),
        "hex": format!("0x{}", hex::encode(&bytes)),
        "Timestamp": timestamp(now),
    })
}

/// Shared between a worker (which records samples) and the arbiter
/// (which serves `/_timings` and `/_reset_timings`), keyed by
/// `(component_idx, register_map_idx)`.
pub type StatsMap = std::sync::Arc<std::sync::Mutex<std::collections::HashMap<(usize, usize), ResponseTimeStats>>>;

#[derive(Clone, Copy, Debug, Default)]
pub struct ResponseTimeStats {
    pub count: u64,
    pub min_us: u64,
    pub max_us: u64,
    pub sum_us: u64,
}

impl ResponseTimeStats {
    pub fn record(&mut self, elapsed_us: u64) {
        self.count += 1;
        self.sum_us += elapsed_us;
        self.min_us = if self.count == 1 { elapsed_us } else { self.min_us.min(elapsed_us) };
        self.max_us = self.max_us.max(elapsed_us);
    }

    pub fn avg_us(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum_us as f64 / self.count as f64
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Fold another register map's stats into this one, for `/_timings` on
    /// a whole component (which has one `ResponseTimeStats` per map).
    pub fn merge(&mut self, other: &ResponseTimeStats) {
        if other.count == 0 {
            return;
        }
        self.min_us = if self.count == 0 { other.min_us } else { self.min_us.min(other.min_us) };
        self.max_us = self.max_us.max(other.max_us);
        self.count += other.count;
        self.sum_us += other.sum_us;
    }
}

/// `/_timings`: accumulated response-time stats for a register map's
/// poll requests since the last `/_reset_timings`.
pub fn format_timings(stats: &ResponseTimeStats, now: DateTime<Local>) -> Value {
    json!({
        "num_timings_recorded": stats.count,
        "avg_response_time": stats.avg_us(),
        "min_response_time": stats.min_us,
        "max_response_time": stats.max_us,
        "Timestamp": timestamp(now),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{BitRange, EnumLabel};
    use chrono::TimeZone;

    fn fixed_now() -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 7, 26, 12, 30, 0).unwrap()
    }

    fn base_spec() -> DecodeSpec {
        DecodeSpec {
            id: "soc".to_string(),
            offset: 0,
            size: 1,
            scale: 0.0,
            shift: 0,
            invert_mask: 0,
            care_mask: 0xFFFF,
            starting_bit_pos: 0,
            number_of_bits: 16,
            signed: false,
            float: false,
            bit_strings: None,
            debounce_ms: 0,
        }
    }

    #[test]
    fn plain_value_carries_id_and_timestamp() {
        let spec = base_spec();
        let body = format_plain(&spec, TypedValue::U(42), fixed_now());
        assert_eq!(body["soc"], 42);
        assert_eq!(body["Timestamp"], "07-26-2026 12:30:00.000000");
    }

    #[test]
    fn bit_field_reports_unknown_for_unlabeled_set_range() {
        let mut spec = base_spec();
        spec.bit_strings = Some(BitStrings::BitField(vec![
            BitRange { begin_bit: 0, end_bit: 0, label: Some("fault".to_string()) },
            BitRange { begin_bit: 1, end_bit: 1, label: None },
        ]));
        let body = format_bit_field(&spec, 0b11, fixed_now());
        let arr = body["soc"].as_array().unwrap();
        assert_eq!(arr, &[
            json!({"value": 0, "string": "fault"}),
            json!({"value": 1, "string": "Unknown"}),
        ]);
    }

    #[test]
    fn bit_field_omits_zero_ranges() {
        let mut spec = base_spec();
        spec.bit_strings = Some(BitStrings::BitField(vec![
            BitRange { begin_bit: 0, end_bit: 0, label: Some("fault".to_string()) },
        ]));
        let body = format_bit_field(&spec, 0b0, fixed_now());
        assert_eq!(body["soc"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn enum_falls_back_to_unknown() {
        let mut spec = base_spec();
        spec.bit_strings = Some(BitStrings::Enum(vec![EnumLabel { value: 1, label: "Idle".to_string() }]));
        let body = format_enum(&spec, 2, fixed_now());
        assert_eq!(body["soc"], json!([{"value": 2, "string": "Unknown"}]));
    }

    #[test]
    fn enum_scenario_4_unmatched_value_renders_unknown() {
        let mut spec = base_spec();
        spec.id = "state".to_string();
        spec.bit_strings = Some(BitStrings::Enum(vec![
            EnumLabel { value: 0, label: "idle".to_string() },
            EnumLabel { value: 2, label: "run".to_string() },
        ]));
        let body = format_enum(&spec, 5, fixed_now());
        assert_eq!(body["state"], json!([{"value": 5, "string": "Unknown"}]));
    }

    #[test]
    fn raw_renders_hex_and_binary() {
        let body = format_raw(0xABCD, 1, fixed_now());
        assert_eq!(body["value"], 0xABCD);
        assert_eq!(body["binary"], "1010101111001101");
        assert_eq!(body["hex"], "0xabcd");
    }

    #[test]
    fn timings_compute_average() {
        let mut stats = ResponseTimeStats::default();
        stats.record(100);
        stats.record(300);
        let body = format_timings(&stats, fixed_now());
        assert_eq!(body["num_timings_recorded"], 2);
        assert_eq!(body["avg_response_time"], 200.0);
        assert_eq!(body["min_response_time"], 100);
        assert_eq!(body["max_response_time"], 300);
    }

    #[test]
    fn merge_combines_across_register_maps() {
        let mut a = ResponseTimeStats::default();
        a.record(100);
        a.record(200);
        let mut b = ResponseTimeStats::default();
        b.record(50);
        a.merge(&b);
        assert_eq!(a.count, 3);
        assert_eq!(a.min_us, 50);
        assert_eq!(a.max_us, 200);
        assert_eq!(a.avg_us(), 350.0 / 3.0);
    }

    #[test]
    fn merge_with_empty_other_is_noop() {
        let mut a = ResponseTimeStats::default();
        a.record(10);
        let empty = ResponseTimeStats::default();
        a.merge(&empty);
        assert_eq!(a.count, 1);
        assert_eq!(a.min_us, 10);
    }
}
