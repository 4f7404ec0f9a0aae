// config/loader.rs
//
// JSON -> validated `Config` model, plus every validation rule from §3 and
// the boundary behaviors from §8. Every failure here is fatal at load
// time and carries a structured `ErrorLocation` (§7), mirroring
// `client_config_loader.hpp` / `decode_config_loader.hpp`.

use std::collections::{HashMap, HashSet};

use serde::Deserialize;
use serde_json::Value;

use crate::decode::{BitRange, BitStrings, DecodeSpec, EnumLabel, IndividualBit, RegKind};
use crate::error::{ConfigError, ErrorLocation, RequiredType};

use super::{
    ComponentCfg, Config, ConnectionCfg, HeartbeatCfg, Parity, RegisterMapCfg, Transport,
    FORBIDDEN_ID_CHARS, MAX_ID_LEN, MAX_REGISTERS_PER_MAP,
};

fn err(loc: ErrorLocation) -> ConfigError {
    ConfigError(loc)
}

#[derive(Deserialize)]
struct RawRoot {
    connection: RawConnection,
    components: Vec<RawComponent>,
}

#[derive(Deserialize, Default)]
struct RawConnection {
    ip: Option<String>,
    port: Option<u16>,
    device: Option<String>,
    baud: Option<u32>,
    parity: Option<String>,
    data_bits: Option<u8>,
    stop_bits: Option<u8>,
    max_num_conns: Option<u8>,
    #[serde(default)]
    off_by_one: bool,
    #[serde(default)]
    word_swap: bool,
    #[serde(default)]
    multi_write_op_code: bool,
    frequency_ms: Option<u64>,
    device_id: Option<u8>,
    #[serde(default)]
    debounce_ms: u64,
}

#[derive(Deserialize, Default)]
struct RawHeartbeat {
    #[serde(default)]
    enabled: bool,
    read_decode_id: Option<String>,
    write_decode_id: Option<String>,
    timeout_ms: Option<u64>,
}

#[derive(Deserialize)]
struct RawComponent {
    id: String,
    device_id: Option<u8>,
    frequency_ms: Option<u64>,
    heartbeat: Option<RawHeartbeat>,
    #[serde(default)]
    register_maps: Vec<RawRegisterMap>,
}

#[derive(Deserialize)]
struct RawRegisterMap {
    reg_type: String,
    #[serde(default)]
    decodes: Vec<RawDecode>,
}

#[derive(Deserialize)]
struct RawDecode {
    id: Option<String>,
    offset: u32,
    size: Option<u8>,
    #[serde(default)]
    scale: f64,
    #[serde(default)]
    shift: i64,
    #[serde(default)]
    invert_mask: u64,
    care_mask: Option<u64>,
    #[serde(default)]
    starting_bit_pos: u8,
    number_of_bits: Option<u8>,
    #[serde(default)]
    signed: bool,
    #[serde(default)]
    float: bool,
    #[serde(default)]
    bit_field: bool,
    #[serde(default)]
    individual_bits: bool,
    #[serde(default, rename = "enum")]
    is_enum: bool,
    #[serde(default)]
    individual_enums: bool,
    #[serde(default)]
    enum_field: bool,
    bit_strings: Option<Value>,
    debounce_ms: Option<u64>,
}

/// Load and validate a config from its JSON text. Returns the model plus
/// any non-fatal warning events (e.g. a heartbeat timeout under 2x
/// frequency) for the caller to post to `/events`.
pub fn load_str(text: &str) -> Result<(Config, Vec<String>), ConfigError> {
    let raw: RawRoot = serde_json::from_str(text)
        .map_err(|e| err(ErrorLocation::new(format!("failed to parse config JSON: {}", e))))?;

    let mut warnings = Vec::new();
    let connection = load_connection(&raw.connection)?;

    let mut components = Vec::with_capacity(raw.components.len());
    for (idx, raw_comp) in raw.components.iter().enumerate() {
        components.push(load_component(idx, raw_comp, &connection, &mut warnings)?);
    }

    let mut seen_ids = HashSet::new();
    for (idx, comp) in components.iter().enumerate() {
        if !seen_ids.insert(comp.id.clone()) {
            return Err(err(ErrorLocation::new(format!(
                "duplicate component id \"{}\"",
                comp.id
            ))
            .with_component(idx, comp.id.clone())));
        }
    }

    Ok((
        Config {
            connection,
            components,
        },
        warnings,
    ))
}

pub fn load_file(path: &std::path::Path) -> Result<(Config, Vec<String>), ConfigError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| err(ErrorLocation::new(format!("failed to read {}: {}", path.display(), e))))?;
    load_str(&text)
}

/// Fetch config JSON via a blocking GET with a 5 second timeout (§6 `-u`).
pub fn load_uri(uri: &str) -> Result<(Config, Vec<String>), ConfigError> {
    let client = reqwest::blocking::Client::builder()
        .timeout(std::time::Duration::from_secs(5))
        .build()
        .map_err(|e| err(ErrorLocation::new(format!("failed to build http client: {}", e))))?;
    let text = client
        .get(uri)
        .send()
        .and_then(|r| r.error_for_status())
        .and_then(|r| r.text())
        .map_err(|e| err(ErrorLocation::new(format!("failed to fetch config from {}: {}", uri, e))))?;
    load_str(&text)
}

fn load_connection(raw: &RawConnection) -> Result<ConnectionCfg, ConfigError> {
    let is_tcp = raw.ip.is_some() || raw.port.is_some();
    let is_rtu = raw.device.is_some()
        || raw.baud.is_some()
        || raw.parity.is_some()
        || raw.data_bits.is_some()
        || raw.stop_bits.is_some();

    let transport = match (is_tcp, is_rtu) {
        (true, false) => {
            let ip = raw.ip.clone().ok_or_else(|| {
                err(ErrorLocation::new("TCP connection missing \"ip\"").with_key("ip", RequiredType::String))
            })?;
            let port = raw.port.ok_or_else(|| {
                err(ErrorLocation::new("TCP connection missing \"port\"").with_key("port", RequiredType::Uint))
            })?;
            Transport::Tcp { ip, port }
        }
        (false, true) => {
            let device = raw.device.clone().ok_or_else(|| {
                err(ErrorLocation::new("RTU connection missing \"device\"")
                    .with_key("device", RequiredType::String))
            })?;
            let baud = raw.baud.ok_or_else(|| {
                err(ErrorLocation::new("RTU connection missing \"baud\"").with_key("baud", RequiredType::Uint))
            })?;
            if baud == 0 {
                return Err(err(ErrorLocation::new("\"baud\" must be nonzero")
                    .with_key("baud", RequiredType::Uint)));
            }
            let parity_str = raw.parity.clone().unwrap_or_else(|| "N".to_string());
            let parity = match parity_str.as_str() {
                "N" => Parity::None,
                "E" => Parity::Even,
                "O" => Parity::Odd,
                other => {
                    return Err(err(ErrorLocation::new(format!(
                        "\"parity\" must be one of N, E, O (got \"{}\")",
                        other
                    ))
                    .with_key("parity", RequiredType::String)))
                }
            };
            let data_bits = raw.data_bits.unwrap_or(8);
            if !(5..=8).contains(&data_bits) {
                return Err(err(ErrorLocation::new(format!(
                    "\"data_bits\" must be in [5,8] (got {})",
                    data_bits
                ))
                .with_key("data_bits", RequiredType::Uint)));
            }
            let stop_bits = raw.stop_bits.unwrap_or(1);
            if stop_bits != 1 && stop_bits != 2 {
                return Err(err(ErrorLocation::new(format!(
                    "\"stop_bits\" must be 1 or 2 (got {})",
                    stop_bits
                ))
                .with_key("stop_bits", RequiredType::Uint)));
            }
            Transport::Rtu {
                device,
                baud,
                parity,
                data_bits,
                stop_bits,
            }
        }
        (true, true) => {
            return Err(err(ErrorLocation::new(
                "connection cannot specify both TCP and RTU fields",
            )))
        }
        (false, false) => {
            return Err(err(ErrorLocation::new(
                "connection must specify either TCP ({ip, port}) or RTU ({device, baud, ...}) fields",
            )))
        }
    };

    let max_num_conns = raw.max_num_conns.ok_or_else(|| {
        err(ErrorLocation::new("connection missing \"max_num_conns\"")
            .with_key("max_num_conns", RequiredType::Uint))
    })?;
    if max_num_conns == 0 {
        return Err(err(ErrorLocation::new("\"max_num_conns\" must be in [1,255]")
            .with_key("max_num_conns", RequiredType::Uint)));
    }

    let frequency_ms = raw.frequency_ms.unwrap_or(1000);
    if frequency_ms == 0 {
        return Err(err(ErrorLocation::new("\"frequency_ms\" must be > 0")
            .with_key("frequency_ms", RequiredType::Uint)));
    }

    Ok(ConnectionCfg {
        transport,
        max_num_conns,
        off_by_one: raw.off_by_one,
        word_swap: raw.word_swap,
        multi_write_op_code: raw.multi_write_op_code,
        frequency_ms,
        device_id: raw.device_id.unwrap_or(0),
        debounce_ms: raw.debounce_ms,
    })
}

fn check_id(
    s: &str,
    loc: ErrorLocation,
) -> Result<(), ConfigError> {
    if s.is_empty() {
        return Err(err(ErrorLocation { message: "id is empty".to_string(), ..loc }));
    }
    if s.chars().any(|c| FORBIDDEN_ID_CHARS.contains(c)) {
        return Err(err(ErrorLocation {
            message: format!(
                "id \"{}\" contains one of the forbidden characters: {}",
                s, FORBIDDEN_ID_CHARS
            ),
            ..loc
        }));
    }
    if s.len() > MAX_ID_LEN {
        return Err(err(ErrorLocation {
            message: format!("id \"{}\" exceeds the maximum length of {}", s, MAX_ID_LEN),
            ..loc
        }));
    }
    Ok(())
}

fn load_component(
    idx: usize,
    raw: &RawComponent,
    connection: &ConnectionCfg,
    warnings: &mut Vec<String>,
) -> Result<ComponentCfg, ConfigError> {
    check_id(
        &raw.id,
        ErrorLocation::new("").with_component(idx, raw.id.clone()),
    )?;

    let device_id = raw.device_id.unwrap_or(connection.device_id);
    let frequency_ms = raw.frequency_ms.unwrap_or(connection.frequency_ms);
    if frequency_ms == 0 {
        return Err(err(ErrorLocation::new("\"frequency_ms\" must be > 0")
            .with_component(idx, raw.id.clone())
            .with_key("frequency_ms", RequiredType::Uint)));
    }

    let heartbeat = match &raw.heartbeat {
        Some(hb) if hb.enabled => {
            let read_decode_id = hb.read_decode_id.clone().ok_or_else(|| {
                err(ErrorLocation::new("heartbeat enabled but \"read_decode_id\" missing")
                    .with_component(idx, raw.id.clone())
                    .with_key("read_decode_id", RequiredType::String))
            })?;
            let timeout_ms = hb.timeout_ms.ok_or_else(|| {
                err(ErrorLocation::new("heartbeat enabled but \"timeout_ms\" missing")
                    .with_component(idx, raw.id.clone())
                    .with_key("timeout_ms", RequiredType::Uint))
            })?;
            if timeout_ms < frequency_ms {
                return Err(err(ErrorLocation::new(format!(
                    "heartbeat \"timeout_ms\" ({}) must be >= \"frequency_ms\" ({})",
                    timeout_ms, frequency_ms
                ))
                .with_component(idx, raw.id.clone())));
            }
            if timeout_ms < frequency_ms * 2 {
                warnings.push(format!(
                    "component \"{}\": \"modbus_heartbeat_timeout_ms\" (currently: {}) is less than 2x frequency. This could cause false timeout issues, consider changing it.",
                    raw.id, timeout_ms
                ));
            }
            Some(HeartbeatCfg {
                enabled: true,
                read_decode_id,
                write_decode_id: hb.write_decode_id.clone(),
                timeout_ms,
            })
        }
        _ => None,
    };

    let mut register_maps = Vec::with_capacity(raw.register_maps.len());
    let mut leaf_names: HashSet<String> = HashSet::new();
    for (map_idx, raw_map) in raw.register_maps.iter().enumerate() {
        register_maps.push(load_register_map(
            idx,
            &raw.id,
            map_idx,
            raw_map,
            connection,
            &mut leaf_names,
        )?);
    }

    Ok(ComponentCfg {
        id: raw.id.clone(),
        device_id,
        frequency_ms,
        heartbeat,
        register_maps,
    })
}

fn parse_reg_type(
    s: &str,
    idx: usize,
    comp_id: &str,
    map_idx: usize,
) -> Result<RegKind, ConfigError> {
    match s {
        "holding" => Ok(RegKind::Holding),
        "input" => Ok(RegKind::Input),
        "coil" => Ok(RegKind::Coil),
        "discrete_input" => Ok(RegKind::DiscreteInput),
        other => Err(err(ErrorLocation::new(format!(
            "unknown \"reg_type\" \"{}\" (expected holding, input, coil, discrete_input)",
            other
        ))
        .with_component(idx, comp_id)
        .with_register(map_idx, other))),
    }
}

fn load_register_map(
    comp_idx: usize,
    comp_id: &str,
    map_idx: usize,
    raw: &RawRegisterMap,
    connection: &ConnectionCfg,
    leaf_names: &mut HashSet<String>,
) -> Result<RegisterMapCfg, ConfigError> {
    let reg_type = parse_reg_type(&raw.reg_type, comp_idx, comp_id, map_idx)?;

    let mut decodes = Vec::with_capacity(raw.decodes.len());
    for (decode_idx, raw_decode) in raw.decodes.iter().enumerate() {
        decodes.push(load_decode(
            comp_idx,
            comp_id,
            map_idx,
            &raw.reg_type,
            decode_idx,
            raw_decode,
            reg_type,
            connection,
            leaf_names,
        )?);
    }

    if decodes.is_empty() {
        return Err(err(ErrorLocation::new("register map has no decode entries")
            .with_component(comp_idx, comp_id)
            .with_register(map_idx, raw.reg_type.clone())));
    }

    decodes.sort_by_key(|d| d.offset);

    for i in 1..decodes.len() {
        let prev_end = decodes[i - 1].offset as u32 + decodes[i - 1].size as u32;
        if (decodes[i].offset as u32) < prev_end {
            return Err(err(ErrorLocation::new(format!(
                "decode \"{}\" (offset {}) overlaps the previous decode \"{}\" (offset {}, size {})",
                decodes[i].id, decodes[i].offset, decodes[i - 1].id, decodes[i - 1].offset, decodes[i - 1].size
            ))
            .with_component(comp_idx, comp_id)
            .with_register(map_idx, raw.reg_type.clone())
            .with_decode(i, decodes[i].id.clone())));
        }
    }

    let first = &decodes[0];
    let last = &decodes[decodes.len() - 1];
    let start_offset = first.offset;
    let num_registers = (last.offset as u32 + last.size as u32) - first.offset as u32;
    if num_registers > MAX_REGISTERS_PER_MAP as u32 {
        return Err(err(ErrorLocation::new(format!(
            "register map spans {} registers, exceeding the Modbus maximum of {}",
            num_registers, MAX_REGISTERS_PER_MAP
        ))
        .with_component(comp_idx, comp_id)
        .with_register(map_idx, raw.reg_type.clone())));
    }

    Ok(RegisterMapCfg {
        reg_type,
        decodes,
        start_offset,
        num_registers: num_registers as u16,
    })
}

#[allow(clippy::too_many_arguments)]
fn load_decode(
    comp_idx: usize,
    comp_id: &str,
    map_idx: usize,
    reg_type_name: &str,
    decode_idx: usize,
    raw: &RawDecode,
    reg_type: RegKind,
    connection: &ConnectionCfg,
    leaf_names: &mut HashSet<String>,
) -> Result<DecodeSpec, ConfigError> {
    let loc = || {
        ErrorLocation::new("")
            .with_component(comp_idx, comp_id)
            .with_register(map_idx, reg_type_name)
            .with_decode(decode_idx, raw.id.clone().unwrap_or_default())
    };

    if raw.individual_enums || raw.enum_field {
        return Err(err(ErrorLocation {
            message: "\"individual_enums\"/\"enum_field\" are not implemented".to_string(),
            ..loc()
        }));
    }

    let exclusive_count =
        [raw.bit_field, raw.individual_bits, raw.is_enum].iter().filter(|b| **b).count();
    if exclusive_count > 1 {
        return Err(err(ErrorLocation {
            message: "at most one of bit_field, individual_bits, enum may be set".to_string(),
            ..loc()
        }));
    }
    if raw.signed && raw.float {
        return Err(err(ErrorLocation {
            message: "signed and float are mutually exclusive".to_string(),
            ..loc()
        }));
    }
    let is_bit_string = exclusive_count == 1;
    if is_bit_string && (raw.signed || raw.float || raw.scale != 0.0 || raw.shift != 0) {
        return Err(err(ErrorLocation {
            message: "bit-string decodes forbid signed, float, scale, and shift".to_string(),
            ..loc()
        }));
    }

    let size: u8 = match reg_type {
        RegKind::Holding | RegKind::Input => {
            let size = raw.size.unwrap_or(1);
            if ![1u8, 2, 4].contains(&size) {
                return Err(err(ErrorLocation {
                    message: format!("\"size\" must be 1, 2, or 4 for Holding/Input (got {})", size),
                    ..loc()
                }));
            }
            size
        }
        RegKind::Coil | RegKind::DiscreteInput => {
            if let Some(size) = raw.size {
                if size != 1 {
                    return Err(err(ErrorLocation {
                        message: format!("\"size\" must be 1 for Coil/DiscreteInput (got {})", size),
                        ..loc()
                    }));
                }
            }
            1
        }
    };

    if raw.float && (size == 1 || raw.starting_bit_pos != 0) {
        return Err(err(ErrorLocation {
            message: "float requires size in {2,4} and starting_bit_pos 0".to_string(),
            ..loc()
        }));
    }

    if raw.offset > 65535 {
        return Err(err(ErrorLocation {
            message: format!("\"offset\" must be <= 65535 (got {})", raw.offset),
            ..loc()
        }));
    }

    let effective_offset: u32 = if connection.off_by_one {
        if raw.offset == 0 {
            return Err(err(ErrorLocation {
                message: "\"offset\" is 0 but off_by_one is set; would underflow".to_string(),
                ..loc()
            }));
        }
        raw.offset - 1
    } else {
        raw.offset
    };

    if effective_offset + size as u32 > 65536 {
        return Err(err(ErrorLocation {
            message: format!(
                "decode spans registers [{}, {}), exceeding the address space",
                effective_offset,
                effective_offset + size as u32
            ),
            ..loc()
        }));
    }

    // Coil/DiscreteInput registers are already single bits; only
    // Holding/Input words have 16 bits apiece to subdivide.
    let bit_width = if reg_type.is_register() { size as u32 * 16 } else { 1 };
    let full_mask: u64 = if bit_width >= 64 { u64::MAX } else { (1u64 << bit_width) - 1 };
    let care_mask = raw.care_mask.unwrap_or(full_mask);
    let number_of_bits = raw
        .number_of_bits
        .unwrap_or((bit_width - raw.starting_bit_pos as u32) as u8);
    if raw.starting_bit_pos as u32 + number_of_bits as u32 > bit_width {
        return Err(err(ErrorLocation {
            message: format!(
                "starting_bit_pos ({}) + number_of_bits ({}) exceeds the decode width ({} bits)",
                raw.starting_bit_pos, number_of_bits, bit_width
            ),
            ..loc()
        }));
    }

    let bit_strings = if raw.bit_field {
        Some(BitStrings::BitField(load_bit_field(
            raw, number_of_bits, &loc,
        )?))
    } else if raw.individual_bits {
        Some(BitStrings::IndividualBits(load_individual_bits(
            raw,
            raw.starting_bit_pos,
            number_of_bits,
            comp_idx,
            comp_id,
            leaf_names,
            &loc,
        )?))
    } else if raw.is_enum {
        Some(BitStrings::Enum(load_enum(raw, bit_width, &loc)?))
    } else {
        None
    };

    let id = if bit_strings
        .as_ref()
        .map(|b| b.is_individual_bits())
        .unwrap_or(false)
    {
        raw.id.clone().unwrap_or_default()
    } else {
        let id = raw.id.clone().ok_or_else(|| {
            err(ErrorLocation {
                message: "decode entry missing \"id\"".to_string(),
                ..loc()
            })
        })?;
        check_id(&id, loc())?;
        if !leaf_names.insert(id.clone()) {
            return Err(err(ErrorLocation {
                message: format!("duplicate decode id/bit label \"{}\" within component", id),
                ..loc()
            }));
        }
        let uri = format!("/components/{}/{}", comp_id, id);
        if uri.len() > MAX_ID_LEN {
            return Err(err(ErrorLocation {
                message: format!("derived uri \"{}\" exceeds {} characters", uri, MAX_ID_LEN),
                ..loc()
            }));
        }
        id
    };

    Ok(DecodeSpec {
        id,
        offset: effective_offset as u16,
        size,
        scale: raw.scale,
        shift: raw.shift,
        invert_mask: raw.invert_mask,
        care_mask,
        starting_bit_pos: raw.starting_bit_pos,
        number_of_bits,
        signed: raw.signed,
        float: raw.float,
        bit_strings,
        debounce_ms: raw.debounce_ms.unwrap_or(connection.debounce_ms),
    })
}

fn load_bit_field(
    raw: &RawDecode,
    number_of_bits: u8,
    loc: &dyn Fn() -> ErrorLocation,
) -> Result<Vec<BitRange>, ConfigError> {
    let arr = raw
        .bit_strings
        .as_ref()
        .and_then(|v| v.as_array())
        .ok_or_else(|| {
            err(ErrorLocation {
                message: "bit_field requires a \"bit_strings\" array".to_string(),
                ..loc()
            })
        })?;

    let mut ranges = Vec::with_capacity(arr.len());
    let mut next_bit: u8 = 0;
    for (i, entry) in arr.iter().enumerate() {
        let entry_loc = || ErrorLocation { bit_strings_idx: i, ..loc() };
        if entry.is_null() {
            ranges.push(BitRange {
                begin_bit: next_bit,
                end_bit: next_bit,
                label: None,
            });
            next_bit += 1;
            continue;
        }
        let obj = entry.as_object().ok_or_else(|| {
            err(ErrorLocation { message: "bit_field entry must be an object or null".to_string(), ..entry_loc() })
        })?;
        let begin_bit = obj
            .get("begin_bit")
            .and_then(Value::as_u64)
            .unwrap_or(next_bit as u64) as u8;
        let end_bit = obj
            .get("end_bit")
            .and_then(Value::as_u64)
            .unwrap_or(begin_bit as u64) as u8;
        if begin_bit != next_bit {
            return Err(err(ErrorLocation {
                message: format!(
                    "bit_field ranges must be contiguous starting at 0 (expected begin_bit {}, got {})",
                    next_bit, begin_bit
                ),
                ..entry_loc()
            }));
        }
        if end_bit < begin_bit {
            return Err(err(ErrorLocation {
                message: "end_bit must be >= begin_bit".to_string(),
                ..entry_loc()
            }));
        }
        let label = obj.get("string").and_then(Value::as_str).map(str::to_string);
        next_bit = end_bit + 1;
        ranges.push(BitRange { begin_bit, end_bit, label });
    }

    if next_bit as u32 != number_of_bits as u32 && !ranges.is_empty() {
        return Err(err(ErrorLocation {
            message: format!(
                "bit_field ranges cover {} bits but number_of_bits is {}",
                next_bit, number_of_bits
            ),
            ..loc()
        }));
    }

    Ok(ranges)
}

fn load_individual_bits(
    raw: &RawDecode,
    starting_bit_pos: u8,
    number_of_bits: u8,
    comp_idx: usize,
    comp_id: &str,
    leaf_names: &mut HashSet<String>,
    loc: &dyn Fn() -> ErrorLocation,
) -> Result<Vec<IndividualBit>, ConfigError> {
    let arr = raw
        .bit_strings
        .as_ref()
        .and_then(|v| v.as_array())
        .ok_or_else(|| {
            err(ErrorLocation {
                message: "individual_bits requires a \"bit_strings\" array".to_string(),
                ..loc()
            })
        })?;
    if arr.len() != number_of_bits as usize {
        return Err(err(ErrorLocation {
            message: format!(
                "individual_bits \"bit_strings\" has {} entries but number_of_bits is {}",
                arr.len(),
                number_of_bits
            ),
            ..loc()
        }));
    }

    let mut bits = Vec::with_capacity(arr.len());
    for (i, entry) in arr.iter().enumerate() {
        let entry_loc = || ErrorLocation { bit_strings_idx: i, ..loc() };
        let label = match entry {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            _ => {
                return Err(err(ErrorLocation {
                    message: "individual_bits entries must be a string label or null".to_string(),
                    ..entry_loc()
                }))
            }
        };
        let bit = starting_bit_pos + i as u8;
        if let Some(label) = &label {
            check_id(
                label,
                ErrorLocation { component_idx: comp_idx, component_id: comp_id.to_string(), ..entry_loc() },
            )?;
            if !leaf_names.insert(label.clone()) {
                return Err(err(ErrorLocation {
                    message: format!("duplicate decode id/bit label \"{}\" within component", label),
                    ..entry_loc()
                }));
            }
            let uri = format!("/components/{}/{}", comp_id, label);
            if uri.len() > MAX_ID_LEN {
                return Err(err(ErrorLocation {
                    message: format!("derived uri \"{}\" exceeds {} characters", uri, MAX_ID_LEN),
                    ..entry_loc()
                }));
            }
        }
        bits.push(IndividualBit { bit, label });
    }
    Ok(bits)
}

fn load_enum(
    raw: &RawDecode,
    bit_width: u32,
    loc: &dyn Fn() -> ErrorLocation,
) -> Result<Vec<EnumLabel>, ConfigError> {
    let arr = raw
        .bit_strings
        .as_ref()
        .and_then(|v| v.as_array())
        .ok_or_else(|| {
            err(ErrorLocation {
                message: "enum requires a \"bit_strings\" array".to_string(),
                ..loc()
            })
        })?;

    let max_value: u128 = if bit_width >= 128 { u128::MAX } else { (1u128 << bit_width) - 1 };
    let mut labels = Vec::with_capacity(arr.len());
    let mut seen: HashMap<u64, ()> = HashMap::new();
    for (i, entry) in arr.iter().enumerate() {
        let entry_loc = || ErrorLocation { bit_strings_idx: i, ..loc() };
        let obj = entry.as_object().ok_or_else(|| {
            err(ErrorLocation { message: "enum entry must be an object".to_string(), ..entry_loc() })
        })?;
        let value = obj
            .get("value")
            .and_then(Value::as_u64)
            .ok_or_else(|| err(ErrorLocation { message: "enum entry missing numeric \"value\"".to_string(), ..entry_loc() }))?;
        if value as u128 > max_value {
            return Err(err(ErrorLocation {
                message: format!("enum value {} exceeds the decode's {}-bit range", value, bit_width),
                ..entry_loc()
            }));
        }
        let label = obj
            .get("string")
            .and_then(Value::as_str)
            .ok_or_else(|| err(ErrorLocation { message: "enum entry missing \"string\"".to_string(), ..entry_loc() }))?
            .to_string();
        if seen.insert(value, ()).is_some() {
            return Err(err(ErrorLocation {
                message: format!("duplicate enum value {}", value),
                ..entry_loc()
            }));
        }
        labels.push(EnumLabel { value, label });
    }
    labels.sort_by_key(|l| l.value);
    Ok(labels)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_conn() -> &'static str {
        r#""connection": { "ip": "10.0.0.1", "port": 502, "max_num_conns": 4 }"#
    }

    #[test]
    fn loads_scenario_1_component() {
        let text = format!(
            r#"{{ {}, "components": [ {{
                "id": "bms", "frequency_ms": 500,
                "register_maps": [ {{ "reg_type": "holding", "decodes": [
                    {{ "id": "soc", "offset": 100, "size": 2, "signed": true, "scale": 0.1 }}
                ] }} ]
            }} ] }}"#,
            base_conn()
        );
        let (cfg, warnings) = load_str(&text).expect("should load");
        assert!(warnings.is_empty());
        assert_eq!(cfg.components.len(), 1);
        let map = &cfg.components[0].register_maps[0];
        assert_eq!(map.start_offset, 100);
        assert_eq!(map.num_registers, 2);
    }

    #[test]
    fn rejects_offset_zero_with_off_by_one() {
        let text = format!(
            r#"{{ "connection": {{ "ip":"10.0.0.1","port":502,"max_num_conns":1,"off_by_one":true }}, "components": [ {{
                "id":"c", "frequency_ms": 100,
                "register_maps": [ {{ "reg_type":"holding", "decodes": [
                    {{ "id":"x", "offset":0, "size":1 }}
                ] }} ]
            }} ] }}"#
        );
        let result = load_str(&text);
        assert!(result.is_err());
    }

    #[test]
    fn accepts_offset_plus_size_at_65536_boundary() {
        let text = format!(
            r#"{{ {}, "components": [ {{
                "id":"c", "frequency_ms": 100,
                "register_maps": [ {{ "reg_type":"holding", "decodes": [
                    {{ "id":"x", "offset":65535, "size":1 }}
                ] }} ]
            }} ] }}"#,
            base_conn()
        );
        assert!(load_str(&text).is_ok());
    }

    #[test]
    fn rejects_oversized_batch() {
        let decodes: Vec<String> = (0..130)
            .map(|i| format!(r#"{{ "id":"d{}", "offset":{}, "size":1 }}"#, i, i))
            .collect();
        let text = format!(
            r#"{{ {}, "components": [ {{
                "id":"c", "frequency_ms": 100,
                "register_maps": [ {{ "reg_type":"holding", "decodes": [ {} ] }} ]
            }} ] }}"#,
            base_conn(),
            decodes.join(",")
        );
        assert!(load_str(&text).is_err());
    }

    #[test]
    fn individual_bits_scenario_3() {
        let text = format!(
            r#"{{ {}, "components": [ {{
                "id":"bms", "frequency_ms": 500,
                "register_maps": [ {{ "reg_type":"holding", "decodes": [
                    {{ "offset":10, "size":1, "individual_bits": true, "bit_strings": ["alarm_a","alarm_b",null,"alarm_d"] }}
                ] }} ]
            }} ] }}"#,
            base_conn()
        );
        let (cfg, _) = load_str(&text).expect("should load");
        let decode = &cfg.components[0].register_maps[0].decodes[0];
        match decode.bit_strings.as_ref().unwrap() {
            BitStrings::IndividualBits(bits) => {
                assert_eq!(bits.len(), 4);
                assert_eq!(bits[2].label, None);
                assert_eq!(bits[3].label.as_deref(), Some("alarm_d"));
            }
            other => panic!("expected individual_bits, got {:?}", other),
        }
    }

    #[test]
    fn heartbeat_timeout_below_frequency_is_fatal() {
        let text = format!(
            r#"{{ {}, "components": [ {{
                "id":"c", "frequency_ms": 500,
                "heartbeat": {{ "enabled": true, "read_decode_id": "hb", "timeout_ms": 100 }},
                "register_maps": [ {{ "reg_type":"holding", "decodes": [
                    {{ "id":"hb", "offset":0, "size":1 }}
                ] }} ]
            }} ] }}"#,
            base_conn()
        );
        assert!(load_str(&text).is_err());
    }

    #[test]
    fn heartbeat_timeout_below_2x_frequency_warns_not_fatal() {
        let text = format!(
            r#"{{ {}, "components": [ {{
                "id":"c", "frequency_ms": 500,
                "heartbeat": {{ "enabled": true, "read_decode_id": "hb", "timeout_ms": 600 }},
                "register_maps": [ {{ "reg_type":"holding", "decodes": [
                    {{ "id":"hb", "offset":0, "size":1 }}
                ] }} ]
            }} ] }}"#,
            base_conn()
        );
        let (_, warnings) = load_str(&text).expect("should load with warning");
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn rejects_bad_baud_stop_bits_data_bits() {
        let bad = [
            r#"{ "device":"/dev/ttyUSB0", "baud":0, "max_num_conns":1 }"#,
            r#"{ "device":"/dev/ttyUSB0", "baud":9600, "stop_bits":3, "max_num_conns":1 }"#,
            r#"{ "device":"/dev/ttyUSB0", "baud":9600, "data_bits":9, "max_num_conns":1 }"#,
        ];
        for conn in bad {
            let text = format!(
                r#"{{ "connection": {}, "components": [] }}"#,
                conn
            );
            assert!(load_str(&text).is_err(), "expected rejection for {}", conn);
        }
    }
}
