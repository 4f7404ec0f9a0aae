// config/expand.rs
//
// Renders a validated `Config` back into canonical JSON for the `-e` CLI
// flag: every default filled in, every offset still in user-facing (not
// off_by_one-adjusted) form, every decode's derived `start_offset`/
// `num_registers` visible. This is the "expand" counterpart to `loader`,
// used to sanity-check a config before pointing a real connection at it.

use serde_json::{json, Value};

use crate::decode::{BitStrings, DecodeSpec};

use super::{ComponentCfg, Config, ConnectionCfg, HeartbeatCfg, Parity, RegisterMapCfg, Transport};

pub fn expand(cfg: &Config) -> Value {
    json!({
        "connection": expand_connection(&cfg.connection),
        "components": cfg.components.iter().map(expand_component).collect::<Vec<_>>(),
    })
}

fn expand_connection(conn: &ConnectionCfg) -> Value {
    let mut obj = match &conn.transport {
        Transport::Tcp { ip, port } => json!({ "ip": ip, "port": port }),
        Transport::Rtu { device, baud, parity, data_bits, stop_bits } => json!({
            "device": device,
            "baud": baud,
            "parity": match parity {
                Parity::None => "N",
                Parity::Even => "E",
                Parity::Odd => "O",
            },
            "data_bits": data_bits,
            "stop_bits": stop_bits,
        }),
    };
    let map = obj.as_object_mut().expect("constructed as object above");
    map.insert("max_num_conns".to_string(), json!(conn.max_num_conns));
    map.insert("off_by_one".to_string(), json!(conn.off_by_one));
    map.insert("word_swap".to_string(), json!(conn.word_swap));
    map.insert("multi_write_op_code".to_string(), json!(conn.multi_write_op_code));
    map.insert("frequency_ms".to_string(), json!(conn.frequency_ms));
    map.insert("device_id".to_string(), json!(conn.device_id));
    map.insert("debounce_ms".to_string(), json!(conn.debounce_ms));
    obj
}

fn expand_component(comp: &ComponentCfg) -> Value {
    let mut obj = json!({
        "id": comp.id,
        "device_id": comp.device_id,
        "frequency_ms": comp.frequency_ms,
        "register_maps": comp.register_maps.iter().map(expand_register_map).collect::<Vec<_>>(),
    });
    if let Some(hb) = &comp.heartbeat {
        obj.as_object_mut()
            .expect("constructed as object above")
            .insert("heartbeat".to_string(), expand_heartbeat(hb));
    }
    obj
}

fn expand_heartbeat(hb: &HeartbeatCfg) -> Value {
    json!({
        "enabled": hb.enabled,
        "read_decode_id": hb.read_decode_id,
        "write_decode_id": hb.write_decode_id,
        "timeout_ms": hb.timeout_ms,
    })
}

fn expand_register_map(map: &RegisterMapCfg) -> Value {
    json!({
        "reg_type": map.reg_type.as_str(),
        "start_offset": map.start_offset,
        "num_registers": map.num_registers,
        "decodes": map.decodes.iter().map(expand_decode).collect::<Vec<_>>(),
    })
}

fn expand_decode(decode: &DecodeSpec) -> Value {
    let mut obj = json!({
        "id": decode.id,
        "offset": decode.offset,
        "size": decode.size,
        "scale": decode.scale,
        "shift": decode.shift,
        "invert_mask": decode.invert_mask,
        "care_mask": decode.care_mask,
        "starting_bit_pos": decode.starting_bit_pos,
        "number_of_bits": decode.number_of_bits,
        "signed": decode.signed,
        "float": decode.float,
        "debounce_ms": decode.debounce_ms,
    });
    let map = obj.as_object_mut().expect("constructed as object above");
    match &decode.bit_strings {
        None => {}
        Some(BitStrings::BitField(ranges)) => {
            map.insert("bit_field".to_string(), json!(true));
            map.insert(
                "bit_strings".to_string(),
                json!(ranges
                    .iter()
                    .map(|r| json!({
                        "begin_bit": r.begin_bit,
                        "end_bit": r.end_bit,
                        "string": r.label,
                    }))
                    .collect::<Vec<_>>()),
            );
        }
        Some(BitStrings::IndividualBits(bits)) => {
            map.insert("individual_bits".to_string(), json!(true));
            map.insert(
                "bit_strings".to_string(),
                json!(bits.iter().map(|b| json!(b.label)).collect::<Vec<_>>()),
            );
        }
        Some(BitStrings::Enum(labels)) => {
            map.insert("enum".to_string(), json!(true));
            map.insert(
                "bit_strings".to_string(),
                json!(labels
                    .iter()
                    .map(|l| json!({ "value": l.value, "string": l.label }))
                    .collect::<Vec<_>>()),
            );
        }
    }
    obj
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::loader::load_str;

    #[test]
    fn round_trips_through_loader() {
        let text = r#"{
            "connection": { "ip": "10.0.0.1", "port": 502, "max_num_conns": 2 },
            "components": [ {
                "id": "bms", "frequency_ms": 500,
                "register_maps": [ { "reg_type": "holding", "decodes": [
                    { "id": "soc", "offset": 100, "size": 2, "signed": true, "scale": 0.1 }
                ] } ]
            } ]
        }"#;
        let (cfg, _) = load_str(text).expect("loads");
        let expanded = expand(&cfg);
        assert_eq!(expanded["connection"]["ip"], "10.0.0.1");
        assert_eq!(expanded["components"][0]["register_maps"][0]["start_offset"], 100);
        assert_eq!(expanded["components"][0]["register_maps"][0]["decodes"][0]["id"], "soc");
    }
}
