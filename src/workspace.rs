// workspace.rs
//
// Turns a validated `config::Config` into the runtime tree every other
// module indexes into: components/register maps/decodes addressed by
// plain `usize` indices (mirroring `Uri_Info`'s component/register/decode
// index triple in the original client), plus a `StringArena` holding every
// name the process will ever need to print (component ids, decode ids,
// bit-string labels) so hot paths never allocate a `String` just to build
// a key.
//
// Built once at startup (or reload) and handed out as a read-only `Arc`.

use crate::arena::{ArenaBuilder, StrHandle, StringArena};
use crate::config::{Config, ConnectionCfg, HeartbeatCfg, RegisterMapCfg};
use crate::decode::{BitStrings, DecodeSpec, RegKind};

pub struct DecodeRuntime {
    pub spec: DecodeSpec,
    pub id_handle: StrHandle,
    /// One handle per bit for `individual_bits` decodes, `None` for
    /// bits without a label, empty otherwise.
    pub bit_label_handles: Vec<Option<StrHandle>>,
}

pub struct RegisterMapRuntime {
    pub reg_type: RegKind,
    pub start_offset: u16,
    pub num_registers: u16,
    pub decodes: Vec<DecodeRuntime>,
}

pub struct HeartbeatRuntime {
    /// (register_map_idx, decode_idx) of the read-side decode.
    pub read_decode: (usize, usize),
    pub write_decode: Option<(usize, usize)>,
    pub timeout_ms: u64,
}

pub struct ComponentRuntime {
    pub id: String,
    pub id_handle: StrHandle,
    pub device_id: u8,
    pub frequency_ms: u64,
    pub heartbeat: Option<HeartbeatRuntime>,
    pub register_maps: Vec<RegisterMapRuntime>,
}

impl ComponentRuntime {
    pub fn find_decode_by_id(&self, id: &str) -> Option<(usize, usize)> {
        for (map_idx, map) in self.register_maps.iter().enumerate() {
            for (decode_idx, decode) in map.decodes.iter().enumerate() {
                if decode.spec.id == id {
                    return Some((map_idx, decode_idx));
                }
            }
        }
        None
    }
}

pub struct Workspace {
    pub arena: StringArena,
    pub connection: ConnectionCfg,
    pub components: Vec<ComponentRuntime>,
}

impl Workspace {
    pub fn build(cfg: Config) -> Workspace {
        let mut builder = ArenaBuilder::new();
        let mut components = Vec::with_capacity(cfg.components.len());

        for comp_cfg in &cfg.components {
            let id_handle = builder.intern(&comp_cfg.id);
            let mut register_maps = Vec::with_capacity(comp_cfg.register_maps.len());
            for map_cfg in &comp_cfg.register_maps {
                register_maps.push(build_register_map(&mut builder, map_cfg));
            }

            let heartbeat = comp_cfg.heartbeat.as_ref().and_then(|hb_cfg| {
                build_heartbeat(hb_cfg, &register_maps)
            });

            components.push(ComponentRuntime {
                id: comp_cfg.id.clone(),
                id_handle,
                device_id: comp_cfg.device_id,
                frequency_ms: comp_cfg.frequency_ms,
                heartbeat,
                register_maps,
            });
        }

        Workspace {
            arena: builder.finish(),
            connection: cfg.connection,
            components,
        }
    }

    pub fn find_component_by_id(&self, id: &str) -> Option<usize> {
        self.components.iter().position(|c| c.id == id)
    }

    /// Total number of register maps across every component, used to cap
    /// `max_num_conns` against the number of I/O workers that could ever
    /// be usefully busy at once.
    pub fn total_register_maps(&self) -> usize {
        self.components.iter().map(|c| c.register_maps.len()).sum()
    }

    pub fn effective_worker_count(&self) -> usize {
        let total = self.total_register_maps().max(1);
        (self.connection.max_num_conns as usize).min(total)
    }
}

fn build_register_map(builder: &mut ArenaBuilder, map_cfg: &RegisterMapCfg) -> RegisterMapRuntime {
    let decodes = map_cfg
        .decodes
        .iter()
        .map(|spec| build_decode(builder, spec))
        .collect();

    RegisterMapRuntime {
        reg_type: map_cfg.reg_type,
        start_offset: map_cfg.start_offset,
        num_registers: map_cfg.num_registers,
        decodes,
    }
}

fn build_decode(builder: &mut ArenaBuilder, spec: &DecodeSpec) -> DecodeRuntime {
    let id_handle = builder.intern(&spec.id);
    let bit_label_handles = match &spec.bit_strings {
        Some(BitStrings::IndividualBits(bits)) => bits
            .iter()
            .map(|b| b.label.as_deref().map(|l| builder.intern(l)))
            .collect(),
        _ => Vec::new(),
    };
    DecodeRuntime {
        spec: spec.clone(),
        id_handle,
        bit_label_handles,
    }
}

fn build_heartbeat(
    hb_cfg: &HeartbeatCfg,
    register_maps: &[RegisterMapRuntime],
) -> Option<HeartbeatRuntime> {
    let find = |id: &str| -> Option<(usize, usize)> {
        for (map_idx, map) in register_maps.iter().enumerate() {
            for (decode_idx, decode) in map.decodes.iter().enumerate() {
                if decode.spec.id == id {
                    return Some((map_idx, decode_idx));
                }
            }
        }
        None
    };

    let read_decode = find(&hb_cfg.read_decode_id)?;
    let write_decode = hb_cfg.write_decode_id.as_deref().and_then(find);

    Some(HeartbeatRuntime {
        read_decode,
        write_decode,
        timeout_ms: hb_cfg.timeout_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::loader::load_str;

    #[test]
    fn builds_runtime_tree_with_interned_ids() {
        let text = r#"{
            "connection": { "ip": "10.0.0.1", "port": 502, "max_num_conns": 3 },
            "components": [ {
                "id": "bms", "frequency_ms": 500,
                "register_maps": [ { "reg_type": "holding", "decodes": [
                    { "id": "soc", "offset": 100, "size": 1 }
                ] } ]
            }, {
                "id": "inverter", "frequency_ms": 1000,
                "register_maps": [ { "reg_type": "input", "decodes": [
                    { "id": "power", "offset": 0, "size": 2, "signed": true }
                ] } ]
            } ]
        }"#;
        let (cfg, _) = load_str(text).expect("loads");
        let ws = Workspace::build(cfg);
        assert_eq!(ws.components.len(), 2);
        assert_eq!(ws.arena.get(ws.components[0].id_handle), "bms");
        assert_eq!(ws.find_component_by_id("inverter"), Some(1));
        assert_eq!(ws.effective_worker_count(), 2);
    }

    #[test]
    fn heartbeat_resolves_decode_indices() {
        let text = r#"{
            "connection": { "ip": "10.0.0.1", "port": 502, "max_num_conns": 1 },
            "components": [ {
                "id": "bms", "frequency_ms": 500,
                "heartbeat": { "enabled": true, "read_decode_id": "hb", "write_decode_id": "hb_w", "timeout_ms": 2000 },
                "register_maps": [ { "reg_type": "holding", "decodes": [
                    { "id": "hb", "offset": 0, "size": 1 },
                    { "id": "hb_w", "offset": 1, "size": 1 }
                ] } ]
            } ]
        }"#;
        let (cfg, _) = load_str(text).expect("loads");
        let ws = Workspace::build(cfg);
        let hb = ws.components[0].heartbeat.as_ref().expect("heartbeat present");
        assert_eq!(hb.read_decode, (0, 0));
        assert_eq!(hb.write_decode, Some((0, 1)));
    }
}
