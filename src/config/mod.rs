// config/mod.rs
//
// The parsed, validated config tree (§3). Produced once at startup (or
// reload) by `loader::load`, immutable thereafter. This is the "Config
// Model" layer in the system overview (§2 item 3) — plain owned data, no
// arena handles yet. `crate::workspace` turns one of these into the
// runtime arena + decoded caches + router.

pub mod expand;
pub mod loader;

use crate::decode::DecodeSpec;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Parity {
    None,
    Even,
    Odd,
}

#[derive(Clone, Debug)]
pub enum Transport {
    Tcp {
        ip: String,
        port: u16,
    },
    Rtu {
        device: String,
        baud: u32,
        parity: Parity,
        data_bits: u8,
        stop_bits: u8,
    },
}

#[derive(Clone, Debug)]
pub struct ConnectionCfg {
    pub transport: Transport,
    pub max_num_conns: u8,
    pub off_by_one: bool,
    pub word_swap: bool,
    pub multi_write_op_code: bool,
    pub frequency_ms: u64,
    pub device_id: u8,
    pub debounce_ms: u64,
}

#[derive(Clone, Debug)]
pub struct HeartbeatCfg {
    pub enabled: bool,
    pub read_decode_id: String,
    pub write_decode_id: Option<String>,
    pub timeout_ms: u64,
}

#[derive(Clone, Debug)]
pub struct RegisterMapCfg {
    pub reg_type: crate::decode::RegKind,
    pub decodes: Vec<DecodeSpec>,
    // derived at load time:
    pub start_offset: u16,
    pub num_registers: u16,
}

#[derive(Clone, Debug)]
pub struct ComponentCfg {
    pub id: String,
    pub device_id: u8,
    pub frequency_ms: u64,
    pub heartbeat: Option<HeartbeatCfg>,
    pub register_maps: Vec<RegisterMapCfg>,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub connection: ConnectionCfg,
    pub components: Vec<ComponentCfg>,
}

pub const FORBIDDEN_ID_CHARS: &str = "{}\\/ \"%";
pub const MAX_ID_LEN: usize = 255;
pub const MAX_REGISTERS_PER_MAP: u16 = 125;
