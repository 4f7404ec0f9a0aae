// modbus_io.rs
//
// The blocking Modbus transport itself. `tokio_modbus::sync` gives a
// blocking request function per register kind over either a TCP socket
// or a `serialport` RTU handle, so a worker thread here reads exactly
// like a single-threaded C client would — no runtime, no `.await`.
//
// `ModbusTransport` exists so `worker.rs` can be exercised against a
// fake in unit tests without opening a real socket or serial port.

use std::time::Duration;

use tokio_modbus::client::sync::{rtu, tcp, Context};
use tokio_modbus::prelude::*;

use crate::config::{ConnectionCfg, Parity, Transport};
use crate::decode::RegKind;

pub trait ModbusTransport: Send {
    /// Set the slave/unit id for the next request. Workers call this
    /// before every read or write since one connection is shared by
    /// every component assigned to it, and components may carry
    /// different `device_id`s (§4.5: "set slave address to its
    /// component's device_id").
    fn set_slave(&mut self, device_id: u8);
    fn read_registers(&mut self, reg_kind: RegKind, addr: u16, count: u16) -> Result<Vec<u16>, String>;
    fn read_bits(&mut self, reg_kind: RegKind, addr: u16, count: u16) -> Result<Vec<bool>, String>;
    fn write_multiple_registers(&mut self, addr: u16, words: &[u16]) -> Result<(), String>;
    fn write_single_register(&mut self, addr: u16, word: u16) -> Result<(), String>;
    fn write_multiple_coils(&mut self, addr: u16, coils: &[bool]) -> Result<(), String>;
    fn write_single_coil(&mut self, addr: u16, coil: bool) -> Result<(), String>;
}

/// Wraps `tokio_modbus::sync`'s blocking `Context` for either transport.
/// One instance per I/O worker thread; never shared.
pub struct ModbusIo {
    ctx: Context,
}

impl ModbusIo {
    pub fn connect(cfg: &ConnectionCfg) -> Result<Self, String> {
        let slave = Slave(cfg.device_id);
        let ctx = match &cfg.transport {
            Transport::Tcp { ip, port } => {
                let addr = format!("{}:{}", ip, port)
                    .parse()
                    .map_err(|e| format!("invalid TCP address {}:{}: {}", ip, port, e))?;
                tcp::connect_slave(addr, slave)
                    .map_err(|e| format!("failed to connect to {}:{}: {}", ip, port, e))?
            }
            Transport::Rtu { device, baud, parity, data_bits, stop_bits } => {
                let builder = serialport::new(device, *baud)
                    .data_bits(match data_bits {
                        5 => serialport::DataBits::Five,
                        6 => serialport::DataBits::Six,
                        7 => serialport::DataBits::Seven,
                        _ => serialport::DataBits::Eight,
                    })
                    .parity(match parity {
                        Parity::None => serialport::Parity::None,
                        Parity::Even => serialport::Parity::Even,
                        Parity::Odd => serialport::Parity::Odd,
                    })
                    .stop_bits(match stop_bits {
                        2 => serialport::StopBits::Two,
                        _ => serialport::StopBits::One,
                    })
                    .timeout(Duration::from_millis(500));
                let port = builder
                    .open()
                    .map_err(|e| format!("failed to open serial device {}: {}", device, e))?;
                rtu::connect_slave(port, slave)
                    .map_err(|e| format!("failed to start RTU session on {}: {}", device, e))?
            }
        };
        Ok(Self { ctx })
    }
}

impl ModbusTransport for ModbusIo {
    fn set_slave(&mut self, device_id: u8) {
        self.ctx.set_slave(Slave(device_id));
    }

    fn read_registers(&mut self, reg_kind: RegKind, addr: u16, count: u16) -> Result<Vec<u16>, String> {
        match reg_kind {
            RegKind::Holding => self
                .ctx
                .read_holding_registers(addr, count)
                .map_err(|e| e.to_string()),
            RegKind::Input => self
                .ctx
                .read_input_registers(addr, count)
                .map_err(|e| e.to_string()),
            _ => Err("read_registers called on a bit register kind".to_string()),
        }
    }

    fn read_bits(&mut self, reg_kind: RegKind, addr: u16, count: u16) -> Result<Vec<bool>, String> {
        match reg_kind {
            RegKind::Coil => self.ctx.read_coils(addr, count).map_err(|e| e.to_string()),
            RegKind::DiscreteInput => self
                .ctx
                .read_discrete_inputs(addr, count)
                .map_err(|e| e.to_string()),
            _ => Err("read_bits called on a register kind".to_string()),
        }
    }

    fn write_multiple_registers(&mut self, addr: u16, words: &[u16]) -> Result<(), String> {
        self.ctx
            .write_multiple_registers(addr, words)
            .map_err(|e| e.to_string())
    }

    fn write_single_register(&mut self, addr: u16, word: u16) -> Result<(), String> {
        self.ctx.write_single_register(addr, word).map_err(|e| e.to_string())
    }

    fn write_multiple_coils(&mut self, addr: u16, coils: &[bool]) -> Result<(), String> {
        self.ctx
            .write_multiple_coils(addr, coils)
            .map_err(|e| e.to_string())
    }

    fn write_single_coil(&mut self, addr: u16, coil: bool) -> Result<(), String> {
        self.ctx.write_single_coil(addr, coil).map_err(|e| e.to_string())
    }
}

/// Classify a Modbus/IO error string into the three buckets §4.5/§4.6
/// care about. Matches the string-based classification the teacher's
/// `io/modbus_tcp/reader.rs` uses against raw tokio-modbus error text,
/// since `tokio_modbus::Error` doesn't carry structured OS error kinds
/// through its `sync` wrapper.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoErrorClass {
    /// Transient: device busy, resource temporarily unavailable. Drop
    /// this cycle's work silently and retry on the next poll.
    Transient,
    /// The connection needs to be torn down and re-established.
    Reconnect,
    /// Unrecoverable: the process should exit non-zero.
    Fatal,
}

pub fn classify_io_error(message: &str) -> IoErrorClass {
    let lower = message.to_ascii_lowercase();
    if lower.contains("temporarily unavailable")
        || lower.contains("resource busy")
        || lower.contains("would block")
        || lower.contains("operation in progress")
        || lower.contains("server device busy")
        || lower.contains("acknowledge")
        || lower.contains("memory parity")
        || lower.contains("nak")
    {
        // §4.5: drop silently, don't count as a component error.
        IoErrorClass::Transient
    } else if lower.contains("timed out") || lower.contains("timeout") {
        IoErrorClass::Reconnect
    } else if lower.contains("connection reset")
        || lower.contains("broken pipe")
        || lower.contains("illegal data")
        || lower.contains("illegal function")
        || lower.contains("server failure")
    {
        IoErrorClass::Fatal
    } else {
        IoErrorClass::Reconnect
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_transient_errors() {
        assert_eq!(classify_io_error("Resource temporarily unavailable (os error 11)"), IoErrorClass::Transient);
    }

    #[test]
    fn classifies_reconnect_errors() {
        assert_eq!(classify_io_error("Connection timed out (os error 110)"), IoErrorClass::Reconnect);
    }

    #[test]
    fn classifies_fatal_errors() {
        assert_eq!(classify_io_error("Connection reset by peer (os error 104)"), IoErrorClass::Fatal);
        assert_eq!(classify_io_error("Broken pipe (os error 32)"), IoErrorClass::Fatal);
        assert_eq!(classify_io_error("Illegal data address"), IoErrorClass::Fatal);
    }
}
