pub mod arbiter;
pub mod arena;
pub mod bus;
pub mod cache;
pub mod clock;
pub mod config;
pub mod decode;
pub mod error;
pub mod events;
pub mod format;
pub mod heartbeat;
pub mod listener;
pub mod logging;
pub mod modbus_io;
pub mod queue;
pub mod router;
pub mod worker;
pub mod workspace;
