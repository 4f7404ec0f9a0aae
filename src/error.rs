// error.rs
//
// Config errors carry a structured location so a bad config file points
// straight at the offending component/register/decode/key, mirroring
// `error_location.hpp`'s `Error_Location` from the original client. Every
// other error kind in this crate (message-level, transport) stays a plain
// `String`, same as the teacher crate does throughout `io/`.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequiredType {
    #[default]
    None,
    Bool,
    Int,
    Uint,
    Float,
    String,
    Object,
    Array,
}

impl fmt::Display for RequiredType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RequiredType::None => "",
            RequiredType::Bool => "boolean",
            RequiredType::Int => "integer",
            RequiredType::Uint => "unsigned integer",
            RequiredType::Float => "float",
            RequiredType::String => "string",
            RequiredType::Object => "object",
            RequiredType::Array => "array",
        };
        f.write_str(s)
    }
}

/// Where a config error occurred. Indices default to 0 / "" when not yet
/// known (e.g. a top-level "components" key missing entirely).
#[derive(Debug, Clone, Default)]
pub struct ErrorLocation {
    pub component_idx: usize,
    pub component_id: String,
    pub register_idx: usize,
    pub register_type: String,
    pub decode_idx: usize,
    pub decode_id: String,
    pub bit_strings_idx: usize,
    pub key: String,
    pub expected_type: RequiredType,
    pub message: String,
}

impl ErrorLocation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_component(mut self, idx: usize, id: impl Into<String>) -> Self {
        self.component_idx = idx;
        self.component_id = id.into();
        self
    }

    pub fn with_register(mut self, idx: usize, reg_type: impl Into<String>) -> Self {
        self.register_idx = idx;
        self.register_type = reg_type.into();
        self
    }

    pub fn with_decode(mut self, idx: usize, id: impl Into<String>) -> Self {
        self.decode_idx = idx;
        self.decode_id = id.into();
        self
    }

    pub fn with_bit_strings(mut self, idx: usize) -> Self {
        self.bit_strings_idx = idx;
        self
    }

    pub fn with_key(mut self, key: impl Into<String>, expected: RequiredType) -> Self {
        self.key = key.into();
        self.expected_type = expected;
        self
    }
}

impl fmt::Display for ErrorLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "\nError Location:\n\n\
             Current Component index:     {}\n\
             Last Known Component id:     {}\n\
             Current Register index:      {}\n\
             Last Known Register type:    {}\n\
             Current Decode index:        {}\n\
             Last Known Decode id:        {}\n\
             Current Bit String index:    {}\n\
             Current Key/Field:           {}\n\
             Current Required type:       {}\n\
             Error:                       {}\n",
            self.component_idx,
            self.component_id,
            self.register_idx,
            self.register_type,
            self.decode_idx,
            self.decode_id,
            self.bit_strings_idx,
            self.key,
            self.expected_type,
            self.message,
        )
    }
}

#[derive(Debug)]
pub struct ConfigError(pub ErrorLocation);

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ConfigError {}

impl From<ErrorLocation> for ConfigError {
    fn from(loc: ErrorLocation) -> Self {
        ConfigError(loc)
    }
}

/// Print a final line and exit non-zero. Used for every error class that
/// `spec.md` §7 marks fatal: bad config at load, connection-reset/
/// broken-pipe/protocol-illegal Modbus errors, five consecutive poll-error
/// cycles, queue overflow, and a non-EAGAIN/EINTR listener receive failure.
pub fn fatal(message: impl fmt::Display) -> ! {
    crate::logging::glog!("[fatal] {}", message);
    std::process::exit(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_location_block() {
        let loc = ErrorLocation::new("offset out of range")
            .with_component(1, "bms")
            .with_register(0, "Holding")
            .with_decode(2, "soc")
            .with_key("offset", RequiredType::Uint);
        let rendered = loc.to_string();
        assert!(rendered.contains("bms"));
        assert!(rendered.contains("offset out of range"));
        assert!(rendered.contains("unsigned integer"));
    }
}
