// decode/mod.rs
//
// Types shared by the decode/encode engine and the config model: the
// per-register-kind dispatch tag, the tagged numeric value, and the three
// `bit_strings` shapes (`enum`, `bit_field`, `individual_bits`).

pub mod engine;

/// Four concrete register kinds drive a fixed `match` dispatch in read,
/// decode, encode, and format — no virtual dispatch (§ Design notes).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegKind {
    Holding,
    Input,
    Coil,
    DiscreteInput,
}

impl RegKind {
    pub fn is_register(self) -> bool {
        matches!(self, RegKind::Holding | RegKind::Input)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RegKind::Holding => "holding",
            RegKind::Input => "input",
            RegKind::Coil => "coil",
            RegKind::DiscreteInput => "discrete_input",
        }
    }
}

/// The decoded value is a discriminated union of `u64 | i64 | f64`, never
/// a generic "dynamic value" box.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TypedValue {
    U(u64),
    I(i64),
    F(f64),
}

impl TypedValue {
    /// Coerce to an `f64` for arithmetic that doesn't care about the tag
    /// (scale/shift application, comparisons against a set body).
    pub fn as_f64(self) -> f64 {
        match self {
            TypedValue::U(v) => v as f64,
            TypedValue::I(v) => v as f64,
            TypedValue::F(v) => v,
        }
    }

    pub fn as_u64(self) -> u64 {
        match self {
            TypedValue::U(v) => v,
            TypedValue::I(v) => v as u64,
            TypedValue::F(v) => v as u64,
        }
    }

    pub fn to_json(self) -> serde_json::Value {
        match self {
            TypedValue::U(v) => serde_json::json!(v),
            TypedValue::I(v) => serde_json::json!(v),
            TypedValue::F(v) => serde_json::json!(v),
        }
    }
}

/// One labeled sub-range of a `bit_field` decode. Ranges are contiguous and
/// cover `[0, number_of_bits)`; a range with `label: None` still occupies
/// its bits but renders as "Unknown" whenever it reads nonzero.
#[derive(Clone, Debug)]
pub struct BitRange {
    pub begin_bit: u8,
    pub end_bit: u8,
    pub label: Option<String>,
}

impl BitRange {
    pub fn mask(&self) -> u64 {
        let width = (self.end_bit - self.begin_bit + 1) as u32;
        if width >= 64 {
            u64::MAX
        } else {
            ((1u64 << width) - 1) << self.begin_bit
        }
    }
}

/// One bit of an `individual_bits` decode. `label: None` means the bit is
/// ignored: it occupies no URI and is never reported.
#[derive(Clone, Debug)]
pub struct IndividualBit {
    pub bit: u8,
    pub label: Option<String>,
}

/// One `(value, label)` pair of an `enum` decode, sorted ascending by
/// `value` with no duplicates.
#[derive(Clone, Debug)]
pub struct EnumLabel {
    pub value: u64,
    pub label: String,
}

#[derive(Clone, Debug)]
pub enum BitStrings {
    BitField(Vec<BitRange>),
    IndividualBits(Vec<IndividualBit>),
    Enum(Vec<EnumLabel>),
}

impl BitStrings {
    pub fn is_individual_bits(&self) -> bool {
        matches!(self, BitStrings::IndividualBits(_))
    }
}

/// Immutable description of how to turn `size` raw 16-bit words into (and
/// back from) a named, typed value. One per register map entry.
#[derive(Clone, Debug)]
pub struct DecodeSpec {
    /// Unique within a component among non-`individual_bits` entries.
    /// `individual_bits` entries may leave this empty; their per-bit
    /// labels are the routable names instead.
    pub id: String,
    pub offset: u16,
    pub size: u8,
    pub scale: f64,
    pub shift: i64,
    pub invert_mask: u64,
    pub care_mask: u64,
    pub starting_bit_pos: u8,
    pub number_of_bits: u8,
    pub signed: bool,
    pub float: bool,
    pub bit_strings: Option<BitStrings>,
    pub debounce_ms: u64,
}

impl DecodeSpec {
    pub fn bit_width(&self) -> u32 {
        self.size as u32 * 16
    }

    pub fn full_mask(&self) -> u64 {
        if self.bit_width() >= 64 {
            u64::MAX
        } else {
            (1u64 << self.bit_width()) - 1
        }
    }

    pub fn is_bit_string(&self) -> bool {
        self.bit_strings.is_some()
    }
}
