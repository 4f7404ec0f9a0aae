// decode/engine.rs
//
// Pure functions over `(raw_words, decode_spec) -> typed_value` and
// `(typed_value, decode_spec, previous_raw) -> raw_words` (§4.1 / §4.2).
// No IO, no allocation beyond the returned `Vec<u16>`, no failure modes:
// garbage in, garbage out. Transport errors are reported upstream by the
// I/O worker, not here.

use super::{DecodeSpec, RegKind, TypedValue};

/// Compose a big-endian unsigned integer from `size` 16-bit words.
/// `word_swap = false`: the lowest-address word (`words[0]`) is the most
/// significant. `word_swap = true`: word order is reversed before
/// composing. Individual words are always big-endian as received.
fn compose_raw(words: &[u16], word_swap: bool) -> u64 {
    let mut ordered: Vec<u16> = words.to_vec();
    if word_swap {
        ordered.reverse();
    }
    ordered.iter().fold(0u64, |acc, &w| (acc << 16) | w as u64)
}

/// Inverse of `compose_raw`: split `raw` into `size` words in
/// most-address-significant-first order, then apply the same reversal.
fn decompose_raw(raw: u64, size: u8, word_swap: bool) -> Vec<u16> {
    let mut ordered: Vec<u16> = (0..size)
        .rev()
        .map(|i| ((raw >> (i as u32 * 16)) & 0xFFFF) as u16)
        .collect();
    if word_swap {
        ordered.reverse();
    }
    ordered
}

fn sign_extend(raw: u64, bits: u32) -> i64 {
    if bits >= 64 {
        return raw as i64;
    }
    let shift = 64 - bits;
    ((raw << shift) as i64) >> shift
}

fn twos_complement(value: i64, bits: u32) -> u64 {
    if bits >= 64 {
        return value as u64;
    }
    (value as u64) & ((1u64 << bits) - 1)
}

/// Decode `size` raw registers into a typed value plus the composed raw
/// integer (needed by the encode path and by change detection).
pub fn decode(words: &[u16], spec: &DecodeSpec, reg_kind: RegKind) -> (TypedValue, u64) {
    decode_with_word_swap(words, spec, reg_kind, false)
}

pub fn decode_with_word_swap(
    words: &[u16],
    spec: &DecodeSpec,
    reg_kind: RegKind,
    word_swap: bool,
) -> (TypedValue, u64) {
    debug_assert_eq!(words.len(), spec.size as usize);

    let mut raw = compose_raw(words, word_swap);

    // Step 2: Holding only - care_mask then invert_mask.
    if reg_kind == RegKind::Holding {
        raw = (raw & spec.care_mask) ^ spec.invert_mask;
    }

    // Step 3: bit-string types return raw unsigned, scale/shift forbidden.
    if spec.bit_strings.is_some() {
        return (TypedValue::U(raw), raw);
    }

    // Step 4: Float reinterpretation.
    if spec.float {
        let value = if spec.size <= 2 {
            f32::from_bits((raw & 0xFFFF_FFFF) as u32) as f64
        } else {
            f64::from_bits(raw)
        };
        return (TypedValue::F(value), raw);
    }

    // Step 5/6: sign-extend (if signed), then shift, then scale.
    if spec.signed {
        let base = sign_extend(raw, spec.bit_width()) as i128;
        let shifted = base + spec.shift as i128;
        if spec.scale != 0.0 {
            return (TypedValue::F(shifted as f64 * spec.scale), raw);
        }
        return (TypedValue::I(shifted as i64), raw);
    }

    let base = raw as i128;
    let shifted = base + spec.shift as i128;
    if spec.scale != 0.0 {
        return (TypedValue::F(shifted as f64 * spec.scale), raw);
    }
    (TypedValue::U(shifted.max(0) as u64), raw)
}

/// Encode a new typed value back into `size` raw 16-bit words.
///
/// `bit_idx` is required (and only meaningful) when `spec` is an
/// `individual_bits` decode. `previous_raw` is required for `individual_bits`
/// sets (to preserve the other bits) and is used, when present, to restore
/// bits outside `care_mask` on Holding writes.
pub fn encode(
    spec: &DecodeSpec,
    value: TypedValue,
    bit_idx: Option<u8>,
    previous_raw: Option<u64>,
    reg_kind: RegKind,
) -> Vec<u16> {
    encode_with_word_swap(spec, value, bit_idx, previous_raw, reg_kind, false)
}

pub fn encode_with_word_swap(
    spec: &DecodeSpec,
    value: TypedValue,
    bit_idx: Option<u8>,
    previous_raw: Option<u64>,
    reg_kind: RegKind,
    word_swap: bool,
) -> Vec<u16> {
    let is_individual_bits = spec
        .bit_strings
        .as_ref()
        .map(|b| b.is_individual_bits())
        .unwrap_or(false);

    let mut raw = if is_individual_bits {
        // Step 1: clear bit_idx, set it iff the new value is 1, continue unsigned.
        let prev = previous_raw.expect("individual_bits set requires previous_raw");
        let bit = bit_idx.expect("individual_bits set requires bit_idx");
        let mut r = prev & !(1u64 << bit);
        if value.as_u64() == 1 {
            r |= 1u64 << bit;
        }
        r
    } else if spec.bit_strings.is_some() {
        // bit_field / enum: the caller already supplies the intended raw bits.
        value.as_u64()
    } else {
        // Step 2: reverse scale/shift.
        let mut v = value.as_f64();
        if spec.scale != 0.0 {
            v = v / spec.scale - spec.shift as f64;
        } else {
            v -= spec.shift as f64;
        }

        if spec.float {
            // Step 3: float reinterpretation.
            if spec.size <= 2 {
                (v as f32).to_bits() as u64
            } else {
                v.to_bits()
            }
        } else if spec.signed {
            // Step 4: two's complement.
            twos_complement(v.round() as i64, spec.bit_width())
        } else {
            v.round() as u64
        }
    };

    // Step 5: invert mask, then care mask merged with previous_raw for Holding.
    raw ^= spec.invert_mask;
    if reg_kind == RegKind::Holding {
        let outside = previous_raw.unwrap_or(0) & !spec.care_mask;
        raw = (raw & spec.care_mask) | outside;
    }

    // Step 6: split into words honoring word_swap.
    decompose_raw(raw, spec.size, word_swap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::DecodeSpec;

    fn spec(size: u8, signed: bool, float: bool, scale: f64) -> DecodeSpec {
        let bits = size as u32 * 16;
        let full_mask = if bits >= 64 { u64::MAX } else { (1u64 << bits) - 1 };
        DecodeSpec {
            id: "x".to_string(),
            offset: 0,
            size,
            scale,
            shift: 0,
            invert_mask: 0,
            care_mask: full_mask,
            starting_bit_pos: 0,
            number_of_bits: bits as u8,
            signed,
            float,
            bit_strings: None,
            debounce_ms: 0,
        }
    }

    #[test]
    fn scenario_1_signed_32bit_negative_two() {
        let s = spec(2, true, false, 0.1);
        let (value, _raw) = decode(&[0xFFFF, 0xFFFE], &s, RegKind::Holding);
        match value {
            TypedValue::F(v) => assert!((v - (-0.2)).abs() < 1e-9),
            other => panic!("expected float, got {:?}", other),
        }
    }

    #[test]
    fn scenario_2_word_swap_same_result() {
        let s = spec(2, true, false, 0.1);
        let (value, _raw) = decode_with_word_swap(&[0xFFFE, 0xFFFF], &s, RegKind::Holding, true);
        match value {
            TypedValue::F(v) => assert!((v - (-0.2)).abs() < 1e-9),
            other => panic!("expected float, got {:?}", other),
        }
    }

    #[test]
    fn round_trip_every_legal_combination() {
        for &size in &[1u8, 2, 4] {
            for &word_swap in &[false, true] {
                for &signed in &[false, true] {
                    for &float in &[false, true] {
                        if signed && float {
                            continue; // forbidden combination
                        }
                        if float && size == 1 {
                            continue; // float requires size in {2,4}
                        }
                        let s = spec(size, signed, float, 0.0);
                        let words: Vec<u16> = (0..size).map(|i| 0x1000u16.wrapping_add(i as u16)).collect();
                        let (value, raw) =
                            decode_with_word_swap(&words, &s, RegKind::Input, word_swap);
                        let encoded =
                            encode_with_word_swap(&s, value, None, Some(raw), RegKind::Input, word_swap);
                        assert_eq!(
                            encoded, words,
                            "round trip failed size={} word_swap={} signed={} float={}",
                            size, word_swap, signed, float
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn holding_care_mask_preserves_bits_outside_mask_on_encode() {
        let mut s = spec(1, false, false, 0.0);
        s.care_mask = 0x00FF;
        let prev_raw = 0xAB34u64;
        let encoded = encode(&s, TypedValue::U(0x12), None, Some(prev_raw), RegKind::Holding);
        assert_eq!(encoded, vec![0xAB12]);
    }

    #[test]
    fn individual_bits_set_clears_and_sets_single_bit() {
        let mut s = spec(1, false, false, 0.0);
        s.bit_strings = Some(crate::decode::BitStrings::IndividualBits(vec![]));
        let prev_raw = 0x000Au64; // 0b1010
        let encoded = encode(&s, TypedValue::U(1), Some(0), Some(prev_raw), RegKind::Holding);
        assert_eq!(encoded, vec![0x000B]); // sets bit 0 -> 0b1011
    }
}
