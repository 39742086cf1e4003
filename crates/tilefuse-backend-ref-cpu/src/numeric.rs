use half::{bf16, f16};
use tilefuse::ir::ScalarType;

/// Rounds `value` to the nearest value representable in `elem`.
pub fn round_float(elem: ScalarType, value: f64) -> f64 {
    match elem {
        ScalarType::F64 => value,
        ScalarType::F32 => value as f32 as f64,
        ScalarType::F16 => f16::from_f64(value).to_f64(),
        ScalarType::Bf16 => bf16::from_f64(value).to_f64(),
        _ => value,
    }
}

/// Wraps `value` to the two's complement range of `elem`. `i1` is kept as 0 or 1.
pub fn wrap_int(elem: ScalarType, value: i64) -> i64 {
    match elem {
        ScalarType::I1 => value & 1,
        ScalarType::I8 => value as i8 as i64,
        ScalarType::I16 => value as i16 as i64,
        ScalarType::I32 => value as i32 as i64,
        _ => value,
    }
}

/// The bit pattern of `value` read as an unsigned integer of `elem`'s width.
pub fn as_unsigned(elem: ScalarType, value: i64) -> u64 {
    match elem {
        ScalarType::I1 => (value & 1) as u64,
        ScalarType::I8 => value as u8 as u64,
        ScalarType::I16 => value as u16 as u64,
        ScalarType::I32 => value as u32 as u64,
        _ => value as u64,
    }
}

/// Signed value of an integer element; a set `i1` reads as -1.
pub fn as_signed(elem: ScalarType, value: i64) -> i64 {
    match elem {
        ScalarType::I1 => -(value & 1),
        _ => value,
    }
}

/// Float to integer conversion truncating toward zero and saturating at the width of `elem`.
pub fn float_to_int(elem: ScalarType, value: f64) -> i64 {
    if value.is_nan() {
        return 0;
    }
    let bits = elem.bit_width();
    if bits >= 64 {
        return value as i64;
    }
    let max = (1i64 << (bits - 1)) - 1;
    let min = -(1i64 << (bits - 1));
    (value.trunc() as i64).clamp(min, max)
}

pub fn float_to_bits(elem: ScalarType, value: f64) -> u64 {
    match elem {
        ScalarType::F64 => value.to_bits(),
        ScalarType::F32 => u64::from((value as f32).to_bits()),
        ScalarType::F16 => u64::from(f16::from_f64(value).to_bits()),
        _ => u64::from(bf16::from_f64(value).to_bits()),
    }
}

pub fn float_from_bits(elem: ScalarType, bits: u64) -> f64 {
    match elem {
        ScalarType::F64 => f64::from_bits(bits),
        ScalarType::F32 => f64::from(f32::from_bits(bits as u32)),
        ScalarType::F16 => f16::from_bits(bits as u16).to_f64(),
        _ => bf16::from_bits(bits as u16).to_f64(),
    }
}

/// Rounds an f32 to the 10 explicit mantissa bits of TF32, nearest-even.
pub fn round_to_tf32(value: f64) -> f64 {
    let single = value as f32;
    if !single.is_finite() {
        return f64::from(single);
    }
    let bits = single.to_bits();
    let lsb = (bits >> 13) & 1;
    let rounded = bits.wrapping_add(0x0fff + lsb) & !0x1fff;
    f64::from(f32::from_bits(rounded))
}

/// Evaluates a device math routine by its base name (`exp`, `log1p`, `atan2`, ...).
pub fn math_function(name: &str, args: &[f64]) -> Option<f64> {
    let x = *args.first()?;
    let y = args.get(1).copied();
    let value = match name {
        "exp" => x.exp(),
        "expm1" => x.exp_m1(),
        "log" => x.ln(),
        "log1p" => x.ln_1p(),
        "sqrt" => x.sqrt(),
        "rsqrt" => 1.0 / x.sqrt(),
        "cbrt" => x.cbrt(),
        "sin" => x.sin(),
        "cos" => x.cos(),
        "tan" => x.tan(),
        "tanh" => x.tanh(),
        "atan2" => x.atan2(y?),
        "pow" => x.powf(y?),
        "fmod" => x % y?,
        _ => return None,
    };
    Some(value)
}

/// Strips vendor prefixes and precision suffixes from a device function symbol.
pub fn math_base_name(symbol: &str) -> &str {
    let name = symbol
        .strip_prefix("__nv_")
        .or_else(|| symbol.strip_prefix("__ocml_"))
        .unwrap_or(symbol);
    let name = name
        .strip_suffix("_f32")
        .or_else(|| name.strip_suffix("_f64"))
        .unwrap_or(name);
    if math_function(name, &[1.0, 1.0]).is_some() {
        return name;
    }
    name.strip_suffix('f').unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_wrapping_follows_width() {
        assert_eq!(wrap_int(ScalarType::I8, 200), -56);
        assert_eq!(wrap_int(ScalarType::I1, 3), 1);
        assert_eq!(as_unsigned(ScalarType::I16, -1), 65535);
        assert_eq!(as_signed(ScalarType::I1, 1), -1);
        assert_eq!(float_to_int(ScalarType::I8, 1000.0), 127);
        assert_eq!(float_to_int(ScalarType::I32, -2.7), -2);
    }

    #[test]
    fn bf16_rounding_and_bits_agree() {
        let rounded = round_float(ScalarType::Bf16, 1.0 + 1.0 / 512.0);
        assert_eq!(rounded, 1.0);
        let bits = float_to_bits(ScalarType::F32, 1.5);
        assert_eq!(bits, 0x3fc0_0000);
        assert_eq!(float_from_bits(ScalarType::F32, bits), 1.5);
    }

    #[test]
    fn tf32_keeps_ten_mantissa_bits() {
        let value = 1.0 + 1.0 / 4096.0;
        assert_eq!(round_to_tf32(value), 1.0);
        assert_eq!(round_to_tf32(1.0 + 1.0 / 1024.0), 1.0 + 1.0 / 1024.0);
    }

    #[test]
    fn symbol_names_resolve_to_math_routines() {
        assert_eq!(math_base_name("__nv_expf"), "exp");
        assert_eq!(math_base_name("__nv_exp"), "exp");
        assert_eq!(math_base_name("__nv_fmodf"), "fmod");
        assert_eq!(math_base_name("__ocml_log1p_f32"), "log1p");
        assert_eq!(math_function("atan2", &[1.0, 1.0]), Some(std::f64::consts::FRAC_PI_4));
    }
}
