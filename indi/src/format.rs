//! INDI number formatting
//!
//! Number elements carry a printf-style `format` attribute. Besides the
//! usual C conversions INDI defines `%<w>.<f>m`, a base-60 rendering used
//! for angles and hours. The precision code `<f>` selects the layout:
//!
//! | code | layout        |
//! |------|---------------|
//! | 9    | `DD:MM:SS.SS` |
//! | 8    | `DD:MM:SS.S`  |
//! | 6    | `DD:MM:SS`    |
//! | 5    | `DD:MM.M`     |
//! | 3    | `DD:MM`       |
//!
//! Formatting never fails: anything that cannot be parsed comes back as the
//! raw value.

/// Format a raw number according to an INDI format specifier
pub fn format_number(raw: &str, format: &str) -> String {
    if raw.is_empty() || format.is_empty() {
        return raw.to_string();
    }
    let value: f64 = match raw.trim().parse() {
        Ok(v) => v,
        Err(_) => return raw.to_string(),
    };

    let formatted = if format.starts_with('%') && format.contains('m') {
        format_sexagesimal(value, format)
    } else if format.starts_with('%') && (format.contains('d') || format.contains('i')) {
        Some(format!("{}", value.trunc() as i64))
    } else if format.starts_with('%') && format.contains(['f', 'e', 'E', 'g', 'G']) {
        printf_float(format, value)
    } else if format.contains(':') {
        format_clock(value, format.matches(':').count())
    } else {
        Some(format_general(value, 6, false, false))
    };

    formatted.unwrap_or_else(|| raw.to_string())
}

/// Render `value` as sexagesimal for a `%<w>[.<f>]m` specifier
pub fn format_sexagesimal(value: f64, format: &str) -> Option<String> {
    let (width, precision) = parse_sexagesimal_spec(format)?;
    // The width doubles as the code, except that an implicit 9 or unknown
    // code renders whole seconds
    let code = match precision {
        Some(p) => p,
        None if matches!(width, 3 | 5 | 6 | 8) => width,
        None => 6,
    };

    let negative = value < 0.0;
    let magnitude = value.abs();
    let degrees = magnitude.trunc();
    let minutes_float = (magnitude - degrees) * 60.0;
    let minutes = minutes_float.trunc();
    let seconds = (minutes_float - minutes) * 60.0;
    let degrees = degrees as i64;
    let whole_minutes = minutes as i64;

    let body = match code {
        8 => format!("{:02}:{:02}:{:04.1}", degrees, whole_minutes, seconds),
        6 => format!("{:02}:{:02}:{:02.0}", degrees, whole_minutes, seconds),
        5 => format!("{:02}:{:04.1}", degrees, minutes + seconds / 60.0),
        3 => format!(
            "{:02}:{:02}",
            degrees,
            (minutes + seconds / 60.0).round() as i64
        ),
        _ => format!("{:02}:{:02}:{:05.2}", degrees, whole_minutes, seconds),
    };

    Some(if negative { format!("-{}", body) } else { body })
}

/// Parse `%<width>[.<precision>]m`
fn parse_sexagesimal_spec(format: &str) -> Option<(u32, Option<u32>)> {
    let spec = format.strip_prefix('%')?;
    let width_len = spec.bytes().take_while(u8::is_ascii_digit).count();
    if width_len == 0 {
        return None;
    }
    let width: u32 = spec[..width_len].parse().ok()?;
    let rest = &spec[width_len..];

    if let Some(fraction) = rest.strip_prefix('.') {
        let precision_len = fraction.bytes().take_while(u8::is_ascii_digit).count();
        if precision_len == 0 || !fraction[precision_len..].starts_with('m') {
            return None;
        }
        let precision = fraction[..precision_len].parse().ok()?;
        Some((width, Some(precision)))
    } else if rest.starts_with('m') {
        Some((width, None))
    } else {
        None
    }
}

/// `HH:MM:SS.mmm` for two colons, `MM:SS.mmm` for one
fn format_clock(value: f64, colons: usize) -> Option<String> {
    match colons {
        2 => {
            let hours = value.trunc();
            let minutes = ((value - hours) * 60.0).trunc();
            let seconds = ((value - hours) * 60.0 - minutes) * 60.0;
            Some(format!(
                "{:02}:{:02}:{:06.3}",
                hours as i64, minutes as i64, seconds
            ))
        }
        1 => {
            let minutes = value.trunc();
            let seconds = (value - minutes) * 60.0;
            Some(format!("{:02}:{:06.3}", minutes as i64, seconds))
        }
        _ => None,
    }
}

// =========================================================================
// printf subset
// =========================================================================

#[derive(Debug, Default, Clone, Copy)]
struct Flags {
    left: bool,
    plus: bool,
    space: bool,
    zero: bool,
    alternate: bool,
}

/// Apply a C-style floating point specifier (`f`, `e`, `E`, `g`, `G`).
///
/// Literal text around a single conversion is kept and `%%` renders `%`.
pub fn printf_float(format: &str, value: f64) -> Option<String> {
    let mut out = String::new();
    let mut chars = format.char_indices().peekable();
    let mut converted = false;

    while let Some((i, c)) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        if let Some((_, '%')) = chars.peek() {
            chars.next();
            out.push('%');
            continue;
        }
        if converted {
            return None;
        }

        let spec = &format[i + 1..];
        let (rendered, consumed) = render_conversion(spec, value)?;
        out.push_str(&rendered);
        converted = true;
        // Skip the characters making up the conversion spec
        for _ in 0..consumed {
            chars.next();
        }
    }

    if converted {
        Some(out)
    } else {
        None
    }
}

/// Render one conversion; returns the text and the number of spec chars used
fn render_conversion(spec: &str, value: f64) -> Option<(String, usize)> {
    let bytes = spec.as_bytes();
    let mut pos = 0;
    let mut flags = Flags::default();

    while pos < bytes.len() {
        match bytes[pos] {
            b'-' => flags.left = true,
            b'+' => flags.plus = true,
            b' ' => flags.space = true,
            b'0' => flags.zero = true,
            b'#' => flags.alternate = true,
            _ => break,
        }
        pos += 1;
    }

    let width_start = pos;
    while pos < bytes.len() && bytes[pos].is_ascii_digit() {
        pos += 1;
    }
    let width: usize = if pos > width_start {
        spec[width_start..pos].parse().ok()?
    } else {
        0
    };

    let mut precision: Option<usize> = None;
    if pos < bytes.len() && bytes[pos] == b'.' {
        pos += 1;
        let precision_start = pos;
        while pos < bytes.len() && bytes[pos].is_ascii_digit() {
            pos += 1;
        }
        precision = Some(if pos > precision_start {
            spec[precision_start..pos].parse().ok()?
        } else {
            0
        });
    }

    // Length modifiers carry no meaning for doubles
    while pos < bytes.len() && matches!(bytes[pos], b'l' | b'L' | b'h') {
        pos += 1;
    }

    let conversion = *bytes.get(pos)?;
    pos += 1;

    let magnitude = value.abs();
    let body = if !value.is_finite() {
        let text = if value.is_nan() { "nan" } else { "inf" };
        if conversion.is_ascii_uppercase() {
            text.to_ascii_uppercase()
        } else {
            text.to_string()
        }
    } else {
        match conversion {
            b'f' | b'F' => format_fixed(magnitude, precision.unwrap_or(6), flags.alternate),
            b'e' | b'E' => format_exponent(
                magnitude,
                precision.unwrap_or(6),
                conversion == b'E',
                flags.alternate,
            ),
            b'g' | b'G' => format_general(
                magnitude,
                precision.unwrap_or(6),
                conversion == b'G',
                flags.alternate,
            ),
            _ => return None,
        }
    };

    let sign = if value.is_sign_negative() && !value.is_nan() {
        "-"
    } else if flags.plus {
        "+"
    } else if flags.space {
        " "
    } else {
        ""
    };

    Some((pad(sign, &body, width, flags, value.is_finite()), pos))
}

fn pad(sign: &str, body: &str, width: usize, flags: Flags, numeric: bool) -> String {
    let len = sign.len() + body.len();
    if len >= width {
        return format!("{}{}", sign, body);
    }
    let fill = width - len;
    if flags.left {
        format!("{}{}{}", sign, body, " ".repeat(fill))
    } else if flags.zero && numeric {
        format!("{}{}{}", sign, "0".repeat(fill), body)
    } else {
        format!("{}{}{}", " ".repeat(fill), sign, body)
    }
}

fn format_fixed(magnitude: f64, precision: usize, alternate: bool) -> String {
    let mut text = format!("{:.*}", precision, magnitude);
    if alternate && precision == 0 {
        text.push('.');
    }
    text
}

fn format_exponent(magnitude: f64, precision: usize, upper: bool, alternate: bool) -> String {
    let text = format!("{:.*e}", precision, magnitude);
    let (mantissa, exponent) = text.split_once('e').unwrap_or((text.as_str(), "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    let mut mantissa = mantissa.to_string();
    if alternate && precision == 0 {
        mantissa.push('.');
    }
    format!(
        "{}{}{}{:02}",
        mantissa,
        if upper { 'E' } else { 'e' },
        if exponent < 0 { '-' } else { '+' },
        exponent.abs()
    )
}

/// `%g`: shortest of fixed or exponent form at `precision` significant digits
fn format_general(value: f64, precision: usize, upper: bool, alternate: bool) -> String {
    let magnitude = value.abs();
    let sign = if value.is_sign_negative() && value != 0.0 { "-" } else { "" };
    let precision = precision.max(1);

    // Exponent after rounding to the requested significant digits
    let exponent: i32 = if magnitude == 0.0 {
        0
    } else {
        let text = format!("{:.*e}", precision - 1, magnitude);
        text.split_once('e')
            .and_then(|(_, e)| e.parse().ok())
            .unwrap_or(0)
    };

    let mut text = if exponent < -4 || exponent >= precision as i32 {
        format_exponent(magnitude, precision - 1, upper, alternate)
    } else {
        let decimals = (precision as i32 - 1 - exponent).max(0) as usize;
        format_fixed(magnitude, decimals, alternate)
    };

    if !alternate {
        text = strip_trailing_zeros(&text);
    }
    format!("{}{}", sign, text)
}

fn strip_trailing_zeros(text: &str) -> String {
    let (mantissa, suffix) = match text.find(['e', 'E']) {
        Some(pos) => (&text[..pos], &text[pos..]),
        None => (text, ""),
    };
    if !mantissa.contains('.') {
        return text.to_string();
    }
    let trimmed = mantissa.trim_end_matches('0').trim_end_matches('.');
    format!("{}{}", trimmed, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sexagesimal_keeps_sign_of_zero_degrees() {
        assert_eq!(format_number("-0.5027778", "%9m"), "-00:30:10");
    }

    #[test]
    fn test_sexagesimal_whole_seconds() {
        assert_eq!(format_number("1.105", "%6.6m"), "01:06:18");
    }

    #[test]
    fn test_sexagesimal_precision_codes() {
        assert_eq!(format_number("12.5", "%10.9m"), "12:30:00.00");
        assert_eq!(format_number("12.5", "%10.8m"), "12:30:00.0");
        assert_eq!(format_number("12.5", "%8.5m"), "12:30.0");
        assert_eq!(format_number("12.5", "%6.3m"), "12:30");
        assert_eq!(format_number("-45.25", "%11.8m"), "-45:15:00.0");
        // Unknown explicit codes fall back to the longest layout
        assert_eq!(format_number("2.75", "%10.4m"), "02:45:00.00");
    }

    #[test]
    fn test_sexagesimal_implicit_precision() {
        assert_eq!(format_number("2.75", "%5m"), "02:45.0");
        assert_eq!(format_number("2.75", "%3m"), "02:45");
        assert_eq!(format_number("2.75", "%6m"), "02:45:00");
        assert_eq!(format_number("2.75", "%8m"), "02:45:00.0");
        assert_eq!(format_number("-2.75", "%8m"), "-02:45:00.0");
        assert_eq!(format_number("2.75", "%9m"), "02:45:00");
        assert_eq!(format_number("2.75", "%12m"), "02:45:00");
    }

    #[test]
    fn test_sexagesimal_bad_spec_returns_raw() {
        assert_eq!(format_number("1.5", "%m"), "1.5");
        assert_eq!(format_number("1.5", "%.2f mm"), "1.5");
    }

    #[test]
    fn test_integer_formats_truncate() {
        assert_eq!(format_number("42.9", "%d"), "42");
        assert_eq!(format_number("-3.7", "%5i"), "-3");
        assert_eq!(format_number("-0.5", "%d"), "0");
    }

    #[test]
    fn test_float_formats_follow_printf() {
        assert_eq!(format_number("1", "%5.2f"), " 1.00");
        assert_eq!(format_number("-1.5", "%6.1f"), "  -1.5");
        assert_eq!(format_number("3.14159", "%.3f"), "3.142");
        assert_eq!(format_number("3.14159", "%-8.2f"), "3.14    ");
        assert_eq!(format_number("3.14159", "%08.2f"), "00003.14");
        assert_eq!(format_number("2.5", "%+.1f"), "+2.5");
        assert_eq!(format_number("12345.678", "%e"), "1.234568e+04");
        assert_eq!(format_number("0.00012", "%.2E"), "1.20E-04");
        assert_eq!(format_number("100000", "%g"), "100000");
        assert_eq!(format_number("1000000", "%g"), "1e+06");
        assert_eq!(format_number("0.0001", "%g"), "0.0001");
        assert_eq!(format_number("0.00001", "%g"), "1e-05");
        assert_eq!(format_number("2.50", "%.3g"), "2.5");
        assert_eq!(format_number("5.0", "%.1f C"), "5.0 C");
        assert_eq!(format_number("50", "%.0f%%"), "50%");
    }

    #[test]
    fn test_clock_formats() {
        assert_eq!(format_number("1.5", "%02d:%02d"), "1");
        assert_eq!(format_number("1.5", "HH:MM:SS"), "01:30:00.000");
        assert_eq!(format_number("2.25", "MM:SS"), "02:15.000");
    }

    #[test]
    fn test_default_general_format() {
        assert_eq!(format_number("3.14159265", "raw"), "3.14159");
        assert_eq!(format_number("1234567", "x"), "1.23457e+06");
    }

    #[test]
    fn test_unparsable_values_are_returned_unchanged() {
        assert_eq!(format_number("12:30:00", "%10.6m"), "12:30:00");
        assert_eq!(format_number("", "%5.2f"), "");
        assert_eq!(format_number("7", ""), "7");
    }
}
