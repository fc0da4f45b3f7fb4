//! Text formatting for hover labels.

use crate::dataset::Column;

/// Format `v` with `precision` significant digits and comma thousands
/// separators, switching to exponent form for very large or small values.
///
/// ```
/// use plotplot::format::format_general;
///
/// assert_eq!(format_general(12345.678, 6), "12,345.7");
/// assert_eq!(format_general(1234567.0, 6), "1.23457e+06");
/// ```
pub fn format_general(v: f64, precision: usize) -> String {
    if v.is_nan() {
        return "nan".to_string();
    }
    if v.is_infinite() {
        return if v > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    let p = precision.max(1);
    if v == 0.0 {
        return if v.is_sign_negative() { "-0" } else { "0" }.to_string();
    }

    // Rounding to `p` digits can bump the exponent (9.999995 -> 1e+01), so
    // take it from the rounded scientific form.
    let sci = format!("{:.*e}", p - 1, v);
    let (mantissa, exp) = match sci.split_once('e') {
        Some((m, e)) => (m.to_string(), e.parse::<i32>().unwrap_or(0)),
        None => (sci.clone(), 0),
    };

    if exp < -4 || exp >= p as i32 {
        let mantissa = strip_zeros(&mantissa);
        let sign = if exp < 0 { '-' } else { '+' };
        return format!("{}e{}{:02}", mantissa, sign, exp.abs());
    }

    let decimals = (p as i32 - 1 - exp).max(0) as usize;
    let fixed = strip_zeros(&format!("{:.*}", decimals, v));
    group_thousands(&fixed)
}

fn strip_zeros(s: &str) -> String {
    if !s.contains('.') {
        return s.to_string();
    }
    s.trim_end_matches('0').trim_end_matches('.').to_string()
}

fn group_thousands(s: &str) -> String {
    let (sign, rest) = match s.strip_prefix('-') {
        Some(r) => ("-", r),
        None => ("", s),
    };
    let (int_part, frac) = match rest.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (rest, None),
    };
    let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3);
    for (i, ch) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    match frac {
        Some(f) => format!("{}{}.{}", sign, grouped, f),
        None => format!("{}{}", sign, grouped),
    }
}

/// Shorten `s` to `n` characters by replacing its middle with `...`.
pub fn truncate_middle(s: &str, n: usize) -> String {
    let chars: Vec<char> = s.chars().collect();
    if chars.len() <= n {
        return s.to_string();
    }
    let tail = (n / 2).saturating_sub(3);
    let head = n.saturating_sub(tail + 3);
    let mut out: String = chars[..head].iter().collect();
    out.push_str("...");
    out.extend(&chars[chars.len() - tail..]);
    out
}

/// One hover cell. Non-negative numbers get a leading space so columns of
/// mixed sign line up in a monospace label.
pub fn hover_value(column: &Column, row: usize, value_width: usize) -> String {
    match column {
        Column::Numeric { values, .. } => {
            let v = values[row];
            if v.is_nan() {
                return "  ".to_string();
            }
            let s = format_general(v, 6);
            if v >= 0.0 { format!(" {}", s) } else { s }
        }
        Column::Text(values) => match &values[row] {
            Some(s) => format!(" {}", truncate_middle(s, value_width)),
            None => "  ".to_string(),
        },
    }
}
