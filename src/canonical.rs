// Canonical JSON serialization for signature verification.
//
// The canonical form is the exact byte sequence handshake signatures are
// computed over, so it is part of the wire contract:
//   - object members in lexicographic key order
//   - the member named "signature" skipped at the top level only
//   - minimal string escaping
//   - numbers in the shortest decimal form that round-trips; integer-valued
//     numbers without a decimal point; any zero (including negative zero)
//     and any non-finite value serialize as "0"

use serde_json::Value;

/// Serialize a JSON value to its canonical signing form.
pub fn to_canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_value(value, &mut out, true);
    out
}

fn write_value(value: &Value, out: &mut String, top_level: bool) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(n) => write_number(n, out),
        Value::String(s) => write_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out, false);
            }
            out.push(']');
        }
        Value::Object(map) => {
            // Sort explicitly rather than relying on the map's iteration
            // order, so canonicalization is independent of serde_json's
            // map backing.
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();

            out.push('{');
            let mut first = true;
            for key in keys {
                if top_level && key == "signature" {
                    continue;
                }
                if !first {
                    out.push(',');
                }
                first = false;
                write_string(key, out);
                out.push(':');
                write_value(&map[key], out, false);
            }
            out.push('}');
        }
    }
}

fn write_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{0008}' => out.push_str("\\b"),
            '\u{000C}' => out.push_str("\\f"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

fn write_number(n: &serde_json::Number, out: &mut String) {
    if let Some(i) = n.as_i64() {
        out.push_str(&i.to_string());
        return;
    }
    if let Some(u) = n.as_u64() {
        out.push_str(&u.to_string());
        return;
    }
    let f = n.as_f64().unwrap_or(0.0);
    if !f.is_finite() || f == 0.0 {
        // Covers NaN, both infinities, and negative zero.
        out.push('0');
        return;
    }
    if f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 {
        out.push_str(&(f as i64).to_string());
        return;
    }
    // Rust's float Display already produces the shortest round-trip form.
    out.push_str(&f.to_string());
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
