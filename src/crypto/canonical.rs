use serde_json::Value;

/// Deterministic byte image of a JSON value: keys sorted lexicographically at
/// every object level, no insignificant whitespace, non-ASCII passed through
/// as UTF-8. Every node must produce identical bytes for the same value, so
/// this is the image that signatures and fingerprints cover.
///
/// NaN and the infinities are unrepresentable in `serde_json::Value`, so they
/// are rejected at parse time, before this function can see them.
pub fn canonical(value: &Value) -> Vec<u8> {
    let mut out = Vec::with_capacity(128);
    write_value(&mut out, value);
    out
}

fn write_value(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
        Value::Number(n) => out.extend_from_slice(n.to_string().as_bytes()),
        Value::String(s) => write_string(out, s),
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_value(out, item);
            }
            out.push(b']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push(b'{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_string(out, key);
                out.push(b':');
                write_value(out, &map[key.as_str()]);
            }
            out.push(b'}');
        }
    }
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    // serde_json escapes quotes, backslashes and control characters, and
    // passes non-ASCII through raw, which is exactly the canonical form.
    serde_json::to_writer(&mut *out, s).expect("string serialization is infallible");
}
