//! MessagePack framing helpers, kept pure so they can be tested without
//! a server.

use redlab_domain::RpcError;
use rmpv::Value;

/// Encode a request frame: an array of `[method, ...args]`.
pub fn encode_request(method: &str, args: &[Value]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(args.len() + 1);
    frame.push(Value::from(method));
    frame.extend(args.iter().cloned());

    let mut buf = Vec::new();
    // Writing into a Vec cannot fail.
    rmpv::encode::write_value(&mut buf, &Value::Array(frame))
        .expect("msgpack encode into Vec");
    buf
}

/// Decode a response frame and surface server-side errors as typed kinds.
///
/// The server signals failure with a map containing `error: true`; a 401
/// error code or an authentication-flavored message maps onto
/// [`RpcError::Auth`] so callers can tell fatal credential loss apart from
/// retryable transport trouble.
pub fn decode_response(bytes: &[u8]) -> Result<Value, RpcError> {
    let mut cursor = bytes;
    let value = rmpv::decode::read_value(&mut cursor)
        .map_err(|e| RpcError::Decode(e.to_string()))?;

    if value_bool(map_get(&value, "error")).unwrap_or(false) {
        let class = value_str(map_get(&value, "error_class"))
            .unwrap_or("unknown")
            .to_owned();
        let message = value_str(map_get(&value, "error_message"))
            .unwrap_or("unknown error")
            .to_owned();
        let code = value_u64(map_get(&value, "error_code"));

        if code == Some(401) || message.to_ascii_lowercase().contains("authentication") {
            return Err(RpcError::Auth(message));
        }
        return Err(RpcError::Server {
            name: class,
            message,
        });
    }

    Ok(value)
}

/// Look up a key in a msgpack map. Keys arrive as either UTF-8 strings or
/// raw binary depending on the server's encoder.
pub fn map_get<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    let entries = value.as_map()?;
    entries.iter().find_map(|(k, v)| {
        let matches = match k {
            Value::String(s) => s.as_str() == Some(key),
            Value::Binary(b) => b.as_slice() == key.as_bytes(),
            _ => false,
        };
        matches.then_some(v)
    })
}

pub fn value_str(value: Option<&Value>) -> Option<&str> {
    match value? {
        Value::String(s) => s.as_str(),
        Value::Binary(b) => std::str::from_utf8(b).ok(),
        _ => None,
    }
}

pub fn value_bool(value: Option<&Value>) -> Option<bool> {
    value?.as_bool()
}

pub fn value_u64(value: Option<&Value>) -> Option<u64> {
    value?.as_u64()
}

/// Copy a string field out of a response map, with a decode error naming
/// the missing key.
pub fn required_str(value: &Value, key: &str) -> Result<String, RpcError> {
    value_str(map_get(value, key))
        .map(str::to_owned)
        .ok_or_else(|| RpcError::Decode(format!("response missing '{key}'")))
}
