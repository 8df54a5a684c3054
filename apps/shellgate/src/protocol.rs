use serde::Deserialize;

use crate::error::RelayError;

/// Leading type tag of a client frame carrying raw terminal input.
pub const TAG_DATA: u8 = b'1';
/// Leading type tag of a client frame carrying a terminal geometry change.
pub const TAG_RESIZE: u8 = b'2';

/// One protocol unit decoded from the client side of the socket.
///
/// Server-to-client traffic is untagged binary (the browser treats everything
/// it receives as raw terminal bytes), so only the client-to-server direction
/// has a framed encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data(Vec<u8>),
    Resize { rows: u32, cols: u32 },
}

#[derive(Debug, Deserialize)]
struct ResizePayload {
    #[serde(default)]
    rows: i64,
    #[serde(default)]
    columns: i64,
}

/// Decode a raw client frame.
///
/// Returns `Ok(None)` for frames that are silently ignored: empty input and
/// unrecognized type tags (forward compatibility with newer clients). A resize
/// payload that fails to parse is a hard error; malformed input is not
/// recoverable mid-stream. Non-positive dimensions decode to zero and are
/// ignored by the relay instead of being applied.
pub fn decode(raw: &[u8]) -> Result<Option<Frame>, RelayError> {
    let Some((&tag, body)) = raw.split_first() else {
        return Ok(None);
    };
    match tag {
        TAG_DATA => Ok(Some(Frame::Data(body.to_vec()))),
        TAG_RESIZE => {
            let payload: ResizePayload = serde_json::from_slice(body)
                .map_err(|err| RelayError::Protocol(format!("bad resize payload: {err}")))?;
            Ok(Some(Frame::Resize {
                rows: payload.rows.max(0) as u32,
                cols: payload.columns.max(0) as u32,
            }))
        }
        _ => Ok(None),
    }
}

/// Encode a data frame the way terminal clients do. The server itself never
/// sends tagged frames.
#[cfg(test)]
pub fn encode_data(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 1);
    frame.push(TAG_DATA);
    frame.extend_from_slice(payload);
    frame
}

/// Encode a resize frame with the given geometry.
#[cfg(test)]
pub fn encode_resize(rows: u32, cols: u32) -> Vec<u8> {
    let mut frame = vec![TAG_RESIZE];
    frame.extend_from_slice(
        serde_json::json!({ "rows": rows, "columns": cols })
            .to_string()
            .as_bytes(),
    );
    frame
}
