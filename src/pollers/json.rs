//! JSON decoding for feed responses with path-aware error messages.

use anyhow::Result;
use serde::de::DeserializeOwned;

/// Decode `body`, reporting the JSON path and a short excerpt around the
/// failure point when the payload does not match `T`.
pub fn decode_json<T: DeserializeOwned>(body: &str) -> Result<T> {
    let deserializer = &mut serde_json::Deserializer::from_str(body);
    serde_path_to_error::deserialize(deserializer).map_err(|err| {
        let inner = err.inner();
        let (line, column) = (inner.line(), inner.column());
        let path = err.path().to_string();

        let message = inner.to_string();
        let suffix = format!(" at line {line} column {column}");
        let message = message.strip_suffix(&suffix).unwrap_or(&message);

        let location = if path.is_empty() || path == "." {
            String::new()
        } else {
            format!("at path '{path}': ")
        };
        anyhow::anyhow!(
            "{location}{message} (line {line} col {column}) near `{}`",
            excerpt(body, line, column, 24)
        )
    })
}

fn excerpt(body: &str, line: usize, column: usize, width: usize) -> String {
    let Some(text) = body.lines().nth(line.saturating_sub(1)) else {
        return String::new();
    };
    let chars: Vec<char> = text.chars().collect();
    let at = column.saturating_sub(1).min(chars.len());
    let start = at.saturating_sub(width / 2);
    let end = (at + width / 2).min(chars.len());
    chars[start..end].iter().collect::<String>().trim().to_owned()
}
