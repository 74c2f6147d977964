// Line codec for dump files: base64(key) SEPARATOR base64(value), one record per line.
use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::core::error::{ApiResult, Error, ErrorKind};

/// Field separator. U+0001 never appears in standard base64 output.
pub const SEPARATOR: char = '\u{1}';

/// One key and its opaque serialized value as produced by the store.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct KeyData {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl KeyData {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// A record for `key` whose value could not be fetched.
    pub fn empty(key: impl Into<Vec<u8>>) -> Self {
        Self::new(key, Vec::new())
    }
}

/// Encode a record without the line terminator.
pub fn encode(data: &KeyData) -> String {
    let key = STANDARD.encode(&data.key);
    let value = STANDARD.encode(&data.value);
    let mut line = String::with_capacity(key.len() + value.len() + 1);
    line.push_str(&key);
    line.push(SEPARATOR);
    line.push_str(&value);
    line
}

/// Decode one record. The input must not carry its line terminator.
pub fn decode(line: &str) -> ApiResult<KeyData> {
    let mut parts = line.split(SEPARATOR);
    let (Some(key), Some(value), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(Error::new(ErrorKind::Format)
            .with_message("record must contain exactly one key and one value"));
    };
    let key = STANDARD.decode(key).map_err(|err| {
        Error::new(ErrorKind::Format)
            .with_message("key is not valid base64")
            .with_source(err)
    })?;
    let value = STANDARD.decode(value).map_err(|err| {
        Error::new(ErrorKind::Format)
            .with_message("value is not valid base64")
            .with_source(err)
    })?;
    Ok(KeyData { key, value })
}
