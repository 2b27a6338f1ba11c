//! DNS TXT record payloads: a run of attribute records, each one length
//! byte followed by that many bytes of `key=value` or a bare `key`.

use thiserror::Error;
use crate::protocol::MAX_TXT_RECORD_LEN;

/// A length byte pointed past the end of the buffer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("TXT record at offset {offset} declares {declared} bytes but only {remaining} remain")]
pub struct TxtDecodeError {
    pub offset: usize,
    pub declared: usize,
    pub remaining: usize,
    /// Tokens decoded before the bad record
    pub partial: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TxtEncodeError {
    #[error("TXT record for key '{key}' is {len} bytes, limit is 255")]
    LengthExceeded { key: String, len: usize },
}

/// Decode a TXT payload into tokens, in record order.
pub fn decode(bytes: &[u8]) -> Result<Vec<String>, TxtDecodeError> {
    let mut tokens = Vec::new();
    let mut offset = 0;

    while offset < bytes.len() {
        let declared = bytes[offset] as usize;
        let start = offset + 1;
        let remaining = bytes.len() - start;
        if declared > remaining {
            return Err(TxtDecodeError {
                offset,
                declared,
                remaining,
                partial: tokens,
            });
        }

        let record = &bytes[start..start + declared];
        tokens.push(decode_record(record));
        offset = start + declared;
    }

    Ok(tokens)
}

fn decode_record(record: &[u8]) -> String {
    match record.iter().position(|&b| b == b'=') {
        Some(eq) => format!(
            "{}={}",
            String::from_utf8_lossy(&record[..eq]),
            String::from_utf8_lossy(&record[eq + 1..])
        ),
        None => String::from_utf8_lossy(record).into_owned(),
    }
}

/// Encode key/value pairs in iteration order. An empty value is written as a
/// bare key so it decodes back to a boolean token.
pub fn encode<I, K, V>(records: I) -> Result<Vec<u8>, TxtEncodeError>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut buf = Vec::new();
    for (key, value) in records {
        let (key, value) = (key.as_ref(), value.as_ref());
        let record = if value.is_empty() {
            key.to_string()
        } else {
            format!("{}={}", key, value)
        };
        push_record(&mut buf, record.as_bytes()).map_err(|len| TxtEncodeError::LengthExceeded {
            key: key.to_string(),
            len,
        })?;
    }
    Ok(buf)
}

/// Append one raw attribute record. On overflow the buffer is left untouched
/// and the offending length is returned.
pub fn push_record(buf: &mut Vec<u8>, record: &[u8]) -> Result<(), usize> {
    if record.len() > MAX_TXT_RECORD_LEN {
        return Err(record.len());
    }
    buf.push(record.len() as u8);
    buf.extend_from_slice(record);
    Ok(())
}

/// Split decoded tokens into key/value pairs. Bare tokens get an empty value.
pub fn to_pairs(tokens: &[String]) -> Vec<(String, String)> {
    tokens
        .iter()
        .map(|token| match token.split_once('=') {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => (token.clone(), String::new()),
        })
        .collect()
}
