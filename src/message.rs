//! Wire messages
//!
//! Every message on the wire is a big-endian u32 length prefix (counting
//! itself) followed by UTF-8 text. The text splits at the first blank line
//! into a header block of `key: value` lines and an optional payload.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use crate::error::{Error, Result};

/// Separator between the header block and the payload.
const SEPARATOR: &str = "\n\n";

/// Response status texts, by code.
pub fn status_text(code: &str) -> &'static str {
    match code {
        // 2xx success
        "200" => "Ok",
        "201" => "No change",
        "202" => "Decline",
        // 3xx partial success
        "300" => "Deprecated request type",
        "301" => "Redirect",
        "302" => "Retry",
        // 4xx client error
        "400" => "Malformed data",
        "401" => "Unsupported encoding",
        "420" => "Server temporarily unavailable",
        "430" => "Access denied",
        "431" => "Account suspended",
        "432" => "Account terminated",
        // 5xx server error
        "500" => "Syntax error in request",
        "501" => "Syntax error, illegal parameters",
        "502" => "Not implemented",
        "503" => "Command parameter not implemented",
        "504" => "Request too big",
        _ => "Unknown",
    }
}

/// A request or response message.
///
/// Header ordering is irrelevant on the wire; a sorted map keeps
/// serialization deterministic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    pub header: BTreeMap<String, String>,
    pub payload: String,
}

impl Message {
    /// Parse the text body of a frame.
    pub fn parse(raw: &str) -> Result<Self> {
        let Some((header_block, payload)) = raw.split_once(SEPARATOR) else {
            return Err(Error::Malformed("Message separator not found".into()));
        };

        let mut header = BTreeMap::new();
        for line in header_block.split('\n') {
            let Some((key, value)) = line.split_once(": ") else {
                return Err(Error::Malformed(format!(
                    "error parsing header entry: {line:?}"
                )));
            };
            header.insert(key.to_string(), value.to_string());
        }

        Ok(Self {
            header,
            payload: payload.to_string(),
        })
    }

    /// A response carrying only `type`, `code` and `status` headers.
    pub fn response(code: &str, status: impl Into<String>) -> Self {
        let mut header = BTreeMap::new();
        header.insert("type".into(), "response".into());
        header.insert("code".into(), code.into());
        header.insert("status".into(), status.into());
        Self {
            header,
            payload: String::new(),
        }
    }

    /// A response for a failed request, using the error's wire code.
    pub fn error_response(err: &Error) -> Self {
        Self::response(err.response_code(), err.to_string())
    }

    pub fn get(&self, key: &str) -> &str {
        self.header.get(key).map(String::as_str).unwrap_or("")
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.header.insert(key.into(), value.into());
    }

    fn text(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.header {
            out.push_str(key);
            out.push_str(": ");
            out.push_str(value);
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.payload);
        out
    }

    /// Serialize to a length-prefixed frame.
    pub fn serialize(&self) -> Vec<u8> {
        let text = self.text();
        let size = (text.len() + 4) as u32;
        let mut buffer = Vec::with_capacity(text.len() + 4);
        buffer.extend_from_slice(&size.to_be_bytes());
        buffer.extend_from_slice(text.as_bytes());
        buffer
    }

    /// Read one framed message. Partial reads are retried until the whole
    /// frame is consumed; a short read mid-frame is an error, not EOF.
    pub fn read(reader: &mut impl Read, limit: usize) -> Result<Self> {
        let mut prefix = [0u8; 4];
        reader.read_exact(&mut prefix)?;

        let size = u32::from_be_bytes(prefix) as usize;
        if size > limit {
            return Err(Error::RequestTooBig { size, limit });
        }
        if size < 4 {
            return Err(Error::Malformed(format!("short frame: {size} bytes")));
        }

        let mut body = vec![0u8; size - 4];
        reader.read_exact(&mut body)?;

        let text = String::from_utf8(body)
            .map_err(|_| Error::Malformed("frame is not valid UTF-8".into()))?;
        Self::parse(&text)
    }

    /// Write the message as a single framed write.
    pub fn write(&self, writer: &mut impl Write) -> Result<()> {
        writer.write_all(&self.serialize())?;
        writer.flush()?;
        Ok(())
    }
}
