//! PMC frame classification
//!
//! Every frame on the wire is a run of printable US-ASCII bytes terminated
//! by a carriage return. Content alone disambiguates the frame kind:
//! `ACK`, `ERR`, `ALERT`, or a `CODE=VALUE` getter response.

use super::PmcError;

/// A classified PMC frame, CR already stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Setter acknowledgement
    Ack,
    /// Command rejection
    Err,
    /// Unsolicited interrupt notification
    Alert,
    /// Getter response `CODE=VALUE`
    Response { code: String, value: String },
}

/// Classify one CR-stripped line.
///
/// Returns `Ok(None)` for empty lines (discarded silently). Bytes outside
/// printable US-ASCII make the frame malformed.
pub fn classify(line: &str) -> Result<Option<Frame>, PmcError> {
    let line = line.trim_matches(|c: char| c.is_ascii_whitespace());
    if line.is_empty() {
        return Ok(None);
    }

    if let Some(byte) = line.bytes().find(|b| !(0x20..=0x7e).contains(b)) {
        return Err(PmcError::FrameMalformed(format!(
            "non-printable byte 0x{:02x} in frame",
            byte
        )));
    }

    let frame = match line {
        "ACK" => Frame::Ack,
        "ERR" => Frame::Err,
        "ALERT" => Frame::Alert,
        _ => match line.split_once('=') {
            Some((code, value)) if !code.is_empty() => Frame::Response {
                code: code.trim().to_uppercase(),
                value: value.trim().to_string(),
            },
            _ => {
                return Err(PmcError::FrameMalformed(format!(
                    "unrecognized frame: {:?}",
                    line
                )))
            }
        },
    };

    Ok(Some(frame))
}
