use crate::{RedirError, RedirResult};

/// Guest-supplied path after wire validation. The raw form is a u16
/// little-endian byte length followed by UTF-8 data, optionally
/// zero-terminated. Both `/` and `\` are accepted as separators; translation
/// into a host path happens later and exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestPath(String);

impl GuestPath {
    /// Decode the length-prefixed wire form. Malformed framing, interior NUL
    /// bytes and invalid UTF-8 are all rejected as InvalidPath before any
    /// host call is made.
    pub fn from_wire(raw: &[u8]) -> RedirResult<Self> {
        if raw.len() < 2 {
            return Err(RedirError::InvalidPath(
                "path shorter than length prefix".to_string(),
            ));
        }
        let declared = u16::from_le_bytes([raw[0], raw[1]]) as usize;
        let payload = &raw[2..];
        if declared != payload.len() {
            return Err(RedirError::InvalidPath(format!(
                "length prefix {} does not match payload size {}",
                declared,
                payload.len()
            )));
        }
        // A single terminating NUL is tolerated, interior NULs are not.
        let payload = match payload.split_last() {
            Some((&0, rest)) => rest,
            _ => payload,
        };
        if payload.contains(&0) {
            return Err(RedirError::InvalidPath(
                "embedded NUL in path".to_string(),
            ));
        }
        let text = std::str::from_utf8(payload)
            .map_err(|e| RedirError::InvalidPath(format!("invalid UTF-8 in path: {}", e)))?;
        Ok(Self(text.to_string()))
    }

    /// Build directly from a string, applying the same NUL check. Used by
    /// in-process callers that never went through the wire.
    pub fn new(path: impl Into<String>) -> RedirResult<Self> {
        let path = path.into();
        if path.contains('\0') {
            return Err(RedirError::InvalidPath(
                "embedded NUL in path".to_string(),
            ));
        }
        Ok(Self(path))
    }

    /// Encode into the wire form, for transports and tests.
    pub fn to_wire(&self) -> Vec<u8> {
        let bytes = self.0.as_bytes();
        let mut out = Vec::with_capacity(bytes.len() + 2);
        out.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
        out.extend_from_slice(bytes);
        out
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path components with empty and `.` segments dropped. Leading
    /// separators therefore read as root-relative, matching guest usage.
    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0
            .split(|c| c == '/' || c == '\\')
            .filter(|c| !c.is_empty() && *c != ".")
    }
}

impl std::fmt::Display for GuestPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
