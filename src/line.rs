//! `name=value` records shared by all stores.

use crate::error::Error;
use crate::name::MAX_NAME_LEN;
use alloc::string::String;

/// Maximum length of a value in bytes.
pub const MAX_VAL_LEN: usize = 256;

/// Builds the record for a setting. A deleted setting (`None`) is stored with an empty value.
pub fn make_line(name: &str, value: Option<&str>) -> Result<String, Error> {
    if name.is_empty() || name.contains('=') || name.contains('\n') {
        return Err(Error::MalformedLine);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(Error::NameTooLong);
    }
    let value = value.unwrap_or("");
    if value.len() > MAX_VAL_LEN {
        return Err(Error::ValueTooLong);
    }
    if value.contains('\n') {
        return Err(Error::MalformedLine);
    }

    let mut line = String::with_capacity(name.len() + 1 + value.len());
    line.push_str(name);
    line.push('=');
    line.push_str(value);
    Ok(line)
}

/// Splits a record at the first `=`. Whitespace around name and value is ignored, an empty
/// value yields `None`.
pub fn parse_line(line: &str) -> Result<(&str, Option<&str>), Error> {
    let (name, value) = line.split_once('=').ok_or(Error::MalformedLine)?;
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::MalformedLine);
    }
    let value = value.trim();
    Ok((name, (!value.is_empty()).then_some(value)))
}

/// Name of a record, used as the compaction key.
pub(crate) fn line_name(entry: &[u8]) -> Option<&[u8]> {
    let line = core::str::from_utf8(entry).ok()?;
    parse_line(line).ok().map(|(name, _)| name.as_bytes())
}
