//! Conversions between setting values and their string representation.
//!
//! Integers are parsed like C's `strtol` with base 0: optional leading whitespace and sign,
//! `0x` for hexadecimal, a leading `0` for octal. A value of width N bits is accepted in the
//! range `-2^(N-1) ..= 2^N - 1`, so both the signed and the unsigned reading of a bit pattern
//! parse. Booleans are `0` or `1`, byte arrays are base64.

use crate::error::Error;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;

pub trait FromValue: Sized {
    fn from_value(value: &str) -> Result<Self, Error>;
}

pub trait ToValue {
    fn to_value(&self) -> String;
}

/// Parses a value handed to a setter. `None` marks a deleted setting and is rejected.
pub fn parse<T: FromValue>(value: Option<&str>) -> Result<T, Error> {
    T::from_value(value.ok_or(Error::InvalidValue)?)
}

pub fn to_value<T: ToValue + ?Sized>(value: &T) -> String {
    value.to_value()
}

fn parse_integer(value: &str) -> Result<i128, Error> {
    let s = value.trim_start();
    let (negative, s) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };

    let (radix, digits) = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"))
    {
        (16, hex)
    } else if s.len() > 1 && s.starts_with('0') {
        (8, &s[1..])
    } else {
        (10, s)
    };

    // from_str_radix would accept another sign here
    if digits.is_empty() || !digits.bytes().all(|b| (b as char).is_digit(radix)) {
        return Err(Error::InvalidValue);
    }
    let magnitude = i128::from_str_radix(digits, radix).map_err(|_| Error::InvalidValue)?;
    Ok(if negative { -magnitude } else { magnitude })
}

macro_rules! impl_integer {
    ($($signed:ty, $unsigned:ty);*) => {
        $(
            impl FromValue for $signed {
                fn from_value(value: &str) -> Result<Self, Error> {
                    let v = parse_integer(value)?;
                    if v < <$signed>::MIN as i128 || v > <$unsigned>::MAX as i128 {
                        return Err(Error::InvalidValue);
                    }
                    Ok(v as $unsigned as $signed)
                }
            }

            impl FromValue for $unsigned {
                fn from_value(value: &str) -> Result<Self, Error> {
                    let v = parse_integer(value)?;
                    if v < <$signed>::MIN as i128 || v > <$unsigned>::MAX as i128 {
                        return Err(Error::InvalidValue);
                    }
                    Ok(v as $signed as $unsigned)
                }
            }

            impl ToValue for $signed {
                fn to_value(&self) -> String {
                    self.to_string()
                }
            }

            impl ToValue for $unsigned {
                fn to_value(&self) -> String {
                    self.to_string()
                }
            }
        )*
    };
}

impl_integer!(i8, u8; i16, u16; i32, u32; i64, u64);

impl FromValue for bool {
    fn from_value(value: &str) -> Result<Self, Error> {
        match parse_integer(value)? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(Error::InvalidValue),
        }
    }
}

impl ToValue for bool {
    fn to_value(&self) -> String {
        String::from(if *self { "1" } else { "0" })
    }
}

impl FromValue for String {
    fn from_value(value: &str) -> Result<Self, Error> {
        Ok(String::from(value))
    }
}

impl ToValue for str {
    fn to_value(&self) -> String {
        String::from(self)
    }
}

impl ToValue for String {
    fn to_value(&self) -> String {
        self.clone()
    }
}

/// Decodes a base64 value into at most `max_len` bytes.
pub fn bytes_from_value(value: &str, max_len: usize) -> Result<Vec<u8>, Error> {
    let bytes = STANDARD
        .decode(value.trim())
        .map_err(|_| Error::InvalidValue)?;
    if bytes.len() > max_len {
        return Err(Error::ValueTooLong);
    }
    Ok(bytes)
}

pub fn value_from_bytes(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}
