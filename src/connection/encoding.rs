//! Text encodings for string reads and writes.

use bytes::Bytes;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum Encoding {
    #[default]
    Utf8,
    /// ISO-8859-1: every byte is the code point of the same value.
    Latin1,
    Ascii,
}

impl Encoding {
    pub fn decode(self, bytes: &[u8]) -> Result<String> {
        match self {
            Encoding::Utf8 => std::str::from_utf8(bytes)
                .map(str::to_owned)
                .map_err(|e| Error::Encoding(e.to_string())),
            Encoding::Latin1 => Ok(bytes.iter().map(|&b| char::from(b)).collect()),
            Encoding::Ascii => {
                if let Some(pos) = bytes.iter().position(|b| !b.is_ascii()) {
                    return Err(Error::Encoding(format!(
                        "non-ASCII byte 0x{:02x} at offset {pos}",
                        bytes[pos]
                    )));
                }
                Ok(bytes.iter().map(|&b| char::from(b)).collect())
            }
        }
    }

    pub fn encode(self, text: &str) -> Result<Bytes> {
        match self {
            Encoding::Utf8 => Ok(Bytes::copy_from_slice(text.as_bytes())),
            Encoding::Latin1 => text
                .chars()
                .map(|c| {
                    u8::try_from(u32::from(c))
                        .map_err(|_| Error::Encoding(format!("{c:?} is not representable in Latin-1")))
                })
                .collect::<Result<Vec<u8>>>()
                .map(Bytes::from),
            Encoding::Ascii => {
                if let Some(c) = text.chars().find(|c| !c.is_ascii()) {
                    return Err(Error::Encoding(format!("{c:?} is not ASCII")));
                }
                Ok(Bytes::copy_from_slice(text.as_bytes()))
            }
        }
    }
}

impl FromStr for Encoding {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" => Ok(Encoding::Utf8),
            "iso-8859-1" | "latin-1" | "latin1" => Ok(Encoding::Latin1),
            "ascii" | "us-ascii" => Ok(Encoding::Ascii),
            other => Err(format!("unknown encoding: {other}")),
        }
    }
}

impl TryFrom<String> for Encoding {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Encoding::Utf8 => "UTF-8",
            Encoding::Latin1 => "ISO-8859-1",
            Encoding::Ascii => "US-ASCII",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latin1_maps_bytes_to_code_points() {
        let text = Encoding::Latin1.decode(&[0x68, 0xe9]).unwrap();
        assert_eq!(text, "hé");
        assert_eq!(&Encoding::Latin1.encode("hé").unwrap()[..], &[0x68, 0xe9]);
        assert!(Encoding::Latin1.encode("€").is_err());
    }

    #[test]
    fn test_invalid_input_is_an_encoding_error() {
        assert!(matches!(
            Encoding::Utf8.decode(&[0xff, 0xfe]),
            Err(Error::Encoding(_))
        ));
        assert!(matches!(Encoding::Ascii.decode(b"ok\x80"), Err(Error::Encoding(_))));
        assert!(matches!(Encoding::Ascii.encode("ü"), Err(Error::Encoding(_))));
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("UTF-8".parse::<Encoding>().unwrap(), Encoding::Utf8);
        assert_eq!("iso-8859-1".parse::<Encoding>().unwrap(), Encoding::Latin1);
        assert_eq!("US-ASCII".parse::<Encoding>().unwrap(), Encoding::Ascii);
        assert!("ebcdic".parse::<Encoding>().is_err());
    }
}
