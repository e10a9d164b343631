//! Presentation formats for file reads.

use std::fmt;

use thiserror::Error;

/// Errors that can occur while decoding file content.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid XML: {0}")]
    Xml(#[from] roxmltree::Error),

    #[error("content is not valid UTF-8")]
    NotUtf8(#[from] std::str::Utf8Error),
}

/// How a file's bytes should be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ReadFormat {
    /// UTF-8 text, invalid sequences replaced.
    #[default]
    Text,
    /// JSON document, pretty-printed.
    Json,
    /// XML document without DTD processing.
    Xml,
    /// Size only.
    Binary,
}

/// Decoded file content.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Text(String),
    Json(serde_json::Value),
    /// Serialized root element.
    Xml(String),
    Binary { len: usize },
}

impl fmt::Display for Decoded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) | Self::Xml(text) => f.write_str(text),
            Self::Json(value) => {
                let pretty = serde_json::to_string_pretty(value).map_err(|_| fmt::Error)?;
                f.write_str(&pretty)
            }
            Self::Binary { len } => write!(f, "Binary file, {len} bytes"),
        }
    }
}

/// Decode `bytes` according to `format`.
pub fn decode(bytes: &[u8], format: ReadFormat) -> Result<Decoded, DecodeError> {
    match format {
        ReadFormat::Text => Ok(Decoded::Text(String::from_utf8_lossy(bytes).into_owned())),
        ReadFormat::Json => Ok(Decoded::Json(serde_json::from_slice(bytes)?)),
        ReadFormat::Xml => {
            let text = std::str::from_utf8(bytes)?;
            // DTDs are refused, so no entity can expand.
            let options = roxmltree::ParsingOptions {
                allow_dtd: false,
                ..roxmltree::ParsingOptions::default()
            };
            let doc = roxmltree::Document::parse_with_options(text, options)?;
            let root = doc.root_element();
            Ok(Decoded::Xml(text[root.range()].to_string()))
        }
        ReadFormat::Binary => Ok(Decoded::Binary { len: bytes.len() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_replaces_invalid_utf8() {
        let decoded = decode(b"ok \xff done", ReadFormat::Text).unwrap();
        assert_eq!(decoded, Decoded::Text("ok \u{fffd} done".to_string()));
    }

    #[test]
    fn test_json_pretty_prints() {
        let decoded = decode(br#"{"a":1}"#, ReadFormat::Json).unwrap();
        assert_eq!(decoded.to_string(), "{\n  \"a\": 1\n}");
    }

    #[test]
    fn test_json_rejects_garbage() {
        assert!(matches!(
            decode(b"{not json", ReadFormat::Json),
            Err(DecodeError::Json(_))
        ));
    }

    #[test]
    fn test_xml_root_element() {
        let decoded = decode(
            b"<?xml version=\"1.0\"?>\n<note><to>Tove</to></note>\n",
            ReadFormat::Xml,
        )
        .unwrap();
        assert_eq!(decoded, Decoded::Xml("<note><to>Tove</to></note>".to_string()));
    }

    #[test]
    fn test_xml_rejects_dtd() {
        let bomb = br#"<?xml version="1.0"?>
<!DOCTYPE lolz [<!ENTITY lol "lol"><!ENTITY lol2 "&lol;&lol;&lol;">]>
<lolz>&lol2;</lolz>"#;
        assert!(matches!(
            decode(bomb, ReadFormat::Xml),
            Err(DecodeError::Xml(_))
        ));
    }

    #[test]
    fn test_binary_reports_length() {
        let decoded = decode(&[0, 1, 2, 3], ReadFormat::Binary).unwrap();
        assert_eq!(decoded.to_string(), "Binary file, 4 bytes");
    }

    #[test]
    fn test_read_format_value_names() {
        use clap::ValueEnum;

        assert_eq!(ReadFormat::from_str("json", false).unwrap(), ReadFormat::Json);
        assert_eq!(ReadFormat::from_str("BINARY", true).unwrap(), ReadFormat::Binary);
        assert!(ReadFormat::from_str("yaml", false).is_err());
    }
}
