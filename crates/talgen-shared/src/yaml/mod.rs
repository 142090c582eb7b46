//! Utility functions for processing data in the YAML file format
//!
//! All documents produced here are serialized by [`serde_yaml`]: nested mappings are indented by
//! two spaces, sequences start at the indentation of their parent key. Comments and the original
//! formatting of parsed input are not preserved, values are.
use std::io::Write;

use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

const DOCUMENT_SEPARATOR: &[u8] = b"---\n";

type Result<T, E = Error> = std::result::Result<T, E>;

/// Represents every error which can be encountered during YAML (de)serialization.
#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to serialize YAML"))]
    SerializeYaml { source: serde_yaml::Error },

    #[snafu(display("failed to deserialize YAML document #{index}"))]
    DeserializeDocument {
        source: serde_yaml::Error,
        index: usize,
    },

    #[snafu(display("failed to write YAML document separator"))]
    WriteDocumentSeparator { source: std::io::Error },

    #[snafu(display("failed to parse bytes as valid UTF-8 string"))]
    ParseUtf8Bytes { source: std::string::FromUtf8Error },
}

/// Provides configurable options during YAML serialization.
///
/// For most people the default implementation [`SerializeOptions::default()`] is sufficient as it
/// emits an explicit document.
#[derive(Clone, Copy, Debug)]
pub struct SerializeOptions {
    /// Adds leading triple dashes (`---`) to the output string.
    pub explicit_document: bool,
}

impl Default for SerializeOptions {
    fn default() -> Self {
        Self {
            explicit_document: true,
        }
    }
}

/// Serializes the given data structure and writes it to a [`Writer`](Write).
pub fn serialize<T, W>(value: &T, mut writer: W, options: SerializeOptions) -> Result<()>
where
    T: Serialize,
    W: Write,
{
    if options.explicit_document {
        writer
            .write_all(DOCUMENT_SEPARATOR)
            .context(WriteDocumentSeparatorSnafu)?;
    }

    let mut serializer = serde_yaml::Serializer::new(writer);
    value
        .serialize(&mut serializer)
        .context(SerializeYamlSnafu)?;

    Ok(())
}

/// Serializes `value` into a [`String`] using the provided [`SerializeOptions`].
pub fn to_string<T: Serialize>(value: &T, options: SerializeOptions) -> Result<String> {
    let mut buffer = Vec::new();
    serialize(value, &mut buffer, options)?;
    String::from_utf8(buffer).context(ParseUtf8BytesSnafu)
}

/// Serializes multiple documents into one YAML stream.
///
/// The first document is written without a leading separator, every following document is
/// preceded by `---`.
pub fn serialize_documents<T, W>(documents: &[T], mut writer: W) -> Result<()>
where
    T: Serialize,
    W: Write,
{
    for (index, document) in documents.iter().enumerate() {
        serialize(
            document,
            &mut writer,
            SerializeOptions {
                explicit_document: index > 0,
            },
        )?;
    }

    Ok(())
}

/// Parses a (possibly multi-document) YAML stream into generic JSON values.
///
/// Empty documents (for example a trailing `---`) are skipped.
pub fn parse_documents(input: impl AsRef<str>) -> Result<Vec<serde_json::Value>> {
    let mut documents = Vec::new();

    for (index, document) in serde_yaml::Deserializer::from_str(input.as_ref()).enumerate() {
        let value =
            serde_json::Value::deserialize(document).context(DeserializeDocumentSnafu { index })?;
        if !value.is_null() {
            documents.push(value);
        }
    }

    Ok(documents)
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use serde_json::json;

    use super::*;

    #[test]
    fn explicit_document() {
        let value = json!({ "machine": { "type": "worker" } });
        let output = to_string(&value, SerializeOptions::default()).unwrap();

        assert_eq!(output, "---\nmachine:\n  type: worker\n");
    }

    #[test]
    fn nested_layout() {
        let value = json!({ "machine": { "certSANs": ["10.0.0.1", "cp.lab"] } });
        let output = to_string(&value, SerializeOptions { explicit_document: false }).unwrap();

        assert_eq!(output, "machine:\n  certSANs:\n  - 10.0.0.1\n  - cp.lab\n");
    }

    #[test]
    fn multiple_documents() {
        let documents = vec![json!({ "version": "v1alpha1" }), json!({ "kind": "Volume" })];
        let mut buffer = Vec::new();
        serialize_documents(&documents, &mut buffer).unwrap();

        assert_eq!(
            String::from_utf8(buffer).unwrap(),
            "version: v1alpha1\n---\nkind: Volume\n"
        );
    }

    #[test]
    fn reencoded_documents_keep_values() {
        let input = indoc! {"
            # comments are lost
            machine:
              network:
                hostname: cp-1
                interfaces:
                  - interface: eth0
                    mtu: 9000
                    dhcp: true
            ---
            kind: UserVolumeConfig
            name: data
        "};

        let documents = parse_documents(input).unwrap();
        assert_eq!(documents.len(), 2);

        let mut buffer = Vec::new();
        serialize_documents(&documents, &mut buffer).unwrap();
        let reparsed = parse_documents(String::from_utf8(buffer).unwrap()).unwrap();

        assert_eq!(documents, reparsed);
    }

    #[test]
    fn empty_documents_are_skipped() {
        let documents = parse_documents("a: 1\n---\n").unwrap();
        assert_eq!(documents, vec![json!({ "a": 1 })]);
    }
}
