//! Transparent decryption of envelope encrypted documents.
//!
//! A document is considered encrypted when it has a top level `sops` mapping holding a `mac`
//! or `lastmodified` entry. The marker is only detected, never verified: the [`Decryptor`]
//! is responsible for checking integrity.
use std::{
    io::Write,
    process::{Command, Stdio},
};

use snafu::{ResultExt, Snafu, ensure};
use strum::{AsRefStr, Display};

const ENVELOPE_KEY: &str = "sops";
const ENVELOPE_MARKERS: &[&str] = &["mac", "lastmodified"];

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to spawn decryptor {program:?}"))]
    SpawnDecryptor {
        source: std::io::Error,
        program: String,
    },

    #[snafu(display("failed to pass the document to decryptor {program:?}"))]
    WriteDecryptorInput {
        source: std::io::Error,
        program: String,
    },

    #[snafu(display("decryptor {program:?} failed with {status}: {stderr}"))]
    DecryptorFailed {
        program: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[snafu(display("the document is encrypted, but no decryptor is configured"))]
    DecryptorUnavailable,
}

/// The serialization format of the document handed to a [`Decryptor`].
#[derive(Clone, Copy, Debug, Display, AsRefStr, PartialEq, Eq)]
#[strum(serialize_all = "lowercase")]
pub enum DocumentFormat {
    Yaml,
    Json,
}

impl DocumentFormat {
    /// JSON documents are objects, everything else is read as YAML.
    pub fn detect(input: &[u8]) -> Self {
        match input.iter().find(|byte| !byte.is_ascii_whitespace()) {
            Some(b'{') => Self::Json,
            _ => Self::Yaml,
        }
    }
}

/// Decrypts envelope encrypted documents.
pub trait Decryptor {
    fn decrypt(&self, input: &[u8], format: DocumentFormat) -> Result<Vec<u8>, Error>;
}

/// Decrypts using the `sops` binary, which must be on the `PATH`.
#[derive(Clone, Debug)]
pub struct SopsDecryptor {
    program: String,
}

impl Default for SopsDecryptor {
    fn default() -> Self {
        Self {
            program: "sops".to_owned(),
        }
    }
}

impl SopsDecryptor {
    /// Uses `program` instead of looking up `sops` on the `PATH`.
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Decryptor for SopsDecryptor {
    fn decrypt(&self, input: &[u8], format: DocumentFormat) -> Result<Vec<u8>, Error> {
        let program = &self.program;
        tracing::debug!(%program, %format, "decrypting document");

        let mut child = Command::new(program)
            .args([
                "--decrypt",
                "--input-type",
                format.as_ref(),
                "--output-type",
                format.as_ref(),
                "/dev/stdin",
            ])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context(SpawnDecryptorSnafu { program })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(input)
                .context(WriteDecryptorInputSnafu { program })?;
        }

        let output = child
            .wait_with_output()
            .context(WriteDecryptorInputSnafu { program })?;
        ensure!(
            output.status.success(),
            DecryptorFailedSnafu {
                program,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            }
        );

        Ok(output.stdout)
    }
}

/// A [`Decryptor`] for runs that never expect encrypted input.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoDecryptor;

impl Decryptor for NoDecryptor {
    fn decrypt(&self, _input: &[u8], _format: DocumentFormat) -> Result<Vec<u8>, Error> {
        DecryptorUnavailableSnafu.fail()
    }
}

/// Whether `input` carries an encryption envelope. Input which can not be parsed is treated as
/// not encrypted, the parse error surfaces later in the pipeline.
pub fn is_encrypted(input: &[u8]) -> bool {
    let Ok(document) = serde_yaml::from_slice::<serde_yaml::Value>(input) else {
        return false;
    };

    document
        .get(ENVELOPE_KEY)
        .and_then(serde_yaml::Value::as_mapping)
        .is_some_and(|envelope| {
            ENVELOPE_MARKERS
                .iter()
                .any(|marker| envelope.contains_key(*marker))
        })
}

/// Decrypts `input` if it is encrypted, returns it unchanged otherwise.
pub fn unwrap(input: Vec<u8>, decryptor: &dyn Decryptor) -> Result<Vec<u8>, Error> {
    if !is_encrypted(&input) {
        return Ok(input);
    }

    decryptor.decrypt(&input, DocumentFormat::detect(&input))
}

#[cfg(test)]
pub(crate) mod tests {
    use indoc::indoc;
    use rstest::rstest;

    use super::*;

    /// Replaces every encrypted document by a fixed plaintext.
    pub(crate) struct FixedDecryptor(pub &'static str);

    impl Decryptor for FixedDecryptor {
        fn decrypt(&self, _input: &[u8], _format: DocumentFormat) -> Result<Vec<u8>, Error> {
            Ok(self.0.as_bytes().to_vec())
        }
    }

    const ENCRYPTED: &str = indoc! {"
        clusterName: ENC[AES256_GCM,data:abc,type:str]
        sops:
          mac: ENC[AES256_GCM,data:def,type:str]
          lastmodified: '2024-01-01T00:00:00Z'
          version: 3.9.0
    "};

    #[rstest]
    #[case(ENCRYPTED, true)]
    #[case("sops:\n  lastmodified: x\n", true)]
    #[case("clusterName: lab\n", false)]
    #[case("sops: not-a-mapping\n", false)]
    #[case("sops:\n  version: 3.9.0\n", false)]
    #[case("nested:\n  sops:\n    mac: x\n", false)]
    #[case("{ this is: [not yaml", false)]
    #[case("- a\n- b\n", false)]
    fn detects_envelope(#[case] input: &str, #[case] expected: bool) {
        assert_eq!(is_encrypted(input.as_bytes()), expected);
    }

    #[test]
    fn plaintext_passes_through() {
        let input = b"clusterName: lab\n".to_vec();
        let output = unwrap(input.clone(), &NoDecryptor).unwrap();
        assert_eq!(output, input);
    }

    #[test]
    fn encrypted_is_decrypted() {
        let output = unwrap(
            ENCRYPTED.as_bytes().to_vec(),
            &FixedDecryptor("clusterName: lab\n"),
        )
        .unwrap();
        assert_eq!(output, b"clusterName: lab\n");
    }

    /// Answers with the name of the format it was asked to decrypt.
    struct FormatEcho;

    impl Decryptor for FormatEcho {
        fn decrypt(&self, _input: &[u8], format: DocumentFormat) -> Result<Vec<u8>, Error> {
            Ok(format.to_string().into_bytes())
        }
    }

    #[rstest]
    #[case(ENCRYPTED, "yaml")]
    #[case("\n  {\"clusterName\": \"ENC[x]\", \"sops\": {\"mac\": \"ENC[y]\"}}\n", "json")]
    fn decrypts_in_the_detected_format(#[case] input: &str, #[case] expected: &str) {
        let output = unwrap(input.as_bytes().to_vec(), &FormatEcho).unwrap();
        assert_eq!(output, expected.as_bytes());
    }

    #[test]
    fn encrypted_without_decryptor_fails() {
        let error = unwrap(ENCRYPTED.as_bytes().to_vec(), &NoDecryptor).unwrap_err();
        assert!(matches!(error, Error::DecryptorUnavailable));
    }

    #[test]
    fn missing_sops_binary_fails() {
        let decryptor = SopsDecryptor::with_program("/nonexistent/sops");
        let error = unwrap(ENCRYPTED.as_bytes().to_vec(), &decryptor).unwrap_err();
        assert!(matches!(error, Error::SpawnDecryptor { .. }));
    }
}
