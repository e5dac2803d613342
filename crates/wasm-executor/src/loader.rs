//! Module loading: encoding detection and custom-section lookup.
//!
//! A module buffer may arrive in either the canonical binary encoding,
//! recognised by its 4-byte magic prefix, or in the textual surface syntax.
//! Both are normalised here to the canonical binary, which the adapter
//! retains for the lifetime of the instance so that custom sections can be
//! inspected after instantiation.
//!
//! ## Authors
//!
//! The Wasm Executor Development Team.
//!
//! ## Licensing and copyright notice
//!
//! See the `LICENSE.md` file in the repository root directory for
//! information on licensing and copyright.

use anyhow::{anyhow, Context, Result};
use wasmparser::{Parser, Payload};

/// The magic prefix of a binary-encoded module: `\0asm`.
const WASM_MAGIC: [u8; 4] = [0x00, 0x61, 0x73, 0x6d];

/// The name of the custom section holding a precompiled object blob.
///
/// The blob's internal format is owned by the execution runtime; the adapter
/// treats it as an opaque cache hint.
pub const PRECOMPILED_SECTION_NAME: &str = "wasm-executor.precompiled";

/// Returns whether the buffer starts with the binary-encoding magic prefix.
#[inline]
pub(crate) fn is_binary_module(bytes: &[u8]) -> bool {
    bytes.len() >= WASM_MAGIC.len() && bytes[..WASM_MAGIC.len()] == WASM_MAGIC
}

/// Normalises a module buffer to the canonical binary encoding.
///
/// A buffer with the binary magic prefix is passed through unchanged
/// (validation happens later, at compilation).  Anything else is parsed as
/// the textual surface syntax.  Malformed input in either form is a
/// recoverable error for the caller to report.
pub(crate) fn canonicalize_module(bytes: &[u8]) -> Result<Vec<u8>> {
    if is_binary_module(bytes) {
        return Ok(bytes.to_vec());
    }
    let text = std::str::from_utf8(bytes)
        .map_err(|_| anyhow!("module is neither binary-encoded nor valid text"))?;
    let binary = wat::parse_str(text).context("failed to parse textual module")?;
    Ok(binary)
}

/// Looks up a named custom section in a binary-encoded module.
///
/// Returns `None` when the section is absent, which is a routine outcome and
/// not an error.  A scan error in an otherwise-accepted module also yields
/// `None`.
pub(crate) fn custom_section<'a>(binary: &'a [u8], name: &str) -> Option<&'a [u8]> {
    for payload in Parser::new(0).parse_all(binary) {
        match payload {
            Ok(Payload::CustomSection(section)) if section.name() == name => {
                return Some(section.data());
            }
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Appends a custom section with the given name and contents to a
    /// binary-encoded module.
    pub(crate) fn append_custom_section(mut binary: Vec<u8>, name: &str, data: &[u8]) -> Vec<u8> {
        fn write_leb128(out: &mut Vec<u8>, mut value: u64) {
            loop {
                let byte = (value & 0x7f) as u8;
                value >>= 7;
                if value == 0 {
                    out.push(byte);
                    return;
                }
                out.push(byte | 0x80);
            }
        }

        let mut payload = Vec::new();
        write_leb128(&mut payload, name.len() as u64);
        payload.extend_from_slice(name.as_bytes());
        payload.extend_from_slice(data);

        binary.push(0); // custom section id
        write_leb128(&mut binary, payload.len() as u64);
        binary.extend_from_slice(&payload);
        binary
    }

    #[test]
    fn binary_modules_are_recognised_by_magic() {
        assert!(is_binary_module(b"\0asm\x01\0\0\0"));
        assert!(!is_binary_module(b"(module)"));
        assert!(!is_binary_module(b"\0as"));
    }

    #[test]
    fn text_modules_are_normalised_to_binary() {
        let binary = canonicalize_module(b"(module)").unwrap();
        assert!(is_binary_module(&binary));
    }

    #[test]
    fn malformed_input_is_a_recoverable_error() {
        assert!(canonicalize_module(b"(module").is_err());
        assert!(canonicalize_module(&[0xff, 0xfe, 0xfd]).is_err());
    }

    #[test]
    fn custom_sections_are_found_by_name() {
        let binary = canonicalize_module(b"(module)").unwrap();
        let binary = append_custom_section(binary, "metadata", b"hello");
        assert_eq!(custom_section(&binary, "metadata"), Some(&b"hello"[..]));
        assert_eq!(custom_section(&binary, "absent"), None);
    }
}
