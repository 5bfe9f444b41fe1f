//! Deterministic JSON canonicalization for hashing and signing.
//!
//! Every byte string that is hashed or signed in the governance log flows
//! through this module. The canonical form follows RFC 8785 (JCS) restricted
//! to a closed value grammar:
//!
//! - Objects with string keys, arrays, strings, booleans, null
//! - Integers within the safe range `[-2^53, 2^53]`
//!
//! Floats, integers outside the safe range, and duplicate object keys are
//! rejected. Rejections surface externally as `CANONICAL_UNSUPPORTED`.
//!
//! # Canonicalization Rules
//!
//! 1. Object keys sorted lexicographically by code point
//! 2. No insignificant whitespace
//! 3. Integers rendered without a fractional part
//! 4. Strings with the minimal JSON escape set (RFC 8785 section 3.2.2.2)
//!
//! Canonicalization is pure and total on valid inputs: the same value always
//! produces the same bytes, and canonicalizing canonical output is identity.
//!
//! # Duplicate keys
//!
//! `serde_json` resolves duplicate object keys silently (last value wins),
//! which would let two byte strings with different meanings canonicalize to
//! the same hash input. Parsing here is therefore two passes: `serde_json`
//! establishes that the text is well-formed, then a raw-text scan walks the
//! object structure and rejects any key that repeats within one object,
//! comparing keys after escape decoding so `"a"` and `"a"` collide.

use std::collections::HashSet;
use std::fmt::Write as _;

use serde_json::{Number, Value};
use thiserror::Error;

/// Largest integer magnitude representable without loss in the canonical
/// grammar (2^53).
pub const MAX_SAFE_INTEGER: i64 = 9_007_199_254_740_992;

/// Maximum nesting depth accepted by the canonicalizer.
///
/// Keeps canonicalization total on adversarial input without risking stack
/// exhaustion.
pub const MAX_DEPTH: usize = 128;

/// Errors produced when a value falls outside the canonical grammar.
///
/// All variants surface externally under the single code
/// `CANONICAL_UNSUPPORTED`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CanonicalError {
    /// A floating-point number was encountered.
    #[error("float not allowed: the canonical grammar is integer-only")]
    FloatUnsupported,

    /// An integer falls outside `[-2^53, 2^53]`.
    #[error("integer out of range: {value} is outside [-2^53, 2^53]")]
    IntegerOutOfRange {
        /// String representation of the out-of-range number.
        value: String,
    },

    /// An object contains the same key more than once.
    #[error("duplicate key: '{key}' appears multiple times in object")]
    DuplicateKey {
        /// The duplicated key.
        key: String,
    },

    /// The value is nested deeper than [`MAX_DEPTH`] levels.
    #[error("max depth exceeded: value nested deeper than {max_depth} levels")]
    DepthExceeded {
        /// The depth limit that was exceeded.
        max_depth: usize,
    },

    /// The input is not valid JSON.
    #[error("parse error: {message}")]
    Parse {
        /// Description of the parse error.
        message: String,
    },
}

impl CanonicalError {
    /// The externally surfaced error code for canonicalization failures.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        "CANONICAL_UNSUPPORTED"
    }
}

/// Produces the canonical string form of a value.
///
/// # Errors
///
/// Returns [`CanonicalError`] if the value falls outside the canonical
/// grammar (floats, out-of-range integers, excessive nesting).
pub fn canonicalize(value: &Value) -> Result<String, CanonicalError> {
    validate_value(value, 0)?;
    let mut output = String::new();
    emit_value(value, &mut output);
    Ok(output)
}

/// Produces the canonical UTF-8 bytes of a value.
///
/// # Errors
///
/// Returns [`CanonicalError`] if the value falls outside the canonical
/// grammar.
pub fn canonical_bytes(value: &Value) -> Result<Vec<u8>, CanonicalError> {
    canonicalize(value).map(String::into_bytes)
}

/// Parses a JSON document, rejecting duplicate keys, and validates it
/// against the canonical grammar.
///
/// # Errors
///
/// Returns [`CanonicalError`] if the input is not valid JSON, repeats an
/// object key, or falls outside the canonical grammar.
pub fn parse_canonical(input: &str) -> Result<Value, CanonicalError> {
    let value: Value = serde_json::from_str(input).map_err(|e| CanonicalError::Parse {
        message: e.to_string(),
    })?;

    // The parser accepted the text but collapsed any repeated keys; rescan
    // the raw text to refuse them
    scan_duplicate_keys(input)?;

    validate_value(&value, 0)?;
    Ok(value)
}

/// Checks whether the input is already in canonical form.
#[must_use]
pub fn is_canonical(input: &str) -> bool {
    parse_canonical(input)
        .and_then(|value| canonicalize(&value))
        .is_ok_and(|canonical| canonical == input)
}

/// Walks raw JSON text and rejects objects that repeat a key.
///
/// Runs only after `serde_json` accepted the document, so the scan can
/// assume well-formed syntax: every string terminates, every escape is
/// complete, and structural bytes outside strings are ASCII. The walk is
/// iterative over an explicit frame stack, so arbitrarily deep input cannot
/// recurse.
fn scan_duplicate_keys(input: &str) -> Result<(), CanonicalError> {
    enum Frame {
        /// Inside an object; `expect_key` is true between `{` or `,` and
        /// the next key string.
        Object {
            seen: HashSet<String>,
            expect_key: bool,
        },
        Array,
    }

    let bytes = input.as_bytes();
    let mut stack: Vec<Frame> = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'{' => {
                stack.push(Frame::Object {
                    seen: HashSet::new(),
                    expect_key: true,
                });
                i += 1;
            },
            b'[' => {
                stack.push(Frame::Array);
                i += 1;
            },
            b'}' | b']' => {
                stack.pop();
                i += 1;
            },
            b',' => {
                if let Some(Frame::Object { expect_key, .. }) = stack.last_mut() {
                    *expect_key = true;
                }
                i += 1;
            },
            b'"' => {
                // Strings are consumed whole so quotes, braces and commas
                // inside them never reach the structural arms above
                let end = string_end(bytes, i);
                if let Some(Frame::Object { seen, expect_key }) = stack.last_mut() {
                    if *expect_key {
                        let key = decode_key(&input[i + 1..end]);
                        if !seen.insert(key.clone()) {
                            return Err(CanonicalError::DuplicateKey { key });
                        }
                        *expect_key = false;
                    }
                }
                i = end + 1;
            },
            // Colons, literals, numbers and whitespace carry no key state
            _ => i += 1,
        }
    }

    Ok(())
}

/// Returns the index of the closing quote of the string opening at `start`.
fn string_end(bytes: &[u8], start: usize) -> usize {
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'"' => return i,
            _ => i += 1,
        }
    }
    // Unterminated strings cannot survive the parse pass
    bytes.len()
}

/// Decodes the escapes in a raw key so repeated keys collide regardless of
/// spelling.
///
/// The text already parsed, so every escape is well-formed and surrogate
/// halves always arrive paired.
fn decode_key(raw: &str) -> String {
    if !raw.contains('\\') {
        return raw.to_string();
    }

    let mut decoded = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            decoded.push(c);
            continue;
        }
        match chars.next() {
            Some('b') => decoded.push('\u{0008}'),
            Some('f') => decoded.push('\u{000C}'),
            Some('n') => decoded.push('\n'),
            Some('r') => decoded.push('\r'),
            Some('t') => decoded.push('\t'),
            Some('u') => {
                let unit = hex_unit(&mut chars);
                let code_point = if (0xD800..=0xDBFF).contains(&unit) {
                    // High surrogate: skip the `\u` introducing the low half
                    chars.next();
                    chars.next();
                    let low = hex_unit(&mut chars);
                    0x10000 + ((unit - 0xD800) << 10) + (low - 0xDC00)
                } else {
                    unit
                };
                decoded.push(char::from_u32(code_point).unwrap_or(char::REPLACEMENT_CHARACTER));
            },
            // Identity escapes: quote, backslash, solidus
            Some(other) => decoded.push(other),
            None => {},
        }
    }
    decoded
}

/// Reads four hex digits from a `\u` escape.
fn hex_unit(chars: &mut std::str::Chars<'_>) -> u32 {
    let mut unit = 0;
    for _ in 0..4 {
        unit = unit * 16 + chars.next().and_then(|c| c.to_digit(16)).unwrap_or(0);
    }
    unit
}

/// Recursively validates a value against the canonical grammar.
fn validate_value(value: &Value, depth: usize) -> Result<(), CanonicalError> {
    if depth > MAX_DEPTH {
        return Err(CanonicalError::DepthExceeded {
            max_depth: MAX_DEPTH,
        });
    }

    match value {
        Value::Null | Value::Bool(_) | Value::String(_) => Ok(()),
        Value::Number(n) => validate_number(n),
        Value::Array(arr) => {
            for item in arr {
                validate_value(item, depth + 1)?;
            }
            Ok(())
        },
        Value::Object(obj) => {
            for val in obj.values() {
                validate_value(val, depth + 1)?;
            }
            Ok(())
        },
    }
}

/// Validates that a number is an integer within `[-2^53, 2^53]`.
fn validate_number(n: &Number) -> Result<(), CanonicalError> {
    if let Some(i) = n.as_i64() {
        if (-MAX_SAFE_INTEGER..=MAX_SAFE_INTEGER).contains(&i) {
            return Ok(());
        }
        return Err(CanonicalError::IntegerOutOfRange {
            value: i.to_string(),
        });
    }

    if let Some(u) = n.as_u64() {
        // u64 values above i64::MAX are necessarily above 2^53
        return Err(CanonicalError::IntegerOutOfRange {
            value: u.to_string(),
        });
    }

    Err(CanonicalError::FloatUnsupported)
}

/// Emits a value in canonical form.
///
/// Callers must validate the value first; emission itself cannot fail.
pub(crate) fn emit_value(value: &Value, output: &mut String) {
    match value {
        Value::Null => output.push_str("null"),
        Value::Bool(true) => output.push_str("true"),
        Value::Bool(false) => output.push_str("false"),
        Value::Number(n) => {
            // Validation restricted numbers to the safe integer range,
            // which always fits i64
            match n.as_i64() {
                Some(i) => {
                    let _ = write!(output, "{i}");
                },
                None => output.push_str(&n.to_string()),
            }
        },
        Value::String(s) => emit_string(s, output),
        Value::Array(items) => {
            output.push('[');
            let mut separate = false;
            for item in items {
                if separate {
                    output.push(',');
                }
                separate = true;
                emit_value(item, output);
            }
            output.push(']');
        },
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));

            output.push('{');
            let mut separate = false;
            for (key, val) in entries {
                if separate {
                    output.push(',');
                }
                separate = true;
                emit_string(key, output);
                output.push(':');
                emit_value(val, output);
            }
            output.push('}');
        },
    }
}

/// Emits a string with minimal escaping per RFC 8785 section 3.2.2.2: only
/// the quote, the backslash and the C0 control characters.
///
/// The scan is byte-oriented and copies unescaped runs in bulk. Every byte
/// that needs an escape is ASCII, so the scan can never split a multibyte
/// character; U+007F and above pass through untouched.
fn emit_string(s: &str, output: &mut String) {
    output.push('"');
    let bytes = s.as_bytes();
    let mut run_start = 0;

    for (i, &byte) in bytes.iter().enumerate() {
        let short = match byte {
            b'"' => Some("\\\""),
            b'\\' => Some("\\\\"),
            0x08 => Some("\\b"),
            0x0C => Some("\\f"),
            b'\n' => Some("\\n"),
            b'\r' => Some("\\r"),
            b'\t' => Some("\\t"),
            _ => None,
        };
        if short.is_none() && byte >= 0x20 {
            continue;
        }

        output.push_str(&s[run_start..i]);
        if let Some(escape) = short {
            output.push_str(escape);
        } else {
            let _ = write!(output, "\\u{byte:04x}");
        }
        run_start = i + 1;
    }

    output.push_str(&s[run_start..]);
    output.push('"');
}
