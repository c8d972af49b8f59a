//! # Identity Hasher
//!
//! Derives identity keys and content checksums from explicitly configured field subsets.
//!
//! The encoding is compact JSON with sorted keys, non-ASCII characters and DEL escaped
//! as `\uXXXX`, and floats laid out the way Python's `repr` prints them. This reproduces
//! the digests already stored in existing history tables.

use crate::model::{Checksum, Entity, Fields, IdentityKey};
use serde::Serialize;
use serde_json::ser::{CompactFormatter, Formatter};
use sha2::{Digest, Sha256};
use std::io;

/// Compact formatter that escapes every non-ASCII character.
struct AsciiFormatter;

/// Printable without escaping: ASCII except DEL.
fn is_plain(ch: char) -> bool {
    ch.is_ascii() && ch != '\x7f'
}

impl Formatter for AsciiFormatter {
    fn write_string_fragment<W>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if fragment.chars().all(is_plain) {
            return writer.write_all(fragment.as_bytes());
        }
        let mut units = [0u16; 2];
        for ch in fragment.chars() {
            if is_plain(ch) {
                writer.write_all(&[ch as u8])?;
            } else {
                for unit in ch.encode_utf16(&mut units) {
                    write!(writer, "\\u{:04x}", unit)?;
                }
            }
        }
        Ok(())
    }

    fn write_char_escape<W>(
        &mut self,
        writer: &mut W,
        char_escape: serde_json::ser::CharEscape,
    ) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        CompactFormatter.write_char_escape(writer, char_escape)
    }

    fn write_f64<W>(&mut self, writer: &mut W, value: f64) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(python_float(value).as_bytes())
    }
}

/// Shortest round-trip digits in Python's `repr` layout: positional when the decimal
/// point falls within `-4 < point <= 16`, otherwise scientific with a signed exponent of
/// at least two digits.
fn python_float(value: f64) -> String {
    // `{:e}` yields the shortest round-trip digits, e.g. `-2.5e-7`.
    let scientific = format!("{value:e}");
    let (mantissa, exponent) = scientific
        .split_once('e')
        .unwrap_or((scientific.as_str(), "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    let (sign, mantissa) = match mantissa.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", mantissa),
    };

    let point = exponent + 1;
    if !(-3..=16).contains(&point) {
        let exp_sign = if exponent < 0 { '-' } else { '+' };
        return format!("{sign}{mantissa}e{exp_sign}{:02}", exponent.abs());
    }

    let digits: String = mantissa.chars().filter(|ch| *ch != '.').collect();
    let len = digits.len() as i32;
    if point <= 0 {
        format!("{sign}0.{}{digits}", "0".repeat(point.unsigned_abs() as usize))
    } else if point >= len {
        format!("{sign}{digits}{}.0", "0".repeat((point - len) as usize))
    } else {
        let (whole, fraction) = digits.split_at(point as usize);
        format!("{sign}{whole}.{fraction}")
    }
}

/// Serialize `value` with the canonical encoding used for hashing.
pub fn canonical_json<T: Serialize + ?Sized>(value: &T) -> String {
    let mut buf = Vec::new();
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, AsciiFormatter);
    // Writing JSON values into a Vec cannot fail.
    if value.serialize(&mut serializer).is_err() {
        return String::new();
    }
    // The formatter only emits ASCII.
    String::from_utf8(buf).unwrap_or_default()
}

/// Compute a hex SHA-256 digest over the requested fields of `record`.
///
/// The field list is sorted (and deduplicated) first, so argument order never matters.
/// Fields missing from the record are skipped rather than defaulted.
pub fn compute_checksum<S: AsRef<str>>(record: &Fields, fields: &[S]) -> String {
    let mut names: Vec<&str> = fields.iter().map(AsRef::as_ref).collect();
    names.sort_unstable();
    names.dedup();

    let selected: Fields = names
        .into_iter()
        .filter_map(|name| {
            record
                .get(name)
                .map(|value| (name.to_string(), value.clone()))
        })
        .collect();

    let encoded = canonical_json(&selected);
    hex::encode(Sha256::digest(encoded.as_bytes()))
}

/// Field subsets that define identity and tracked content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityHasher {
    identity_fields: Vec<String>,
    checksum_fields: Vec<String>,
}

impl IdentityHasher {
    /// Create a hasher; an empty identity field list is rejected since every entity would collide.
    pub fn new(identity_fields: Vec<String>, checksum_fields: Vec<String>) -> anyhow::Result<Self> {
        if identity_fields.is_empty() {
            anyhow::bail!("identity field list must not be empty");
        }
        Ok(Self {
            identity_fields,
            checksum_fields,
        })
    }

    pub fn identity_fields(&self) -> &[String] {
        &self.identity_fields
    }

    pub fn checksum_fields(&self) -> &[String] {
        &self.checksum_fields
    }

    pub fn identity_key(&self, entity: &Entity) -> IdentityKey {
        IdentityKey(compute_checksum(&entity.fields, &self.identity_fields))
    }

    pub fn checksum(&self, entity: &Entity) -> Checksum {
        Checksum(compute_checksum(&entity.fields, &self.checksum_fields))
    }

    /// Checksum over already-materialized fields (history rows).
    pub fn checksum_fields_of(&self, fields: &Fields) -> Checksum {
        Checksum(compute_checksum(fields, &self.checksum_fields))
    }

    /// Identity fields the entity lacks (absent or null).
    pub fn missing_identity_fields(&self, entity: &Entity) -> Vec<String> {
        self.identity_fields
            .iter()
            .filter(|name| !entity.has(name))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: serde_json::Value) -> Fields {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_known_digest() {
        let record = fields(json!({"title": "Programm A", "url": "https://x/a"}));
        assert_eq!(
            compute_checksum(&record, &["url", "title"]),
            "7340b5df53f5f56da5ed11048327ac02ff6510a84933705baa42107667e1d6ce"
        );
    }

    #[test]
    fn test_field_order_is_irrelevant() {
        let record = fields(json!({"a": 1, "b": "two", "c": [3]}));
        let forward = compute_checksum(&record, &["a", "b", "c"]);
        let reversed = compute_checksum(&record, &["c", "b", "a"]);
        let repeated = compute_checksum(&record, &["c", "a", "b", "a"]);
        assert_eq!(forward, reversed);
        assert_eq!(forward, repeated);
    }

    #[test]
    fn test_missing_fields_are_skipped() {
        let record = fields(json!({"title": "Förderung für Gründer", "url": "https://x/b"}));
        assert_eq!(
            compute_checksum(&record, &["title", "url", "missing"]),
            "e388825b7cddf3c161a611b7a8d560d16dbc4e5a8fe2056d781bbc447e9cfc7a"
        );
        assert_eq!(
            compute_checksum(&Fields::new(), &["title"]),
            "44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a"
        );
    }

    #[test]
    fn test_non_bmp_characters_use_surrogate_pairs() {
        let record = fields(json!({"title": "😀"}));
        assert_eq!(canonical_json(&record), r#"{"title":"\ud83d\ude00"}"#);
        assert_eq!(
            compute_checksum(&record, &["title"]),
            "6746cb26cdf80ca3796c55bf9c3ea2c9c72a0255d37d249ad3a84ad74fc07aa8"
        );
    }

    #[test]
    fn test_delete_character_is_escaped() {
        let record = fields(json!({"title": "a\u{7f}b"}));
        assert_eq!(canonical_json(&record), r#"{"title":"a\u007fb"}"#);
        assert_eq!(
            compute_checksum(&record, &["title"]),
            "7fdd3de2eba64bc7dff47d40c4034fc38bb842e883d8edea8540eabc52bd4e2e"
        );
    }

    #[test]
    fn test_floats_match_python_repr() {
        let record = fields(json!({
            "a": 1e20,
            "b": 1e-5,
            "c": 0.0001,
            "d": 1.5,
            "e": 1e16,
            "f": 1e15,
            "g": -2.5e-7,
            "h": 100.0,
            "i": 123.456
        }));
        assert_eq!(
            canonical_json(&record),
            r#"{"a":1e+20,"b":1e-05,"c":0.0001,"d":1.5,"e":1e+16,"f":1000000000000000.0,"g":-2.5e-07,"h":100.0,"i":123.456}"#
        );
        assert_eq!(
            compute_checksum(&record, &["a", "b", "c", "d", "e", "f", "g", "h", "i"]),
            "0570a3d3fefaee9147178af0ccf50b2d7624587fe67823e6825caa9acee2bf64"
        );
        assert_eq!(python_float(0.0), "0.0");
        assert_eq!(python_float(-0.5), "-0.5");
    }

    #[test]
    fn test_canonical_json_escapes_controls() {
        let record = fields(json!({"b": "line\nbreak \"quoted\"", "a": null}));
        assert_eq!(
            canonical_json(&record),
            r#"{"a":null,"b":"line\nbreak \"quoted\""}"#
        );
    }

    #[test]
    fn test_identity_independent_of_content() {
        let hasher = IdentityHasher::new(
            vec!["url".to_string()],
            vec!["title".to_string(), "url".to_string()],
        )
        .unwrap();
        let before = Entity::new().with("url", "https://x/a").with("title", "Old");
        let after = Entity::new().with("url", "https://x/a").with("title", "New");
        assert_eq!(hasher.identity_key(&before), hasher.identity_key(&after));
        assert_ne!(hasher.checksum(&before), hasher.checksum(&after));
    }

    #[test]
    fn test_missing_identity_fields() {
        let hasher = IdentityHasher::new(
            vec!["url".to_string(), "title".to_string()],
            vec!["title".to_string()],
        )
        .unwrap();
        let entity = Entity::new().with("title", "Only title");
        assert_eq!(hasher.missing_identity_fields(&entity), vec!["url".to_string()]);
        assert!(IdentityHasher::new(Vec::new(), Vec::new()).is_err());
    }
}
