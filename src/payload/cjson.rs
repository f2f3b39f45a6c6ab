//! # CJSON Row Body Encoding
//!
//! Compact binary JSON used for the dynamic part of a row. Object keys are
//! replaced by integer tags from the [`TagsMatcher`]; values are varint or
//! fixed-width encoded. The encoding is self-delimiting, so sparse-index key
//! extraction can walk a body without decoding it fully.
//!
//! ## Wire Format
//!
//! Every node starts with a varint token `T`:
//!
//! ```text
//! type = T & 0x7        tag = T >> 3   (0 = no tag: root, array elements)
//!
//! 0 null      no payload
//! 1 bool      1 byte
//! 2 int       zigzag varint
//! 3 double    8 bytes LE
//! 4 string    varint length + UTF-8 bytes
//! 5 array     varint count, then untagged nodes
//! 6 object    tagged child nodes until an `end` token
//! 7 end       closes the innermost object
//! ```
//!
//! Varints are LEB128 (7 bits per byte, high bit = continuation); signed
//! integers are zigzag-folded first.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::payload::tags::{TagId, TagsMatcher};
use crate::types::value::{Variant, VariantArray};

const TYPE_NULL: u64 = 0;
const TYPE_BOOL: u64 = 1;
const TYPE_INT: u64 = 2;
const TYPE_DOUBLE: u64 = 3;
const TYPE_STRING: u64 = 4;
const TYPE_ARRAY: u64 = 5;
const TYPE_OBJECT: u64 = 6;
const TYPE_END: u64 = 7;

pub fn write_uvarint(out: &mut Vec<u8>, mut v: u64) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

pub fn read_uvarint(buf: &[u8], pos: &mut usize) -> Result<u64> {
    let mut v = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *buf
            .get(*pos)
            .ok_or_else(|| Error::parse("truncated cjson varint"))?;
        *pos += 1;
        v |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(v);
        }
        shift += 7;
        if shift >= 64 {
            return Err(Error::parse("cjson varint overflow"));
        }
    }
}

fn zigzag(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

fn unzigzag(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

fn write_token(out: &mut Vec<u8>, ty: u64, tag: TagId) {
    write_uvarint(out, ((tag as u64) << 3) | ty);
}

/// Encode a JSON document into a CJSON body, registering new keys in the
/// tags matcher. The root must be an object.
pub fn encode(value: &serde_json::Value, tm: &mut TagsMatcher) -> Result<Vec<u8>> {
    let serde_json::Value::Object(_) = value else {
        return Err(Error::parse("document root must be a JSON object"));
    };
    let mut out = Vec::with_capacity(64);
    encode_node(&mut out, value, 0, tm)?;
    Ok(out)
}

fn encode_node(
    out: &mut Vec<u8>,
    value: &serde_json::Value,
    tag: TagId,
    tm: &mut TagsMatcher,
) -> Result<()> {
    match value {
        serde_json::Value::Null => write_token(out, TYPE_NULL, tag),
        serde_json::Value::Bool(b) => {
            write_token(out, TYPE_BOOL, tag);
            out.push(*b as u8);
        }
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                write_token(out, TYPE_INT, tag);
                write_uvarint(out, zigzag(i));
            } else {
                write_token(out, TYPE_DOUBLE, tag);
                out.extend_from_slice(&n.as_f64().unwrap_or(f64::NAN).to_le_bytes());
            }
        }
        serde_json::Value::String(s) => {
            write_token(out, TYPE_STRING, tag);
            write_uvarint(out, s.len() as u64);
            out.extend_from_slice(s.as_bytes());
        }
        serde_json::Value::Array(items) => {
            write_token(out, TYPE_ARRAY, tag);
            write_uvarint(out, items.len() as u64);
            for item in items {
                encode_node(out, item, 0, tm)?;
            }
        }
        serde_json::Value::Object(map) => {
            write_token(out, TYPE_OBJECT, tag);
            for (key, child) in map {
                let child_tag = tm.name_to_tag_mut(key);
                encode_node(out, child, child_tag, tm)?;
            }
            write_token(out, TYPE_END, 0);
        }
    }
    Ok(())
}

/// Decode a CJSON body back into a JSON document.
pub fn decode(body: &[u8], tm: &TagsMatcher) -> Result<serde_json::Value> {
    if body.is_empty() {
        return Ok(serde_json::Value::Object(serde_json::Map::new()));
    }
    let mut pos = 0;
    let (value, _) = decode_node(body, &mut pos, tm)?;
    Ok(value)
}

fn decode_node(
    buf: &[u8],
    pos: &mut usize,
    tm: &TagsMatcher,
) -> Result<(serde_json::Value, TagId)> {
    let token = read_uvarint(buf, pos)?;
    let ty = token & 0x7;
    let tag = (token >> 3) as TagId;
    let value = match ty {
        TYPE_NULL => serde_json::Value::Null,
        TYPE_BOOL => {
            let b = *buf
                .get(*pos)
                .ok_or_else(|| Error::parse("truncated cjson bool"))?;
            *pos += 1;
            serde_json::Value::Bool(b != 0)
        }
        TYPE_INT => serde_json::Value::from(unzigzag(read_uvarint(buf, pos)?)),
        TYPE_DOUBLE => {
            let bytes: [u8; 8] = buf
                .get(*pos..*pos + 8)
                .ok_or_else(|| Error::parse("truncated cjson double"))?
                .try_into()
                .unwrap_or([0; 8]);
            *pos += 8;
            serde_json::Value::from(f64::from_le_bytes(bytes))
        }
        TYPE_STRING => {
            let len = read_uvarint(buf, pos)? as usize;
            let bytes = buf
                .get(*pos..*pos + len)
                .ok_or_else(|| Error::parse("truncated cjson string"))?;
            *pos += len;
            serde_json::Value::String(
                std::str::from_utf8(bytes)
                    .map_err(|_| Error::parse("invalid utf-8 in cjson string"))?
                    .to_string(),
            )
        }
        TYPE_ARRAY => {
            let count = read_uvarint(buf, pos)? as usize;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(decode_node(buf, pos, tm)?.0);
            }
            serde_json::Value::Array(items)
        }
        TYPE_OBJECT => {
            let mut map = serde_json::Map::new();
            loop {
                let save = *pos;
                let child_token = read_uvarint(buf, pos)?;
                if child_token & 0x7 == TYPE_END {
                    break;
                }
                *pos = save;
                let (child, child_tag) = decode_node(buf, pos, tm)?;
                map.insert(tm.tag_to_name(child_tag)?.to_string(), child);
            }
            serde_json::Value::Object(map)
        }
        _ => return Err(Error::parse(format!("unexpected cjson token type {ty}"))),
    };
    Ok((value, tag))
}

/// Extract the scalar values at a dotted path (for sparse index keys)
/// without materializing the document. Arrays along the path fan out.
pub fn extract_path(body: &[u8], tm: &TagsMatcher, path: &str) -> Result<VariantArray> {
    let mut out = VariantArray::new();
    if body.is_empty() {
        return Ok(out);
    }
    let tags: Vec<Option<TagId>> = path.split('.').map(|seg| tm.name_to_tag(seg)).collect();
    if tags.iter().any(Option::is_none) {
        return Ok(out);
    }
    let tags: Vec<TagId> = tags.into_iter().flatten().collect();
    let mut pos = 0;
    collect_path(body, &mut pos, tm, &tags, 0, &mut out)?;
    Ok(out)
}

fn collect_path(
    buf: &[u8],
    pos: &mut usize,
    tm: &TagsMatcher,
    tags: &[TagId],
    depth: usize,
    out: &mut VariantArray,
) -> Result<()> {
    let token = read_uvarint(buf, pos)?;
    let ty = token & 0x7;
    let tag = (token >> 3) as TagId;
    let on_path = depth < tags.len() && tag == tags[depth];
    let at_leaf = on_path && depth + 1 == tags.len();
    match ty {
        TYPE_NULL => {}
        TYPE_BOOL => {
            let b = *buf
                .get(*pos)
                .ok_or_else(|| Error::parse("truncated cjson bool"))?;
            *pos += 1;
            if at_leaf {
                out.push(Variant::Bool(b != 0));
            }
        }
        TYPE_INT => {
            let v = unzigzag(read_uvarint(buf, pos)?);
            if at_leaf {
                out.push(if v >= i32::MIN as i64 && v <= i32::MAX as i64 {
                    Variant::Int(v as i32)
                } else {
                    Variant::Int64(v)
                });
            }
        }
        TYPE_DOUBLE => {
            let bytes: [u8; 8] = buf
                .get(*pos..*pos + 8)
                .ok_or_else(|| Error::parse("truncated cjson double"))?
                .try_into()
                .unwrap_or([0; 8]);
            *pos += 8;
            if at_leaf {
                out.push(Variant::Double(f64::from_le_bytes(bytes)));
            }
        }
        TYPE_STRING => {
            let len = read_uvarint(buf, pos)? as usize;
            let bytes = buf
                .get(*pos..*pos + len)
                .ok_or_else(|| Error::parse("truncated cjson string"))?;
            *pos += len;
            if at_leaf {
                let s = std::str::from_utf8(bytes)
                    .map_err(|_| Error::parse("invalid utf-8 in cjson string"))?;
                out.push(Variant::String(Arc::from(s)));
            }
        }
        TYPE_ARRAY => {
            let count = read_uvarint(buf, pos)? as usize;
            for _ in 0..count {
                if at_leaf {
                    // Leaf array: every element is a key.
                    collect_array_leaf(buf, pos, out)?;
                } else if on_path {
                    collect_path(buf, pos, tm, tags, depth + 1, out)?;
                } else {
                    skip_node(buf, pos)?;
                }
            }
        }
        TYPE_OBJECT => loop {
            let save = *pos;
            let child_token = read_uvarint(buf, pos)?;
            if child_token & 0x7 == TYPE_END {
                break;
            }
            *pos = save;
            // Untagged objects (the root, array elements) are transparent:
            // they keep the current path depth.
            if on_path || tag == 0 {
                let next_depth = if tag == 0 { depth } else { depth + 1 };
                collect_path(buf, pos, tm, tags, next_depth, out)?;
            } else {
                skip_node(buf, pos)?;
            }
        },
        _ => return Err(Error::parse(format!("unexpected cjson token type {ty}"))),
    }
    Ok(())
}

fn collect_array_leaf(buf: &[u8], pos: &mut usize, out: &mut VariantArray) -> Result<()> {
    let token = read_uvarint(buf, pos)?;
    match token & 0x7 {
        TYPE_NULL => {}
        TYPE_BOOL => {
            let b = *buf
                .get(*pos)
                .ok_or_else(|| Error::parse("truncated cjson bool"))?;
            *pos += 1;
            out.push(Variant::Bool(b != 0));
        }
        TYPE_INT => {
            let v = unzigzag(read_uvarint(buf, pos)?);
            out.push(if v >= i32::MIN as i64 && v <= i32::MAX as i64 {
                Variant::Int(v as i32)
            } else {
                Variant::Int64(v)
            });
        }
        TYPE_DOUBLE => {
            let bytes: [u8; 8] = buf
                .get(*pos..*pos + 8)
                .ok_or_else(|| Error::parse("truncated cjson double"))?
                .try_into()
                .unwrap_or([0; 8]);
            *pos += 8;
            out.push(Variant::Double(f64::from_le_bytes(bytes)));
        }
        TYPE_STRING => {
            let len = read_uvarint(buf, pos)? as usize;
            let bytes = buf
                .get(*pos..*pos + len)
                .ok_or_else(|| Error::parse("truncated cjson string"))?;
            *pos += len;
            let s = std::str::from_utf8(bytes)
                .map_err(|_| Error::parse("invalid utf-8 in cjson string"))?;
            out.push(Variant::String(Arc::from(s)));
        }
        _ => skip_body(buf, pos, token & 0x7)?,
    }
    Ok(())
}

fn skip_node(buf: &[u8], pos: &mut usize) -> Result<()> {
    let token = read_uvarint(buf, pos)?;
    skip_body(buf, pos, token & 0x7)
}

fn skip_body(buf: &[u8], pos: &mut usize, ty: u64) -> Result<()> {
    match ty {
        TYPE_NULL | TYPE_END => {}
        TYPE_BOOL => *pos += 1,
        TYPE_INT => {
            read_uvarint(buf, pos)?;
        }
        TYPE_DOUBLE => *pos += 8,
        TYPE_STRING => {
            let len = read_uvarint(buf, pos)? as usize;
            *pos += len;
        }
        TYPE_ARRAY => {
            let count = read_uvarint(buf, pos)? as usize;
            for _ in 0..count {
                skip_node(buf, pos)?;
            }
        }
        TYPE_OBJECT => loop {
            let token = read_uvarint(buf, pos)?;
            if token & 0x7 == TYPE_END {
                break;
            }
            skip_body(buf, pos, token & 0x7)?;
        },
        _ => return Err(Error::parse(format!("unexpected cjson token type {ty}"))),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(doc: serde_json::Value) -> serde_json::Value {
        let mut tm = TagsMatcher::new(1);
        let body = encode(&doc, &mut tm).unwrap();
        decode(&body, &tm).unwrap()
    }

    #[test]
    fn json_cjson_json_preserves_values() {
        let doc = serde_json::json!({
            "id": 42,
            "title": "dune",
            "rating": 4.5,
            "tags": ["sf", "classic"],
            "meta": {"pages": 412, "reread": true, "isbn": null},
            "big": 9_000_000_000i64
        });
        assert_eq!(roundtrip(doc.clone()), doc);
    }

    #[test]
    fn nested_empty_structures_survive() {
        let doc = serde_json::json!({"a": [], "b": {}, "c": [[1], []]});
        assert_eq!(roundtrip(doc.clone()), doc);
    }

    #[test]
    fn extract_scalar_path() {
        let mut tm = TagsMatcher::new(1);
        let body = encode(
            &serde_json::json!({"meta": {"pages": 412}, "x": 1}),
            &mut tm,
        )
        .unwrap();
        let keys = extract_path(&body, &tm, "meta.pages").unwrap();
        assert_eq!(keys.as_slice(), &[Variant::Int(412)]);
    }

    #[test]
    fn extract_array_path_fans_out() {
        let mut tm = TagsMatcher::new(1);
        let body = encode(&serde_json::json!({"tags": ["a", "b"]}), &mut tm).unwrap();
        let keys = extract_path(&body, &tm, "tags").unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].as_str(), Some("a"));
    }

    #[test]
    fn missing_path_yields_no_keys() {
        let mut tm = TagsMatcher::new(1);
        let body = encode(&serde_json::json!({"x": 1}), &mut tm).unwrap();
        assert!(extract_path(&body, &tm, "nope.deeper").unwrap().is_empty());
    }
}
