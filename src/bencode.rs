//! Hand-rolled bencode codec.
//!
//! Bencode is the self-describing binary dictionary format used by torrent
//! metainfo files and HTTP tracker responses. It has four types: integers
//! (`i<digits>e`), byte strings (`<len>:<bytes>`), lists (`l...e`) and
//! dictionaries (`d...e`). Keys in a dictionary are themselves byte strings.
//!
//! This codec is deliberately not built on `serde`: decoding needs to hand
//! back the exact byte range it consumed so callers can recover the raw
//! `info` sub-dictionary bytes for info-hash hashing without re-encoding.

use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    pub fn bytes(b: impl Into<Vec<u8>>) -> Value {
        Value::Bytes(b.into())
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_dict()?.get(key.as_bytes())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BencodeError {
    #[error("truncated bencode input at offset {0}")]
    Truncated(usize),
    #[error("unexpected byte: expected {expected}, found {found:?} at offset {at}")]
    Unexpected {
        expected: &'static str,
        found: Option<u8>,
        at: usize,
    },
    #[error("dictionary keys not in lexicographic order")]
    DictKeyOrder,
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Decodes a single bencoded value starting at `input[0]`.
///
/// Returns the parsed value and the number of bytes it occupied, so the
/// caller can slice out the exact raw bytes of a sub-value (e.g. the `info`
/// dictionary) rather than trusting a re-encoding of it.
pub fn decode(input: &[u8]) -> Result<(Value, usize), BencodeError> {
    decode_at(input, 0)
}

fn decode_at(input: &[u8], at: usize) -> Result<(Value, usize), BencodeError> {
    let byte = *input.get(at).ok_or(BencodeError::Truncated(at))?;
    match byte {
        b'i' => decode_int(input, at),
        b'l' => decode_list(input, at),
        b'd' => decode_dict(input, at),
        b'0'..=b'9' => decode_string(input, at),
        other => Err(BencodeError::Unexpected {
            expected: "one of 'i', 'l', 'd', or a digit",
            found: Some(other),
            at,
        }),
    }
}

fn decode_int(input: &[u8], at: usize) -> Result<(Value, usize), BencodeError> {
    debug_assert_eq!(input[at], b'i');
    let start = at + 1;
    let end = find(input, b'e', start).ok_or(BencodeError::Truncated(start))?;
    let digits = std::str::from_utf8(&input[start..end]).map_err(|_| BencodeError::Unexpected {
        expected: "ASCII integer",
        found: input.get(start).copied(),
        at: start,
    })?;
    let value: i64 = digits.parse().map_err(|_| BencodeError::Unexpected {
        expected: "valid integer literal",
        found: input.get(start).copied(),
        at: start,
    })?;
    Ok((Value::Int(value), end + 1 - at))
}

fn decode_string(input: &[u8], at: usize) -> Result<(Value, usize), BencodeError> {
    let colon = find(input, b':', at).ok_or(BencodeError::Truncated(at))?;
    let len_digits =
        std::str::from_utf8(&input[at..colon]).map_err(|_| BencodeError::Unexpected {
            expected: "ASCII string length",
            found: input.get(at).copied(),
            at,
        })?;
    let len: usize = len_digits.parse().map_err(|_| BencodeError::Unexpected {
        expected: "valid string length",
        found: input.get(at).copied(),
        at,
    })?;
    let data_start = colon + 1;
    let data_end = data_start
        .checked_add(len)
        .ok_or(BencodeError::Truncated(data_start))?;
    if data_end > input.len() {
        return Err(BencodeError::Truncated(data_start));
    }
    Ok((
        Value::Bytes(input[data_start..data_end].to_vec()),
        data_end - at,
    ))
}

fn decode_list(input: &[u8], at: usize) -> Result<(Value, usize), BencodeError> {
    debug_assert_eq!(input[at], b'l');
    let mut items = Vec::new();
    let mut cursor = at + 1;
    loop {
        match input.get(cursor) {
            None => return Err(BencodeError::Truncated(cursor)),
            Some(b'e') => {
                cursor += 1;
                break;
            }
            Some(_) => {
                let (value, len) = decode_at(input, cursor)?;
                items.push(value);
                cursor += len;
            }
        }
    }
    Ok((Value::List(items), cursor - at))
}

fn decode_dict(input: &[u8], at: usize) -> Result<(Value, usize), BencodeError> {
    debug_assert_eq!(input[at], b'd');
    let mut map = BTreeMap::new();
    let mut cursor = at + 1;
    loop {
        match input.get(cursor) {
            None => return Err(BencodeError::Truncated(cursor)),
            Some(b'e') => {
                cursor += 1;
                break;
            }
            Some(_) => {
                let (key, key_len) = decode_string(input, cursor)?;
                let key = match key {
                    Value::Bytes(b) => b,
                    _ => unreachable!("decode_string always returns Value::Bytes"),
                };
                cursor += key_len;
                let (value, value_len) = decode_at(input, cursor)?;
                cursor += value_len;
                map.insert(key, value);
            }
        }
    }
    Ok((Value::Dict(map), cursor - at))
}

fn find(haystack: &[u8], needle: u8, from: usize) -> Option<usize> {
    haystack[from..]
        .iter()
        .position(|&b| b == needle)
        .map(|i| i + from)
}

/// Encodes a value. Dictionary keys are always emitted in lexicographic
/// (byte-wise) order, which is required for info-hash stability: callers
/// rely on `BTreeMap`'s natural ordering to uphold this without a separate
/// sort pass.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Int(i) => {
            out.push(b'i');
            out.extend_from_slice(i.to_string().as_bytes());
            out.push(b'e');
        }
        Value::Bytes(b) => {
            out.extend_from_slice(b.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(b);
        }
        Value::List(items) => {
            out.push(b'l');
            for item in items {
                encode_into(item, out);
            }
            out.push(b'e');
        }
        Value::Dict(map) => {
            out.push(b'd');
            // BTreeMap iterates in ascending key order, which for Vec<u8>
            // keys is exactly the lexicographic byte order bencode requires.
            for (key, value) in map {
                encode_into(&Value::Bytes(key.clone()), out);
                encode_into(value, out);
            }
            out.push(b'e');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_integer() {
        let (v, len) = decode(b"i42e").unwrap();
        assert_eq!(v, Value::Int(42));
        assert_eq!(len, 4);
    }

    #[test]
    fn decode_negative_integer() {
        let (v, _) = decode(b"i-3e").unwrap();
        assert_eq!(v, Value::Int(-3));
    }

    #[test]
    fn decode_string() {
        let (v, len) = decode(b"4:spam").unwrap();
        assert_eq!(v, Value::bytes(&b"spam"[..]));
        assert_eq!(len, 6);
    }

    #[test]
    fn decode_list() {
        let (v, _) = decode(b"l4:spam4:eggse").unwrap();
        assert_eq!(
            v,
            Value::List(vec![Value::bytes(&b"spam"[..]), Value::bytes(&b"eggs"[..])])
        );
    }

    #[test]
    fn decode_dict() {
        let (v, _) = decode(b"d3:cow3:moo4:spam4:eggse").unwrap();
        let dict = v.as_dict().unwrap();
        assert_eq!(dict.get(&b"cow"[..]).unwrap().as_bytes(), Some(&b"moo"[..]));
        assert_eq!(
            dict.get(&b"spam"[..]).unwrap().as_bytes(),
            Some(&b"eggs"[..])
        );
    }

    #[test]
    fn decode_tolerates_unordered_keys() {
        // "zebra" before "apple" — unordered, but decode must still succeed.
        let (v, _) = decode(b"d5:zebra4:spam5:apple4:eggse").unwrap();
        assert!(v.get("apple").is_some());
        assert!(v.get("zebra").is_some());
    }

    #[test]
    fn truncated_string_errors() {
        let err = decode(b"10:short").unwrap_err();
        assert!(matches!(err, BencodeError::Truncated(_)));
    }

    #[test]
    fn truncated_container_errors() {
        assert!(matches!(decode(b"d3:cow3:moo"), Err(BencodeError::Truncated(_))));
        assert!(matches!(decode(b"l4:spam"), Err(BencodeError::Truncated(_))));
    }

    #[test]
    fn unexpected_byte_errors() {
        assert!(matches!(
            decode(b"x"),
            Err(BencodeError::Unexpected { .. })
        ));
    }

    #[test]
    fn round_trip() {
        let mut dict = BTreeMap::new();
        dict.insert(b"b".to_vec(), Value::Int(2));
        dict.insert(b"a".to_vec(), Value::Int(1));
        let value = Value::Dict(dict);
        let encoded = encode(&value);
        assert_eq!(encoded, b"d1:ai1e1:bi2ee");
        let (decoded, len) = decode(&encoded).unwrap();
        assert_eq!(decoded, value);
        assert_eq!(len, encoded.len());
    }

    #[test]
    fn encode_emits_lexicographic_key_order() {
        let mut dict = BTreeMap::new();
        dict.insert(b"zzz".to_vec(), Value::Int(1));
        dict.insert(b"aaa".to_vec(), Value::Int(2));
        dict.insert(b"mmm".to_vec(), Value::Int(3));
        let encoded = encode(&Value::Dict(dict));
        assert_eq!(encoded, b"d3:aaai2e3:mmmi3e3:zzzi1ee");
    }

    #[test]
    fn info_hash_round_trip_scenario() {
        // Scenario 6 from the spec: encode a fixed info dict and check its
        // SHA-1 changes when any byte is mutated.
        use sha1::{Digest, Sha1};

        let mut dict = BTreeMap::new();
        dict.insert(b"length".to_vec(), Value::Int(12));
        dict.insert(b"name".to_vec(), Value::bytes(&b"a"[..]));
        dict.insert(b"piece length".to_vec(), Value::Int(16384));
        dict.insert(b"pieces".to_vec(), Value::bytes(vec![0u8; 20]));
        let encoded = encode(&Value::Dict(dict));

        let mut hasher = Sha1::new();
        hasher.update(&encoded);
        let hash = hasher.finalize();

        let mut mutated = encoded.clone();
        let last = mutated.len() - 1;
        mutated[last] ^= 0xFF;
        let mut hasher2 = Sha1::new();
        hasher2.update(&mutated);
        let hash2 = hasher2.finalize();

        assert_ne!(hash.as_slice(), hash2.as_slice());
    }
}
