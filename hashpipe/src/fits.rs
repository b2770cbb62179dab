//! Minimal FITS-style fixed-record keyword codec.
//!
//! Status buffers are a flat sequence of 80-byte "cards" terminated by a
//! record whose first three bytes are `"END"`. Each non-END card holds a
//! keyword (up to 8 bytes, space padded) followed by `= ` and a value. This
//! module implements just enough of that format for the status buffer to
//! store and retrieve integer, string and float keys; it is not a general
//! purpose FITS header library.

use hashpipe_common::STATUS_RECORD_SIZE;

const KEYWORD_WIDTH: usize = 8;

fn card_keyword(card: &[u8]) -> &[u8] {
    &card[0..KEYWORD_WIDTH]
}

fn keyword_matches(card: &[u8], key: &str) -> bool {
    let kw = card_keyword(card);
    let key_bytes = key.as_bytes();
    if key_bytes.len() > KEYWORD_WIDTH {
        return false;
    }
    kw[..key_bytes.len()] == *key_bytes && kw[key_bytes.len()..].iter().all(|&b| b == b' ')
}

/// Returns the byte offset of the `END` record, or `None` if not present.
pub fn find_end(buf: &[u8]) -> Option<usize> {
    let mut offs = 0;
    while offs + 3 <= buf.len() {
        if &buf[offs..offs + 3] == b"END" {
            return Some(offs);
        }
        offs += STATUS_RECORD_SIZE;
    }
    None
}

fn cards(buf: &[u8]) -> impl Iterator<Item = &[u8]> {
    buf.chunks(STATUS_RECORD_SIZE)
        .take_while(|c| !c.starts_with(b"END"))
}

fn value_str(card: &[u8]) -> &str {
    let rest = &card[KEYWORD_WIDTH..];
    let rest = if rest.starts_with(b"= ") {
        &rest[2..]
    } else {
        rest
    };
    let s = std::str::from_utf8(rest).unwrap_or("");
    s.trim_end_matches(|c: char| c == '\0' || c == ' ')
        .trim()
        .trim_matches('\'')
        .trim()
}

pub fn get_str<'a>(buf: &'a [u8], key: &str) -> Option<&'a str> {
    cards(buf)
        .find(|c| keyword_matches(c, key))
        .map(value_str)
}

pub fn get_i32(buf: &[u8], key: &str) -> Option<i32> {
    get_str(buf, key).and_then(|s| s.trim().parse::<i32>().ok())
}

pub fn get_f64(buf: &[u8], key: &str) -> Option<f64> {
    get_str(buf, key).and_then(|s| s.trim().parse::<f64>().ok())
}

fn write_card(buf: &mut [u8], offset: usize, key: &str, value: &str) {
    let card = &mut buf[offset..offset + STATUS_RECORD_SIZE];
    for b in card.iter_mut() {
        *b = b' ';
    }
    let key_bytes = key.as_bytes();
    let kw_len = key_bytes.len().min(KEYWORD_WIDTH);
    card[..kw_len].copy_from_slice(&key_bytes[..kw_len]);
    card[KEYWORD_WIDTH] = b'=';
    card[KEYWORD_WIDTH + 1] = b' ';
    let value_bytes = value.as_bytes();
    let max_value_len = STATUS_RECORD_SIZE - KEYWORD_WIDTH - 2;
    let n = value_bytes.len().min(max_value_len);
    card[KEYWORD_WIDTH + 2..KEYWORD_WIDTH + 2 + n].copy_from_slice(&value_bytes[..n]);
}

/// Writes `key = value` as a card, reusing an existing card for `key` if one
/// is present, otherwise inserting before the `END` record (appending a new
/// `END` record after it). Returns the (possibly unchanged) offset of `END`.
fn put_str_inner(buf: &mut [u8], key: &str, value: &str) -> usize {
    let mut end = find_end(buf).unwrap_or(0);
    let mut offs = 0;
    while offs < end {
        if keyword_matches(&buf[offs..offs + STATUS_RECORD_SIZE], key) {
            write_card(buf, offs, key, value);
            return end;
        }
        offs += STATUS_RECORD_SIZE;
    }
    write_card(buf, end, key, value);
    end += STATUS_RECORD_SIZE;
    if end + 3 <= buf.len() {
        buf[end..end + 3].copy_from_slice(b"END");
    }
    end
}

pub fn put_str(buf: &mut [u8], key: &str, value: &str) {
    put_str_inner(buf, key, value);
}

pub fn put_i32(buf: &mut [u8], key: &str, value: i32) {
    put_str_inner(buf, key, &value.to_string());
}

pub fn put_f64(buf: &mut [u8], key: &str, value: f64) {
    put_str_inner(buf, key, &value.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_buf() -> Vec<u8> {
        let mut buf = vec![0u8; hashpipe_common::STATUS_TOTAL_SIZE];
        for b in buf[0..STATUS_RECORD_SIZE].iter_mut() {
            *b = b' ';
        }
        buf[0..3].copy_from_slice(b"END");
        buf
    }

    #[test]
    fn find_end_locates_sentinel() {
        let buf = fresh_buf();
        assert_eq!(find_end(&buf), Some(0));
    }

    #[test]
    fn put_then_get_i32_roundtrips() {
        let mut buf = fresh_buf();
        put_i32(&mut buf, "INSTANCE", 7);
        assert_eq!(get_i32(&buf, "INSTANCE"), Some(7));
    }

    #[test]
    fn put_then_get_str_roundtrips() {
        let mut buf = fresh_buf();
        put_str(&mut buf, "DATADIR", "/data/obs1");
        assert_eq!(get_str(&buf, "DATADIR"), Some("/data/obs1"));
    }

    #[test]
    fn put_overwrites_existing_key_in_place() {
        let mut buf = fresh_buf();
        put_i32(&mut buf, "INSTANCE", 1);
        let end_before = find_end(&buf);
        put_i32(&mut buf, "INSTANCE", 2);
        assert_eq!(get_i32(&buf, "INSTANCE"), Some(2));
        assert_eq!(find_end(&buf), end_before);
    }

    #[test]
    fn missing_key_returns_none() {
        let buf = fresh_buf();
        assert_eq!(get_i32(&buf, "NOPE"), None);
    }
}
