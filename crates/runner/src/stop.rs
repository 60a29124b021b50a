//! Stop-string matching and text-buffer hygiene.
//!
//! Generated pieces arrive as raw bytes and may end mid-character. Text is
//! withheld from the caller while it could still become a stop string or
//! complete a multi-byte character; when a stop string lands, the buffered
//! pieces are truncated so the stop string itself is never delivered.

/// Find the earliest occurrence of any stop string. Returns the byte index
/// where the match begins and the matching stop.
pub fn find_stop<'a>(sequence: &[u8], stops: &'a [String]) -> Option<(usize, &'a str)> {
    let mut earliest: Option<(usize, &'a str)> = None;
    for stop in stops {
        let needle = stop.as_bytes();
        if needle.is_empty() || needle.len() > sequence.len() {
            continue;
        }
        if let Some(at) = sequence
            .windows(needle.len())
            .position(|window| window == needle)
        {
            if earliest.map_or(true, |(best, _)| at < best) {
                earliest = Some((at, stop.as_str()));
            }
        }
    }
    earliest
}

/// Whether the buffer ends with a proper prefix of any stop string, meaning
/// the next pieces could still complete a match.
pub fn contains_stop_suffix(sequence: &[u8], stops: &[String]) -> bool {
    for stop in stops {
        let needle = stop.as_bytes();
        for len in 1..needle.len() {
            if sequence.ends_with(&needle[..len]) {
                return true;
            }
        }
    }
    false
}

/// Cut the piece list at byte offset `cut`. Pieces entirely past the cut
/// are dropped; a piece straddling it is shortened. Returns whether a piece
/// was partially truncated rather than wholly removed.
pub fn truncate_pieces(pieces: &mut Vec<Vec<u8>>, cut: usize) -> bool {
    let mut kept = 0;
    let mut acc = 0;
    let mut truncated = false;

    for piece in pieces.iter_mut() {
        if acc + piece.len() <= cut {
            acc += piece.len();
            kept += 1;
            continue;
        }
        if acc < cut {
            piece.truncate(cut - acc);
            truncated = true;
            kept += 1;
        }
        break;
    }

    pieces.truncate(kept);
    truncated
}

/// Whether the buffer ends inside an unfinished multi-byte character.
pub fn ends_mid_rune(bytes: &[u8]) -> bool {
    let len = bytes.len();
    for back in 1..=len.min(4) {
        let b = bytes[len - back];
        if b & 0b1100_0000 == 0b1000_0000 {
            // Continuation byte, keep looking for the leading byte.
            continue;
        }
        let need = if b & 0b1000_0000 == 0 {
            1
        } else if b & 0b1110_0000 == 0b1100_0000 {
            2
        } else if b & 0b1111_0000 == 0b1110_0000 {
            3
        } else if b & 0b1111_1000 == 0b1111_0000 {
            4
        } else {
            // Invalid leading byte; nothing more will fix it.
            return false;
        };
        return need > back;
    }
    false
}

/// Longest valid UTF-8 prefix of the buffer. Trailing bytes that never
/// became a valid character are dropped.
pub fn valid_utf8_prefix(bytes: &[u8]) -> &str {
    match std::str::from_utf8(bytes) {
        Ok(s) => s,
        Err(e) => {
            // Safe by construction: valid_up_to marks the end of the
            // longest valid prefix.
            std::str::from_utf8(&bytes[..e.valid_up_to()]).unwrap_or_default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stops(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn finds_earliest_stop() {
        let stops = stops(&["END", "ND"]);
        let (at, which) = find_stop(b"abcENDxyz", &stops).unwrap();
        assert_eq!(at, 3);
        assert_eq!(which, "END");
    }

    #[test]
    fn prefers_the_stop_that_appears_first() {
        let stops = stops(&["zzz", "bc"]);
        let (at, which) = find_stop(b"abczzz", &stops).unwrap();
        assert_eq!(at, 1);
        assert_eq!(which, "bc");
    }

    #[test]
    fn no_match_without_full_stop_string() {
        let stops = stops(&["STOP"]);
        assert!(find_stop(b"this is STO", &stops).is_none());
        assert!(contains_stop_suffix(b"this is STO", &stops));
    }

    #[test]
    fn suffix_check_ignores_unrelated_tails() {
        let stops = stops(&["STOP"]);
        assert!(!contains_stop_suffix(b"all clear", &stops));
    }

    #[test]
    fn truncate_on_piece_boundary() {
        let mut pieces = vec![b"ab".to_vec(), b"cd".to_vec(), b"ef".to_vec()];
        let truncated = truncate_pieces(&mut pieces, 4);
        assert!(!truncated);
        assert_eq!(pieces, vec![b"ab".to_vec(), b"cd".to_vec()]);
    }

    #[test]
    fn truncate_inside_a_piece() {
        let mut pieces = vec![b"ab".to_vec(), b"cdef".to_vec()];
        let truncated = truncate_pieces(&mut pieces, 3);
        assert!(truncated);
        assert_eq!(pieces, vec![b"ab".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn truncate_to_zero_drops_everything() {
        let mut pieces = vec![b"ab".to_vec()];
        let truncated = truncate_pieces(&mut pieces, 0);
        assert!(!truncated);
        assert!(pieces.is_empty());
    }

    #[test]
    fn detects_unfinished_multibyte_character() {
        // "é" is 0xC3 0xA9; holding back the continuation byte leaves an
        // unfinished character.
        assert!(ends_mid_rune(&[b'a', 0xC3]));
        assert!(!ends_mid_rune("café".as_bytes()));

        // First two bytes of a four-byte emoji.
        assert!(ends_mid_rune(&[0xF0, 0x9F]));
    }

    #[test]
    fn plain_ascii_is_never_mid_rune() {
        assert!(!ends_mid_rune(b"hello"));
        assert!(!ends_mid_rune(b""));
    }

    #[test]
    fn terminal_flush_drops_undecodable_tail() {
        let mut bytes = "ok".as_bytes().to_vec();
        bytes.push(0xC3);
        assert_eq!(valid_utf8_prefix(&bytes), "ok");
    }
}
