// Deterministic relay host selection
//
// Each replica index maps to the host whose hash(host + index) is closest to
// hash(public key), compared as 256-bit big-endian integers.

use crate::crypto::hash;
use std::cmp::Ordering;

/// Pick the relay host for replica `index`. Ties go to the smaller host name,
/// so the result does not depend on the order of `hosts`.
pub fn select_relay_host<'a>(hosts: &'a [String], id_hash: &[u8; 32], index: usize) -> Option<&'a str> {
    hosts
        .iter()
        .map(|host| {
            let candidate = hash(format!("{}{}", host, index).as_bytes());
            (abs_diff(id_hash, &candidate), host.as_str())
        })
        .min()
        .map(|(_, host)| host)
}

/// |a - b| over big-endian 256-bit integers.
fn abs_diff(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let (larger, smaller) = match a.cmp(b) {
        Ordering::Less => (b, a),
        _ => (a, b),
    };

    let mut out = [0u8; 32];
    let mut borrow = 0i16;
    for i in (0..32).rev() {
        let mut digit = larger[i] as i16 - smaller[i] as i16 - borrow;
        borrow = 0;
        if digit < 0 {
            digit += 256;
            borrow = 1;
        }
        out[i] = digit as u8;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosts(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_abs_diff_is_symmetric_with_borrow() {
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        a[30] = 1; // 256
        b[31] = 1; // 1

        let mut expected = [0u8; 32];
        expected[31] = 255;
        assert_eq!(abs_diff(&a, &b), expected);
        assert_eq!(abs_diff(&b, &a), expected);
        assert_eq!(abs_diff(&a, &a), [0u8; 32]);
    }

    #[test]
    fn test_selection_ignores_host_order() {
        let id = hash(b"some public key");
        let forward = hosts(&["a.example.org", "b.example.org", "c.example.org", "d.example.org"]);
        let mut reversed = forward.clone();
        reversed.reverse();

        for index in 0..4 {
            assert_eq!(
                select_relay_host(&forward, &id, index),
                select_relay_host(&reversed, &id, index)
            );
        }
    }

    #[test]
    fn test_selection_is_deterministic_and_total() {
        let candidates = hosts(&["one.example.org", "two.example.org"]);
        let id = hash(b"key");

        let first = select_relay_host(&candidates, &id, 0);
        assert!(first.is_some());
        assert_eq!(first, select_relay_host(&candidates, &id, 0));
        assert_eq!(select_relay_host(&[], &id, 0), None);
        assert_eq!(
            select_relay_host(&hosts(&["only.example.org"]), &id, 7),
            Some("only.example.org")
        );
    }

    #[test]
    fn test_selection_matches_brute_force_minimum() {
        let candidates = hosts(&["n1", "n2", "n3", "n4", "n5"]);
        let id = hash(b"brute force");

        let expected = candidates
            .iter()
            .min_by_key(|host| abs_diff(&id, &hash(format!("{}2", host).as_bytes())))
            .map(String::as_str);
        assert_eq!(select_relay_host(&candidates, &id, 2), expected);
    }
}
