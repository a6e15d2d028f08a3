//! Short unique identifiers and ANSI color helpers.
//!
//! IDs are scoped to a single plan file, not globally unique: a microsecond
//! timestamp folded into base36 plus two random base36 characters is more
//! than enough to avoid collisions within one process's lifetime.

use rand::Rng;
use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Generate a short prefixed identifier, e.g. `t-4k2xa9` or `i-091zzb`.
pub fn gen_id(prefix: &str) -> String {
    let micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros())
        .unwrap_or(0);

    // Fold to four base36 digits (36^4 ~= 1.68M), matching the source's
    // collision tolerance: scoped to one plan, not globally unique.
    let folded = (micros % (36u128.pow(4))) as u32;
    let mut time_part = [0u8; 4];
    let mut n = folded;
    for slot in time_part.iter_mut().rev() {
        *slot = BASE36[(n % 36) as usize];
        n /= 36;
    }

    let mut rng = rand::rng();
    let rand_part: [u8; 2] = [
        BASE36[rng.random_range(0..36)],
        BASE36[rng.random_range(0..36)],
    ];

    let mut s = String::with_capacity(prefix.len() + 1 + time_part.len() + rand_part.len());
    s.push_str(prefix);
    s.push('-');
    s.push_str(std::str::from_utf8(&time_part).expect("base36 alphabet is ASCII"));
    s.push_str(std::str::from_utf8(&rand_part).expect("base36 alphabet is ASCII"));
    s
}

/// ANSI color codes for terminal status output.
///
/// Kept as plain constants rather than a crate dependency (crossterm/etc)
/// since the need is a handful of SGR codes, not cursor control or raw mode.
pub struct Colors;

impl Colors {
    pub const RESET: &'static str = "\x1b[0m";
    pub const BOLD: &'static str = "\x1b[1m";
    pub const DIM: &'static str = "\x1b[2m";
    pub const RED: &'static str = "\x1b[31m";
    pub const GREEN: &'static str = "\x1b[32m";
    pub const YELLOW: &'static str = "\x1b[33m";
    pub const BLUE: &'static str = "\x1b[34m";
    pub const MAGENTA: &'static str = "\x1b[35m";
    pub const CYAN: &'static str = "\x1b[36m";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gen_id_has_expected_shape() {
        let id = gen_id("t");
        assert!(id.starts_with("t-"));
        assert_eq!(id.len(), 2 + 4 + 2);
        assert!(id[2..].chars().all(|c| c.is_ascii_alphanumeric() && !c.is_uppercase()));
    }

    #[test]
    fn gen_id_uses_requested_prefix() {
        assert!(gen_id("i").starts_with("i-"));
        assert!(gen_id("task").starts_with("task-"));
    }

    #[test]
    fn gen_id_is_not_trivially_constant() {
        let ids: std::collections::HashSet<_> = (0..50).map(|_| gen_id("t")).collect();
        assert!(ids.len() > 1, "expected at least some variation across 50 generated ids");
    }
}
