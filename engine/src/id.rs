//! Locally generated record identifiers.
//!
//! Local ids look like `id-<millis base36>-<random base36>`. The timestamp
//! component is zero-padded so that ids sort in creation order, and the
//! generator never hands out the same timestamp component twice.
//!
//! Remote ids are whatever the document store assigns. The two shapes are
//! distinguished structurally by [`is_local_shaped`] and [`is_remote_shaped`].

use crate::RecordId;
use rand::Rng;

/// Prefix carried by every locally generated id.
pub const LOCAL_ID_PREFIX: &str = "id-";

/// Width of the base36 timestamp component (covers millis until year 5188).
const TIMESTAMP_WIDTH: usize = 9;

/// Length of the random suffix.
const SUFFIX_LEN: usize = 10;

/// Remote ids are longer than this.
const REMOTE_ID_MIN_EXCLUSIVE: usize = 10;

const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Generates locally unique, time-sortable ids.
///
/// The generator takes the current time as an argument so it stays free of
/// IO. Calls with a timestamp that is not strictly greater than the previous
/// one reuse the previous timestamp plus one millisecond.
#[derive(Debug, Clone, Default)]
pub struct IdGenerator {
    last_millis: Option<u64>,
}

impl IdGenerator {
    /// Create a new generator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate an id for the given wall-clock time using `rng` for the suffix.
    pub fn generate_at<R: Rng>(&mut self, now_millis: u64, rng: &mut R) -> RecordId {
        let millis = match self.last_millis {
            Some(last) if now_millis <= last => last + 1,
            _ => now_millis,
        };
        self.last_millis = Some(millis);

        let mut id = String::with_capacity(LOCAL_ID_PREFIX.len() + TIMESTAMP_WIDTH + 1 + SUFFIX_LEN);
        id.push_str(LOCAL_ID_PREFIX);
        id.push_str(&format!("{:0>width$}", to_base36(millis), width = TIMESTAMP_WIDTH));
        id.push('-');
        for _ in 0..SUFFIX_LEN {
            id.push(BASE36[rng.gen_range(0..BASE36.len())] as char);
        }
        id
    }
}

/// Encode an integer in lowercase base36.
pub fn to_base36(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while value > 0 {
        digits.push(BASE36[(value % 36) as usize]);
        value /= 36;
    }
    digits.reverse();
    String::from_utf8(digits).unwrap_or_default()
}

/// Whether `id` was generated locally.
pub fn is_local_shaped(id: &str) -> bool {
    id.starts_with(LOCAL_ID_PREFIX)
}

/// Whether `id` looks like a server-assigned document id.
pub fn is_remote_shaped(id: &str) -> bool {
    !is_local_shaped(id) && id.len() > REMOTE_ID_MIN_EXCLUSIVE
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;

    #[test]
    fn base36_encoding() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
        assert_eq!(to_base36(1_706_745_600_000), "ls2g9hc0");
    }

    #[test]
    fn generated_ids_have_local_shape() {
        let mut generator = IdGenerator::new();
        let mut rng = StdRng::seed_from_u64(7);
        let id = generator.generate_at(1_706_745_600_000, &mut rng);

        assert!(id.starts_with("id-0ls2g9hc0-"));
        assert_eq!(id.len(), 3 + TIMESTAMP_WIDTH + 1 + SUFFIX_LEN);
        assert!(is_local_shaped(&id));
        assert!(!is_remote_shaped(&id));
    }

    #[test]
    fn ids_are_unique_within_the_same_millisecond() {
        let mut generator = IdGenerator::new();
        let mut rng = StdRng::seed_from_u64(1);
        let ids: HashSet<_> = (0..1000)
            .map(|_| generator.generate_at(1000, &mut rng))
            .collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn ids_sort_in_generation_order_even_if_clock_goes_back() {
        let mut generator = IdGenerator::new();
        let mut rng = StdRng::seed_from_u64(3);
        let first = generator.generate_at(5000, &mut rng);
        let second = generator.generate_at(4000, &mut rng);
        let third = generator.generate_at(6000, &mut rng);

        assert!(first < second);
        assert!(second < third);
    }

    #[test]
    fn shape_heuristics() {
        assert!(is_remote_shaped("Xk2aPq9LmN0bR7sT"));
        assert!(!is_remote_shaped("short"));
        assert!(!is_remote_shaped("id-0ls2g9hc0-abcdefghij"));
        assert!(is_local_shaped("id-anything"));
        assert!(!is_local_shaped("Xk2aPq9LmN0bR7sT"));
    }
}
