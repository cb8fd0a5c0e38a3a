//! UUID generation helpers.

use uuid::Uuid;

/// Generates a new UUID v7 (time-ordered).
///
/// Job ids use v7 so that lexical order roughly follows submission order,
/// which keeps store listings readable. Scheduling never relies on it.
#[must_use]
pub fn generate_uuid_v7() -> Uuid {
    Uuid::now_v7()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_v7_ids_are_unique() {
        let a = generate_uuid_v7();
        let b = generate_uuid_v7();
        assert_ne!(a, b);
    }
}
