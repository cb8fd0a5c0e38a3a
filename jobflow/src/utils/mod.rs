//! Id and timestamp helpers.

pub mod timestamps;
mod uuid_utils;

pub use timestamps::{now_utc, strictly_after, Timestamp};
pub use uuid_utils::generate_uuid_v7;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_uuid_v7_is_valid() {
        let id = generate_uuid_v7();
        assert_eq!(id.get_version_num(), 7);
    }
}
