/// Key/value store for generative-backend responses.
///
/// Keys are content hashes of the serialized request; values are serialized
/// responses. Implementations handle their own errors and never panic.
pub trait Cache: Send + Sync {
    /// Returns the cached response for `key`, or `None` on a miss or read failure
    fn get(&self, key: &str) -> Option<String>;

    /// Stores `value` under `key`.
    ///
    /// Fire-and-forget: failures are logged, not returned.
    fn set(&self, key: &str, value: &str);
}
