/// Current UTC time as an ISO-8601 string with millisecond precision
/// (`2024-01-01T00:00:00.000Z`), the format used for every ledger date.
pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Random alphanumeric identifier of the given length.
///
/// Used for registration activation codes.
pub fn generate_random_id(len: usize) -> String {
    use rand::Rng;
    use rand::distributions::Alphanumeric;
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
