use rand::distributions::Alphanumeric;
use rand::Rng;
use uuid::Uuid;


/// globally unique id, used for message ids and port ids
pub fn unique_id() -> String {
    Uuid::new_v4().to_string()
}

/// short random name for nodes and relays, intended for log output rather than for uniqueness
pub fn short_name(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
