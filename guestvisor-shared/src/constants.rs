//! Constants shared across crates.

/// Event type published for every guest lifecycle change.
pub const GUEST_EVENT_TYPE: &str = "guest";

/// Metadata key layout.
pub mod keys {
    pub const GUESTS_PREFIX: &str = "/guests/";
    pub const VOLUMES_PREFIX: &str = "/volumes/";
    pub const HOSTS_PREFIX: &str = "/hosts/";

    pub fn guest(id: &str) -> String {
        format!("{GUESTS_PREFIX}{id}")
    }

    pub fn volume(id: &str) -> String {
        format!("{VOLUMES_PREFIX}{id}")
    }

    /// Index entry linking a host to one of its guests.
    pub fn host_guest(host: &str, guest_id: &str) -> String {
        format!("{HOSTS_PREFIX}{host}/guests/{guest_id}")
    }

    pub fn host_guests_prefix(host: &str) -> String {
        format!("{HOSTS_PREFIX}{host}/guests/")
    }
}
