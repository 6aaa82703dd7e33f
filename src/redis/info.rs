use rand::Rng;
use std::fmt;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationRole {
    Master,
    Slave,
}

impl fmt::Display for ReplicationRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicationRole::Master => write!(f, "master"),
            ReplicationRole::Slave => write!(f, "slave"),
        }
    }
}

/// Returns a fresh 40-character hex replication id.
pub fn gen_replid() -> String {
    let mut rng = rand::thread_rng();
    (0..40)
        .map(|_| char::from_digit(rng.gen_range(0..16), 16).unwrap())
        .collect()
}

#[derive(Debug, Clone)]
struct ReplicationInfo {
    role: ReplicationRole,
    connected_slaves: u64,
    master_replid: String,
    master_repl_offset: u64,
}

/// Process-wide replication state. Constructed once at boot and shared
/// behind `Arc`; only the interior fields mutate, always under the lock.
pub struct ServerInfo {
    inner: Mutex<ReplicationInfo>,
}

impl ServerInfo {
    pub fn new(role: ReplicationRole) -> Self {
        ServerInfo {
            inner: Mutex::new(ReplicationInfo {
                role,
                connected_slaves: 0,
                master_replid: gen_replid(),
                master_repl_offset: 0,
            }),
        }
    }

    pub fn role(&self) -> ReplicationRole {
        self.inner.lock().unwrap().role
    }

    pub fn replid(&self) -> String {
        self.inner.lock().unwrap().master_replid.clone()
    }

    pub fn offset(&self) -> u64 {
        self.inner.lock().unwrap().master_repl_offset
    }

    pub fn add_to_offset(&self, bytes: u64) {
        self.inner.lock().unwrap().master_repl_offset += bytes;
    }

    pub fn connected_slaves(&self) -> u64 {
        self.inner.lock().unwrap().connected_slaves
    }

    pub fn incr_connected_slaves(&self) {
        self.inner.lock().unwrap().connected_slaves += 1;
    }

    pub fn decr_connected_slaves(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.connected_slaves = inner.connected_slaves.saturating_sub(1);
    }

    /// Render the named sections (all known sections when the filter is
    /// empty). Unknown section names are skipped without error.
    pub fn render_sections(&self, sections: &[String]) -> String {
        let all = sections.is_empty();
        let mut out = String::new();
        if all
            || sections
                .iter()
                .any(|s| s.eq_ignore_ascii_case("replication"))
        {
            out.push_str(&self.render_replication_section());
        }
        out
    }

    fn render_replication_section(&self) -> String {
        let info = self.inner.lock().unwrap();
        format_section(
            "Replication",
            &[
                ("role", info.role.to_string()),
                ("connected_slaves", info.connected_slaves.to_string()),
                ("master_replid", info.master_replid.clone()),
                ("master_repl_offset", info.master_repl_offset.to_string()),
            ],
        )
    }
}

/// Renders `# <Title>\r\n<field>:<value>\r\n...`, the INFO section wire shape.
pub fn format_section(title: &str, fields: &[(&str, String)]) -> String {
    let mut out = format!("# {}\r\n", title);
    for (name, value) in fields {
        out.push_str(name);
        out.push(':');
        out.push_str(value);
        out.push_str("\r\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replid_shape() {
        let id = gen_replid();
        assert_eq!(id.len(), 40);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(gen_replid(), id);
    }

    #[test]
    fn test_offset_accumulates() {
        let info = ServerInfo::new(ReplicationRole::Master);
        assert_eq!(info.offset(), 0);
        info.add_to_offset(29);
        info.add_to_offset(31);
        assert_eq!(info.offset(), 60);
    }

    #[test]
    fn test_section_format() {
        let rendered = format_section("Replication", &[("role", "master".to_string())]);
        assert_eq!(rendered, "# Replication\r\nrole:master\r\n");
    }

    #[test]
    fn test_render_filters_unknown_sections() {
        let info = ServerInfo::new(ReplicationRole::Slave);
        assert_eq!(info.render_sections(&["keyspace".to_string()]), "");
        let rendered = info.render_sections(&[]);
        assert!(rendered.starts_with("# Replication\r\n"));
        assert!(rendered.contains("role:slave\r\n"));
        assert!(rendered.contains("master_repl_offset:0\r\n"));
    }
}
