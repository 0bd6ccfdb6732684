pub mod cloud_options;
pub mod config;
pub mod connection_session;
pub mod credentials;
pub mod known_databases;
pub mod location;
pub mod schema_cache;
pub mod settings;
pub mod storage;

#[must_use]
pub fn domain_name() -> &'static str {
    "dxb-core"
}

#[cfg(test)]
mod tests {
    use super::domain_name;

    #[test]
    fn domain_name_is_stable() {
        assert_eq!(domain_name(), "dxb-core");
    }
}
