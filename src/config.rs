//! Process configuration, built from parsed CLI args.
//!
//! Grounded on the teacher's `state::RelayConfig` (a plain, `Default`-able
//! struct handed to the thing that needs it, rather than passing loose
//! strings around) — see `SPEC_FULL.md` §3 "ambient additions".

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub addr: String,
    pub driver: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            addr: ":8080".to_string(),
            driver: "mdbx".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub server: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            server: "ws://localhost:8080".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_cli_surface() {
        let broker = BrokerConfig::default();
        assert_eq!(broker.addr, ":8080");
        assert_eq!(broker.driver, "mdbx");

        let service = ServiceConfig::default();
        assert_eq!(service.server, "ws://localhost:8080");
    }
}
