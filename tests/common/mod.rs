//! Common test utilities and fixtures

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use treeway::{Rank, ReceiveHandler};

/// Get the path to the test fixtures directory
pub fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
}

/// Get a path to a specific fixture file
pub fn fixture_path(name: &str) -> PathBuf {
    fixtures_dir().join(name)
}

pub fn valid_config_fixture() -> PathBuf {
    fixture_path("valid_config.toml")
}

pub fn invalid_config_fixture() -> PathBuf {
    fixture_path("invalid_config.toml")
}

/// Handler that records everything it is given
#[derive(Default)]
pub struct RecordingHandler {
    pub from_parent: Mutex<Vec<Vec<u8>>>,
    pub from_child: Mutex<Vec<(Vec<u8>, Rank)>>,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn total(&self) -> usize {
        self.from_parent.lock().len() + self.from_child.lock().len()
    }
}

impl ReceiveHandler for RecordingHandler {
    fn received_from_parent(&self, data: &[u8]) {
        self.from_parent.lock().push(data.to_vec());
    }

    fn received_from_child(&self, data: &[u8], sender: Rank) {
        self.from_child.lock().push((data.to_vec(), sender));
    }
}

/// Spin until `condition` holds; false if `timeout` passes first
pub fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixtures_exist() {
        assert!(fixtures_dir().exists(), "Fixtures directory should exist");
        assert!(valid_config_fixture().exists());
        assert!(invalid_config_fixture().exists());
    }
}
