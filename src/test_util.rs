#![cfg(test)]

use crate::resource::Resource;

pub fn trace_init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(std::env::var("TEST_LOG").unwrap_or_else(|_| "error".to_owned()))
        .with_test_writer()
        .try_init();
}

/// A minimal keyed resource for exercising the cache and the reflector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestResource {
    name: Option<String>,
    version: Option<String>,
}

impl TestResource {
    pub fn new(name: &str, version: &str) -> Self {
        Self {
            name: Some(name.to_owned()),
            version: Some(version.to_owned()),
        }
    }

    /// A resource that yields no key.
    pub fn anonymous(version: &str) -> Self {
        Self {
            name: None,
            version: Some(version.to_owned()),
        }
    }
}

impl Resource for TestResource {
    fn key(&self) -> Option<String> {
        self.name.clone()
    }

    fn resource_version(&self) -> Option<String> {
        self.version.clone()
    }
}

#[test]
fn test_log() {
    trace_init();
    info!("Log works");
}
