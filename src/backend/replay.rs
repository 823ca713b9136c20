use super::{GenerationBackend, GenerationRequest};
use crate::error::{Error, Result};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// Returns pre-recorded responses verbatim, for offline runs and tests.
///
/// Call `n` returns fixture `n`; once the list runs out the last fixture
/// keeps being returned.
#[derive(Debug)]
pub struct ReplayBackend {
    fixtures: Vec<PathBuf>,
    calls: AtomicUsize,
}

impl ReplayBackend {
    pub fn new(fixtures: Vec<PathBuf>) -> Result<Self> {
        if fixtures.is_empty() {
            return Err(Error::Configuration(
                "replay backend requires a fixture path".to_string(),
            ));
        }
        Ok(Self {
            fixtures,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn single(fixture: impl Into<PathBuf>) -> Result<Self> {
        Self::new(vec![fixture.into()])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl GenerationBackend for ReplayBackend {
    fn name(&self) -> &'static str {
        "replay"
    }

    fn generate(&self, _request: &GenerationRequest) -> Result<String> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let index = call.min(self.fixtures.len() - 1);
        let path = &self.fixtures[index];
        debug!(call, fixture = %path.display(), "replaying fixture");
        fs::read_to_string(path).map_err(|e| {
            Error::backend(format!("cannot read fixture {}: {}", path.display(), e))
        })
    }
}
