//! Mock sampler for agent tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use pyroscope_agent_native::agent::Sampler;
use pyroscope_agent_native::config::Config;
use pyroscope_agent_native::tags::TagStore;

/// Sampler that counts calls and remembers the configuration it was last started with.
#[derive(Default)]
pub struct RecordingSampler {
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub resets: AtomicUsize,
    pub fail_start: AtomicBool,
    last_started: Mutex<Option<Config>>,
}

#[allow(dead_code)]
impl RecordingSampler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn last_started(&self) -> Option<Config> {
        self.last_started.lock().unwrap().clone()
    }
}

impl Sampler for RecordingSampler {
    fn start(&self, config: &Config, _tags: Arc<TagStore>) -> bool {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.fail_start.load(Ordering::SeqCst) {
            return false;
        }
        *self.last_started.lock().unwrap() = Some(config.clone());
        true
    }

    fn stop(&self) -> bool {
        self.stops.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn reset_after_fork(&self) {
        self.resets.fetch_add(1, Ordering::SeqCst);
    }
}
