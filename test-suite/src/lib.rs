pub mod api;
pub mod stream;

extern crate captains_log;
extern crate log;
pub use captains_log::logfn;

use captains_log::*;
use micro_rpc_mem::MemBus;
use rstest::*;
use std::fmt;
use std::sync::Arc;
use tokio::runtime::Runtime;

#[fixture]
pub fn runner() -> TestRunner {
    TestRunner::new()
}

impl fmt::Debug for TestRunner {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "")
    }
}

pub struct TestRunner {
    rt: Runtime,
}

impl TestRunner {
    pub fn new() -> Self {
        recipe::raw_file_logger("/tmp/micro_rpc_test.log", Level::Trace).test().build().expect("log");
        Self {
            rt: tokio::runtime::Builder::new_multi_thread()
                .worker_threads(4)
                .enable_all()
                .build()
                .unwrap(),
        }
    }

    pub fn block_on<F: Future<Output = ()> + Send + 'static>(&self, f: F) {
        self.rt.block_on(f);
    }
}

/// A fresh bus, plus the same bus as the handle services and clients take.
pub fn new_bus() -> (MemBus, Arc<dyn micro_rpc_core::Transport>) {
    let bus = MemBus::new();
    let transport: Arc<dyn micro_rpc_core::Transport> = Arc::new(bus.clone());
    (bus, transport)
}
