// Shutdown callback registry.
//
// Modules register cleanup callbacks as they initialize; shutdown runs
// them in reverse registration order. Each callback is removed before it
// runs, so a panicking callback cannot re-enter itself on a second pass.

use parking_lot::Mutex;
use tracing::debug;

type Callback = Box<dyn FnOnce() + Send>;

pub struct ShutdownCallbacks {
    list: Mutex<Vec<(String, Callback)>>,
}

impl ShutdownCallbacks {
    pub fn new() -> Self {
        Self {
            list: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, name: &str, callback: impl FnOnce() + Send + 'static) {
        self.list
            .lock()
            .push((name.to_string(), Box::new(callback)));
    }

    /// Run every registered callback, last registered first.
    pub fn run_all(&self) {
        loop {
            let entry = self.list.lock().pop();
            match entry {
                Some((name, callback)) => {
                    debug!(callback = %name, "running shutdown callback");
                    callback();
                }
                None => break,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.list.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.lock().is_empty()
    }
}

impl Default for ShutdownCallbacks {
    fn default() -> Self {
        Self::new()
    }
}
