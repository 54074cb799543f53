//! Asynchronous event interfaces
//!
//! The supervisor pushes program output through an [`OutputSink`] and the
//! device synchronizer pushes change notifications through a
//! [`DeviceNotifier`]. Each transport implements both; the [`EventHub`] fans
//! a single emitter out to every registered transport.

use std::sync::{Arc, RwLock};

/// Receives program output, one line per call
pub trait OutputSink: Send + Sync {
    fn on_stdout(&self, line: &str);
    fn on_stderr(&self, line: &str);
}

/// Receives "this device's state changed" notifications
pub trait DeviceNotifier: Send + Sync {
    fn on_device_changed(&self, device_id: &str);
}

/// Fan-out of output and device events to every registered transport
#[derive(Default)]
pub struct EventHub {
    sinks: RwLock<Vec<Arc<dyn OutputSink>>>,
    notifiers: RwLock<Vec<Arc<dyn DeviceNotifier>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sink(&self, sink: Arc<dyn OutputSink>) {
        if let Ok(mut sinks) = self.sinks.write() {
            sinks.push(sink);
        }
    }

    pub fn add_notifier(&self, notifier: Arc<dyn DeviceNotifier>) {
        if let Ok(mut notifiers) = self.notifiers.write() {
            notifiers.push(notifier);
        }
    }

    fn sinks(&self) -> Vec<Arc<dyn OutputSink>> {
        self.sinks.read().map(|s| s.clone()).unwrap_or_default()
    }

    fn notifiers(&self) -> Vec<Arc<dyn DeviceNotifier>> {
        self.notifiers.read().map(|n| n.clone()).unwrap_or_default()
    }
}

impl OutputSink for EventHub {
    fn on_stdout(&self, line: &str) {
        for sink in self.sinks() {
            sink.on_stdout(line);
        }
    }

    fn on_stderr(&self, line: &str) {
        for sink in self.sinks() {
            sink.on_stderr(line);
        }
    }
}

impl DeviceNotifier for EventHub {
    fn on_device_changed(&self, device_id: &str) {
        for notifier in self.notifiers() {
            notifier.on_device_changed(device_id);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn test_hub_fans_out_to_every_transport() {
        let hub = EventHub::new();
        let a = Arc::new(RecordingSink::default());
        let b = Arc::new(RecordingSink::default());
        hub.add_sink(a.clone());
        hub.add_sink(b.clone());

        hub.on_stdout("hello");
        hub.on_stderr("oops");

        for sink in [&a, &b] {
            assert_eq!(sink.stdout_lines(), vec!["hello"]);
            assert_eq!(sink.stderr_lines(), vec!["oops"]);
        }
    }

    #[test]
    fn test_hub_without_listeners_is_silent() {
        let hub = EventHub::new();
        hub.on_stdout("nobody listening");
        hub.on_device_changed("arm");

        let notifier = Arc::new(RecordingNotifier::default());
        hub.add_notifier(notifier.clone());
        hub.on_device_changed("arm");
        assert_eq!(notifier.changes(), vec!["arm"]);
    }
}
