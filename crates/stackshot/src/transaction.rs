//! Profiling of traced transactions.
//!
//! Decides whether a transaction gets profiled, and wraps a finished profile
//! together with the transaction it belongs to into the payload shape the
//! ingestion side expects.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serializer;

use crate::profile::Trace;
use crate::session::StopHandle;

const PROFILE_VERSION: &str = "1";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleDecision {
    Profile,
    Skip,
}

/// Evaluates `rate` (the configured probability, expected in `[0.0, 1.0]`)
/// against `draw`, a uniformly random number in `[0.0, 1.0)`.
pub fn sample_decision(rate: f64, draw: f64) -> SampleDecision {
    if !(0.0..=1.0).contains(&rate) {
        log::debug!(
            "Skipping transaction profiling: ProfilesSampleRate out of range [0.0, 1.0]: {}",
            rate
        );
        return SampleDecision::Skip;
    }
    if rate == 0.0 || draw >= rate {
        log::debug!(
            "Skipping transaction profiling: ProfilesSampleRate is: {}",
            rate
        );
        return SampleDecision::Skip;
    }
    SampleDecision::Profile
}

/// The parts of a finished transaction span a profile refers to.
#[derive(Clone, Debug)]
pub struct TransactionSpan {
    pub name: String,
    pub op: String,
    pub trace_id: String,
    pub start_time: SystemTime,
    pub end_time: SystemTime,
}

/// A profiler attached to one transaction for its whole duration.
pub struct TransactionProfiler {
    stop_handle: StopHandle,
}

impl TransactionProfiler {
    /// Starts profiling when the sampling decision says so.
    pub fn maybe_start(rate: f64, draw: f64) -> Option<Self> {
        match sample_decision(rate, draw) {
            SampleDecision::Profile => Some(Self::new(crate::start_profiling())),
            SampleDecision::Skip => None,
        }
    }

    pub fn new(stop_handle: StopHandle) -> Self {
        Self { stop_handle }
    }

    /// Stops the profiler and builds the payload. `None` if the profiler
    /// produced nothing.
    pub fn finish(self, span: &TransactionSpan) -> Option<ProfileInfo> {
        let (timestamp, trace) = self.stop_handle.stop()?.into_parts();
        let duration_ns = span
            .end_time
            .duration_since(span.start_time)
            .map(|duration| u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        // Ingestion rejects an empty name
        let name = if span.name.is_empty() {
            span.op.clone()
        } else {
            span.name.clone()
        };

        Some(ProfileInfo {
            dist: String::new(),
            environment: String::new(),
            event_id: uuid::Uuid::new_v4().simple().to_string(),
            platform: String::new(),
            release: String::new(),
            timestamp,
            trace,
            transaction: ProfileTransaction {
                // The calling thread is not identified yet
                active_thread_id: 0,
                duration_ns,
                id: String::new(),
                name,
                trace_id: span.trace_id.clone(),
            },
            version: PROFILE_VERSION.to_owned(),
            runtime: RuntimeContext::default(),
            os: OsContext::default(),
            device: DeviceContext::default(),
        })
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ProfileInfo {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub dist: String,
    pub environment: String,
    pub event_id: String,
    pub platform: String,
    pub release: String,
    #[serde(serialize_with = "serialize_unix_nanos")]
    pub timestamp: SystemTime,
    #[serde(rename = "profile")]
    pub trace: Trace,
    pub transaction: ProfileTransaction,
    pub version: String,
    pub runtime: RuntimeContext,
    pub os: OsContext,
    pub device: DeviceContext,
}

#[derive(Clone, Debug, Serialize)]
pub struct ProfileTransaction {
    pub active_thread_id: u64,
    pub duration_ns: u64,
    pub id: String,
    pub name: String,
    pub trace_id: String,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct RuntimeContext {
    pub name: String,
    pub version: String,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct OsContext {
    pub name: String,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct DeviceContext {
    pub architecture: String,
}

/// The event a transaction was reported as, reduced to what a profile
/// copies from it.
#[derive(Clone, Debug, Default)]
pub struct EventContext {
    pub event_id: String,
    pub environment: String,
    pub platform: String,
    pub release: String,
    pub dist: String,
    /// Context name (`runtime`, `os`, `device`, ...) to its key/value pairs.
    pub contexts: BTreeMap<String, BTreeMap<String, String>>,
}

impl EventContext {
    fn context_value(&self, context: &str, key: &str) -> Option<&str> {
        self.contexts
            .get(context)
            .and_then(|values| values.get(key))
            .map(String::as_str)
    }
}

impl ProfileInfo {
    pub fn update_from_event(&mut self, event: &EventContext) {
        self.environment = event.environment.clone();
        self.platform = event.platform.clone();
        self.release = event.release.clone();
        self.dist = event.dist.clone();
        self.transaction.id = event.event_id.clone();

        if let Some(name) = event.context_value("runtime", "name") {
            self.runtime.name = name.to_owned();
        }
        if let Some(version) = event.context_value("runtime", "version") {
            self.runtime.version = version.to_owned();
        }
        if let Some(name) = event.context_value("os", "name") {
            self.os.name = name.to_owned();
        }
        if let Some(arch) = event.context_value("device", "arch") {
            self.device.architecture = arch.to_owned();
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

fn serialize_unix_nanos<S: Serializer>(time: &SystemTime, serializer: S) -> Result<S::Ok, S::Error> {
    let nanos = time
        .duration_since(UNIX_EPOCH)
        .map(|duration| u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0);
    serializer.serialize_u64(nanos)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::fault::{FailAt, FaultPoint, NoFaults};
    use crate::profiler::tests::ScriptedProvider;
    use crate::session::configuration::Configuration;
    use crate::session::Session;

    fn span(name: &str) -> TransactionSpan {
        let start_time = SystemTime::now();
        TransactionSpan {
            name: name.to_owned(),
            op: "http.server".to_owned(),
            trace_id: "d49d9bf66f13450b81f65bc51cf49c03".to_owned(),
            start_time,
            end_time: start_time + Duration::from_millis(35),
        }
    }

    fn scripted_profiler(faults: FailAt) -> TransactionProfiler {
        TransactionProfiler::new(Session::start(
            &Configuration::new(Duration::from_millis(1)),
            Box::<ScriptedProvider>::default(),
            Box::new(faults),
        ))
    }

    #[test]
    fn test_sample_decision() {
        assert_eq!(sample_decision(1.0, 0.999), SampleDecision::Profile);
        assert_eq!(sample_decision(0.5, 0.25), SampleDecision::Profile);
        assert_eq!(sample_decision(0.5, 0.5), SampleDecision::Skip);
        assert_eq!(sample_decision(0.5, 0.75), SampleDecision::Skip);
        assert_eq!(sample_decision(0.0, 0.0), SampleDecision::Skip);
        assert_eq!(sample_decision(-0.1, 0.0), SampleDecision::Skip);
        assert_eq!(sample_decision(1.5, 0.0), SampleDecision::Skip);
        assert_eq!(sample_decision(f64::NAN, 0.0), SampleDecision::Skip);
    }

    #[test]
    fn test_maybe_start_skips_without_starting() {
        assert!(TransactionProfiler::maybe_start(0.0, 0.0).is_none());
        assert!(TransactionProfiler::maybe_start(2.0, 0.0).is_none());
    }

    #[test]
    fn test_finish_builds_profile_info() {
        let profiler = TransactionProfiler::new(Session::start(
            &Configuration::new(Duration::from_millis(1)),
            Box::<ScriptedProvider>::default(),
            Box::new(NoFaults),
        ));
        let span = span("GET /users");
        let info = profiler.finish(&span).unwrap();

        assert_eq!(info.version, "1");
        assert_eq!(info.event_id.len(), 32);
        assert!(info.event_id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(info.transaction.name, "GET /users");
        assert_eq!(info.transaction.trace_id, span.trace_id);
        assert_eq!(info.transaction.duration_ns, 35_000_000);
        assert_eq!(info.transaction.active_thread_id, 0);
        assert!(!info.trace.samples().is_empty());
    }

    #[test]
    fn test_finish_falls_back_to_op_name() {
        let info = scripted_profiler(FailAt(FaultPoint::Process(2)))
            .finish(&span(""))
            .unwrap();
        assert_eq!(info.transaction.name, "http.server");
    }

    #[test]
    fn test_finish_without_result() {
        assert!(scripted_profiler(FailAt(FaultPoint::Startup))
            .finish(&span("GET /"))
            .is_none());
    }

    #[test]
    fn test_update_from_event() {
        let mut info = scripted_profiler(FailAt(FaultPoint::Capture(2)))
            .finish(&span("GET /"))
            .unwrap();

        let mut event = EventContext {
            event_id: "a1b2c3".to_owned(),
            environment: "production".to_owned(),
            platform: "native".to_owned(),
            release: "app@1.2.3".to_owned(),
            dist: "42".to_owned(),
            contexts: BTreeMap::new(),
        };
        event.contexts.insert(
            "runtime".to_owned(),
            BTreeMap::from([
                ("name".to_owned(), "rustc".to_owned()),
                ("version".to_owned(), "1.80.0".to_owned()),
            ]),
        );
        event.contexts.insert(
            "device".to_owned(),
            BTreeMap::from([("arch".to_owned(), "x86_64".to_owned())]),
        );
        info.update_from_event(&event);

        assert_eq!(info.environment, "production");
        assert_eq!(info.platform, "native");
        assert_eq!(info.release, "app@1.2.3");
        assert_eq!(info.dist, "42");
        assert_eq!(info.transaction.id, "a1b2c3");
        assert_eq!(info.runtime.name, "rustc");
        assert_eq!(info.runtime.version, "1.80.0");
        assert_eq!(info.device.architecture, "x86_64");
        // No os context on the event
        assert_eq!(info.os.name, "");
    }

    #[test]
    fn test_to_json() {
        let info = scripted_profiler(FailAt(FaultPoint::Capture(2)))
            .finish(&span("GET /"))
            .unwrap();
        let json: serde_json::Value = serde_json::from_str(&info.to_json().unwrap()).unwrap();

        assert_eq!(json["version"], "1");
        assert!(json.get("dist").is_none());
        assert!(json["timestamp"].as_u64().unwrap() > 0);
        assert_eq!(json["transaction"]["name"], "GET /");
        assert_eq!(json["profile"]["samples"].as_array().unwrap().len(), 2);
        assert_eq!(json["profile"]["thread_metadata"]["1"]["name"], "main");
        assert_eq!(json["device"]["architecture"], "");
    }
}
