//! Connection supervision for one camera
//!
//! [`ReconnectionSupervisor`] owns at most one live [`ConnectionSession`] at a
//! time. Each session bundles the signaling transport, the media session,
//! a heartbeat scheduler and a quality monitor; all of them are released
//! together when the session ends, and the backoff state decides when the
//! next one starts.

pub mod backoff;
pub mod heartbeat;
pub mod quality;
pub mod sink;
pub mod supervisor;

#[cfg(test)]
pub mod testing;

pub use backoff::{BackoffPolicy, BackoffState, RetryDelay};
pub use heartbeat::{BeaconKind, BeaconSink, HeartbeatBeacon, HeartbeatScheduler, HttpBeaconSink};
pub use quality::{QualityMonitor, QualityScore, QualitySignal};
pub use sink::{FrameSink, VisibilityPort};
pub use supervisor::{ConnectionSession, ReconnectionSupervisor, SupervisorDeps};
