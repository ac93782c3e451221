mod error;
mod navigate;
mod orchestrator;
mod overlay;
mod poll;
mod scroll;
mod sink;
mod stabilize;
mod view;

pub use error::{ErrorKind, NavigationError, RunError};
pub use navigate::Navigator;
pub use orchestrator::{RunOrchestrator, RunOutcome, RunRequest, RunState, RunSummary};
pub use overlay::{DismissalKind, OverlayAction, OverlayHandler, OverlayRule, SweepReport};
pub use poll::{Poller, Tick};
pub use scroll::{content_fingerprint, ScrollController, ScrollOutcome, ScrollState};
pub use sink::{RecordSink, SinkError, VecSink};
pub use stabilize::{
    Check, ContentProbe, LandmarkProbe, Readiness, ReadinessProbe, StabilizationWaiter,
};
pub use view::PageView;
