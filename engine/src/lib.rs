//! The realtime dataplane: processor chains, the router, latency
//! compensation, the two scheduler strategies and the MIDI file player.

pub mod latency;
pub mod player;
pub mod processor;
pub mod router;
pub mod scheduler;

pub use latency::{LatencyCompensator, LatencyProfile};
pub use player::{start_player, PlayerHandle, PlayerStatus, TEMPO_SCALE_MAX, TEMPO_SCALE_MIN};
pub use processor::{
    ArpPattern, Arpeggiator, ChannelFilter, ChannelSet, Chord, CurveShape, Delay, Harmonizer,
    Processor, ProcessorChain, ScaleKind, Transpose, VelocityCurve,
};
pub use router::{start_router, ChannelMap, Route, RouteSnapshot, RouterHandle, PLAYER_SOURCE_ID};
pub use scheduler::{
    start_scheduler, Scheduler, ScheduledEvent, SchedulerStrategy, SinkFn, DISPATCH_EPSILON_US,
    DRAIN_DEADLINE, MAX_DISPATCH_WAIT,
};
