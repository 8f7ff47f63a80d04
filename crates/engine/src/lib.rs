//! The RedLab execution engine: supervised stateful actors driving
//! sandbox containers, the consoles inside them, and the tools agents
//! invoke against both.
//!
//! The hierarchy, leaves first:
//!
//! - [`events::EventBus`] is the topic-keyed fan-out every component
//!   publishes to.
//! - [`console::ConsoleHandle`] fronts one actor per active console
//!   session; the actor owns the destructive polling loop.
//! - [`container::ContainerHandle`] fronts one actor per managed
//!   container, driving the lifecycle, authenticating MSGRPC, supervising
//!   consoles, and running one-shot shell commands.
//! - [`supervisor::Supervisor`] is the registry of container actors and
//!   the idempotent entry point a startup reconciler calls.
//! - [`scheduler`] is the stateless tool batch executor enforcing mutex
//!   groups and per-tool timeouts.
//! - [`turn`] holds the per-track pure reducer consuming LLM stream
//!   events and tool completions; it performs no I/O and returns effect
//!   descriptors.

pub mod backoff;
pub mod console;
pub mod container;
pub mod events;
pub mod ports;
pub mod scheduler;
pub mod supervisor;
pub mod trace;
pub mod turn;

pub use backoff::Backoff;
pub use events::EventBus;
pub use ports::allocate_port;
