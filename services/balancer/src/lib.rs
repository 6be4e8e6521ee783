//! fluxlb balancer.
//!
//! A consistent-hashing load balancer front node. Backends register over a
//! line-based TCP control channel, prove their data path with a sanity
//! probe and are health-monitored for as long as the connection lives.
//! Intercepted packets are hashed by flow (`source_ip:source_port`) onto a
//! Maglev table and forwarded, unmodified, to the owning backend.
//!
//! ## Architecture
//!
//! ```text
//! control listener -> RegistrationManager -> RegistrationSession (per backend)
//!                                                     |
//!                                             BackendRegistry (table + map)
//!                                                     |
//! Interceptor -> PacketSender -> PacketPipeline workers -> Forwarder
//! ```

pub mod balancer;
pub mod channel;
pub mod config;
pub mod error;
pub mod forwarder;
pub mod interception;
pub mod manager;
pub mod packet;
pub mod pipeline;
pub mod registry;
pub mod session;

pub use balancer::Balancer;
pub use config::Config;
pub use error::{RegistryError, SessionError};
pub use forwarder::{
    ChannelForwarderFactory, Delivery, Forwarder, ForwarderFactory, UdpForwarder,
    UdpForwarderFactory,
};
pub use interception::{Interceptor, NoopInterceptor, UdpTapInterceptor};
pub use manager::{ManagerConfig, ManagerStats, RegistrationManager};
pub use packet::{flow_key, FlowKey, PacketError, Transport};
pub use pipeline::{PacketPipeline, PacketSender, PipelineConfig, PipelineStats, Verdict};
pub use registry::{Backend, BackendRegistry};
pub use session::{
    DeregisterReason, RegistrationSession, SessionConfig, SessionOutcome, SessionState,
};
