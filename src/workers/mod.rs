//! The fixed worker set (spec.md §5): Upstream, Downstream, JIT
//! dispatcher, GPS sync, XTAL validator, Statistics loop, and the
//! optional Spectral scanner. Each is a long-lived `tokio` task that
//! owns an `Arc<Agent>` handle and a `triggered::Listener` it checks
//! at every natural suspension point.

pub mod downstream;
pub mod gps_worker;
pub mod jit_dispatcher;
pub mod spectral;
pub mod stats_worker;
pub mod upstream;
pub mod xtal_worker;
