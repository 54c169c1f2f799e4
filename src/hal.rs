//! The concentrator HAL facade (spec.md §2 item 1). Real hardware
//! access is an external collaborator; this module only pins down the
//! narrow interface every worker calls through, all behind `mx_concent`
//! at the call site (see [`crate::agent::Agent`]).

use crate::error::{Error, Result};
use crate::packet::{RxPacket, TxPacket};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Idle,
    Scheduled,
    Emitting,
}

/// Everything a worker may do to the concentrator. Implementations are
/// expected to be cheap to call but may block on actual hardware I/O;
/// callers always hold `mx_concent` for the duration of a call.
#[async_trait::async_trait]
pub trait Hal: Send + Sync {
    /// Drains up to `max` newly received packets. An error here is
    /// fatal to the caller per spec.md §7.
    async fn receive(&self, max: usize) -> Result<Vec<RxPacket>>;

    async fn send(&self, pkt: &TxPacket) -> Result<()>;

    async fn status(&self, rf_chain: u8) -> Result<TxStatus>;

    /// Current value of the free-running 32-bit microsecond counter.
    async fn instcnt(&self) -> Result<u32>;

    /// Concentrator counter latched at the last PPS trigger.
    async fn trigcnt(&self) -> Result<u32>;

    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    async fn reset(&self) -> Result<()>;

    /// Aborts an in-progress spectral scan, if any, so a pending send
    /// is not blocked behind it (spec.md §4.3 JIT dispatcher).
    async fn abort_spectral_scan(&self) -> Result<()> {
        Ok(())
    }
}

/// A HAL backed by nothing: useful for tests and for running the agent
/// without hardware attached.
pub struct NullHal;

#[async_trait::async_trait]
impl Hal for NullHal {
    async fn receive(&self, _max: usize) -> Result<Vec<RxPacket>> {
        Ok(Vec::new())
    }

    async fn send(&self, _pkt: &TxPacket) -> Result<()> {
        Ok(())
    }

    async fn status(&self, _rf_chain: u8) -> Result<TxStatus> {
        Ok(TxStatus::Idle)
    }

    async fn instcnt(&self) -> Result<u32> {
        Err(Error::hal("NullHal has no counter"))
    }

    async fn trigcnt(&self) -> Result<u32> {
        Err(Error::hal("NullHal has no counter"))
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn reset(&self) -> Result<()> {
        Ok(())
    }
}
