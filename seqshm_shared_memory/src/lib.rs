//! # Dual-slot seqlock shared memory
//!
//! A fixed-layout region shared between processes (or threads) holding two
//! payload slots and the state that arbitrates access to them. Three classes
//! of participant use it concurrently:
//!
//! - **RT writer**: takes the RT lock, bumps the counter by 2 (bit 1 set),
//!   mutates the *active* slot in place, bumps by 2 again. Never waits on the
//!   non-RT writer or on readers.
//! - **Non-RT writer**: takes the non-RT lock, fills the *shadow* slot and
//!   publishes it by CAS `start -> (start + 4) ^ 1`, redoing the whole body if
//!   anything moved in between.
//! - **Readers**: lock-free. Wait for bit 1 to clear, read the active slot,
//!   retry if the counter changed.
//!
//! ```text
//! ┌──────────┐ RT lock   ┌──────────────────────────────┐
//! │ RT write ├──────────►│ seq: epoch | R | A           │
//! └──────────┘  +2 / +2  │                              │    ┌─────────┐
//! ┌──────────┐ non-RT    │ slot[A]   ◄──────────────────┼────┤ readers │
//! │ non-RT   ├──────────►│ slot[A^1] (shadow)           │    └─────────┘
//! └──────────┘  CAS      └──────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use seqshm_shared_memory::{
//!     InProcessBroker, PayloadUpdate, RegionContext, RegionLayout, SharedRegion,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut region = SharedRegion::anonymous("demo", RegionLayout::new().required_size())?;
//! region.pin_or_warn();
//! region.initialize()?;
//!
//! let broker = InProcessBroker::new();
//! let mut ctx = RegionContext::new(broker.publish(region)?);
//!
//! ctx.rt_write(|slot| slot.set_integer(slot.integer() + 1))?;
//! ctx.nonrt_write(&PayloadUpdate::new().with_float(3.14))?;
//! let (integer, float) = ctx.read(|slot| (slot.integer(), slot.float()))?;
//! # Ok(())
//! # }
//! ```
//!
//! Regions shared between processes are published with [`ShmDirBroker`],
//! which writes JSON metadata next to the `/dev/shm` backing file.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod backoff;
pub mod bridge;
pub mod broker;
pub mod context;
pub mod error;
pub mod layout;
pub mod mutex;
pub mod payload;
pub mod platform;
pub mod protocol;
pub mod reader;
pub mod region;
pub mod sequence;

pub use backoff::{Backoff, ExponentialBackoff, PlatformBackoff, SpinBackoff, YieldBackoff};
pub use bridge::ForeignView;
pub use broker::{
    HandleBroker, InProcessBroker, Liveness, Publication, RegionHandle, RegionInfo, ShmDirBroker,
};
pub use context::RegionContext;
pub use error::{ShmError, ShmResult};
pub use layout::{PayloadLayout, RegionLayout};
pub use payload::{Payload, PayloadUpdate, SlotMut, SlotRef};
pub use protocol::{
    NoProbe, NonRtCommit, ProbePoint, ProtocolProbe, RegionStatus, Snapshot, seq_begin,
    seq_doretry,
};
pub use reader::CachedReader;
pub use region::{Backing, SharedRegion};
pub use sequence::SequenceCounter;

/// Initialize tracing for tests and demos
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
