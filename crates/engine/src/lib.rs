//! A highly-available embedded key/value store.
//!
//! Applications link an [`Engine`] into their own process and gain a local
//! embedded database whose contents are kept identical across every live
//! node of a small cluster: gossip membership discovers peers and carries
//! write broadcasts, a raft log totally orders the writes, and each node's
//! state machine materialises them into its local store. Writes are
//! strongly consistent; reads are served from the locally-applied state.
//!
//! ```no_run
//! use replikv_engine::{Engine, EngineConfig};
//! use replikv_membership::Address;
//! use replikv_store::StoreOptions;
//!
//! # async fn run() -> Result<(), replikv_engine::Error> {
//! let bind = Address::parse("127.0.0.1:7000")?;
//! let engine = Engine::new(EngineConfig::new(bind, StoreOptions::new("./node.db"))).await?;
//!
//! let pump = {
//!     let engine = engine.clone();
//!     tokio::spawn(async move { engine.start(Vec::new()).await })
//! };
//!
//! engine.set("alpha_1", &serde_json::json!({ "n": 1 })).await?;
//! # let _ = pump;
//! # Ok(())
//! # }
//! ```

mod config;
mod engine;
mod error;
mod logging;

pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{EngineResult, Error};
pub use logging::init_logging;

pub use replikv_consensus::{Command, CommandResponse, Op};
pub use replikv_membership::{Address, Event, Member};
pub use replikv_store::{LocalStore, StoreOptions};
