//! rollcall-engine — enrollment and recognition service over the core
//! detector and recognizer, with durable samples and identity lookups.

pub mod config;
pub mod engine;
pub mod identity;
pub mod registry;
pub mod store;

pub use config::{Config, ConfigError};
pub use engine::{EngineError, EngineHandle, EnrollOutcome, FaceRecognitionService, ServiceStatus};
pub use identity::{Identity, IdentityError, IdentityStore, MemoryIdentityStore, SqliteIdentityStore};
pub use registry::IdentityRegistry;
pub use store::{SampleRef, SampleStore, StoreError};
