pub mod clock;
pub mod config;
pub mod digest;
pub mod engine;
pub mod error;
pub mod logging;
pub mod policy;
pub mod store;
pub mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{LockPolicy, PinlockConfig};
pub use digest::DigestScheme;
pub use engine::{LockPolicyEngine, LockoutState, TimeRemaining, UnlockOutcome};
pub use error::{PinlockError, PinlockResult, StorageError};
pub use policy::{AlwaysRequired, FreshnessPolicy, UnlockContext, UnlockRequirementPolicy};
pub use store::{
    has_enrolled_secret, remove_enrolled_secret, CredentialStore, EnrollmentRecord, FileStore,
    MemoryStore, StoredValue,
};
pub use worker::{spawn_gate, GateHandle};
